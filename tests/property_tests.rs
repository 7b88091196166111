use std::collections::HashMap;
use std::sync::Arc;

use proptest::prelude::*;

use penumbra::hashtable::{DeleteType, HashTable, MutationType};
use penumbra::item::Item;
use penumbra::stats::EngineStats;
use penumbra::time::Clock;

#[derive(Debug, Clone)]
enum Operation {
    Set { key: u8, value: String },
    CasSet { key: u8, value: String },
    Add { key: u8, value: String },
    SoftDelete { key: u8 },
}

fn arb_operation() -> impl Strategy<Value = Operation> {
    let key = 0u8..8;
    let value = "[a-z]{0,12}";
    prop_oneof![
        (key.clone(), value.prop_map(String::from))
            .prop_map(|(key, value)| Operation::Set { key, value }),
        (key.clone(), "[a-z]{0,12}".prop_map(String::from))
            .prop_map(|(key, value)| Operation::CasSet { key, value }),
        (key.clone(), "[a-z]{0,12}".prop_map(String::from))
            .prop_map(|(key, value)| Operation::Add { key, value }),
        key.prop_map(|key| Operation::SoftDelete { key }),
    ]
}

fn key_bytes(key: u8) -> Vec<u8> {
    format!("key{key}").into_bytes()
}

proptest! {
    /// For every key, the CAS tags of successful writes strictly
    /// increase, live records always answer lookups, and soft-deleted
    /// records read as missing.
    #[test]
    fn cas_is_monotonic_under_any_op_sequence(ops in prop::collection::vec(arb_operation(), 1..200)) {
        let ht = HashTable::new(13, 3, Arc::new(EngineStats::new()), Clock::new());
        let mut last_cas: HashMap<u8, u64> = HashMap::new();
        let mut live: HashMap<u8, bool> = HashMap::new();

        for op in ops {
            match op {
                Operation::Set { key, value } => {
                    let mut item = Item::new(key_bytes(key), 0, 0, value.into_bytes());
                    match ht.set(&mut item, true) {
                        MutationType::NotFound
                        | MutationType::WasClean
                        | MutationType::WasDirty => {
                            let prev = last_cas.insert(key, item.cas());
                            if let Some(prev) = prev {
                                prop_assert!(item.cas() > prev, "cas went backwards");
                            }
                            live.insert(key, true);
                        }
                        other => prop_assert!(false, "unexpected set result {other:?}"),
                    }
                }
                Operation::CasSet { key, value } => {
                    let mut item = Item::new(key_bytes(key), 0, 0, value.into_bytes());
                    match last_cas.get(&key) {
                        Some(&cas) if live.get(&key).copied().unwrap_or(false) => {
                            item.set_cas(cas);
                            let rv = ht.set(&mut item, true);
                            prop_assert!(
                                matches!(rv, MutationType::WasClean | MutationType::WasDirty),
                                "matching cas must win: {rv:?}"
                            );
                            prop_assert!(item.cas() > cas);
                            last_cas.insert(key, item.cas());
                        }
                        _ => {
                            item.set_cas(u64::MAX - 1);
                            let rv = ht.set(&mut item, true);
                            prop_assert!(
                                matches!(rv, MutationType::NotFound | MutationType::InvalidCas),
                                "stale cas must lose: {rv:?}"
                            );
                        }
                    }
                }
                Operation::Add { key, value } => {
                    let was_live = live.get(&key).copied().unwrap_or(false);
                    let mut item = Item::new(key_bytes(key), 0, 0, value.into_bytes());
                    let rv = ht.add(&mut item, true, true);
                    if was_live {
                        prop_assert_eq!(rv, penumbra::hashtable::AddType::Exists);
                    } else {
                        let prev = last_cas.insert(key, item.cas());
                        if let Some(prev) = prev {
                            prop_assert!(item.cas() > prev);
                        }
                        live.insert(key, true);
                    }
                }
                Operation::SoftDelete { key } => {
                    let was_live = live.get(&key).copied().unwrap_or(false);
                    let rv = ht.soft_delete(&key_bytes(key));
                    if was_live {
                        prop_assert_ne!(rv, DeleteType::NotFound);
                        live.insert(key, false);
                    } else {
                        prop_assert_eq!(rv, DeleteType::NotFound);
                    }
                }
            }
        }

        // Final visibility agrees with the model.
        for key in 0u8..8 {
            let found = ht.get_item(&key_bytes(key)).is_some();
            prop_assert_eq!(found, live.get(&key).copied().unwrap_or(false));
        }
    }
}
