use std::sync::Arc;

use penumbra::hashtable::{
    AddType, DeleteType, HashTable, HashTableDepthVisitor, HashTableVisitor, MutationType,
};
use penumbra::item::Item;
use penumbra::stats::EngineStats;
use penumbra::stored_value::StoredValue;
use penumbra::time::Clock;

fn table(size: usize, locks: usize) -> HashTable {
    HashTable::new(size, locks, Arc::new(EngineStats::new()), Clock::new())
}

fn item_for(key: &str) -> Item {
    // Value mirrors the key so visitors can verify integrity.
    Item::new(key.as_bytes().to_vec(), 0, 0, key.as_bytes().to_vec())
}

fn store(ht: &HashTable, key: &str) {
    assert_ne!(ht.set(&mut item_for(key), true), MutationType::NoMem);
}

fn store_many(ht: &HashTable, keys: &[String]) {
    for key in keys {
        store(ht, key);
    }
}

fn add_many(ht: &HashTable, keys: &[String], expect_fresh: bool) {
    for key in keys {
        let rv = ht.add(&mut item_for(key), true, true);
        if expect_fresh {
            assert_eq!(rv, AddType::Success, "fresh add of {key}");
        } else {
            assert_eq!(rv, AddType::Exists, "repeat add of {key}");
        }
    }
}

fn generate_keys(num: usize) -> Vec<String> {
    (0..num).map(|i| format!("key{i}")).collect()
}

struct Counter {
    count: usize,
    verify: bool,
}

impl HashTableVisitor for Counter {
    fn visit(&mut self, v: &mut StoredValue) {
        if !v.is_deleted() {
            self.count += 1;
            if self.verify {
                let value = v.value().expect("resident value");
                assert_eq!(&v.key()[..], &value[..]);
            }
        }
    }
}

fn count(ht: &HashTable, verify: bool) -> usize {
    let mut c = Counter { count: 0, verify };
    ht.visit(&mut c);
    c.count
}

fn remove(ht: &HashTable, key: &str) -> bool {
    let bucket = ht.partition_of(key.as_bytes());
    ht.lock_partition(bucket).remove(key.as_bytes())
}

#[test]
fn size_tracks_inserts() {
    let ht = table(0, 0);
    assert_eq!(count(&ht, true), 0);
    store(&ht, "testkey");
    assert_eq!(count(&ht, true), 1);
}

#[test]
fn clear_empties_the_table() {
    let ht = table(0, 0);
    store_many(&ht, &generate_keys(5));
    assert_eq!(count(&ht, true), 5);
    ht.clear();
    assert_eq!(count(&ht, true), 0);
}

#[test]
fn reverse_deletions() {
    const NKEYS: usize = 10_000;
    let ht = table(5, 1);
    let mut keys = generate_keys(NKEYS);
    store_many(&ht, &keys);
    assert_eq!(count(&ht, true), NKEYS);

    keys.reverse();
    for key in &keys {
        assert!(remove(&ht, key));
    }
    assert_eq!(count(&ht, true), 0);
}

#[test]
fn forward_deletions() {
    const NKEYS: usize = 10_000;
    let ht = table(5, 1);
    assert_eq!(ht.size(), 5);
    assert_eq!(ht.num_locks(), 1);

    let keys = generate_keys(NKEYS);
    store_many(&ht, &keys);
    assert_eq!(count(&ht, true), NKEYS);

    for key in &keys {
        assert!(remove(&ht, key));
    }
    assert_eq!(count(&ht, true), 0);
}

#[test]
fn find_hits_and_misses() {
    const NKEYS: usize = 5_000;
    let ht = table(5, 1);
    let keys = generate_keys(NKEYS);
    store_many(&ht, &keys);

    assert!(ht.get_item(b"aMissingKey").is_none());
    for key in &keys {
        assert!(ht.get_item(key.as_bytes()).is_some(), "missing {key}");
    }
}

#[test]
fn add_conflicts_and_undelete() {
    const NKEYS: usize = 5_000;
    let ht = table(5, 1);
    let keys = generate_keys(NKEYS);
    add_many(&ht, &keys, true);

    assert!(ht.get_item(b"aMissingKey").is_none());
    add_many(&ht, &keys, false);

    // Re-adding after a soft delete reuses the tombstone.
    assert_eq!(ht.soft_delete(keys[0].as_bytes()), DeleteType::WasDirty);
    assert_eq!(ht.soft_delete(keys[0].as_bytes()), DeleteType::NotFound);
    assert!(ht.get_item(keys[0].as_bytes()).is_none());
    assert_eq!(count(&ht, true), NKEYS - 1);

    let mut replacement = Item::new(keys[0].as_bytes().to_vec(), 0, 0, &b"newtest"[..]);
    assert_eq!(ht.add(&mut replacement, true, true), AddType::UnDel);
    assert_eq!(count(&ht, false), NKEYS);
}

#[test]
fn depth_counting() {
    const NKEYS: usize = 5_000;
    let ht = table(5, 1);
    store_many(&ht, &generate_keys(NKEYS));

    struct DepthCounter {
        max: usize,
    }
    impl HashTableDepthVisitor for DepthCounter {
        fn visit_depth(&mut self, depth: usize) {
            self.max = self.max.max(depth);
        }
    }

    let mut depths = DepthCounter { max: 0 };
    ht.visit_depth(&mut depths);
    assert!(depths.max > 1_000, "5 buckets x 5k keys must chain deeply");
}

#[test]
fn poison_key_is_stored_verbatim() {
    let poison = "A\\NROBs_oc)$zqJ1C.9?XU}Vn^(LW\"`+K/4lykF[ue0{ram;fvId6h=p&Zb3T~SQ]82'ixDP";
    let ht = table(5, 1);
    store(&ht, poison);
    assert_eq!(count(&ht, true), 1);
}
