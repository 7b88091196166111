use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use penumbra::backend::{KvStore, MutationResult, SqliteKvStore};
use penumbra::{
    Clock, Config, ControlCommand, ControlStatus, Engine, FlusherState, GetValue, Item, Status,
    Store, StoreOperation, VBucketState,
};
use tempfile::TempDir;

mod common;

use common::{test_config, wait_until, RecordingNotifier};

const WAIT: Duration = Duration::from_secs(10);

fn open_engine(config: Config) -> (Engine, Arc<RecordingNotifier>) {
    let notifier = RecordingNotifier::new();
    let engine = Engine::new(config, notifier.clone()).expect("engine open");
    (engine, notifier)
}

fn key(s: &str) -> Bytes {
    Bytes::copy_from_slice(s.as_bytes())
}

fn set_value(engine: &Engine, vbucket: u16, k: &str, v: &str) -> (Status, u64) {
    let mut item = engine.item_allocate(key(k), 0, 0, key(v)).expect("alloc");
    engine.store_item(&mut item, 0, StoreOperation::Set, vbucket)
}

fn persisted_rows(engine: &Engine) -> Vec<(Bytes, Bytes, u16)> {
    let mut rows = Vec::new();
    engine.store().with_backend(|kv| {
        kv.dump(&mut |gv: GetValue| {
            let item = gv.item.expect("dump row");
            rows.push((item.key().clone(), item.value().clone(), item.vbucket()));
        });
    });
    rows
}

#[test]
fn cas_collision_returns_exists_and_keeps_old_value() {
    let dir = TempDir::new().unwrap();
    let (engine, _notifier) = open_engine(test_config(dir.path()));

    let (status, cas1) = set_value(&engine, 0, "a", "1");
    assert_eq!(status, Status::Success);
    assert!(cas1 > 0);

    let mut stale = engine.item_allocate(key("a"), 0, 0, key("2")).unwrap();
    stale.set_cas(cas1 - 1);
    let (status, _) = engine.store_item(&mut stale, 0, StoreOperation::Cas, 0);
    assert_eq!(status, Status::KeyExists);

    let gv = engine.get(&key("a"), 0, 0);
    assert_eq!(gv.status, Status::Success);
    assert_eq!(&gv.item.unwrap().value()[..], b"1");
}

#[test]
fn pending_vbucket_queues_and_releases_clients() {
    let dir = TempDir::new().unwrap();
    let (engine, notifier) = open_engine(test_config(dir.path()));

    engine.set_vbucket_state(7, VBucketState::Pending);
    let cookie = 71;
    let mut item = engine.item_allocate(key("k"), 0, 0, key("v")).unwrap();
    let (status, _) = engine.store_item(&mut item, cookie, StoreOperation::Set, 7);
    assert_eq!(status, Status::WouldBlock);

    engine.set_vbucket_state(7, VBucketState::Active);
    assert_eq!(
        notifier.wait_for_cookie(cookie, WAIT),
        Some(Status::Success)
    );

    let mut retry = engine.item_allocate(key("k"), 0, 0, key("v")).unwrap();
    let (status, cas) = engine.store_item(&mut retry, cookie, StoreOperation::Set, 7);
    assert_eq!(status, Status::Success);
    assert!(cas > 0);
}

#[test]
fn young_data_is_requeued_until_old_enough() {
    let dir = TempDir::new().unwrap();
    let (engine, _notifier) = open_engine(test_config(dir.path()));

    let resp = engine.control(ControlCommand::SetFlushParam {
        key: "min_data_age".to_string(),
        value: "5".to_string(),
    });
    assert_eq!(resp.status, ControlStatus::Success);
    assert_eq!(resp.message, "Updated");

    set_value(&engine, 0, "young", "v");
    assert!(
        wait_until(WAIT, || engine.stats().too_young > 0),
        "flusher should reject the entry as too young"
    );
    assert_eq!(engine.stats().total_persisted, 0);

    engine.clock().advance(6);
    assert!(
        wait_until(WAIT, || engine.stats().total_persisted == 1),
        "entry should persist once its data age passes the minimum"
    );
}

#[test]
fn ejected_value_comes_back_through_bg_fetch() {
    let dir = TempDir::new().unwrap();
    let (engine, notifier) = open_engine(test_config(dir.path()));

    let payload = "x".repeat(256);
    set_value(&engine, 0, "big", &payload);
    assert!(wait_until(WAIT, || engine.stats().total_persisted == 1));

    let resp = engine.control(ControlCommand::EvictKey {
        vbucket: 0,
        key: key("big"),
    });
    assert_eq!(resp.status, ControlStatus::Success);
    assert_eq!(resp.message, "Ejected.");
    assert_eq!(engine.stats().num_non_resident, 1);

    let cookie = 42;
    let gv = engine.get(&key("big"), 0, cookie);
    assert_eq!(gv.status, Status::WouldBlock);
    assert_eq!(
        notifier.wait_for_cookie(cookie, WAIT),
        Some(Status::Success)
    );

    let gv = engine.get(&key("big"), 0, cookie);
    assert_eq!(gv.status, Status::Success);
    assert_eq!(&gv.item.unwrap().value()[..], payload.as_bytes());
    assert_eq!(engine.stats().bg_fetched, 1);
    assert_eq!(engine.stats().num_non_resident, 0);
}

#[test]
fn dead_vbucket_is_deleted_in_chunks() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.vb_del_chunk_size = 1000;
    let (engine, _notifier) = open_engine(config);

    engine.set_vbucket_state(3, VBucketState::Active);
    const ROWS: usize = 2_500;
    for i in 0..ROWS {
        let (status, _) = set_value(&engine, 3, &format!("key{i}"), "payload");
        assert_eq!(status, Status::Success);
    }
    assert!(
        wait_until(Duration::from_secs(30), || {
            engine.stats().new_items as usize == ROWS
        }),
        "all rows need ids before deletion can be chunked"
    );

    engine.set_vbucket_state(3, VBucketState::Dead);
    assert!(engine.delete_vbucket(3));
    assert!(
        wait_until(Duration::from_secs(30), || {
            engine.stats().vbucket_deletions == 1
        }),
        "deletion should complete across three chunks"
    );

    let leftover = persisted_rows(&engine)
        .into_iter()
        .filter(|(_, _, vb)| *vb == 3)
        .count();
    assert_eq!(leftover, 0);
}

#[test]
fn failed_backend_set_is_redirtied_and_retried() {
    struct FlakyKv {
        inner: SqliteKvStore,
        fail_next_set: Arc<AtomicBool>,
    }

    impl KvStore for FlakyKv {
        fn begin(&mut self) -> bool {
            self.inner.begin()
        }
        fn commit(&mut self) -> bool {
            self.inner.commit()
        }
        fn rollback(&mut self) {
            self.inner.rollback()
        }
        fn set(&mut self, item: &Item, vb_version: u16) -> MutationResult {
            if self.fail_next_set.swap(false, Ordering::AcqRel) {
                return MutationResult {
                    rows: -1,
                    new_row_id: 0,
                };
            }
            self.inner.set(item, vb_version)
        }
        fn get(&mut self, key: &[u8], row_id: i64) -> GetValue {
            self.inner.get(key, row_id)
        }
        fn del(&mut self, key: &[u8], row_id: i64) -> i32 {
            self.inner.del(key, row_id)
        }
        fn del_vbucket(&mut self, vbucket: u16, vb_version: u16, range: (i64, i64)) -> bool {
            self.inner.del_vbucket(vbucket, vb_version, range)
        }
        fn snapshot_vbuckets(
            &mut self,
            states: &std::collections::BTreeMap<(u16, u16), String>,
        ) -> bool {
            self.inner.snapshot_vbuckets(states)
        }
        fn list_persisted_vbuckets(&mut self) -> std::collections::BTreeMap<(u16, u16), String> {
            self.inner.list_persisted_vbuckets()
        }
        fn dump(&mut self, cb: &mut dyn FnMut(GetValue)) {
            self.inner.dump(cb)
        }
        fn reset(&mut self) {
            self.inner.reset()
        }
    }

    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());
    let fail_next_set = Arc::new(AtomicBool::new(false));
    let kv = FlakyKv {
        inner: SqliteKvStore::open(&config.dbname, 1, None, None).unwrap(),
        fail_next_set: fail_next_set.clone(),
    };
    let notifier = RecordingNotifier::new();
    let store = Store::new(&config, Box::new(kv), notifier, Clock::new());
    store.start();
    assert!(wait_until(WAIT, || {
        store.flusher().state() == FlusherState::Running
    }));

    fail_next_set.store(true, Ordering::Release);
    let mut item = Item::new(key("k"), 0, 0, key("v"));
    item.set_vbucket(0);
    assert_eq!(store.set(&mut item, 0, false), Status::Success);

    let stats = Arc::clone(store.stats());
    assert!(
        wait_until(WAIT, || stats.snapshot().flush_failed == 1),
        "first persistence attempt must fail and redirty"
    );
    assert!(
        wait_until(WAIT, || stats.snapshot().total_persisted == 1),
        "retry must succeed on the next cycle"
    );
    assert_eq!(stats.snapshot().flush_failed, 1);
    store.stop();
}

#[test]
fn rapid_overwrites_persist_only_the_latest_value() {
    let dir = TempDir::new().unwrap();
    let (engine, _notifier) = open_engine(test_config(dir.path()));

    let resp = engine.control(ControlCommand::StopPersistence);
    assert_eq!(resp.status, ControlStatus::Success);

    set_value(&engine, 0, "k", "v1");
    set_value(&engine, 0, "k", "v2");
    assert_eq!(engine.stats().total_enqueued, 1, "second set coalesces");

    let resp = engine.control(ControlCommand::StartPersistence);
    assert_eq!(resp.status, ControlStatus::Success);

    assert!(wait_until(WAIT, || engine.stats().total_persisted == 1));
    let rows = persisted_rows(&engine);
    assert_eq!(rows.len(), 1);
    assert_eq!(&rows[0].1[..], b"v2");
}

#[test]
fn set_then_delete_leaves_no_backend_row() {
    let dir = TempDir::new().unwrap();
    let (engine, _notifier) = open_engine(test_config(dir.path()));

    let resp = engine.control(ControlCommand::StopPersistence);
    assert_eq!(resp.status, ControlStatus::Success);

    set_value(&engine, 0, "doomed", "v");
    assert_eq!(engine.del(&key("doomed"), 0, 0), Status::Success);

    let resp = engine.control(ControlCommand::StartPersistence);
    assert_eq!(resp.status, ControlStatus::Success);

    assert!(wait_until(WAIT, || {
        let s = engine.stats();
        s.queue_size == 0 && s.flusher_todo == 0 && s.flusher_commits > 0
    }));
    assert!(persisted_rows(&engine).is_empty());
    assert_eq!(engine.get(&key("doomed"), 0, 0).status, Status::KeyNotFound);
}

#[test]
fn locked_key_reports_sentinel_cas_until_unlocked() {
    let dir = TempDir::new().unwrap();
    let (engine, _notifier) = open_engine(test_config(dir.path()));

    set_value(&engine, 0, "locked", "v");
    let (status, item) = engine.get_locked(&key("locked"), 0, Some(15));
    assert_eq!(status, Status::Success);
    let lock_cas = item.unwrap().cas();

    // A second lock attempt and a blind CAS both bounce.
    let (status, _) = engine.get_locked(&key("locked"), 0, Some(15));
    assert_eq!(status, Status::TempFail);
    let gv = engine.get(&key("locked"), 0, 0);
    assert_eq!(gv.item.unwrap().cas(), u64::MAX);

    let mut wrong = engine.item_allocate(key("locked"), 0, 0, key("x")).unwrap();
    wrong.set_cas(lock_cas + 1000);
    let (status, _) = engine.store_item(&mut wrong, 0, StoreOperation::Cas, 0);
    assert_eq!(status, Status::KeyExists);

    // The lock holder's CAS releases the lock.
    let mut owned = engine.item_allocate(key("locked"), 0, 0, key("y")).unwrap();
    owned.set_cas(lock_cas);
    let (status, _) = engine.store_item(&mut owned, 0, StoreOperation::Cas, 0);
    assert_eq!(status, Status::Success);
    let gv = engine.get(&key("locked"), 0, 0);
    assert_ne!(gv.item.unwrap().cas(), u64::MAX);
}

#[test]
fn lock_expires_on_its_own() {
    let dir = TempDir::new().unwrap();
    let (engine, _notifier) = open_engine(test_config(dir.path()));

    set_value(&engine, 0, "k", "v");
    let (status, _) = engine.get_locked(&key("k"), 0, Some(15));
    assert_eq!(status, Status::Success);

    engine.clock().advance(16);
    let (status, _) = engine.get_locked(&key("k"), 0, Some(15));
    assert_eq!(status, Status::Success, "expired lock can be re-taken");
}

#[test]
fn expired_record_reads_as_missing_and_queues_deletion() {
    let dir = TempDir::new().unwrap();
    let (engine, _notifier) = open_engine(test_config(dir.path()));

    let mut item = engine.item_allocate(key("fleeting"), 0, 1, key("v")).unwrap();
    let (status, _) = engine.store_item(&mut item, 0, StoreOperation::Set, 0);
    assert_eq!(status, Status::Success);

    engine.clock().advance(10);
    assert_eq!(
        engine.get(&key("fleeting"), 0, 0).status,
        Status::KeyNotFound
    );
    assert_eq!(engine.stats().expired, 1);
}

#[test]
fn arithmetic_creates_parses_and_saturates() {
    let dir = TempDir::new().unwrap();
    let (engine, _notifier) = open_engine(test_config(dir.path()));

    let (status, _, value) = engine.arithmetic(&key("ctr"), 0, 0, true, true, 5, 10, 0);
    assert_eq!(status, Status::Success);
    assert_eq!(value, 10, "creation stores the initial value");

    let (status, _, value) = engine.arithmetic(&key("ctr"), 0, 0, true, true, 5, 10, 0);
    assert_eq!(status, Status::Success);
    assert_eq!(value, 15);

    let (status, _, value) = engine.arithmetic(&key("ctr"), 0, 0, false, false, 100, 0, 0);
    assert_eq!(status, Status::Success);
    assert_eq!(value, 0, "decrement saturates at zero");

    let (status, _, _) = engine.arithmetic(&key("missing"), 0, 0, true, false, 1, 0, 0);
    assert_eq!(status, Status::KeyNotFound);

    set_value(&engine, 0, "text", "not a number");
    let (status, _, _) = engine.arithmetic(&key("text"), 0, 0, true, false, 1, 0, 0);
    assert_eq!(status, Status::Invalid);
}

#[test]
fn append_and_prepend_splice_values() {
    let dir = TempDir::new().unwrap();
    let (engine, _notifier) = open_engine(test_config(dir.path()));

    let mut missing = engine.item_allocate(key("nope"), 0, 0, key("x")).unwrap();
    let (status, _) = engine.store_item(&mut missing, 0, StoreOperation::Append, 0);
    assert_eq!(status, Status::NotStored);

    set_value(&engine, 0, "s", "base");
    let mut tail = engine.item_allocate(key("s"), 0, 0, key("post")).unwrap();
    let (status, _) = engine.store_item(&mut tail, 0, StoreOperation::Append, 0);
    assert_eq!(status, Status::Success);
    let mut head = engine.item_allocate(key("s"), 0, 0, key("pre")).unwrap();
    let (status, _) = engine.store_item(&mut head, 0, StoreOperation::Prepend, 0);
    assert_eq!(status, Status::Success);

    let gv = engine.get(&key("s"), 0, 0);
    assert_eq!(&gv.item.unwrap().value()[..], b"prebasepost");
}

#[test]
fn replace_requires_an_existing_key() {
    let dir = TempDir::new().unwrap();
    let (engine, _notifier) = open_engine(test_config(dir.path()));

    let mut item = engine.item_allocate(key("r"), 0, 0, key("v")).unwrap();
    let (status, _) = engine.store_item(&mut item, 0, StoreOperation::Replace, 0);
    assert_eq!(status, Status::NotStored);

    set_value(&engine, 0, "r", "v");
    let mut item = engine.item_allocate(key("r"), 0, 0, key("v2")).unwrap();
    let (status, _) = engine.store_item(&mut item, 0, StoreOperation::Replace, 0);
    assert_eq!(status, Status::Success);
}

#[test]
fn add_refuses_live_keys_but_takes_tombstones() {
    let dir = TempDir::new().unwrap();
    let (engine, _notifier) = open_engine(test_config(dir.path()));

    let mut item = engine.item_allocate(key("a"), 0, 0, key("v")).unwrap();
    let (status, _) = engine.store_item(&mut item, 0, StoreOperation::Add, 0);
    assert_eq!(status, Status::Success);

    let mut dup = engine.item_allocate(key("a"), 0, 0, key("v")).unwrap();
    let (status, _) = engine.store_item(&mut dup, 0, StoreOperation::Add, 0);
    assert_eq!(status, Status::NotStored);

    assert_eq!(engine.del(&key("a"), 0, 0), Status::Success);
    let mut again = engine.item_allocate(key("a"), 0, 0, key("v2")).unwrap();
    let (status, _) = engine.store_item(&mut again, 0, StoreOperation::Add, 0);
    assert_eq!(status, Status::Success, "tombstone is reusable");
}

#[test]
fn operations_against_unknown_vbuckets_are_rejected() {
    let dir = TempDir::new().unwrap();
    let (engine, _notifier) = open_engine(test_config(dir.path()));

    let mut item = engine.item_allocate(key("k"), 0, 0, key("v")).unwrap();
    let (status, _) = engine.store_item(&mut item, 0, StoreOperation::Set, 9);
    assert_eq!(status, Status::NotMyVBucket);
    assert_eq!(engine.get(&key("k"), 9, 0).status, Status::NotMyVBucket);
    assert_eq!(engine.del(&key("k"), 9, 0), Status::NotMyVBucket);
    assert!(engine.stats().num_not_my_vbuckets >= 3);

    engine.set_vbucket_state(9, VBucketState::Replica);
    let (status, _) = engine.store_item(&mut item, 0, StoreOperation::Set, 9);
    assert_eq!(status, Status::NotMyVBucket, "replica rejects client writes");
}

#[test]
fn control_command_surface() {
    let dir = TempDir::new().unwrap();
    let (engine, _notifier) = open_engine(test_config(dir.path()));

    let resp = engine.control(ControlCommand::SetFlushParam {
        key: "nonsense".to_string(),
        value: "1".to_string(),
    });
    assert_eq!(resp.status, ControlStatus::KeyNotFound);
    assert_eq!(resp.message, "Unknown config param");

    let resp = engine.control(ControlCommand::SetFlushParam {
        key: "bg_fetch_delay".to_string(),
        value: "100000".to_string(),
    });
    assert_eq!(resp.status, ControlStatus::Invalid);
    assert_eq!(resp.message, "Value out of range.");

    let resp = engine.control(ControlCommand::GetVBucket { vbucket: 0 });
    assert_eq!(resp.status, ControlStatus::Success);
    assert_eq!(resp.message, "active");

    let resp = engine.control(ControlCommand::GetVBucket { vbucket: 11 });
    assert_eq!(resp.status, ControlStatus::NotMyVBucket);

    let resp = engine.control(ControlCommand::DelVBucket { vbucket: 0 });
    assert_eq!(resp.status, ControlStatus::Invalid);
    assert_eq!(
        resp.message,
        "Failed to delete vbucket.  Must be in the dead state."
    );

    let resp = engine.control(ControlCommand::DelVBucket { vbucket: 12 });
    assert_eq!(resp.status, ControlStatus::NotMyVBucket);

    let resp = engine.control(ControlCommand::EvictKey {
        vbucket: 0,
        key: key("absent"),
    });
    assert_eq!(resp.status, ControlStatus::KeyNotFound);
    assert_eq!(resp.message, "Not found.");
}

#[test]
fn evict_key_diagnostics() {
    let dir = TempDir::new().unwrap();
    let (engine, _notifier) = open_engine(test_config(dir.path()));

    // Dirty records can't be ejected.
    let resp = engine.control(ControlCommand::StopPersistence);
    assert_eq!(resp.status, ControlStatus::Success);
    set_value(&engine, 0, "dirty", &"x".repeat(256));
    let resp = engine.control(ControlCommand::EvictKey {
        vbucket: 0,
        key: key("dirty"),
    });
    assert_eq!(resp.message, "Can't eject: Dirty or a small object.");

    let resp = engine.control(ControlCommand::StartPersistence);
    assert_eq!(resp.status, ControlStatus::Success);
    assert!(wait_until(WAIT, || engine.stats().total_persisted >= 1));

    // Small objects stay resident too.
    set_value(&engine, 0, "tiny", "v");
    assert!(wait_until(WAIT, || engine.stats().total_persisted >= 2));
    let resp = engine.control(ControlCommand::EvictKey {
        vbucket: 0,
        key: key("tiny"),
    });
    assert_eq!(resp.message, "Can't eject: Dirty or a small object.");

    let resp = engine.control(ControlCommand::EvictKey {
        vbucket: 0,
        key: key("dirty"),
    });
    assert_eq!(resp.message, "Ejected.");
    let resp = engine.control(ControlCommand::EvictKey {
        vbucket: 0,
        key: key("dirty"),
    });
    assert_eq!(resp.message, "Already ejected.");
}

#[test]
fn full_flush_resets_memory_and_backend() {
    let dir = TempDir::new().unwrap();
    let (engine, _notifier) = open_engine(test_config(dir.path()));

    set_value(&engine, 0, "a", "1");
    set_value(&engine, 0, "b", "2");
    assert!(wait_until(WAIT, || engine.stats().total_persisted == 2));

    assert_eq!(engine.flush(10), Status::NotSupported);
    assert_eq!(engine.flush(0), Status::Success);

    assert_eq!(engine.get(&key("a"), 0, 0).status, Status::KeyNotFound);
    assert!(wait_until(WAIT, || persisted_rows(&engine).is_empty()));
}

#[test]
fn delete_many_soft_deletes_batches() {
    let dir = TempDir::new().unwrap();
    let (engine, _notifier) = open_engine(test_config(dir.path()));

    set_value(&engine, 0, "a", "1");
    set_value(&engine, 0, "b", "2");
    engine
        .store()
        .delete_many(&[(0, key("a")), (0, key("b")), (0, key("absent"))]);

    assert_eq!(engine.get(&key("a"), 0, 0).status, Status::KeyNotFound);
    assert_eq!(engine.get(&key("b"), 0, 0).status, Status::KeyNotFound);
    assert!(wait_until(WAIT, || persisted_rows(&engine).is_empty()));
}

#[test]
fn key_stats_report_dirtiness_and_metadata() {
    let dir = TempDir::new().unwrap();
    let (engine, _notifier) = open_engine(test_config(dir.path()));

    let resp = engine.control(ControlCommand::StopPersistence);
    assert_eq!(resp.status, ControlStatus::Success);

    let (_, cas) = set_value(&engine, 0, "k", "v");
    let stats = engine.get_key_stats(&key("k"), 0).expect("key stats");
    assert!(stats.dirty);
    assert_eq!(stats.cas, cas);

    let resp = engine.control(ControlCommand::StartPersistence);
    assert_eq!(resp.status, ControlStatus::Success);
    assert!(wait_until(WAIT, || {
        engine
            .get_key_stats(&key("k"), 0)
            .map(|s| !s.dirty)
            .unwrap_or(false)
    }));

    assert!(engine.get_key_stats(&key("missing"), 0).is_none());
}

#[test]
fn underlying_fetch_delivers_the_disk_copy() {
    use parking_lot::Mutex;

    let dir = TempDir::new().unwrap();
    let (engine, _notifier) = open_engine(test_config(dir.path()));

    set_value(&engine, 0, "k", "disk");
    assert!(wait_until(WAIT, || engine.stats().total_persisted == 1));

    let result: Arc<Mutex<Option<GetValue>>> = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&result);
    let status = engine.get_from_underlying(
        &key("k"),
        0,
        7,
        Box::new(move |gv| {
            *slot.lock() = Some(gv);
        }),
    );
    assert_eq!(status, Status::WouldBlock);

    assert!(wait_until(WAIT, || result.lock().is_some()));
    let gv = result.lock().take().unwrap();
    assert_eq!(gv.status, Status::Success);
    assert_eq!(&gv.item.unwrap().value()[..], b"disk");

    let status = engine.get_from_underlying(&key("missing"), 0, 7, Box::new(|_| {}));
    assert_eq!(status, Status::KeyNotFound);
}

#[test]
fn oversize_values_are_rejected_at_allocation() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(dir.path());
    config.max_item_size = 128;
    let (engine, _notifier) = open_engine(config);

    let err = engine
        .item_allocate(key("big"), 0, 0, Bytes::from(vec![0u8; 256]))
        .unwrap_err();
    assert_eq!(err, Status::TooBig);
}
