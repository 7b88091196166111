use std::time::Duration;

use bytes::Bytes;
use penumbra::{Engine, Status, StoreOperation, VBucketState};
use tempfile::TempDir;

mod common;

use common::{test_config, wait_until, RecordingNotifier};

const WAIT: Duration = Duration::from_secs(10);

fn key(s: &str) -> Bytes {
    Bytes::copy_from_slice(s.as_bytes())
}

#[test]
fn warmup_restores_data_and_vbucket_states() {
    let dir = TempDir::new().unwrap();
    const NKEYS: usize = 50;

    {
        let engine = Engine::new(test_config(dir.path()), RecordingNotifier::new()).unwrap();
        engine.set_vbucket_state(5, VBucketState::Replica);
        for i in 0..NKEYS {
            let mut item = engine
                .item_allocate(key(&format!("key{i}")), 7, 0, key(&format!("value{i}")))
                .unwrap();
            let (status, _) = engine.store_item(&mut item, 0, StoreOperation::Set, 0);
            assert_eq!(status, Status::Success);
        }
        assert!(wait_until(WAIT, || {
            engine.stats().total_persisted as usize == NKEYS
        }));
        // Make sure the state snapshot for vbucket 5 landed too.
        assert!(wait_until(WAIT, || {
            engine.store().with_backend(|kv| {
                kv.list_persisted_vbuckets()
                    .iter()
                    .any(|((vb, _), state)| *vb == 5 && state == "replica")
            })
        }));
        engine.shutdown();
    }

    let engine = Engine::new(test_config(dir.path()), RecordingNotifier::new()).unwrap();
    assert_eq!(engine.stats().warmed_up as usize, NKEYS);
    assert_eq!(engine.get_vbucket_state(5), Some(VBucketState::Replica));
    assert_eq!(engine.get_vbucket_state(0), Some(VBucketState::Active));

    for i in 0..NKEYS {
        let gv = engine.get(&key(&format!("key{i}")), 0, 0);
        assert_eq!(gv.status, Status::Success, "key{i} after warmup");
        let item = gv.item.unwrap();
        assert_eq!(&item.value()[..], format!("value{i}").as_bytes());
        assert_eq!(item.flags(), 7);
        assert!(item.row_id() > 0, "warmed records keep their row ids");
    }
}

#[test]
fn warmup_false_starts_empty() {
    let dir = TempDir::new().unwrap();

    {
        let engine = Engine::new(test_config(dir.path()), RecordingNotifier::new()).unwrap();
        let mut item = engine.item_allocate(key("k"), 0, 0, key("v")).unwrap();
        engine.store_item(&mut item, 0, StoreOperation::Set, 0);
        assert!(wait_until(WAIT, || engine.stats().total_persisted == 1));
        engine.shutdown();
    }

    let mut config = test_config(dir.path());
    config.warmup = false;
    let engine = Engine::new(config, RecordingNotifier::new()).unwrap();
    assert_eq!(engine.get(&key("k"), 0, 0).status, Status::KeyNotFound);
    assert!(wait_until(WAIT, || {
        engine.store().with_backend(|kv| {
            let mut rows = 0;
            kv.dump(&mut |_| rows += 1);
            rows == 0
        })
    }));
}

#[test]
fn stale_vbucket_versions_are_discarded_at_warmup() {
    use penumbra::backend::{KvStore, SqliteKvStore};

    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path());

    {
        let engine = Engine::new(config.clone(), RecordingNotifier::new()).unwrap();
        engine.set_vbucket_state(4, VBucketState::Active);
        let mut item = engine.item_allocate(key("stale"), 0, 0, key("v")).unwrap();
        let (status, _) = engine.store_item(&mut item, 0, StoreOperation::Set, 4);
        assert_eq!(status, Status::Success);
        assert!(wait_until(WAIT, || engine.stats().total_persisted == 1));
        assert!(wait_until(WAIT, || {
            engine.store().with_backend(|kv| {
                kv.list_persisted_vbuckets().contains_key(&(4, 0))
            })
        }));
        engine.shutdown();
    }

    // Move vbucket 4's persisted version past the row's stamp, as if the
    // bucket had been reincarnated without cleaning up the old rows.
    {
        let mut kv = SqliteKvStore::open(&config.dbname, 1, None, None).unwrap();
        let mut states = kv.list_persisted_vbuckets();
        states.remove(&(4, 0));
        states.insert((4, 1), "active".to_string());
        assert!(kv.snapshot_vbuckets(&states));
    }

    let engine = Engine::new(config, RecordingNotifier::new()).unwrap();
    assert_eq!(engine.get_vbucket_state(4), Some(VBucketState::Active));
    assert_eq!(
        engine.get(&key("stale"), 4, 0).status,
        Status::KeyNotFound,
        "a row from a previous incarnation must not be loaded"
    );
}
