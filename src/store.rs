use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::backend::{KvStore, MutationResult};
use crate::config::Config;
use crate::dispatcher::{Dispatcher, DispatcherTask, Priority, TaskId};
use crate::error::{ControlStatus, Status};
use crate::flusher::Flusher;
use crate::hashtable::{AddType, DeleteType, HashTableVisitor, MutationType, Partition};
use crate::item::{Cookie, GetValue, Item, Notifier, LOCKED_CAS};
use crate::queue::{IntakeQueue, QueueOp, QueuedItem};
use crate::stats::EngineStats;
use crate::stored_value::StoredValue;
use crate::time::Clock;
use crate::vbucket::{VBucket, VBucketMap, VBucketState, NO_VB_VERSION};

/// Per-key metadata reported by the key-stats diagnostic.
#[derive(Debug, Clone, Copy)]
pub struct KeyStats {
    pub dirty: bool,
    pub exptime: u32,
    pub flags: u32,
    pub cas: u64,
    /// Relative seconds the dirty bit was last raised.
    pub dirtied: u32,
    /// Relative seconds of the last full value write.
    pub data_age: u32,
    /// Absolute unix seconds of the last full value write.
    pub last_modification_time: u64,
}

/// Outcome of a lock-and-get request.
#[derive(Debug)]
pub enum GetLockedResult {
    /// The vbucket is not active here.
    NotMyVBucket,
    /// Another holder owns the lock.
    AlreadyLocked,
    /// No live record.
    NotFound,
    /// Lock acquired; the item carries the new CAS that releases it.
    Acquired(Item),
}

/// Outcome of one chunk of a vbucket deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VBucketDelResult {
    Success,
    Fail,
    /// The bucket came back to life; abandon the deletion.
    Invalid,
}

/// Walks vbuckets and, optionally, their records.
pub trait VBucketVisitor {
    /// Begins visiting a bucket; return true to also walk its hash table.
    fn visit_vbucket(&mut self, vb: &Arc<VBucket>) -> bool;

    /// Called for each record when the bucket walk was accepted.
    fn visit(&mut self, _v: &mut StoredValue) {}
}

struct Persistence {
    kv: Box<dyn KvStore>,
    txn_remaining: isize,
    in_txn: bool,
}

/// The persistence coordinator: glues the vbucket map, the dirty queues,
/// the dispatchers, the flusher, and the durable backend together.
///
/// Values are acknowledged from memory; every mutation is queued for the
/// write-back flusher under the stripe lock that produced it, which is
/// what keeps the queue order equal to the observed per-key mutation
/// order.
pub struct Store {
    stats: Arc<EngineStats>,
    clock: Clock,
    vbuckets: VBucketMap,
    vbset_mutex: Mutex<()>,
    intake: IntakeQueue,
    working: Mutex<VecDeque<QueuedItem>>,
    persistence: Mutex<Persistence>,
    dispatcher: Dispatcher,
    non_io_dispatcher: Dispatcher,
    flusher: Arc<Flusher>,
    notifier: Arc<dyn Notifier>,
    bg_fetch_queue: Arc<AtomicUsize>,
    bg_fetch_delay: AtomicU32,
    expiry_window: AtomicU32,
    do_persistence: AtomicBool,
    vb_del_chunk_size: usize,
    ht_size: usize,
    ht_locks: usize,
}

impl Store {
    /// Builds a store over an opened backend. Call [`Store::start`] on
    /// the returned handle to spawn the dispatchers and the flusher.
    pub fn new(
        config: &Config,
        kv: Box<dyn KvStore>,
        notifier: Arc<dyn Notifier>,
        clock: Clock,
    ) -> Arc<Store> {
        let stats = Arc::new(EngineStats::new());
        stats
            .max_data_size
            .store(config.max_size, Ordering::Relaxed);
        stats
            .mem_low_wat
            .store(config.effective_mem_low_wat(), Ordering::Relaxed);
        stats
            .mem_high_wat
            .store(config.effective_mem_high_wat(), Ordering::Relaxed);
        stats
            .min_data_age
            .store(config.min_data_age, Ordering::Relaxed);
        stats
            .queue_age_cap
            .store(config.queue_age_cap, Ordering::Relaxed);
        stats.txn_size.store(config.max_txn_size, Ordering::Relaxed);

        let do_persistence = std::env::var_os("PENUMBRA_NO_PERSISTENCE").is_none();
        let store = Arc::new(Store {
            stats: Arc::clone(&stats),
            clock: clock.clone(),
            vbuckets: VBucketMap::new(config.max_vbuckets),
            vbset_mutex: Mutex::new(()),
            intake: IntakeQueue::new(),
            working: Mutex::new(VecDeque::new()),
            persistence: Mutex::new(Persistence {
                kv,
                txn_remaining: 0,
                in_txn: false,
            }),
            dispatcher: Dispatcher::new("io"),
            non_io_dispatcher: Dispatcher::new("nonio"),
            flusher: Arc::new(Flusher::new()),
            notifier,
            bg_fetch_queue: Arc::new(AtomicUsize::new(0)),
            bg_fetch_delay: AtomicU32::new(config.bg_fetch_delay),
            expiry_window: AtomicU32::new(config.expiry_window),
            do_persistence: AtomicBool::new(do_persistence),
            vb_del_chunk_size: config.vb_del_chunk_size,
            ht_size: config.ht_size,
            ht_locks: config.ht_locks,
        });

        if config.start_vb0 {
            let vb = Arc::new(store.make_vbucket(0, VBucketState::Active));
            store.vbuckets.add(vb);
            store.vbuckets.set_version(0, 0);
        }
        store
    }

    /// Spawns both dispatcher workers and schedules the flusher.
    pub fn start(self: &Arc<Self>) {
        self.dispatcher.start();
        self.non_io_dispatcher.start();
        self.flusher.attach(Arc::downgrade(self));
        self.flusher.start(self);
    }

    /// Stops the flusher and both dispatchers. Queued tasks are dropped.
    pub fn stop(&self) {
        if self.flusher.stop() {
            self.flusher.wait();
        }
        self.dispatcher.stop();
        self.non_io_dispatcher.stop();
    }

    fn make_vbucket(&self, id: u16, state: VBucketState) -> VBucket {
        VBucket::new(
            id,
            state,
            self.ht_size,
            self.ht_locks,
            Arc::clone(&self.stats),
            self.clock.clone(),
        )
    }

    pub fn stats(&self) -> &Arc<EngineStats> {
        &self.stats
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// The I/O dispatcher: flush, background fetches, snapshots,
    /// deletions.
    pub fn io_dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// The non-I/O dispatcher: state-change notifications.
    pub fn non_io_dispatcher(&self) -> &Dispatcher {
        &self.non_io_dispatcher
    }

    pub fn flusher(&self) -> &Arc<Flusher> {
        &self.flusher
    }

    pub fn get_vbucket(&self, vbid: u16) -> Option<Arc<VBucket>> {
        self.vbuckets.get(vbid)
    }

    fn get_vbucket_in(&self, vbid: u16, wanted: VBucketState) -> Option<Arc<VBucket>> {
        self.vbuckets.get(vbid).filter(|vb| vb.state() == wanted)
    }

    pub fn set_min_data_age(&self, to: u32) {
        self.stats.min_data_age.store(to, Ordering::Relaxed);
    }

    pub fn set_queue_age_cap(&self, to: u32) {
        self.stats.queue_age_cap.store(to, Ordering::Relaxed);
    }

    pub fn set_txn_size(&self, to: usize) {
        self.stats.txn_size.store(to, Ordering::Relaxed);
    }

    /// Artificial scheduling delay for background fetches; a test and
    /// debugging aid.
    pub fn set_bg_fetch_delay(&self, to: u32) {
        self.bg_fetch_delay.store(to, Ordering::Relaxed);
    }

    // ------------------------------------------------------------------
    // Client operations
    // ------------------------------------------------------------------

    /// Stores `item` into its vbucket. `force` lets replicated writes
    /// through regardless of state and CAS/lock checks.
    pub fn set(&self, item: &mut Item, cookie: Cookie, force: bool) -> Status {
        let vb = match self.vbuckets.get(item.vbucket()) {
            Some(vb) => vb,
            None => return self.not_my_vbucket(),
        };
        match vb.state() {
            VBucketState::Dead => return self.not_my_vbucket(),
            VBucketState::Active => {}
            VBucketState::Replica if !force => return self.not_my_vbucket(),
            VBucketState::Pending if !force => {
                if vb.add_pending_op(cookie) {
                    return Status::WouldBlock;
                }
            }
            _ => {}
        }

        let cas_op = item.cas() != 0;
        let bucket = vb.ht.partition_of(item.key());
        let mut part = vb.ht.lock_partition(bucket);
        match vb.ht.set_locked(&mut part, item, !force) {
            MutationType::NoMem => Status::OutOfMemory,
            MutationType::InvalidCas | MutationType::IsLocked => Status::KeyExists,
            MutationType::WasDirty => {
                // The earlier queue entry still covers this record.
                Status::Success
            }
            MutationType::NotFound if cas_op => Status::KeyNotFound,
            MutationType::NotFound | MutationType::WasClean => {
                self.queue_dirty(item.key().clone(), item.vbucket(), QueueOp::Set);
                Status::Success
            }
            MutationType::InvalidVBucket => Status::NotMyVBucket,
        }
    }

    /// Stores `item` only if no live record exists.
    pub fn add(&self, item: &mut Item, cookie: Cookie) -> Status {
        let vb = match self.vbuckets.get(item.vbucket()) {
            Some(vb) => vb,
            None => return self.not_my_vbucket(),
        };
        match vb.state() {
            VBucketState::Dead | VBucketState::Replica => return self.not_my_vbucket(),
            VBucketState::Active => {}
            VBucketState::Pending => {
                if vb.add_pending_op(cookie) {
                    return Status::WouldBlock;
                }
            }
        }
        if item.cas() != 0 {
            // Adding with a CAS value doesn't make sense.
            return Status::NotStored;
        }

        let bucket = vb.ht.partition_of(item.key());
        let mut part = vb.ht.lock_partition(bucket);
        match vb.ht.add_locked(&mut part, item, true, true) {
            AddType::NoMem => Status::OutOfMemory,
            AddType::Exists => Status::NotStored,
            AddType::Success | AddType::UnDel => {
                self.queue_dirty(item.key().clone(), item.vbucket(), QueueOp::Set);
                Status::Success
            }
        }
    }

    /// Retrieves a value, queueing a background fetch when the record is
    /// non-resident. `honor_states` false fetches regardless of state.
    pub fn get(
        self: &Arc<Self>,
        key: &Bytes,
        vbid: u16,
        cookie: Cookie,
        queue_bg: bool,
        honor_states: bool,
    ) -> GetValue {
        let vb = match self.vbuckets.get(vbid) {
            Some(vb) => vb,
            None => {
                self.not_my_vbucket();
                return GetValue::miss(Status::NotMyVBucket);
            }
        };
        match vb.state() {
            VBucketState::Active => {}
            VBucketState::Dead | VBucketState::Replica if honor_states => {
                self.not_my_vbucket();
                return GetValue::miss(Status::NotMyVBucket);
            }
            VBucketState::Pending if honor_states => {
                if vb.add_pending_op(cookie) {
                    return GetValue::miss(Status::WouldBlock);
                }
            }
            _ => {}
        }

        let bucket = vb.ht.partition_of(key);
        let mut part = vb.ht.lock_partition(bucket);
        let rel_now = self.clock.now();
        match self.fetch_valid_value(&vb, &mut part, key, false) {
            Some(v) => {
                if !v.is_resident() {
                    let row_id = v.row_id();
                    if queue_bg {
                        self.bg_fetch(key.clone(), vbid, row_id, cookie);
                    }
                    let mut gv = GetValue::miss(Status::WouldBlock);
                    gv.row_id = row_id;
                    return gv;
                }
                // A locked record answers with a sentinel CAS.
                let cas = if v.is_locked(rel_now) {
                    LOCKED_CAS
                } else {
                    v.cas()
                };
                let row_id = v.row_id();
                GetValue::hit(v.to_item(vbid, cas), row_id)
            }
            None => GetValue::miss(Status::KeyNotFound),
        }
    }

    /// Soft-deletes a key, leaving a tombstone for the flusher.
    pub fn del(&self, key: &Bytes, vbid: u16, cookie: Cookie) -> Status {
        let vb = match self.vbuckets.get(vbid) {
            Some(vb) => vb,
            None => return self.not_my_vbucket(),
        };
        match vb.state() {
            VBucketState::Dead | VBucketState::Replica => return self.not_my_vbucket(),
            VBucketState::Active => {}
            VBucketState::Pending => {
                if vb.add_pending_op(cookie) {
                    return Status::WouldBlock;
                }
            }
        }

        let bucket = vb.ht.partition_of(key);
        let mut part = vb.ht.lock_partition(bucket);
        match vb.ht.soft_delete_locked(&mut part, key) {
            DeleteType::NotFound => Status::KeyNotFound,
            DeleteType::WasClean => {
                self.queue_dirty(key.clone(), vbid, QueueOp::Del);
                Status::Success
            }
            DeleteType::WasDirty => Status::Success,
        }
    }

    /// Soft-deletes a batch of `(vbucket, key)` pairs.
    pub fn delete_many(&self, keys: &[(u16, Bytes)]) {
        for (vbid, key) in keys {
            if let Some(vb) = self.vbuckets.get(*vbid) {
                let bucket = vb.ht.partition_of(key);
                let mut part = vb.ht.lock_partition(bucket);
                if vb.ht.soft_delete_locked(&mut part, key) == DeleteType::WasClean {
                    self.queue_dirty(key.clone(), *vbid, QueueOp::Del);
                }
            }
        }
    }

    /// Locks a key for `lock_timeout` seconds, bumping its CAS; only the
    /// holder of the returned CAS can store over it until then.
    pub fn get_locked(
        &self,
        key: &Bytes,
        vbid: u16,
        current_time: u32,
        lock_timeout: u32,
    ) -> GetLockedResult {
        let vb = match self.get_vbucket_in(vbid, VBucketState::Active) {
            Some(vb) => vb,
            None => {
                self.not_my_vbucket();
                return GetLockedResult::NotMyVBucket;
            }
        };
        let bucket = vb.ht.partition_of(key);
        let mut part = vb.ht.lock_partition(bucket);
        match self.fetch_valid_value(&vb, &mut part, key, false) {
            Some(v) => {
                if v.is_locked(current_time) {
                    return GetLockedResult::AlreadyLocked;
                }
                v.lock(current_time + lock_timeout);
                let mut item = v.to_item(vbid, v.cas());
                item.refresh_cas();
                v.set_cas(item.cas());
                GetLockedResult::Acquired(item)
            }
            None => GetLockedResult::NotFound,
        }
    }

    /// Reports per-key metadata for an active vbucket.
    pub fn get_key_stats(&self, key: &Bytes, vbid: u16) -> Option<KeyStats> {
        let vb = self.get_vbucket_in(vbid, VBucketState::Active)?;
        let bucket = vb.ht.partition_of(key);
        let mut part = vb.ht.lock_partition(bucket);
        let v = self.fetch_valid_value(&vb, &mut part, key, false)?;
        Some(KeyStats {
            dirty: v.is_dirty(),
            exptime: v.exptime(),
            flags: v.flags(),
            cas: v.cas(),
            dirtied: v.dirtied_at(),
            data_age: v.data_age(),
            last_modification_time: self.clock.abs_time(v.data_age()),
        })
    }

    /// Drops the value bytes of a key, forcing the next read through the
    /// background fetcher. Diagnostic command.
    pub fn evict_key(&self, key: &Bytes, vbid: u16) -> (ControlStatus, &'static str) {
        let vb = match self.get_vbucket_in(vbid, VBucketState::Active) {
            Some(vb) => vb,
            None => return (ControlStatus::NotMyVBucket, "That's not my bucket."),
        };
        let bucket = vb.ht.partition_of(key);
        let mut part = vb.ht.lock_partition(bucket);
        match self.fetch_valid_value(&vb, &mut part, key, false) {
            Some(v) => {
                if v.is_resident() {
                    if v.eject_value(&self.stats) {
                        (ControlStatus::Success, "Ejected.")
                    } else {
                        (
                            ControlStatus::Success,
                            "Can't eject: Dirty or a small object.",
                        )
                    }
                } else {
                    (ControlStatus::Success, "Already ejected.")
                }
            }
            None => (ControlStatus::KeyNotFound, "Not found."),
        }
    }

    /// Schedules a read-only disk fetch whose result is delivered to
    /// `lookup` instead of being installed in the hash table.
    pub fn get_from_underlying(
        self: &Arc<Self>,
        key: &Bytes,
        vbid: u16,
        cookie: Cookie,
        lookup: Box<dyn FnOnce(GetValue) + Send>,
    ) -> Status {
        let vb = match self.vbuckets.get(vbid) {
            Some(vb) => vb,
            None => return self.not_my_vbucket(),
        };
        match vb.state() {
            VBucketState::Dead | VBucketState::Replica => return self.not_my_vbucket(),
            VBucketState::Active => {}
            VBucketState::Pending => {
                if vb.add_pending_op(cookie) {
                    return Status::WouldBlock;
                }
            }
        }
        let bucket = vb.ht.partition_of(key);
        let mut part = vb.ht.lock_partition(bucket);
        match self.fetch_valid_value(&vb, &mut part, key, false) {
            Some(v) => {
                let task = VKeyFetchTask {
                    store: Arc::clone(self),
                    key: key.clone(),
                    row_id: v.row_id(),
                    lookup: Some(lookup),
                    _counter: CounterGuard::new(Arc::clone(&self.bg_fetch_queue)),
                };
                let delay = f64::from(self.bg_fetch_delay.load(Ordering::Relaxed));
                self.dispatcher
                    .schedule(Box::new(task), None, Priority::VKeyStatBgFetcher, delay);
                Status::WouldBlock
            }
            None => Status::KeyNotFound,
        }
    }

    /// Clears every active vbucket and queues a backend reset.
    pub fn reset(&self) {
        for id in self.vbuckets.live_ids() {
            if let Some(vb) = self.get_vbucket_in(id, VBucketState::Active) {
                vb.ht.clear();
            }
        }
        self.queue_dirty(Bytes::new(), 0, QueueOp::Flush);
    }

    /// Re-checks a key's expiry under its stripe lock, soft-deleting and
    /// queueing the deletion if the deadline has passed. Used by the
    /// expired-item pager so sweep expiry and read expiry share one path.
    pub(crate) fn expire_if_needed(&self, vbid: u16, key: &Bytes) {
        if let Some(vb) = self.vbuckets.get(vbid) {
            let bucket = vb.ht.partition_of(key);
            let mut part = vb.ht.lock_partition(bucket);
            let _ = self.fetch_valid_value(&vb, &mut part, key, false);
        }
    }

    fn not_my_vbucket(&self) -> Status {
        self.stats
            .num_not_my_vbuckets
            .fetch_add(1, Ordering::Relaxed);
        Status::NotMyVBucket
    }

    /// Resolves the record for `key`, expiring it inline when its
    /// deadline has passed. Deleted records ignore expiry and are only
    /// returned when `want_deleted`.
    fn fetch_valid_value<'p, 'g>(
        &self,
        vb: &VBucket,
        part: &'p mut Partition<'g>,
        key: &[u8],
        want_deleted: bool,
    ) -> Option<&'p mut StoredValue> {
        let idx = part.position(key, true)?;
        if part.record(idx).is_deleted() {
            if want_deleted {
                return Some(part.record_mut(idx));
            }
            return None;
        }
        if part.record(idx).is_expired(self.clock.real_time()) {
            self.stats.expired.fetch_add(1, Ordering::Relaxed);
            if vb.ht.soft_delete_locked(part, key) == DeleteType::WasClean {
                self.queue_dirty(Bytes::copy_from_slice(key), vb.id(), QueueOp::Del);
            }
            return None;
        }
        Some(part.record_mut(idx))
    }

    /// Queues a mutation for the write-back flusher. Must be called with
    /// the stripe lock that produced the mutation still held; queue order
    /// is the persistence order.
    fn queue_dirty(&self, key: Bytes, vbid: u16, op: QueueOp) {
        if !self.do_persistence.load(Ordering::Relaxed) {
            return;
        }
        let version = self.vbuckets.version(vbid);
        let qi = QueuedItem::new(key, vbid, version, op, self.clock.now());
        self.stats.add_overhead(qi.mem_size());
        self.stats.total_enqueued.fetch_add(1, Ordering::Relaxed);
        self.intake.push(qi);
        self.stats
            .queue_size
            .store(self.intake.len(), Ordering::Relaxed);
    }

    // ------------------------------------------------------------------
    // Background fetch
    // ------------------------------------------------------------------

    /// Schedules an asynchronous load of an ejected value.
    pub fn bg_fetch(self: &Arc<Self>, key: Bytes, vbid: u16, row_id: i64, cookie: Cookie) {
        let counter = CounterGuard::new(Arc::clone(&self.bg_fetch_queue));
        debug!(
            queued = self.bg_fetch_queue.load(Ordering::Relaxed),
            "bgfetch.queued"
        );
        let task = BgFetchTask {
            store: Arc::clone(self),
            key,
            vbucket: vbid,
            row_id,
            cookie,
            init: Instant::now(),
            _counter: counter,
        };
        let delay = f64::from(self.bg_fetch_delay.load(Ordering::Relaxed));
        self.dispatcher
            .schedule(Box::new(task), None, Priority::BgFetcher, delay);
    }

    /// Completes a background fetch: restores the value if (and only if)
    /// the record is still non-resident, the vbucket is still active, and
    /// the key was not deleted in the meantime; then wakes the client.
    fn complete_bg_fetch(
        &self,
        key: &Bytes,
        vbid: u16,
        row_id: i64,
        cookie: Cookie,
        init: Instant,
        start: Instant,
    ) {
        self.stats.bg_fetched.fetch_add(1, Ordering::Relaxed);
        let gv = {
            let mut p = self.persistence.lock();
            p.kv.get(key, row_id)
        };

        {
            // Serialize with vbucket deletion.
            let _vbset = self.vbset_mutex.lock();
            if let Some(vb) = self.get_vbucket_in(vbid, VBucketState::Active) {
                if gv.status == Status::Success {
                    let bucket = vb.ht.partition_of(key);
                    let mut part = vb.ht.lock_partition(bucket);
                    if let Some(v) = self.fetch_valid_value(&vb, &mut part, key, false) {
                        if !v.is_resident() {
                            if let Some(item) = &gv.item {
                                v.restore_value(item.value().clone(), &self.stats);
                            }
                        }
                    }
                }
            }
        }

        let stop = Instant::now();
        if stop > start && start > init {
            self.stats.bg_num_operations.fetch_add(1, Ordering::Relaxed);
            self.stats
                .bg_wait_micros
                .fetch_add((start - init).as_micros() as u64, Ordering::Relaxed);
            self.stats
                .bg_load_micros
                .fetch_add((stop - start).as_micros() as u64, Ordering::Relaxed);
        }
        self.notifier.notify_io_complete(cookie, gv.status);
    }

    /// In-flight background fetches; the flusher preempts itself while
    /// this is non-zero.
    pub fn bg_fetch_queue_depth(&self) -> usize {
        self.bg_fetch_queue.load(Ordering::Relaxed)
    }

    // ------------------------------------------------------------------
    // VBucket lifecycle
    // ------------------------------------------------------------------

    /// Applies a state change, creating the vbucket shell on first use.
    pub fn set_vbucket_state(self: &Arc<Self>, vbid: u16, to: VBucketState) {
        let _lh = self.vbset_mutex.lock();
        if let Some(vb) = self.vbuckets.get(vbid) {
            vb.set_state(to);
            self.non_io_dispatcher.schedule(
                Box::new(NotifyVBStateChangeTask {
                    vb,
                    notifier: Arc::clone(&self.notifier),
                }),
                None,
                Priority::NotifyVBStateChange,
                0.0,
            );
            self.schedule_vb_snapshot(Priority::VBucketPersistLow);
        } else {
            let vb = Arc::new(self.make_vbucket(vbid, to));
            let new_version = self.vbuckets.next_version(vbid);
            self.vbuckets.add(vb);
            self.vbuckets.set_version(vbid, new_version);
            self.schedule_vb_snapshot(Priority::VBucketPersistHigh);
        }
    }

    /// Schedules a vbucket-state snapshot at the given priority; at most
    /// one per priority is ever outstanding.
    pub fn schedule_vb_snapshot(self: &Arc<Self>, priority: Priority) {
        let flag_changed = if priority == Priority::VBucketPersistHigh {
            self.vbuckets.set_high_priority_vb_snapshot(true)
        } else {
            self.vbuckets.set_low_priority_vb_snapshot(true)
        };
        if !flag_changed {
            return;
        }
        self.dispatcher.schedule(
            Box::new(SnapshotVBucketsTask {
                store: Arc::clone(self),
                priority,
            }),
            None,
            priority,
            0.0,
        );
    }

    /// Persists the `(id, version) -> state` map; reschedules itself on
    /// backend failure.
    pub fn snapshot_vbuckets(self: &Arc<Self>, priority: Priority) {
        if priority == Priority::VBucketPersistHigh {
            self.vbuckets.set_high_priority_vb_snapshot(false);
        } else {
            self.vbuckets.set_low_priority_vb_snapshot(false);
        }

        let mut states: BTreeMap<(u16, u16), String> = BTreeMap::new();
        for id in self.vbuckets.live_ids() {
            if let Some(vb) = self.vbuckets.get(id) {
                states.insert(
                    (id, self.vbuckets.version(id)),
                    vb.state().as_str().to_string(),
                );
            }
        }
        let ok = {
            let mut p = self.persistence.lock();
            p.kv.snapshot_vbuckets(&states)
        };
        if !ok {
            debug!("vbucket.snapshot_rescheduled");
            self.schedule_vb_snapshot(priority);
        }
    }

    /// Removes a dead vbucket and schedules its chunked on-disk removal.
    pub fn delete_vbucket(self: &Arc<Self>, vbid: u16) -> bool {
        let lh = self.vbset_mutex.lock();
        let vb = match self.vbuckets.get(vbid) {
            Some(vb) if vb.state() == VBucketState::Dead => vb,
            _ => return false,
        };
        let vb_version = self.vbuckets.version(vbid);
        drop(lh);

        self.vbuckets.remove(vbid);
        self.schedule_vb_snapshot(Priority::VBucketPersistHigh);
        self.schedule_vb_deletion(&vb, vb_version, 0.0);
        vb.ht.set_active(false);
        vb.ht.clear();
        true
    }

    /// Builds the chunked deletion task from the in-memory row ids.
    fn schedule_vb_deletion(self: &Arc<Self>, vb: &Arc<VBucket>, vb_version: u16, delay: f64) {
        if !self.vbuckets.set_bucket_deletion(vb.id(), true) {
            return;
        }

        struct RowIdCollector {
            row_ids: BTreeSet<i64>,
        }
        impl HashTableVisitor for RowIdCollector {
            fn visit(&mut self, v: &mut StoredValue) {
                if v.has_row_id() {
                    self.row_ids.insert(v.row_id());
                }
            }
        }
        let mut collector = RowIdCollector {
            row_ids: BTreeSet::new(),
        };
        vb.ht.visit(&mut collector);

        let ids: Vec<i64> = collector.row_ids.into_iter().collect();
        let ranges: Vec<(i64, i64)> = ids
            .chunks(self.vb_del_chunk_size.max(1))
            .map(|chunk| (chunk[0], *chunk.last().expect("non-empty chunk")))
            .collect();

        let task = VBucketDeletionTask {
            store: Arc::clone(self),
            vbucket: vb.id(),
            vb_version,
            ranges,
            next: 0,
            chunk_num: 1,
            started: Instant::now(),
        };
        self.dispatcher
            .schedule(Box::new(task), None, Priority::VBucketDeletion, delay);
    }

    /// Deletes one row range of a dead (or already removed) vbucket.
    pub fn complete_vbucket_deletion(
        &self,
        vbid: u16,
        vb_version: u16,
        range: Option<(i64, i64)>,
        is_last_chunk: bool,
    ) -> VBucketDelResult {
        let lh = self.vbset_mutex.lock();
        let resurrected = match self.vbuckets.get(vbid) {
            Some(vb) => vb.state() != VBucketState::Dead && !self.vbuckets.is_bucket_deletion(vbid),
            None => false,
        };
        if resurrected {
            return VBucketDelResult::Invalid;
        }
        drop(lh);

        let ok = match range {
            None => true,
            Some(range) => {
                let mut p = self.persistence.lock();
                p.kv.del_vbucket(vbid, vb_version, range)
            }
        };
        if ok {
            if is_last_chunk {
                self.vbuckets.set_bucket_deletion(vbid, false);
                self.stats.vbucket_deletions.fetch_add(1, Ordering::Relaxed);
            }
            VBucketDelResult::Success
        } else {
            self.stats
                .vbucket_deletion_fail
                .fetch_add(1, Ordering::Relaxed);
            VBucketDelResult::Fail
        }
    }

    /// Walks every live vbucket with `visitor`.
    pub fn visit(&self, visitor: &mut dyn VBucketVisitor) {
        struct Bridge<'a> {
            inner: &'a mut dyn VBucketVisitor,
        }
        impl HashTableVisitor for Bridge<'_> {
            fn visit(&mut self, v: &mut StoredValue) {
                self.inner.visit(v);
            }
        }

        for id in self.vbuckets.live_ids() {
            if let Some(vb) = self.vbuckets.get(id) {
                if visitor.visit_vbucket(&vb) {
                    vb.ht.visit(&mut Bridge {
                        inner: &mut *visitor,
                    });
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Warmup
    // ------------------------------------------------------------------

    /// Reloads vbucket states and data from the backend. Runs once, on
    /// the flusher's first tick.
    pub(crate) fn warmup(&self) {
        let states = {
            let mut p = self.persistence.lock();
            p.kv.list_persisted_vbuckets()
        };
        for ((id, version), state_str) in &states {
            debug!(vbucket = id, state = %state_str, "warmup.vbucket");
            match VBucketState::parse(state_str) {
                Some(state) => self.warmup_init_vbucket(*id, *version, state),
                None => warn!(vbucket = id, state = %state_str, "warmup.unknown_state"),
            }
        }

        let mut has_purged = false;
        let mut p = self.persistence.lock();
        let stats = Arc::clone(&self.stats);
        p.kv.dump(&mut |gv| {
            self.warmup_load(gv, &mut has_purged);
            stats.warmed_up.fetch_add(1, Ordering::Relaxed);
        });
        info!(
            records = self.stats.warmed_up.load(Ordering::Relaxed),
            dups = self.stats.warm_dups.load(Ordering::Relaxed),
            oom = self.stats.warm_oom.load(Ordering::Relaxed),
            "warmup.complete"
        );
    }

    fn warmup_init_vbucket(&self, vbid: u16, version: u16, state: VBucketState) {
        if self.vbuckets.get(vbid).is_none() {
            let vb = Arc::new(self.make_vbucket(vbid, state));
            self.vbuckets.add(vb);
            self.vbuckets.set_version(vbid, version);
        }
        if vbid == 0 && self.vbuckets.version(0) != version {
            self.vbuckets.set_version(0, version);
        }
    }

    fn warmup_load(&self, gv: GetValue, has_purged: &mut bool) {
        let mut item = match gv.item {
            Some(item) => item,
            None => return,
        };
        let map_version = self.vbuckets.version(item.vbucket());
        if map_version != NO_VB_VERSION && gv.vb_version != map_version {
            // A row from a previous incarnation of the vbucket.
            return;
        }
        let vb = match self.vbuckets.get(item.vbucket()) {
            Some(vb) => vb,
            None => {
                let vb = Arc::new(self.make_vbucket(item.vbucket(), VBucketState::Dead));
                self.vbuckets.add(Arc::clone(&vb));
                self.vbuckets.set_version(item.vbucket(), gv.vb_version);
                vb
            }
        };

        let retain = self.stats.current_size.load(Ordering::Relaxed)
            < self.stats.mem_low_wat.load(Ordering::Relaxed);
        let mut succeeded = false;
        match vb.ht.add(&mut item, false, retain) {
            AddType::Success | AddType::UnDel => succeeded = true,
            AddType::Exists => {
                warn!(key = ?item.key(), "warmup.duplicate_key");
                self.stats.warm_dups.fetch_add(1, Ordering::Relaxed);
                succeeded = true;
            }
            AddType::NoMem => {
                if *has_purged {
                    if self.stats.warm_oom.fetch_add(1, Ordering::Relaxed) == 0 {
                        warn!("warmup dataload failure: max_size too low");
                    }
                } else {
                    warn!("emergency startup purge to free space for load");
                    self.warmup_purge();
                    *has_purged = true;
                    match vb.ht.add(&mut item, false, retain) {
                        AddType::Success | AddType::UnDel => succeeded = true,
                        AddType::Exists => {
                            self.stats.warm_dups.fetch_add(1, Ordering::Relaxed);
                            succeeded = true;
                        }
                        AddType::NoMem => {
                            warn!("cannot store an item after emergency purge");
                            self.stats.warm_oom.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            }
        }
        if succeeded && !retain {
            // Loaded as non-resident.
            self.stats.num_value_ejects.fetch_add(1, Ordering::Relaxed);
            self.stats.num_non_resident.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn warmup_purge(&self) {
        struct PurgeVisitor<'a> {
            stats: &'a EngineStats,
        }
        impl HashTableVisitor for PurgeVisitor<'_> {
            fn visit(&mut self, v: &mut StoredValue) {
                v.eject_value(self.stats);
            }
        }
        for id in self.vbuckets.live_ids() {
            if let Some(vb) = self.vbuckets.get(id) {
                vb.ht.visit(&mut PurgeVisitor { stats: &self.stats });
            }
        }
    }

    // ------------------------------------------------------------------
    // Flush pipeline
    // ------------------------------------------------------------------

    /// True while either flush queue holds work.
    pub fn has_flush_work(&self) -> bool {
        !self.intake.is_empty() || !self.working.lock().is_empty()
    }

    /// Starts a flush cycle by draining the intake queue into the
    /// working queue. False means there is nothing to do.
    pub(crate) fn begin_flush(&self) -> bool {
        let mut w = self.working.lock();
        if self.intake.is_empty() && w.is_empty() {
            self.stats.dirty_age.store(0, Ordering::Relaxed);
            return false;
        }
        self.intake.drain_into(&mut w);
        self.stats.flusher_todo.store(w.len(), Ordering::Relaxed);
        self.stats
            .queue_size
            .store(self.intake.len(), Ordering::Relaxed);
        debug!(
            flushing = w.len(),
            still_queued = self.intake.len(),
            "flusher.begin"
        );
        true
    }

    /// Persists up to a transaction's worth of entries from the working
    /// queue. Returns the smallest residual min-data-age wait observed
    /// (0 when everything eligible was handled), or 1 when the backend
    /// refused to open a transaction.
    pub(crate) fn flush_some(&self, rejects: &mut VecDeque<QueuedItem>) -> u32 {
        let mut p = self.persistence.lock();
        if !self.enter_transaction(&mut p) {
            self.stats.begin_failed.fetch_add(1, Ordering::Relaxed);
            warn!("failed to start a transaction");
            let mut w = self.working.lock();
            rejects.extend(w.drain(..));
            return 1;
        }

        let budget = p.txn_remaining.max(0) as usize;
        let mut oldest = self.stats.min_data_age.load(Ordering::Relaxed);
        let mut completed = 0usize;
        while completed < budget && self.bg_fetch_queue.load(Ordering::Relaxed) == 0 {
            let qi = match self.working.lock().pop_front() {
                Some(qi) => qi,
                None => break,
            };
            let n = self.flush_one(&mut p, &qi, rejects);
            completed += 1;
            if n != 0 && n < oldest {
                oldest = n;
            }
        }

        if self.bg_fetch_queue.load(Ordering::Relaxed) > 0 {
            // Leave the transaction open; reads come first.
            self.stats.flusher_preempts.fetch_add(1, Ordering::Relaxed);
        } else {
            self.commit_transaction(&mut p);
        }
        self.leave_transaction(&mut p, completed);
        oldest
    }

    /// Ends a flush cycle: rejects return to the head of the working
    /// queue and the duration gauges are updated.
    pub(crate) fn complete_flush(&self, rejects: &mut VecDeque<QueuedItem>, flush_start: u32) {
        let mut w = self.working.lock();
        while let Some(qi) = rejects.pop_back() {
            w.push_front(qi);
        }
        self.stats
            .queue_size
            .store(self.intake.len() + w.len(), Ordering::Relaxed);
        self.stats.flusher_todo.store(w.len(), Ordering::Relaxed);
        drop(w);

        let duration = self.clock.now().saturating_sub(flush_start);
        self.stats.flush_duration.store(duration, Ordering::Relaxed);
        self.stats
            .flush_duration_high_wat
            .fetch_max(duration, Ordering::Relaxed);
        self.stats
            .cumulative_flush_time
            .fetch_add(u64::from(duration), Ordering::Relaxed);
    }

    fn flush_one(
        &self,
        p: &mut Persistence,
        qi: &QueuedItem,
        rejects: &mut VecDeque<QueuedItem>,
    ) -> u32 {
        self.stats.sub_overhead(qi.mem_size());
        let todo = self.stats.flusher_todo.load(Ordering::Relaxed);
        self.stats
            .flusher_todo
            .store(todo.saturating_sub(1), Ordering::Relaxed);

        match qi.op() {
            QueueOp::Flush => {
                p.kv.reset();
                1
            }
            QueueOp::Set => {
                if qi.vb_version() == self.vbuckets.version(qi.vbucket()) {
                    self.flush_one_del_or_set(p, qi, rejects)
                } else {
                    // The vbucket was recreated since this was queued.
                    0
                }
            }
            QueueOp::Del => self.flush_one_del_or_set(p, qi, rejects),
        }
    }

    // The queued operation says what was intended, but the current
    // record decides what actually happens: only the state under the
    // stripe lock at flush time is persisted.
    fn flush_one_del_or_set(
        &self,
        p: &mut Persistence,
        qi: &QueuedItem,
        rejects: &mut VecDeque<QueuedItem>,
    ) -> u32 {
        let vb = match self.vbuckets.get(qi.vbucket()) {
            Some(vb) => vb,
            None => return 0,
        };
        let bucket = vb.ht.partition_of(qi.key());
        let mut part = vb.ht.lock_partition(bucket);
        let idx = match part.position(qi.key(), true) {
            Some(idx) => idx,
            None => return 0,
        };

        let queued = qi.dirtied_at();
        let now_rel = self.clock.now();
        let abs_now = self.clock.real_time();
        let expiry_window = u64::from(self.expiry_window.load(Ordering::Relaxed));

        let (deleted, row_id) = {
            let v = part.record(idx);
            (v.is_deleted(), v.row_id())
        };
        let mut is_dirty = part.record(idx).is_dirty();
        let mut dirtied = 0u32;
        let mut ret = 0u32;
        let mut snapshot: Option<Item> = None;

        if is_dirty && part.record(idx).is_expired(abs_now + expiry_window) {
            self.stats.flush_expired.fetch_add(1, Ordering::Relaxed);
            dirtied = part.record_mut(idx).mark_clean();
            is_dirty = false;
        }

        if is_dirty {
            dirtied = part.record(idx).data_age();
            let data_age = now_rel.saturating_sub(dirtied);
            let dirty_age = now_rel.saturating_sub(queued);
            let min_age = self.stats.min_data_age.load(Ordering::Relaxed);
            let age_cap = self.stats.queue_age_cap.load(Ordering::Relaxed);
            let mut eligible = true;

            if part.record(idx).is_pending_id() {
                // An earlier persistence attempt owns the row id.
                eligible = false;
            } else if dirty_age > age_cap {
                self.stats.too_old.fetch_add(1, Ordering::Relaxed);
            } else if data_age < min_age {
                eligible = false;
                ret = min_age - data_age;
                self.stats.too_young.fetch_add(1, Ordering::Relaxed);
            }

            if eligible {
                self.stats.dirty_age.store(dirty_age, Ordering::Relaxed);
                self.stats.data_age.store(data_age, Ordering::Relaxed);
                self.stats
                    .dirty_age_high_wat
                    .fetch_max(dirty_age, Ordering::Relaxed);
                self.stats
                    .data_age_high_wat
                    .fetch_max(data_age, Ordering::Relaxed);
                if !deleted {
                    let v = part.record(idx);
                    snapshot = Some(v.to_item(qi.vbucket(), v.cas()));
                }
                if row_id == -1 {
                    part.record_mut(idx).set_pending_id();
                }
            } else {
                is_dirty = false;
                part.record_mut(idx).re_dirty(dirtied);
                rejects.push_back(qi.clone());
                self.stats.add_overhead(qi.mem_size());
            }
        }

        if is_dirty && !deleted {
            if qi.vb_version() != self.vbuckets.version(qi.vbucket()) {
                // Stale incarnation; drop silently.
            } else if self.vbuckets.is_high_priority_snapshot_scheduled() {
                // Never write ahead of a pending metadata snapshot.
                drop(part);
                self.requeue_to_intake(qi.clone());
            } else {
                part.record_mut(idx).mark_clean();
                drop(part);
                if let Some(item) = snapshot {
                    let result = p.kv.set(&item, qi.vb_version());
                    self.persist_set_result(qi, result, dirtied, rejects);
                }
            }
        } else if deleted {
            drop(part);
            let rows = if row_id > 0 { p.kv.del(qi.key(), row_id) } else { 0 };
            self.persist_del_result(qi, rows, dirtied, rejects);
        }

        ret
    }

    fn requeue_to_intake(&self, qi: QueuedItem) {
        self.stats.add_overhead(qi.mem_size());
        self.stats.total_enqueued.fetch_add(1, Ordering::Relaxed);
        self.intake.push(qi);
        self.stats
            .queue_size
            .store(self.intake.len(), Ordering::Relaxed);
    }

    fn persist_set_result(
        &self,
        qi: &QueuedItem,
        result: MutationResult,
        dirtied: u32,
        rejects: &mut VecDeque<QueuedItem>,
    ) {
        if result.rows == 1 {
            self.stats.total_persisted.fetch_add(1, Ordering::Relaxed);
            if result.new_row_id > 0 {
                self.stats.new_items.fetch_add(1, Ordering::Relaxed);
                self.assign_row_id(qi, result.new_row_id);
            }
            // Memory held by a non-active bucket is better spent on the
            // active side; shed the value once it is safely on disk.
            if let Some(vb) = self.vbuckets.get(qi.vbucket()) {
                if vb.state() != VBucketState::Active
                    && self.stats.total_memory() > self.stats.mem_low_wat.load(Ordering::Relaxed)
                {
                    let bucket = vb.ht.partition_of(qi.key());
                    let mut part = vb.ht.lock_partition(bucket);
                    if let Some(v) = part.find(qi.key(), true) {
                        v.eject_value(&self.stats);
                    }
                }
            }
        } else if result.rows == 0 {
            // An update aimed at a missing row id; we no longer know
            // where this object lives, so don't redirty.
            warn!(
                vbucket = qi.vbucket(),
                key = ?qi.key(),
                "persisting returned no updated rows"
            );
        } else {
            self.redirty(qi, dirtied, rejects);
        }
    }

    fn persist_del_result(
        &self,
        qi: &QueuedItem,
        rows: i32,
        dirtied: u32,
        rejects: &mut VecDeque<QueuedItem>,
    ) {
        if rows >= 0 {
            if rows > 0 {
                self.stats.del_items.fetch_add(1, Ordering::Relaxed);
                self.stats.total_persisted.fetch_add(1, Ordering::Relaxed);
            }
            // The disk row is gone; the tombstone may leave memory. A
            // record resurrected by a concurrent set just loses its
            // stale row id.
            if let Some(vb) = self.vbuckets.get(qi.vbucket()) {
                let bucket = vb.ht.partition_of(qi.key());
                let mut part = vb.ht.lock_partition(bucket);
                if let Some(idx) = part.position(qi.key(), true) {
                    if part.record(idx).is_deleted() {
                        part.remove(qi.key());
                    } else {
                        part.record_mut(idx).clear_row_id();
                    }
                }
            }
        } else {
            self.redirty(qi, dirtied, rejects);
        }
    }

    fn assign_row_id(&self, qi: &QueuedItem, row_id: i64) {
        let done = self
            .vbuckets
            .get(qi.vbucket())
            .map(|vb| {
                let bucket = vb.ht.partition_of(qi.key());
                let mut part = vb.ht.lock_partition(bucket);
                match part.find(qi.key(), true) {
                    Some(v) => {
                        v.set_row_id(row_id);
                        true
                    }
                    None => false,
                }
            })
            .unwrap_or(false);
        if !done {
            warn!(vbucket = qi.vbucket(), key = ?qi.key(), "failed to set row id");
        }
    }

    fn redirty(&self, qi: &QueuedItem, dirtied: u32, rejects: &mut VecDeque<QueuedItem>) {
        self.stats.add_overhead(qi.mem_size());
        self.stats.flush_failed.fetch_add(1, Ordering::Relaxed);
        if let Some(vb) = self.vbuckets.get(qi.vbucket()) {
            let bucket = vb.ht.partition_of(qi.key());
            let mut part = vb.ht.lock_partition(bucket);
            if let Some(v) = part.find(qi.key(), true) {
                v.re_dirty(dirtied);
            }
        }
        rejects.push_back(qi.clone());
    }

    // ------------------------------------------------------------------
    // Transaction context
    // ------------------------------------------------------------------

    fn enter_transaction(&self, p: &mut Persistence) -> bool {
        if !p.in_txn {
            p.txn_remaining = self.stats.txn_size.load(Ordering::Relaxed) as isize;
            p.in_txn = p.kv.begin();
        }
        p.in_txn
    }

    fn leave_transaction(&self, p: &mut Persistence, completed: usize) {
        p.txn_remaining -= completed as isize;
        if p.txn_remaining <= 0 && p.in_txn {
            self.commit_transaction(p);
        }
    }

    fn commit_transaction(&self, p: &mut Persistence) {
        if !p.in_txn {
            return;
        }
        let start = self.clock.now();
        while !p.kv.commit() {
            self.stats.commit_failed.fetch_add(1, Ordering::Relaxed);
            std::thread::sleep(Duration::from_secs(1));
        }
        self.stats.flusher_commits.fetch_add(1, Ordering::Relaxed);
        p.in_txn = false;
        let took = self.clock.now().saturating_sub(start);
        self.stats.commit_time.store(took, Ordering::Relaxed);
        self.stats
            .cumulative_commit_time
            .fetch_add(u64::from(took), Ordering::Relaxed);
    }

    /// Forces the next transaction boundary to commit immediately.
    pub fn commit_soon(&self) {
        self.persistence.lock().txn_remaining = 0;
    }

    /// Pauses the flusher after requesting an early commit.
    pub fn pause_flusher(&self) -> bool {
        self.commit_soon();
        self.flusher.pause()
    }

    pub fn resume_flusher(&self) -> bool {
        self.flusher.resume()
    }

    /// Read-only backend access for diagnostics and tests.
    pub fn with_backend<R>(&self, f: impl FnOnce(&mut dyn KvStore) -> R) -> R {
        let mut p = self.persistence.lock();
        f(p.kv.as_mut())
    }
}

/// RAII increment of the in-flight background-fetch counter.
struct CounterGuard {
    counter: Arc<AtomicUsize>,
}

impl CounterGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        CounterGuard { counter }
    }
}

impl Drop for CounterGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

struct BgFetchTask {
    store: Arc<Store>,
    key: Bytes,
    vbucket: u16,
    row_id: i64,
    cookie: Cookie,
    init: Instant,
    _counter: CounterGuard,
}

impl DispatcherTask for BgFetchTask {
    fn run(&mut self, _d: &Dispatcher, _t: &TaskId) -> bool {
        let start = Instant::now();
        self.store.complete_bg_fetch(
            &self.key,
            self.vbucket,
            self.row_id,
            self.cookie,
            self.init,
            start,
        );
        false
    }

    fn description(&self) -> String {
        format!(
            "Fetching item from disk: {}",
            String::from_utf8_lossy(&self.key)
        )
    }
}

struct VKeyFetchTask {
    store: Arc<Store>,
    key: Bytes,
    row_id: i64,
    lookup: Option<Box<dyn FnOnce(GetValue) + Send>>,
    _counter: CounterGuard,
}

impl DispatcherTask for VKeyFetchTask {
    fn run(&mut self, _d: &Dispatcher, _t: &TaskId) -> bool {
        let gv = self.store.with_backend(|kv| kv.get(&self.key, self.row_id));
        if let Some(lookup) = self.lookup.take() {
            lookup(gv);
        }
        false
    }

    fn description(&self) -> String {
        format!(
            "Fetching item from disk for vkey stat: {}",
            String::from_utf8_lossy(&self.key)
        )
    }
}

struct SnapshotVBucketsTask {
    store: Arc<Store>,
    priority: Priority,
}

impl DispatcherTask for SnapshotVBucketsTask {
    fn run(&mut self, _d: &Dispatcher, _t: &TaskId) -> bool {
        self.store.snapshot_vbuckets(self.priority);
        false
    }

    fn description(&self) -> String {
        "Snapshotting vbuckets".to_string()
    }
}

struct NotifyVBStateChangeTask {
    vb: Arc<VBucket>,
    notifier: Arc<dyn Notifier>,
}

impl DispatcherTask for NotifyVBStateChangeTask {
    fn run(&mut self, _d: &Dispatcher, _t: &TaskId) -> bool {
        self.vb.fire_all_ops(self.notifier.as_ref());
        false
    }

    fn description(&self) -> String {
        format!("Notifying state change of vbucket {}", self.vb.id())
    }
}

struct VBucketDeletionTask {
    store: Arc<Store>,
    vbucket: u16,
    vb_version: u16,
    ranges: Vec<(i64, i64)>,
    next: usize,
    chunk_num: usize,
    started: Instant,
}

impl DispatcherTask for VBucketDeletionTask {
    fn run(&mut self, d: &Dispatcher, t: &TaskId) -> bool {
        let (range, is_last) = if self.next >= self.ranges.len() {
            (None, true)
        } else {
            (
                Some(self.ranges[self.next]),
                self.next + 1 == self.ranges.len(),
            )
        };

        match self
            .store
            .complete_vbucket_deletion(self.vbucket, self.vb_version, range, is_last)
        {
            VBucketDelResult::Success if !is_last => {
                self.next += 1;
                self.chunk_num += 1;
                d.snooze(t, 1.0);
                true
            }
            VBucketDelResult::Success => {
                let wall = self.started.elapsed().as_micros() as u64;
                self.store
                    .stats
                    .vbucket_del_total_walltime_micros
                    .fetch_add(wall, Ordering::Relaxed);
                self.store
                    .stats
                    .vbucket_del_max_walltime_micros
                    .fetch_max(wall, Ordering::Relaxed);
                false
            }
            VBucketDelResult::Fail => {
                debug!(
                    chunk = self.chunk_num,
                    vbucket = self.vbucket,
                    "rescheduling vbucket chunk deletion"
                );
                d.snooze(t, 10.0);
                true
            }
            VBucketDelResult::Invalid => false,
        }
    }

    fn description(&self) -> String {
        format!(
            "Removing chunk {} of vbucket {} from disk",
            self.chunk_num, self.vbucket
        )
    }
}
