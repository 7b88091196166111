use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::error::Status;
use crate::hashtable::HashTable;
use crate::item::{Cookie, Notifier};
use crate::stats::EngineStats;
use crate::time::Clock;

/// Lifecycle state of a vbucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VBucketState {
    /// Owns the keyspace slice; serves reads and writes.
    Active,
    /// Receives replicated writes only.
    Replica,
    /// Ownership transfer in progress; clients are suspended.
    Pending,
    /// Scheduled for removal.
    Dead,
}

impl VBucketState {
    /// Canonical lowercase name, as persisted in the state snapshot.
    pub fn as_str(self) -> &'static str {
        match self {
            VBucketState::Active => "active",
            VBucketState::Replica => "replica",
            VBucketState::Pending => "pending",
            VBucketState::Dead => "dead",
        }
    }

    /// Parses a persisted state name.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(VBucketState::Active),
            "replica" => Some(VBucketState::Replica),
            "pending" => Some(VBucketState::Pending),
            "dead" => Some(VBucketState::Dead),
            _ => None,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => VBucketState::Active,
            1 => VBucketState::Replica,
            2 => VBucketState::Pending,
            _ => VBucketState::Dead,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            VBucketState::Active => 0,
            VBucketState::Replica => 1,
            VBucketState::Pending => 2,
            VBucketState::Dead => 3,
        }
    }
}

struct PendingOps {
    cookies: Vec<Cookie>,
    start: Option<Instant>,
}

/// One hash partition of the keyspace: a state, a hash table, and the
/// cookies of clients suspended while the bucket is `Pending`.
pub struct VBucket {
    id: u16,
    state: AtomicU8,
    /// The bucket's records. Exclusively owned; shared access goes
    /// through the table's own stripe locks.
    pub ht: HashTable,
    pending_ops: Mutex<PendingOps>,
    stats: Arc<EngineStats>,
}

impl VBucket {
    /// Creates a vbucket shell in the given state.
    pub fn new(
        id: u16,
        state: VBucketState,
        ht_size: usize,
        ht_locks: usize,
        stats: Arc<EngineStats>,
        clock: Clock,
    ) -> Self {
        VBucket {
            id,
            state: AtomicU8::new(state.as_u8()),
            ht: HashTable::new(ht_size, ht_locks, stats.clone(), clock),
            pending_ops: Mutex::new(PendingOps {
                cookies: Vec::new(),
                start: None,
            }),
            stats,
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn state(&self) -> VBucketState {
        VBucketState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Transitions the state. Callers must hold the map-wide vbset mutex.
    pub fn set_state(&self, to: VBucketState) {
        let old = self.state();
        debug!(
            vbucket = self.id,
            from = old.as_str(),
            to = to.as_str(),
            "vbucket.transition"
        );
        self.state.store(to.as_u8(), Ordering::Release);
    }

    /// Queues a client cookie while the bucket is `Pending`.
    ///
    /// Returns true if the cookie was queued (the caller must report
    /// `WouldBlock`); false if the bucket left `Pending` in the meantime
    /// and the operation should proceed.
    pub fn add_pending_op(&self, cookie: Cookie) -> bool {
        let mut ops = self.pending_ops.lock();
        if self.state() != VBucketState::Pending {
            return false;
        }
        if ops.start.is_none() {
            ops.start = Some(Instant::now());
        }
        ops.cookies.push(cookie);
        self.stats.pending_ops.fetch_add(1, Ordering::Relaxed);
        self.stats.pending_ops_total.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Number of cookies currently parked on this bucket.
    pub fn pending_op_count(&self) -> usize {
        self.pending_ops.lock().cookies.len()
    }

    /// Releases every parked cookie with a status derived from the
    /// current state. Does nothing while still `Pending`.
    pub fn fire_all_ops(&self, notifier: &dyn Notifier) {
        let code = match self.state() {
            VBucketState::Active => Status::Success,
            VBucketState::Pending => return,
            _ => Status::NotMyVBucket,
        };
        let mut ops = self.pending_ops.lock();
        let cookies = std::mem::take(&mut ops.cookies);
        ops.start = None;
        if cookies.is_empty() {
            return;
        }
        self.stats
            .pending_ops
            .fetch_sub(cookies.len(), Ordering::Relaxed);
        self.stats
            .pending_ops_max
            .fetch_max(cookies.len(), Ordering::Relaxed);
        drop(ops);
        for cookie in &cookies {
            notifier.notify_io_complete(*cookie, code);
        }
        info!(
            vbucket = self.id,
            state = self.state().as_str(),
            fired = cookies.len(),
            "vbucket.fired_pending_ops"
        );
    }
}

/// Sentinel returned for ids with no recorded version.
pub const NO_VB_VERSION: u16 = u16::MAX;

/// Dense, id-indexed collection of vbucket handles with per-id versions
/// and the snapshot/deletion coordination flags.
pub struct VBucketMap {
    buckets: Vec<RwLock<Option<Arc<VBucket>>>>,
    versions: Vec<AtomicU16>,
    deletions: Vec<AtomicBool>,
    hi_prio_snapshot: AtomicBool,
    lo_prio_snapshot: AtomicBool,
}

impl VBucketMap {
    /// Creates a map with `num_vbuckets` slots.
    pub fn new(num_vbuckets: usize) -> Self {
        VBucketMap {
            buckets: (0..num_vbuckets).map(|_| RwLock::new(None)).collect(),
            versions: (0..num_vbuckets)
                .map(|_| AtomicU16::new(NO_VB_VERSION))
                .collect(),
            deletions: (0..num_vbuckets).map(|_| AtomicBool::new(false)).collect(),
            hi_prio_snapshot: AtomicBool::new(false),
            lo_prio_snapshot: AtomicBool::new(false),
        }
    }

    /// Number of addressable ids.
    pub fn capacity(&self) -> usize {
        self.buckets.len()
    }

    pub fn get(&self, id: u16) -> Option<Arc<VBucket>> {
        self.buckets
            .get(usize::from(id))
            .and_then(|slot| slot.read().clone())
    }

    /// Installs (or replaces) the handle for the bucket's id.
    pub fn add(&self, vb: Arc<VBucket>) {
        if let Some(slot) = self.buckets.get(usize::from(vb.id())) {
            *slot.write() = Some(vb);
        }
    }

    /// Drops the handle for `id`, returning it to the caller.
    pub fn remove(&self, id: u16) -> Option<Arc<VBucket>> {
        self.buckets
            .get(usize::from(id))
            .and_then(|slot| slot.write().take())
    }

    /// Ids with a live handle.
    pub fn live_ids(&self) -> Vec<u16> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.read().is_some())
            .map(|(i, _)| i as u16)
            .collect()
    }

    /// Version recorded for `id`, or [`NO_VB_VERSION`].
    pub fn version(&self, id: u16) -> u16 {
        self.versions
            .get(usize::from(id))
            .map(|v| v.load(Ordering::Acquire))
            .unwrap_or(NO_VB_VERSION)
    }

    pub fn set_version(&self, id: u16, version: u16) {
        if let Some(v) = self.versions.get(usize::from(id)) {
            v.store(version, Ordering::Release);
        }
    }

    /// Version to use for the next reincarnation of `id`.
    pub fn next_version(&self, id: u16) -> u16 {
        let cur = self.version(id);
        if cur == NO_VB_VERSION || cur == NO_VB_VERSION - 1 {
            0
        } else {
            cur + 1
        }
    }

    pub fn is_bucket_deletion(&self, id: u16) -> bool {
        self.deletions
            .get(usize::from(id))
            .map(|d| d.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Flips the deletion flag; true iff the value actually changed, so
    /// only one deletion task is ever scheduled per incarnation.
    pub fn set_bucket_deletion(&self, id: u16, value: bool) -> bool {
        self.deletions
            .get(usize::from(id))
            .map(|d| d.swap(value, Ordering::AcqRel) != value)
            .unwrap_or(false)
    }

    /// Flips the high-priority snapshot flag; true iff it changed.
    pub fn set_high_priority_vb_snapshot(&self, value: bool) -> bool {
        self.hi_prio_snapshot.swap(value, Ordering::AcqRel) != value
    }

    /// Flips the low-priority snapshot flag; true iff it changed.
    pub fn set_low_priority_vb_snapshot(&self, value: bool) -> bool {
        self.lo_prio_snapshot.swap(value, Ordering::AcqRel) != value
    }

    pub fn is_high_priority_snapshot_scheduled(&self) -> bool {
        self.hi_prio_snapshot.load(Ordering::Acquire)
    }
}
