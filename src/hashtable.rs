use std::hash::Hasher;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use siphasher::sip::SipHasher13;

use crate::item::Item;
use crate::stats::EngineStats;
use crate::stored_value::{StoredValue, STORED_VALUE_OVERHEAD};
use crate::time::Clock;

/// Outcome of a `set`-style mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationType {
    /// No live or deleted record existed; on a non-CAS set the item was
    /// freshly inserted.
    NotFound,
    /// The incoming CAS did not match the current tag.
    InvalidCas,
    /// Replaced a clean record.
    WasClean,
    /// Replaced a record whose previous mutation is still queued.
    WasDirty,
    /// The record is locked and the incoming CAS does not own the lock.
    IsLocked,
    /// Admitting the bytes would exceed the memory ceiling.
    NoMem,
    /// The hash table has been shut down.
    InvalidVBucket,
}

/// Outcome of an `add`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddType {
    /// Inserted a brand-new record.
    Success,
    /// Reused a tombstone (or an expired record).
    UnDel,
    /// A live record already exists.
    Exists,
    /// Admitting the bytes would exceed the memory ceiling.
    NoMem,
}

/// Outcome of a soft delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteType {
    /// The record was clean; a deletion must be enqueued.
    WasClean,
    /// The record was already dirty; the queued entry covers the delete.
    WasDirty,
    /// No live record.
    NotFound,
}

/// Walks every stored value under the owning stripe lock.
pub trait HashTableVisitor {
    /// Called once per record; may mutate (e.g. eject) the record.
    fn visit(&mut self, v: &mut StoredValue);
}

/// Observes per-bucket chain depths.
pub trait HashTableDepthVisitor {
    /// Called once per bucket with its chain length.
    fn visit_depth(&mut self, depth: usize);
}

struct Stripe {
    chains: Vec<Vec<StoredValue>>,
}

/// Fixed-bucket hash table with a smaller stripe-lock array.
///
/// Bucket `b` is guarded by stripe `b % num_locks`; each stripe mutex owns
/// the chains of exactly the buckets that map to it, so chain access never
/// crosses a lock boundary. All mutating operations go through a
/// [`Partition`] guard, which lets the store enqueue flush work while the
/// stripe lock that produced the mutation is still held.
pub struct HashTable {
    stripes: Vec<Mutex<Stripe>>,
    size: usize,
    num_locks: usize,
    num_items: AtomicUsize,
    active: AtomicBool,
    stats: Arc<EngineStats>,
    clock: Clock,
}

/// An exclusively locked slice of the table: one bucket's chain plus the
/// shared accounting handles.
pub struct Partition<'a> {
    guard: MutexGuard<'a, Stripe>,
    chain: usize,
    stats: &'a EngineStats,
    num_items: &'a AtomicUsize,
}

impl HashTable {
    /// Default bucket count (prime).
    pub const DEFAULT_SIZE: usize = 196_613;
    /// Default stripe-lock count (prime).
    pub const DEFAULT_NUM_LOCKS: usize = 193;

    /// Creates a table with `size` buckets and `num_locks` stripes.
    /// Zero values select the defaults; the lock count is clamped below
    /// the bucket count.
    pub fn new(size: usize, num_locks: usize, stats: Arc<EngineStats>, clock: Clock) -> Self {
        let size = if size == 0 { Self::DEFAULT_SIZE } else { size };
        let num_locks = if num_locks == 0 {
            Self::DEFAULT_NUM_LOCKS
        } else {
            num_locks
        };
        let num_locks = num_locks.min(size).max(1);

        let mut stripes = Vec::with_capacity(num_locks);
        for i in 0..num_locks {
            let chains = (size - i + num_locks - 1) / num_locks;
            stripes.push(Mutex::new(Stripe {
                chains: (0..chains).map(|_| Vec::new()).collect(),
            }));
        }
        HashTable {
            stripes,
            size,
            num_locks,
            num_items: AtomicUsize::new(0),
            active: AtomicBool::new(true),
            stats,
            clock,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn num_locks(&self) -> usize {
        self.num_locks
    }

    /// Records currently chained, tombstones included.
    pub fn num_items(&self) -> usize {
        self.num_items.load(Ordering::Relaxed)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    /// Marks the table unusable; later sets report `InvalidVBucket`.
    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Relaxed);
    }

    /// Maps a key to its bucket index.
    pub fn partition_of(&self, key: &[u8]) -> usize {
        let mut h = SipHasher13::new_with_keys(0, 0);
        h.write(key);
        (h.finish() % self.size as u64) as usize
    }

    /// Locks the stripe guarding `bucket` and returns the partition view.
    pub fn lock_partition(&self, bucket: usize) -> Partition<'_> {
        let stripe = bucket % self.num_locks;
        Partition {
            guard: self.stripes[stripe].lock(),
            chain: bucket / self.num_locks,
            stats: &self.stats,
            num_items: &self.num_items,
        }
    }

    /// Inserts or replaces under the partition lock the caller holds.
    ///
    /// On success the item is stamped with a freshly generated CAS so the
    /// caller can report it. A non-zero incoming CAS must match the
    /// current tag (or own the record's lock) to proceed.
    pub fn set_locked(
        &self,
        part: &mut Partition<'_>,
        item: &mut Item,
        enforce: bool,
    ) -> MutationType {
        if !self.is_active() {
            return MutationType::InvalidVBucket;
        }
        let now = self.clock.now();
        let cas_op = item.cas() != 0;

        match part.position(item.key(), true) {
            None => {
                if cas_op {
                    return MutationType::NotFound;
                }
                if enforce && !self.stats.has_space_for(Self::admission_cost(item)) {
                    return MutationType::NoMem;
                }
                item.refresh_cas();
                part.insert_record(StoredValue::from_item(item, true, true, now));
                MutationType::NotFound
            }
            Some(idx) => {
                let stats = &self.stats;
                let v = part.record_mut(idx);
                if v.is_deleted() {
                    // A tombstone behaves like a missing key for CAS sets.
                    if cas_op {
                        return MutationType::NotFound;
                    }
                    if enforce && !stats.has_space_for(item.value().len()) {
                        return MutationType::NoMem;
                    }
                    let was_dirty = v.is_dirty();
                    item.refresh_cas();
                    v.set_cas(item.cas());
                    v.set_value(item, now, stats);
                    return if was_dirty {
                        MutationType::WasDirty
                    } else {
                        MutationType::WasClean
                    };
                }

                if enforce && v.is_locked(now) {
                    if cas_op && item.cas() == v.cas() {
                        v.unlock();
                    } else {
                        return MutationType::IsLocked;
                    }
                }
                if cas_op && item.cas() != v.cas() {
                    return MutationType::InvalidCas;
                }
                let grow = item.value().len().saturating_sub(v.value_len());
                if enforce && grow > 0 && !stats.has_space_for(grow) {
                    return MutationType::NoMem;
                }
                let was_dirty = v.is_dirty();
                item.refresh_cas();
                v.set_cas(item.cas());
                v.set_value(item, now, stats);
                if was_dirty {
                    MutationType::WasDirty
                } else {
                    MutationType::WasClean
                }
            }
        }
    }

    /// Adds a record only if no live one exists.
    ///
    /// `dirty` is false for warmup loads (they are already persisted and
    /// keep the CAS read from disk); `retain` false inserts the record
    /// non-resident, dropping the value bytes immediately.
    pub fn add_locked(
        &self,
        part: &mut Partition<'_>,
        item: &mut Item,
        dirty: bool,
        retain: bool,
    ) -> AddType {
        let now = self.clock.now();
        let abs_now = self.clock.real_time();

        match part.position(item.key(), true) {
            Some(idx) if !part.record(idx).is_deleted() && !part.record(idx).is_expired(abs_now) => {
                AddType::Exists
            }
            Some(idx) => {
                if !self.stats.has_space_for(item.value().len()) {
                    return AddType::NoMem;
                }
                if dirty {
                    item.refresh_cas();
                }
                let old_row_id = part.record(idx).row_id();
                part.drop_record(idx);
                let mut sv = StoredValue::from_item(item, dirty, retain, now);
                if item.row_id() == -1 && old_row_id > 0 {
                    sv.set_row_id(old_row_id);
                }
                part.insert_record(sv);
                AddType::UnDel
            }
            None => {
                if !self.stats.has_space_for(Self::admission_cost(item)) {
                    return AddType::NoMem;
                }
                if dirty {
                    item.refresh_cas();
                }
                part.insert_record(StoredValue::from_item(item, dirty, retain, now));
                AddType::Success
            }
        }
    }

    /// Marks a live record deleted, keeping the tombstone for the flusher.
    pub fn soft_delete_locked(&self, part: &mut Partition<'_>, key: &[u8]) -> DeleteType {
        let now = self.clock.now();
        let stats = &self.stats;
        match part.position(key, false) {
            None => DeleteType::NotFound,
            Some(idx) => {
                let v = part.record_mut(idx);
                let was_dirty = v.is_dirty();
                v.del(now, stats);
                if was_dirty {
                    DeleteType::WasDirty
                } else {
                    DeleteType::WasClean
                }
            }
        }
    }

    /// Locking convenience wrapper over [`HashTable::set_locked`].
    pub fn set(&self, item: &mut Item, enforce: bool) -> MutationType {
        let bucket = self.partition_of(item.key());
        let mut part = self.lock_partition(bucket);
        self.set_locked(&mut part, item, enforce)
    }

    /// Locking convenience wrapper over [`HashTable::add_locked`].
    pub fn add(&self, item: &mut Item, dirty: bool, retain: bool) -> AddType {
        let bucket = self.partition_of(item.key());
        let mut part = self.lock_partition(bucket);
        self.add_locked(&mut part, item, dirty, retain)
    }

    /// Locking convenience wrapper over [`HashTable::soft_delete_locked`].
    pub fn soft_delete(&self, key: &[u8]) -> DeleteType {
        let bucket = self.partition_of(key);
        let mut part = self.lock_partition(bucket);
        self.soft_delete_locked(&mut part, key)
    }

    /// Snapshot of a live record, for diagnostics and tests.
    pub fn get_item(&self, key: &[u8]) -> Option<Item> {
        let bucket = self.partition_of(key);
        let mut part = self.lock_partition(bucket);
        let idx = part.position(key, false)?;
        let v = part.record(idx);
        let cas = v.cas();
        Some(v.to_item(0, cas))
    }

    /// Visits every record, stripe by stripe.
    pub fn visit(&self, visitor: &mut dyn HashTableVisitor) {
        for stripe in &self.stripes {
            let mut guard = stripe.lock();
            for chain in guard.chains.iter_mut() {
                for v in chain.iter_mut() {
                    visitor.visit(v);
                }
            }
        }
    }

    /// Reports each bucket's chain depth.
    pub fn visit_depth(&self, visitor: &mut dyn HashTableDepthVisitor) {
        for stripe in &self.stripes {
            let guard = stripe.lock();
            for chain in guard.chains.iter() {
                visitor.visit_depth(chain.len());
            }
        }
    }

    /// Drops every record, fixing up the shared accounting.
    pub fn clear(&self) {
        for stripe in &self.stripes {
            let mut guard = stripe.lock();
            for chain in guard.chains.iter_mut() {
                for v in chain.drain(..) {
                    release_accounting(&self.stats, &v);
                    self.num_items.fetch_sub(1, Ordering::Relaxed);
                }
            }
        }
    }

    fn admission_cost(item: &Item) -> usize {
        item.value().len() + item.key().len() + STORED_VALUE_OVERHEAD
    }
}

fn release_accounting(stats: &EngineStats, v: &StoredValue) {
    let len = v.value_len();
    if len > 0 {
        stats.current_size.fetch_sub(len, Ordering::Relaxed);
        stats.total_cache_size.fetch_sub(len, Ordering::Relaxed);
    }
    stats.sub_overhead(v.key().len() + STORED_VALUE_OVERHEAD);
    if !v.is_resident() && !v.is_deleted() && stats.num_non_resident.load(Ordering::Relaxed) > 0 {
        stats.num_non_resident.fetch_sub(1, Ordering::Relaxed);
    }
}

impl<'a> Partition<'a> {
    /// Index of the record for `key` in this partition's chain.
    pub fn position(&self, key: &[u8], want_deleted: bool) -> Option<usize> {
        self.guard.chains[self.chain]
            .iter()
            .position(|v| v.key()[..] == *key && (want_deleted || !v.is_deleted()))
    }

    /// Mutable record lookup; skips tombstones unless `want_deleted`.
    pub fn find(&mut self, key: &[u8], want_deleted: bool) -> Option<&mut StoredValue> {
        let idx = self.position(key, want_deleted)?;
        Some(&mut self.guard.chains[self.chain][idx])
    }

    pub(crate) fn record(&self, idx: usize) -> &StoredValue {
        &self.guard.chains[self.chain][idx]
    }

    pub(crate) fn record_mut(&mut self, idx: usize) -> &mut StoredValue {
        &mut self.guard.chains[self.chain][idx]
    }

    fn insert_record(&mut self, v: StoredValue) {
        let len = v.value_len();
        if v.is_resident() {
            self.stats.current_size.fetch_add(len, Ordering::Relaxed);
        }
        self.stats
            .total_cache_size
            .fetch_add(len, Ordering::Relaxed);
        self.stats
            .add_overhead(v.key().len() + STORED_VALUE_OVERHEAD);
        self.num_items.fetch_add(1, Ordering::Relaxed);
        self.guard.chains[self.chain].push(v);
    }

    fn drop_record(&mut self, idx: usize) -> StoredValue {
        let v = self.guard.chains[self.chain].swap_remove(idx);
        release_accounting(self.stats, &v);
        self.num_items.fetch_sub(1, Ordering::Relaxed);
        v
    }

    /// Physically removes the record for `key`. Used once the backend has
    /// acknowledged a deletion.
    pub fn remove(&mut self, key: &[u8]) -> bool {
        match self.position(key, true) {
            Some(idx) => {
                self.drop_record(idx);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::Item;

    fn table(size: usize, locks: usize) -> HashTable {
        HashTable::new(size, locks, Arc::new(EngineStats::new()), Clock::new())
    }

    fn mk(key: &str) -> Item {
        Item::new(key.as_bytes().to_vec(), 0, 0, key.as_bytes().to_vec())
    }

    struct Counter {
        count: usize,
    }

    impl HashTableVisitor for Counter {
        fn visit(&mut self, v: &mut StoredValue) {
            if !v.is_deleted() {
                self.count += 1;
            }
        }
    }

    fn count(ht: &HashTable) -> usize {
        let mut c = Counter { count: 0 };
        ht.visit(&mut c);
        c.count
    }

    #[test]
    fn fresh_insert_reports_not_found() {
        let ht = table(5, 1);
        let mut it = mk("key");
        assert_eq!(ht.set(&mut it, true), MutationType::NotFound);
        assert!(it.cas() > 0);
        assert_eq!(count(&ht), 1);
    }

    #[test]
    fn cas_mismatch_is_rejected() {
        let ht = table(5, 1);
        let mut it = mk("key");
        ht.set(&mut it, true);
        let good = it.cas();

        let mut stale = mk("key");
        stale.set_cas(good - 1);
        assert_eq!(ht.set(&mut stale, true), MutationType::InvalidCas);

        let mut exact = mk("key");
        exact.set_cas(good);
        assert_eq!(ht.set(&mut exact, true), MutationType::WasDirty);
        assert!(exact.cas() > good);
    }

    #[test]
    fn cas_set_against_missing_key_does_not_insert() {
        let ht = table(5, 1);
        let mut it = mk("ghost");
        it.set_cas(42);
        assert_eq!(ht.set(&mut it, true), MutationType::NotFound);
        assert_eq!(count(&ht), 0);
    }

    #[test]
    fn soft_delete_keeps_tombstone() {
        let ht = table(5, 1);
        let mut it = mk("key");
        ht.set(&mut it, true);
        assert_eq!(ht.soft_delete(b"key"), DeleteType::WasDirty);
        assert_eq!(ht.soft_delete(b"key"), DeleteType::NotFound);
        assert_eq!(count(&ht), 0);
        assert_eq!(ht.num_items(), 1, "tombstone still chained");
    }

    #[test]
    fn add_over_tombstone_undeletes() {
        let ht = table(5, 1);
        let mut it = mk("key");
        ht.set(&mut it, true);
        ht.soft_delete(b"key");

        let mut again = mk("key");
        assert_eq!(ht.add(&mut again, true, true), AddType::UnDel);
        assert_eq!(ht.add(&mut mk("key"), true, true), AddType::Exists);
    }

    #[test]
    fn clear_releases_accounting() {
        let stats = Arc::new(EngineStats::new());
        let ht = HashTable::new(5, 1, Arc::clone(&stats), Clock::new());
        for i in 0..10 {
            ht.set(&mut mk(&format!("key{i}")), true);
        }
        assert!(stats.total_memory() > 0);
        ht.clear();
        assert_eq!(ht.num_items(), 0);
        assert_eq!(stats.total_memory(), 0);
    }
}
