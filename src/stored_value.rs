use bytes::Bytes;

use crate::item::{next_cas, Item};
use crate::stats::EngineStats;

use std::sync::atomic::Ordering;

/// Fixed per-record metadata overhead charged to `mem_overhead`.
pub const STORED_VALUE_OVERHEAD: usize = 56;

/// Values smaller than this are not worth ejecting; the freed bytes would
/// not cover the cost of the later background fetch.
pub const MIN_EJECT_SIZE: usize = 64;

/// The per-key cell held in a hash-table chain.
///
/// A record can be *resident* (value bytes in memory), *non-resident*
/// (ejected; only metadata remains and `row_id` points at the durable
/// copy), or a *tombstone* (`deleted`, kept until the deletion persists).
#[derive(Debug)]
pub struct StoredValue {
    key: Bytes,
    value: Option<Bytes>,
    flags: u32,
    exptime: u32,
    cas: u64,
    row_id: i64,
    /// Relative seconds; 0 means unlocked.
    lock_until: u32,
    /// Relative seconds of the last full value write.
    data_age: u32,
    /// Relative seconds the dirty bit was last raised.
    dirtied_at: u32,
    dirty: bool,
    deleted: bool,
    /// A persistence attempt is in flight and the row id is unknown.
    pending_id: bool,
}

impl StoredValue {
    pub(crate) fn from_item(item: &Item, dirty: bool, resident: bool, now: u32) -> Self {
        StoredValue {
            key: item.key().clone(),
            value: if resident {
                Some(item.value().clone())
            } else {
                None
            },
            flags: item.flags(),
            exptime: item.exptime(),
            cas: item.cas(),
            row_id: item.row_id(),
            lock_until: 0,
            data_age: now,
            dirtied_at: now,
            dirty,
            deleted: false,
            pending_id: false,
        }
    }

    pub fn key(&self) -> &Bytes {
        &self.key
    }

    /// Value bytes, present only while resident and not deleted.
    pub fn value(&self) -> Option<&Bytes> {
        self.value.as_ref()
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn exptime(&self) -> u32 {
        self.exptime
    }

    pub fn cas(&self) -> u64 {
        self.cas
    }

    pub fn set_cas(&mut self, cas: u64) {
        self.cas = cas;
    }

    pub fn row_id(&self) -> i64 {
        self.row_id
    }

    /// True once the backend has assigned a durable row.
    pub fn has_row_id(&self) -> bool {
        self.row_id > 0
    }

    /// Records the backend-assigned row id and clears the pending marker.
    pub fn set_row_id(&mut self, id: i64) {
        self.row_id = id;
        self.pending_id = false;
    }

    pub fn clear_row_id(&mut self) {
        self.row_id = -1;
        self.pending_id = false;
    }

    pub fn is_pending_id(&self) -> bool {
        self.pending_id
    }

    /// Marks an insert as in flight so concurrent flushes skip the record
    /// until the row id comes back.
    pub fn set_pending_id(&mut self) {
        self.pending_id = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn is_resident(&self) -> bool {
        self.value.is_some()
    }

    pub fn data_age(&self) -> u32 {
        self.data_age
    }

    pub fn dirtied_at(&self) -> u32 {
        self.dirtied_at
    }

    /// True if the record carries an expiry in the past.
    pub fn is_expired(&self, abs_now: u64) -> bool {
        self.exptime != 0 && abs_now > u64::from(self.exptime)
    }

    /// Checks the lock, releasing it if the deadline has passed.
    pub fn is_locked(&mut self, rel_now: u32) -> bool {
        if self.lock_until == 0 {
            return false;
        }
        if rel_now > self.lock_until {
            self.lock_until = 0;
            return false;
        }
        true
    }

    pub fn lock(&mut self, until: u32) {
        self.lock_until = until;
    }

    pub fn unlock(&mut self) {
        self.lock_until = 0;
    }

    /// Raises the dirty bit with a fresh enqueue stamp.
    pub fn mark_dirty(&mut self, now: u32) {
        self.dirty = true;
        self.dirtied_at = now;
    }

    /// Restores the dirty bit with the original enqueue stamp so the
    /// queued age keeps growing across a requeue. The abandoned
    /// persistence attempt no longer holds the row id.
    pub fn re_dirty(&mut self, dirtied_at: u32) {
        self.dirty = true;
        self.dirtied_at = dirtied_at;
        self.pending_id = false;
    }

    /// Clears the dirty bit, returning the stamp it carried.
    pub fn mark_clean(&mut self) -> u32 {
        self.dirty = false;
        self.dirtied_at
    }

    /// Replaces the value and metadata from `item`. The data age resets
    /// only when the stored bytes actually change.
    pub(crate) fn set_value(&mut self, item: &Item, now: u32, stats: &EngineStats) {
        let old_len = self.value.as_ref().map(Bytes::len).unwrap_or(0);
        let new_len = item.value().len();
        let changed = self.value.as_deref() != Some(&item.value()[..]);

        stats.current_size.fetch_sub(old_len, Ordering::Relaxed);
        stats.current_size.fetch_add(new_len, Ordering::Relaxed);
        if !self.deleted {
            stats.total_cache_size.fetch_sub(old_len, Ordering::Relaxed);
        }
        stats.total_cache_size.fetch_add(new_len, Ordering::Relaxed);

        self.value = Some(item.value().clone());
        self.flags = item.flags();
        self.exptime = item.exptime();
        self.deleted = false;
        if changed {
            self.data_age = now;
        }
        self.mark_dirty(now);
    }

    /// Turns the record into a tombstone, releasing the value bytes.
    pub(crate) fn del(&mut self, now: u32, stats: &EngineStats) {
        if let Some(v) = self.value.take() {
            stats.current_size.fetch_sub(v.len(), Ordering::Relaxed);
            stats.total_cache_size.fetch_sub(v.len(), Ordering::Relaxed);
        }
        self.deleted = true;
        self.mark_dirty(now);
    }

    /// Drops the value bytes of a clean, live, resident record that is
    /// big enough to be worth re-reading from disk later.
    pub fn eject_value(&mut self, stats: &EngineStats) -> bool {
        if self.dirty || self.deleted || !self.is_resident() {
            return false;
        }
        let len = self.value.as_ref().map(Bytes::len).unwrap_or(0);
        if len < MIN_EJECT_SIZE {
            return false;
        }
        self.value = None;
        stats.current_size.fetch_sub(len, Ordering::Relaxed);
        stats.num_value_ejects.fetch_add(1, Ordering::Relaxed);
        stats.num_non_resident.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Reinstates the value bytes of a non-resident record. Refuses to
    /// touch dirty, deleted, or already-resident records; a background
    /// fetch must never clobber a newer mutation.
    pub fn restore_value(&mut self, bytes: Bytes, stats: &EngineStats) -> bool {
        if self.dirty || self.deleted || self.is_resident() {
            return false;
        }
        stats.current_size.fetch_add(bytes.len(), Ordering::Relaxed);
        self.value = Some(bytes);
        if stats.num_non_resident.load(Ordering::Relaxed) > 0 {
            stats.num_non_resident.fetch_sub(1, Ordering::Relaxed);
        }
        true
    }

    /// Builds a response item snapshotting the record.
    pub fn to_item(&self, vbucket: u16, cas: u64) -> Item {
        Item::with_meta(
            self.key.clone(),
            self.flags,
            self.exptime,
            self.value.clone().unwrap_or_else(Bytes::new),
            cas,
            self.row_id,
            vbucket,
        )
    }

    /// Bytes of value data logically held by this record.
    pub fn value_len(&self) -> usize {
        self.value.as_ref().map(Bytes::len).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(key: &[u8], value: &[u8]) -> Item {
        Item::new(key.to_vec(), 0, 0, value.to_vec())
    }

    #[test]
    fn eject_requires_clean_resident_and_big_enough() {
        let stats = EngineStats::new();
        let big = vec![b'x'; MIN_EJECT_SIZE];
        let mut v = StoredValue::from_item(&item(b"k", &big), true, true, 0);
        assert!(!v.eject_value(&stats), "dirty record must not eject");
        v.mark_clean();
        assert!(v.eject_value(&stats));
        assert!(!v.is_resident());
        assert!(!v.eject_value(&stats), "already ejected");

        let mut small = StoredValue::from_item(&item(b"k", b"tiny"), false, true, 0);
        assert!(!small.eject_value(&stats), "small object must not eject");
    }

    #[test]
    fn restore_refuses_dirty_and_deleted() {
        let stats = EngineStats::new();
        let big = vec![b'x'; MIN_EJECT_SIZE];
        let mut v = StoredValue::from_item(&item(b"k", &big), false, true, 0);
        assert!(v.eject_value(&stats));

        v.mark_dirty(1);
        assert!(!v.restore_value(Bytes::from_static(b"new"), &stats));
        v.mark_clean();
        assert!(v.restore_value(Bytes::copy_from_slice(&big), &stats));
        assert!(v.is_resident());
    }

    #[test]
    fn data_age_resets_only_on_changed_bytes() {
        let stats = EngineStats::new();
        let mut v = StoredValue::from_item(&item(b"k", b"same"), true, true, 0);
        v.set_value(&item(b"k", b"same"), 10, &stats);
        assert_eq!(v.data_age(), 0);
        v.set_value(&item(b"k", b"other"), 20, &stats);
        assert_eq!(v.data_age(), 20);
    }

    #[test]
    fn lock_expires() {
        let mut v = StoredValue::from_item(&item(b"k", b"v"), true, true, 0);
        v.lock(10);
        assert!(v.is_locked(5));
        assert!(v.is_locked(10));
        assert!(!v.is_locked(11));
        assert!(!v.is_locked(5), "expiry clears the lock");
    }
}
