use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;

use crate::error::Status;

/// Opaque per-request token; the engine hands it back through
/// `notify_io_complete` when a suspended operation may be retried.
pub type Cookie = u64;

/// Callback surface into the hosting server: how the engine tells a
/// suspended client that its operation may be retried.
pub trait Notifier: Send + Sync {
    /// Wakes the client identified by `cookie` with the final status of
    /// the blocked operation.
    fn notify_io_complete(&self, cookie: Cookie, status: Status);
}

/// CAS returned for a locked record instead of its real tag.
pub const LOCKED_CAS: u64 = u64::MAX;

static CAS_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Generates the next compare-and-swap tag. Strictly increasing
/// process-wide, which gives strict per-key monotonicity for free.
pub fn next_cas() -> u64 {
    CAS_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// A complete key/value pair as it crosses the engine boundary.
#[derive(Debug, Clone)]
pub struct Item {
    key: Bytes,
    value: Bytes,
    flags: u32,
    /// Absolute unix seconds; 0 means never.
    exptime: u32,
    cas: u64,
    row_id: i64,
    vbucket: u16,
}

impl Item {
    /// Builds a fresh item with no CAS and no durable row.
    pub fn new(key: impl Into<Bytes>, flags: u32, exptime: u32, value: impl Into<Bytes>) -> Self {
        Item {
            key: key.into(),
            value: value.into(),
            flags,
            exptime,
            cas: 0,
            row_id: -1,
            vbucket: 0,
        }
    }

    /// Builds an item carrying full metadata, as read back from disk.
    pub fn with_meta(
        key: impl Into<Bytes>,
        flags: u32,
        exptime: u32,
        value: impl Into<Bytes>,
        cas: u64,
        row_id: i64,
        vbucket: u16,
    ) -> Self {
        Item {
            key: key.into(),
            value: value.into(),
            flags,
            exptime,
            cas,
            row_id,
            vbucket,
        }
    }

    pub fn key(&self) -> &Bytes {
        &self.key
    }

    pub fn value(&self) -> &Bytes {
        &self.value
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

    pub fn row_id(&self) -> i64 {
        self.row_id
    }

    pub fn vbucket(&self) -> u16 {
        self.vbucket
    }

    pub fn set_vbucket(&mut self, vb: u16) {
        self.vbucket = vb;
    }

    pub fn set_cas(&mut self, cas: u64) {
        self.cas = cas;
    }

    pub fn set_exptime(&mut self, exptime: u32) {
        self.exptime = exptime;
    }

    /// Assigns a freshly generated CAS tag and returns it.
    pub fn refresh_cas(&mut self) -> u64 {
        self.cas = next_cas();
        self.cas
    }

    /// Replaces the value with `self.value ++ other.value`.
    pub fn append(&mut self, other: &Item) {
        let mut joined = Vec::with_capacity(self.value.len() + other.value.len());
        joined.extend_from_slice(&self.value);
        joined.extend_from_slice(&other.value);
        self.value = Bytes::from(joined);
    }

    /// Replaces the value with `other.value ++ self.value`.
    pub fn prepend(&mut self, other: &Item) {
        let mut joined = Vec::with_capacity(self.value.len() + other.value.len());
        joined.extend_from_slice(&other.value);
        joined.extend_from_slice(&self.value);
        self.value = Bytes::from(joined);
    }
}

/// Result of a read against memory or disk.
#[derive(Debug)]
pub struct GetValue {
    /// The item, if one was produced.
    pub item: Option<Item>,
    /// Outcome code.
    pub status: Status,
    /// Durable row id of the record, or -1.
    pub row_id: i64,
    /// VBucket version the row was persisted under (dump path only).
    pub vb_version: u16,
}

impl GetValue {
    /// A miss with the given status.
    pub fn miss(status: Status) -> Self {
        GetValue {
            item: None,
            status,
            row_id: -1,
            vb_version: 0,
        }
    }

    /// A successful read.
    pub fn hit(item: Item, row_id: i64) -> Self {
        GetValue {
            item: Some(item),
            status: Status::Success,
            row_id,
            vb_version: 0,
        }
    }
}

impl Default for GetValue {
    fn default() -> Self {
        GetValue::miss(Status::KeyNotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cas_tags_are_strictly_increasing() {
        let a = next_cas();
        let b = next_cas();
        assert!(b > a);
    }

    #[test]
    fn append_and_prepend_concatenate() {
        let mut base = Item::new(&b"k"[..], 0, 0, &b"mid"[..]);
        base.append(&Item::new(&b"k"[..], 0, 0, &b"post"[..]));
        base.prepend(&Item::new(&b"k"[..], 0, 0, &b"pre"[..]));
        assert_eq!(&base.value()[..], b"premidpost");
    }
}
