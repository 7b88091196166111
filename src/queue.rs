use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;

/// Kind of work a queued entry represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOp {
    /// Persist the key's current state.
    Set,
    /// Persist the key's deletion.
    Del,
    /// Reset the entire backend.
    Flush,
}

/// One unit of pending persistence work.
///
/// Entries carry the vbucket version observed at enqueue time; the flusher
/// drops `Set` entries whose version no longer matches the map (the
/// vbucket was deleted and recreated in between).
#[derive(Debug, Clone)]
pub struct QueuedItem {
    key: Bytes,
    vbucket: u16,
    vb_version: u16,
    op: QueueOp,
    /// Relative seconds the entry was queued.
    dirtied_at: u32,
}

impl QueuedItem {
    pub fn new(key: Bytes, vbucket: u16, vb_version: u16, op: QueueOp, dirtied_at: u32) -> Self {
        QueuedItem {
            key,
            vbucket,
            vb_version,
            op,
            dirtied_at,
        }
    }

    pub fn key(&self) -> &Bytes {
        &self.key
    }

    pub fn vbucket(&self) -> u16 {
        self.vbucket
    }

    pub fn vb_version(&self) -> u16 {
        self.vb_version
    }

    pub fn op(&self) -> QueueOp {
        self.op
    }

    pub fn dirtied_at(&self) -> u32 {
        self.dirtied_at
    }

    /// Bytes charged to `mem_overhead` while the entry is queued.
    pub fn mem_size(&self) -> usize {
        self.key.len() + 32
    }
}

/// Multi-producer intake queue for dirty keys.
///
/// Producers push under the stripe lock that produced the mutation, which
/// is what gives the per-key ordering guarantee; the flusher drains the
/// whole queue in one swap at the start of a cycle.
pub struct IntakeQueue {
    items: Mutex<VecDeque<QueuedItem>>,
    len: AtomicUsize,
}

impl IntakeQueue {
    pub fn new() -> Self {
        IntakeQueue {
            items: Mutex::new(VecDeque::new()),
            len: AtomicUsize::new(0),
        }
    }

    pub fn push(&self, qi: QueuedItem) {
        let mut items = self.items.lock();
        items.push_back(qi);
        self.len.store(items.len(), Ordering::Relaxed);
    }

    /// Moves everything queued so far onto the back of `out`.
    pub fn drain_into(&self, out: &mut VecDeque<QueuedItem>) {
        let mut items = self.items.lock();
        out.append(&mut items);
        self.len.store(0, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for IntakeQueue {
    fn default() -> Self {
        Self::new()
    }
}
