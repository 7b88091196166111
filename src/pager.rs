use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info};

use crate::dispatcher::{Dispatcher, DispatcherTask, TaskId};
use crate::stats::EngineStats;
use crate::store::{Store, VBucketVisitor};
use crate::stored_value::StoredValue;
use crate::vbucket::VBucket;

/// How often the item pager wakes to check the watermarks.
const PAGER_PERIOD_SECS: f64 = 10.0;

/// Ejects resident values when memory use crosses the high watermark,
/// until it is back under the low watermark.
pub struct ItemPagerTask {
    store: Arc<Store>,
}

impl ItemPagerTask {
    pub fn new(store: Arc<Store>) -> Self {
        ItemPagerTask { store }
    }
}

struct PagingVisitor<'a> {
    stats: &'a EngineStats,
    ejected: usize,
}

impl VBucketVisitor for PagingVisitor<'_> {
    fn visit_vbucket(&mut self, _vb: &Arc<VBucket>) -> bool {
        // Keep walking only while we are still above the low watermark.
        self.stats.total_memory() > self.stats.mem_low_wat.load(Ordering::Relaxed)
    }

    fn visit(&mut self, v: &mut StoredValue) {
        if self.stats.total_memory() <= self.stats.mem_low_wat.load(Ordering::Relaxed) {
            return;
        }
        if v.eject_value(self.stats) {
            self.ejected += 1;
        }
    }
}

impl DispatcherTask for ItemPagerTask {
    fn run(&mut self, d: &Dispatcher, t: &TaskId) -> bool {
        let stats = self.store.stats();
        if stats.total_memory() > stats.mem_high_wat.load(Ordering::Relaxed) {
            let mut visitor = PagingVisitor {
                stats,
                ejected: 0,
            };
            self.store.visit(&mut visitor);
            info!(
                ejected = visitor.ejected,
                memory = stats.total_memory(),
                "pager.swept"
            );
        }
        d.snooze(t, PAGER_PERIOD_SECS);
        true
    }

    fn description(&self) -> String {
        "Paging out items".to_string()
    }
}

/// Periodically soft-deletes records whose expiry has passed, without
/// waiting for a client to touch them.
pub struct ExpiredItemPagerTask {
    store: Arc<Store>,
    sleep_secs: u64,
}

impl ExpiredItemPagerTask {
    pub fn new(store: Arc<Store>, sleep_secs: u64) -> Self {
        ExpiredItemPagerTask { store, sleep_secs }
    }
}

struct ExpiryCollector {
    abs_now: u64,
    current_vb: u16,
    expired: Vec<(u16, Bytes)>,
}

impl VBucketVisitor for ExpiryCollector {
    fn visit_vbucket(&mut self, vb: &Arc<VBucket>) -> bool {
        self.current_vb = vb.id();
        true
    }

    fn visit(&mut self, v: &mut StoredValue) {
        if !v.is_deleted() && v.is_expired(self.abs_now) {
            self.expired.push((self.current_vb, v.key().clone()));
        }
    }
}

impl DispatcherTask for ExpiredItemPagerTask {
    fn run(&mut self, d: &Dispatcher, t: &TaskId) -> bool {
        let mut collector = ExpiryCollector {
            abs_now: self.store.clock().real_time(),
            current_vb: 0,
            expired: Vec::new(),
        };
        self.store.visit(&mut collector);
        if !collector.expired.is_empty() {
            debug!(candidates = collector.expired.len(), "expiry_pager.sweep");
        }
        // Re-check each candidate under its stripe lock; the record may
        // have been touched since the walk.
        for (vbid, key) in collector.expired {
            self.store.expire_if_needed(vbid, &key);
        }
        d.snooze(t, self.sleep_secs as f64);
        true
    }

    fn description(&self) -> String {
        "Paging expired items".to_string()
    }
}
