use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

/// Shared counters and live-tunable thresholds for the whole engine.
///
/// Everything here is atomic; counters are updated from request threads,
/// dispatcher workers, and the flusher without additional locking. The
/// tunables (`min_data_age`, `queue_age_cap`, watermarks, transaction size)
/// are read on every flush-eligibility decision, so they live here rather
/// than in the configuration struct.
pub struct EngineStats {
    // Memory accounting.
    /// Resident value bytes.
    pub current_size: AtomicUsize,
    /// Metadata plus queued-item overhead bytes.
    pub mem_overhead: AtomicUsize,
    /// Logical dataset bytes, including ejected values.
    pub total_cache_size: AtomicUsize,
    /// Hard memory ceiling.
    pub max_data_size: AtomicUsize,
    /// Pager low watermark.
    pub mem_low_wat: AtomicUsize,
    /// Pager high watermark.
    pub mem_high_wat: AtomicUsize,

    // Flush-eligibility tunables.
    /// Seconds a value must stay unchanged before it may persist.
    pub min_data_age: AtomicU32,
    /// Seconds after which a queued mutation is flushed regardless of age.
    pub queue_age_cap: AtomicU32,
    /// Mutations per backend transaction.
    pub txn_size: AtomicUsize,

    // Queue gauges.
    /// Items waiting in the intake queue.
    pub queue_size: AtomicUsize,
    /// Items in the flusher's working queue for the current cycle.
    pub flusher_todo: AtomicUsize,
    /// Total items ever enqueued for persistence.
    pub total_enqueued: AtomicU64,
    /// Total items successfully persisted.
    pub total_persisted: AtomicU64,

    // Flush pipeline counters.
    pub too_young: AtomicU64,
    pub too_old: AtomicU64,
    pub flush_expired: AtomicU64,
    pub flush_failed: AtomicU64,
    pub begin_failed: AtomicU64,
    pub commit_failed: AtomicU64,
    pub flusher_commits: AtomicU64,
    pub flusher_preempts: AtomicU64,
    pub new_items: AtomicU64,
    pub del_items: AtomicU64,

    // Age gauges (seconds) with high-water marks.
    pub dirty_age: AtomicU32,
    pub dirty_age_high_wat: AtomicU32,
    pub data_age: AtomicU32,
    pub data_age_high_wat: AtomicU32,
    pub flush_duration: AtomicU32,
    pub flush_duration_high_wat: AtomicU32,
    pub cumulative_flush_time: AtomicU64,
    pub commit_time: AtomicU32,
    pub cumulative_commit_time: AtomicU64,

    // Cache behavior.
    pub expired: AtomicU64,
    pub num_value_ejects: AtomicU64,
    pub num_non_resident: AtomicUsize,
    pub bg_fetched: AtomicU64,
    pub bg_num_operations: AtomicU64,
    pub bg_wait_micros: AtomicU64,
    pub bg_load_micros: AtomicU64,

    // State gating.
    pub num_not_my_vbuckets: AtomicU64,
    pub pending_ops: AtomicUsize,
    pub pending_ops_total: AtomicU64,
    pub pending_ops_max: AtomicUsize,

    // Warmup.
    pub warmed_up: AtomicU64,
    pub warm_dups: AtomicU64,
    pub warm_oom: AtomicU64,

    // Memory-condition reporting.
    pub oom_errors: AtomicU64,
    pub tmp_oom_errors: AtomicU64,

    // VBucket lifecycle.
    pub vbucket_deletions: AtomicU64,
    pub vbucket_deletion_fail: AtomicU64,
    pub vbucket_del_total_walltime_micros: AtomicU64,
    pub vbucket_del_max_walltime_micros: AtomicU64,
}

impl EngineStats {
    /// Creates a zeroed stats block with unlimited memory and default
    /// flush tunables; the engine overwrites the tunables from its config.
    pub fn new() -> Self {
        EngineStats {
            current_size: AtomicUsize::new(0),
            mem_overhead: AtomicUsize::new(0),
            total_cache_size: AtomicUsize::new(0),
            max_data_size: AtomicUsize::new(usize::MAX / 2),
            mem_low_wat: AtomicUsize::new(usize::MAX / 2),
            mem_high_wat: AtomicUsize::new(usize::MAX / 2),
            min_data_age: AtomicU32::new(0),
            queue_age_cap: AtomicU32::new(900),
            txn_size: AtomicUsize::new(250_000),
            queue_size: AtomicUsize::new(0),
            flusher_todo: AtomicUsize::new(0),
            total_enqueued: AtomicU64::new(0),
            total_persisted: AtomicU64::new(0),
            too_young: AtomicU64::new(0),
            too_old: AtomicU64::new(0),
            flush_expired: AtomicU64::new(0),
            flush_failed: AtomicU64::new(0),
            begin_failed: AtomicU64::new(0),
            commit_failed: AtomicU64::new(0),
            flusher_commits: AtomicU64::new(0),
            flusher_preempts: AtomicU64::new(0),
            new_items: AtomicU64::new(0),
            del_items: AtomicU64::new(0),
            dirty_age: AtomicU32::new(0),
            dirty_age_high_wat: AtomicU32::new(0),
            data_age: AtomicU32::new(0),
            data_age_high_wat: AtomicU32::new(0),
            flush_duration: AtomicU32::new(0),
            flush_duration_high_wat: AtomicU32::new(0),
            cumulative_flush_time: AtomicU64::new(0),
            commit_time: AtomicU32::new(0),
            cumulative_commit_time: AtomicU64::new(0),
            expired: AtomicU64::new(0),
            num_value_ejects: AtomicU64::new(0),
            num_non_resident: AtomicUsize::new(0),
            bg_fetched: AtomicU64::new(0),
            bg_num_operations: AtomicU64::new(0),
            bg_wait_micros: AtomicU64::new(0),
            bg_load_micros: AtomicU64::new(0),
            num_not_my_vbuckets: AtomicU64::new(0),
            pending_ops: AtomicUsize::new(0),
            pending_ops_total: AtomicU64::new(0),
            pending_ops_max: AtomicUsize::new(0),
            warmed_up: AtomicU64::new(0),
            warm_dups: AtomicU64::new(0),
            warm_oom: AtomicU64::new(0),
            oom_errors: AtomicU64::new(0),
            tmp_oom_errors: AtomicU64::new(0),
            vbucket_deletions: AtomicU64::new(0),
            vbucket_deletion_fail: AtomicU64::new(0),
            vbucket_del_total_walltime_micros: AtomicU64::new(0),
            vbucket_del_max_walltime_micros: AtomicU64::new(0),
        }
    }

    /// Bytes currently attributed to the cache: resident values plus
    /// metadata and queue overhead.
    pub fn total_memory(&self) -> usize {
        self.current_size.load(Ordering::Relaxed) + self.mem_overhead.load(Ordering::Relaxed)
    }

    /// True if `extra` more bytes would stay under the memory ceiling.
    pub fn has_space_for(&self, extra: usize) -> bool {
        self.total_memory() + extra < self.max_data_size.load(Ordering::Relaxed)
    }

    pub(crate) fn add_overhead(&self, bytes: usize) {
        self.mem_overhead.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn sub_overhead(&self, bytes: usize) {
        self.mem_overhead.fetch_sub(bytes, Ordering::Relaxed);
    }
}

impl Default for EngineStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of the interesting counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatsSnapshot {
    pub current_size: usize,
    pub mem_overhead: usize,
    pub total_cache_size: usize,
    pub queue_size: usize,
    pub flusher_todo: usize,
    pub total_enqueued: u64,
    pub total_persisted: u64,
    pub too_young: u64,
    pub too_old: u64,
    pub flush_expired: u64,
    pub flush_failed: u64,
    pub commit_failed: u64,
    pub flusher_commits: u64,
    pub flusher_preempts: u64,
    pub new_items: u64,
    pub del_items: u64,
    pub expired: u64,
    pub num_value_ejects: u64,
    pub num_non_resident: usize,
    pub bg_fetched: u64,
    pub num_not_my_vbuckets: u64,
    pub pending_ops: usize,
    pub warmed_up: u64,
    pub warm_dups: u64,
    pub warm_oom: u64,
    pub oom_errors: u64,
    pub tmp_oom_errors: u64,
    pub vbucket_deletions: u64,
}

impl EngineStats {
    /// Copies the counter set for reporting.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            current_size: self.current_size.load(Ordering::Relaxed),
            mem_overhead: self.mem_overhead.load(Ordering::Relaxed),
            total_cache_size: self.total_cache_size.load(Ordering::Relaxed),
            queue_size: self.queue_size.load(Ordering::Relaxed),
            flusher_todo: self.flusher_todo.load(Ordering::Relaxed),
            total_enqueued: self.total_enqueued.load(Ordering::Relaxed),
            total_persisted: self.total_persisted.load(Ordering::Relaxed),
            too_young: self.too_young.load(Ordering::Relaxed),
            too_old: self.too_old.load(Ordering::Relaxed),
            flush_expired: self.flush_expired.load(Ordering::Relaxed),
            flush_failed: self.flush_failed.load(Ordering::Relaxed),
            commit_failed: self.commit_failed.load(Ordering::Relaxed),
            flusher_commits: self.flusher_commits.load(Ordering::Relaxed),
            flusher_preempts: self.flusher_preempts.load(Ordering::Relaxed),
            new_items: self.new_items.load(Ordering::Relaxed),
            del_items: self.del_items.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            num_value_ejects: self.num_value_ejects.load(Ordering::Relaxed),
            num_non_resident: self.num_non_resident.load(Ordering::Relaxed),
            bg_fetched: self.bg_fetched.load(Ordering::Relaxed),
            num_not_my_vbuckets: self.num_not_my_vbuckets.load(Ordering::Relaxed),
            pending_ops: self.pending_ops.load(Ordering::Relaxed),
            warmed_up: self.warmed_up.load(Ordering::Relaxed),
            warm_dups: self.warm_dups.load(Ordering::Relaxed),
            warm_oom: self.warm_oom.load(Ordering::Relaxed),
            oom_errors: self.oom_errors.load(Ordering::Relaxed),
            tmp_oom_errors: self.tmp_oom_errors.load(Ordering::Relaxed),
            vbucket_deletions: self.vbucket_deletions.load(Ordering::Relaxed),
        }
    }
}
