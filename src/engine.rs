use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, error, warn};

use crate::backend::SqliteKvStore;
use crate::config::{
    percent_of, Config, StoredValueType, MAX_BG_FETCH_DELAY, MAX_DATA_AGE_PARAM, MAX_TXN_SIZE,
};
use crate::dispatcher::{DispatcherState, Priority};
use crate::error::{ControlStatus, EngineError, Result, Status};
use crate::flusher::FlusherState;
use crate::item::{Cookie, GetValue, Item, Notifier};
use crate::pager::{ExpiredItemPagerTask, ItemPagerTask};
use crate::stats::StatsSnapshot;
use crate::store::{GetLockedResult, KeyStats, Store, VBucketVisitor};
use crate::time::Clock;
use crate::vbucket::{VBucket, VBucketState};

/// Store-operation flavors from the client protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOperation {
    Set,
    Add,
    Cas,
    Replace,
    Append,
    Prepend,
}

/// Administrative commands carried by the extension opcodes.
#[derive(Debug, Clone)]
pub enum ControlCommand {
    StopPersistence,
    StartPersistence,
    SetFlushParam { key: String, value: String },
    GetVBucket { vbucket: u16 },
    SetVBucket { vbucket: u16, state: VBucketState },
    DelVBucket { vbucket: u16 },
    EvictKey { vbucket: u16, key: Bytes },
}

/// Status plus diagnostic message for a control command.
#[derive(Debug, Clone)]
pub struct ControlResponse {
    pub status: ControlStatus,
    pub message: String,
}

impl ControlResponse {
    fn new(status: ControlStatus, message: impl Into<String>) -> Self {
        ControlResponse {
            status,
            message: message.into(),
        }
    }
}

/// Default and maximum getl lock durations, in seconds.
const GETL_DEFAULT_TIMEOUT: u32 = 15;
const GETL_MAX_TIMEOUT: u32 = 30;

/// The client-facing engine: wraps the [`Store`] with the protocol-level
/// store operations, arithmetic, and administration.
pub struct Engine {
    store: Arc<Store>,
    clock: Clock,
    max_item_size: usize,
    stored_val_type: StoredValueType,
}

impl Engine {
    /// Opens the backend, builds the store, and (by default) blocks
    /// until warmup finishes. A backend that cannot be opened is fatal.
    pub fn new(config: Config, notifier: Arc<dyn Notifier>) -> Result<Engine> {
        config.validate()?;

        let kv = SqliteKvStore::open(
            &config.dbname,
            config.shard_count(),
            config.init_file.as_deref(),
            config.post_init_file.as_deref(),
        )
        .map_err(|e| {
            error!(dbname = %config.dbname.display(), error = %e, "failed to open database");
            e
        })?;

        let clock = Clock::new();
        let store = Store::new(&config, Box::new(kv), notifier, clock.clone());
        store.start();

        // A discarded warmup must still complete before the reset clears
        // it, so waiting is mandatory when warmup is disabled.
        if config.wait_for_warmup || !config.warmup {
            let mut sleep_micros: u64 = 1;
            while store.flusher().state() == FlusherState::Initializing {
                std::thread::sleep(Duration::from_micros(sleep_micros));
                sleep_micros = (sleep_micros << 1).min(500_000);
            }
            let warm_oom = store.stats().warm_oom.load(Ordering::Relaxed);
            if config.warmup && config.fail_on_partial_warmup && warm_oom > 0 {
                store.stop();
                return Err(EngineError::Warmup(format!(
                    "failed to load {warm_oom} records due to OOM"
                )));
            }
        }

        if !config.warmup {
            store.reset();
        }

        if config.stored_val_type != StoredValueType::Small {
            store.io_dispatcher().schedule(
                Box::new(ItemPagerTask::new(Arc::clone(&store))),
                None,
                Priority::ItemPager,
                10.0,
            );
            store.io_dispatcher().schedule(
                Box::new(ExpiredItemPagerTask::new(
                    Arc::clone(&store),
                    config.exp_pager_stime,
                )),
                None,
                Priority::ItemPager,
                config.exp_pager_stime as f64,
            );
        }

        debug!("engine init complete");
        Ok(Engine {
            store,
            clock,
            max_item_size: config.max_item_size,
            stored_val_type: config.stored_val_type,
        })
    }

    /// The underlying store; exposed for scheduling and diagnostics.
    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// The engine's time source.
    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Builds an item, converting the relative expiry to absolute
    /// seconds and rejecting oversize values.
    pub fn item_allocate(
        &self,
        key: impl Into<Bytes>,
        flags: u32,
        rel_exptime: u32,
        value: impl Into<Bytes>,
    ) -> std::result::Result<Item, Status> {
        let value = value.into();
        if value.len() > self.max_item_size {
            return Err(Status::TooBig);
        }
        let exptime = if rel_exptime == 0 {
            0
        } else {
            self.clock.abs_time(rel_exptime) as u32
        };
        Ok(Item::new(key, flags, exptime, value))
    }

    /// Reads a value; may return `WouldBlock` while a background fetch
    /// is in flight.
    pub fn get(&self, key: &Bytes, vbucket: u16, cookie: Cookie) -> GetValue {
        self.store.get(key, vbucket, cookie, true, true)
    }

    /// Applies a store operation. On success the returned CAS is the
    /// item's newly assigned tag.
    pub fn store_item(
        &self,
        item: &mut Item,
        cookie: Cookie,
        operation: StoreOperation,
        vbucket: u16,
    ) -> (Status, u64) {
        item.set_vbucket(vbucket);
        let ret = match operation {
            StoreOperation::Cas if item.cas() == 0 => {
                // A CAS mutation with the wildcard tag makes no sense.
                Status::NotStored
            }
            StoreOperation::Cas | StoreOperation::Set => self.store.set(item, cookie, false),
            StoreOperation::Add => self.store.add(item, cookie),
            StoreOperation::Replace => {
                let gv = self.get(item.key(), vbucket, cookie);
                match gv.status {
                    Status::Success => self.store.set(item, cookie, false),
                    Status::KeyNotFound => Status::NotStored,
                    other => other,
                }
            }
            StoreOperation::Append | StoreOperation::Prepend => {
                let ret = loop {
                    let gv = self.get(item.key(), vbucket, cookie);
                    match gv.status {
                        Status::Success => {
                            let mut merged = match gv.item {
                                Some(existing) => existing,
                                None => break Status::Failed,
                            };
                            if operation == StoreOperation::Append {
                                merged.append(item);
                            } else {
                                merged.prepend(item);
                            }
                            let (s, cas) = self.store_item(&mut merged, cookie, StoreOperation::Cas, vbucket);
                            if s == Status::KeyExists {
                                continue;
                            }
                            if s == Status::Success {
                                item.set_cas(cas);
                            }
                            break s;
                        }
                        other => break other,
                    }
                };
                if ret == Status::KeyNotFound {
                    Status::NotStored
                } else {
                    ret
                }
            }
        };

        let ret = if ret == Status::OutOfMemory {
            self.memory_condition()
        } else {
            ret
        };
        let cas = if ret == Status::Success { item.cas() } else { 0 };
        (ret, cas)
    }

    /// Increments or decrements an ASCII-numeric value.
    #[allow(clippy::too_many_arguments)]
    pub fn arithmetic(
        &self,
        key: &Bytes,
        vbucket: u16,
        cookie: Cookie,
        increment: bool,
        create: bool,
        delta: u64,
        initial: u64,
        rel_exptime: u32,
    ) -> (Status, u64, u64) {
        let exptime = if rel_exptime == 0 || rel_exptime == u32::MAX {
            0
        } else {
            self.clock.abs_time(rel_exptime) as u32
        };

        let gv = self.get(key, vbucket, cookie);
        let (ret, cas, result) = match gv.status {
            Status::Success => {
                let existing = match gv.item {
                    Some(item) => item,
                    None => return (Status::Failed, 0, 0),
                };
                let text = String::from_utf8_lossy(existing.value());
                match text.trim_end().parse::<u64>() {
                    Ok(old) => {
                        let val = if increment {
                            old.wrapping_add(delta)
                        } else {
                            old.saturating_sub(delta)
                        };
                        let mut next = Item::new(
                            key.clone(),
                            existing.flags(),
                            exptime,
                            format!("{val}\r\n").into_bytes(),
                        );
                        next.set_cas(existing.cas());
                        let (s, cas) = self.store_item(&mut next, cookie, StoreOperation::Cas, vbucket);
                        (s, cas, val)
                    }
                    Err(_) => (Status::Invalid, 0, 0),
                }
            }
            Status::KeyNotFound if create => {
                let mut fresh = Item::new(
                    key.clone(),
                    0,
                    exptime,
                    format!("{initial}\r\n").into_bytes(),
                );
                let (s, cas) = self.store_item(&mut fresh, cookie, StoreOperation::Add, vbucket);
                (s, cas, initial)
            }
            other => (other, 0, 0),
        };

        // Lost a CAS race with a concurrent mutation; retry from the top.
        if ret == Status::KeyExists {
            return self.arithmetic(
                key, vbucket, cookie, increment, create, delta, initial, rel_exptime,
            );
        }
        (ret, cas, result)
    }

    /// Soft-deletes a key.
    pub fn del(&self, key: &Bytes, vbucket: u16, cookie: Cookie) -> Status {
        self.store.del(key, vbucket, cookie)
    }

    /// Flushes the entire cache. Only immediate flushes are supported.
    pub fn flush(&self, when: u32) -> Status {
        if when != 0 {
            return Status::NotSupported;
        }
        self.store.reset();
        Status::Success
    }

    /// Locks a key against mutation for `lock_timeout` seconds (bounded;
    /// default 15). The returned item's CAS releases the lock.
    pub fn get_locked(
        &self,
        key: &Bytes,
        vbucket: u16,
        lock_timeout: Option<u32>,
    ) -> (Status, Option<Item>) {
        let mut timeout = lock_timeout.unwrap_or(GETL_DEFAULT_TIMEOUT);
        if timeout == 0 || timeout > GETL_MAX_TIMEOUT {
            timeout = GETL_DEFAULT_TIMEOUT;
        }
        match self
            .store
            .get_locked(key, vbucket, self.clock.now(), timeout)
        {
            GetLockedResult::NotMyVBucket => (Status::NotMyVBucket, None),
            GetLockedResult::AlreadyLocked => (Status::TempFail, None),
            GetLockedResult::NotFound => (Status::KeyNotFound, None),
            GetLockedResult::Acquired(item) => (Status::Success, Some(item)),
        }
    }

    /// Per-key diagnostics for an active vbucket.
    pub fn get_key_stats(&self, key: &Bytes, vbucket: u16) -> Option<KeyStats> {
        self.store.get_key_stats(key, vbucket)
    }

    /// Read-only disk fetch delivered to `lookup`; used to compare the
    /// in-memory and on-disk copies of a key.
    pub fn get_from_underlying(
        &self,
        key: &Bytes,
        vbucket: u16,
        cookie: Cookie,
        lookup: Box<dyn FnOnce(GetValue) + Send>,
    ) -> Status {
        self.store.get_from_underlying(key, vbucket, cookie, lookup)
    }

    /// Current state of a vbucket, if it exists.
    pub fn get_vbucket_state(&self, vbucket: u16) -> Option<VBucketState> {
        self.store.get_vbucket(vbucket).map(|vb| vb.state())
    }

    /// Applies a vbucket state transition.
    pub fn set_vbucket_state(&self, vbucket: u16, state: VBucketState) {
        self.store.set_vbucket_state(vbucket, state);
    }

    /// Removes a dead vbucket.
    pub fn delete_vbucket(&self, vbucket: u16) -> bool {
        self.store.delete_vbucket(vbucket)
    }

    /// Classifies an out-of-memory condition: `TempFail` when eviction
    /// could plausibly free space, hard `OutOfMemory` otherwise.
    pub fn memory_condition(&self) -> Status {
        let stats = self.store.stats();
        let mut can_free = stats.max_data_size.load(Ordering::Relaxed)
            > stats.mem_overhead.load(Ordering::Relaxed);
        if can_free && self.stored_val_type != StoredValueType::Small {
            struct CountVisitor {
                total: usize,
            }
            impl VBucketVisitor for CountVisitor {
                fn visit_vbucket(&mut self, vb: &Arc<VBucket>) -> bool {
                    self.total += vb.ht.num_items();
                    false
                }
            }
            let mut counter = CountVisitor { total: 0 };
            self.store.visit(&mut counter);
            can_free = stats.num_non_resident.load(Ordering::Relaxed) < counter.total;
        }
        if can_free {
            stats.tmp_oom_errors.fetch_add(1, Ordering::Relaxed);
            Status::TempFail
        } else {
            stats.oom_errors.fetch_add(1, Ordering::Relaxed);
            Status::OutOfMemory
        }
    }

    /// Executes an administrative command.
    pub fn control(&self, command: ControlCommand) -> ControlResponse {
        match command {
            ControlCommand::StopPersistence => {
                if self.store.pause_flusher() {
                    ControlResponse::new(ControlStatus::Success, "Stopped persistence.")
                } else {
                    warn!(
                        state = self.store.flusher().state_name(),
                        "attempted to stop flusher"
                    );
                    ControlResponse::new(ControlStatus::Invalid, "Flusher not running.")
                }
            }
            ControlCommand::StartPersistence => {
                if self.store.resume_flusher() {
                    ControlResponse::new(ControlStatus::Success, "Started persistence.")
                } else {
                    warn!(
                        state = self.store.flusher().state_name(),
                        "attempted to start flusher"
                    );
                    ControlResponse::new(ControlStatus::Invalid, "Flusher not shut down.")
                }
            }
            ControlCommand::SetFlushParam { key, value } => self.set_flush_param(&key, &value),
            ControlCommand::GetVBucket { vbucket } => match self.get_vbucket_state(vbucket) {
                Some(state) => ControlResponse::new(ControlStatus::Success, state.as_str()),
                None => ControlResponse::new(ControlStatus::NotMyVBucket, "That's not my bucket."),
            },
            ControlCommand::SetVBucket { vbucket, state } => {
                self.set_vbucket_state(vbucket, state);
                ControlResponse::new(ControlStatus::Success, "Configured")
            }
            ControlCommand::DelVBucket { vbucket } => {
                if self.delete_vbucket(vbucket) {
                    ControlResponse::new(ControlStatus::Success, "Deleted.")
                } else {
                    match self.get_vbucket_state(vbucket) {
                        None => ControlResponse::new(
                            ControlStatus::NotMyVBucket,
                            "Failed to delete vbucket.  Bucket not found.",
                        ),
                        Some(state) if state != VBucketState::Dead => ControlResponse::new(
                            ControlStatus::Invalid,
                            "Failed to delete vbucket.  Must be in the dead state.",
                        ),
                        Some(_) => ControlResponse::new(
                            ControlStatus::Internal,
                            "Failed to delete vbucket.  Unknown reason.",
                        ),
                    }
                }
            }
            ControlCommand::EvictKey { vbucket, key } => {
                debug!(key = ?key, "manually evicting object");
                let (status, msg) = self.store.evict_key(&key, vbucket);
                ControlResponse::new(status, msg)
            }
        }
    }

    fn set_flush_param(&self, key: &str, value: &str) -> ControlResponse {
        fn parse_ranged<T: std::str::FromStr + PartialOrd>(
            value: &str,
            lo: T,
            hi: T,
        ) -> Option<T> {
            let v = value.parse::<T>().ok()?;
            if v < lo || v > hi {
                return None;
            }
            Some(v)
        }

        let stats = self.store.stats();
        let applied = match key {
            "min_data_age" => parse_ranged(value, 0, MAX_DATA_AGE_PARAM)
                .map(|v| self.store.set_min_data_age(v)),
            "queue_age_cap" => parse_ranged(value, 0, MAX_DATA_AGE_PARAM)
                .map(|v| self.store.set_queue_age_cap(v)),
            "max_txn_size" => {
                parse_ranged(value, 1, MAX_TXN_SIZE).map(|v| self.store.set_txn_size(v))
            }
            "bg_fetch_delay" => parse_ranged(value, 0, MAX_BG_FETCH_DELAY)
                .map(|v| self.store.set_bg_fetch_delay(v)),
            "max_size" => value.parse::<usize>().ok().map(|v| {
                stats.max_data_size.store(v, Ordering::Relaxed);
                stats
                    .mem_low_wat
                    .store(percent_of(v, 0.6), Ordering::Relaxed);
                stats
                    .mem_high_wat
                    .store(percent_of(v, 0.75), Ordering::Relaxed);
            }),
            "mem_low_wat" => value
                .parse::<usize>()
                .ok()
                .map(|v| stats.mem_low_wat.store(v, Ordering::Relaxed)),
            "mem_high_wat" => value
                .parse::<usize>()
                .ok()
                .map(|v| stats.mem_high_wat.store(v, Ordering::Relaxed)),
            _ => {
                return ControlResponse::new(ControlStatus::KeyNotFound, "Unknown config param");
            }
        };

        match applied {
            Some(()) => ControlResponse::new(ControlStatus::Success, "Updated"),
            None => ControlResponse::new(ControlStatus::Invalid, "Value out of range."),
        }
    }

    /// Counter snapshot for the stats surface.
    pub fn stats(&self) -> StatsSnapshot {
        self.store.stats().snapshot()
    }

    /// Observability for both dispatcher workers.
    pub fn dispatcher_states(&self) -> (DispatcherState, DispatcherState) {
        (
            self.store.io_dispatcher().state(),
            self.store.non_io_dispatcher().state(),
        )
    }

    /// Name of the flusher's current state.
    pub fn flusher_state(&self) -> &'static str {
        self.store.flusher().state_name()
    }

    /// Stops the flusher and dispatcher workers.
    pub fn shutdown(&self) {
        self.store.stop();
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
