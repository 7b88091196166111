use std::path::{Path, PathBuf};

use crate::error::{EngineError, Result};

/// Upper bound for the flush age tunables, in seconds.
pub const MAX_DATA_AGE_PARAM: u32 = 86_400;
/// Upper bound for mutations per backend transaction.
pub const MAX_TXN_SIZE: usize = 10_000_000;
/// Upper bound for the artificial background-fetch delay, in seconds.
pub const MAX_BG_FETCH_DELAY: u32 = 900;

/// How kv rows are spread across database files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbStrategy {
    /// Everything in one file.
    SingleDb,
    /// KV rows hashed across `db_shards` files; metadata stays in the
    /// main file.
    MultiDb,
}

/// In-memory record representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoredValueType {
    /// Full records with ejection support.
    Full,
    /// Trimmed records; values cannot be ejected, so the pagers are not
    /// scheduled.
    Small,
}

/// Engine configuration. Durations are seconds, sizes are bytes.
#[derive(Debug, Clone)]
pub struct Config {
    /// Main database file.
    pub dbname: PathBuf,
    /// Optional SQL batch run before schema creation.
    pub init_file: Option<PathBuf>,
    /// Optional SQL batch run after schema creation.
    pub post_init_file: Option<PathBuf>,
    pub db_strategy: DbStrategy,
    pub db_shards: usize,
    /// Reload persisted data at startup. When false the backend is reset.
    pub warmup: bool,
    /// Block engine construction until warmup completes.
    pub wait_for_warmup: bool,
    /// Treat warmup OOMs as a construction failure.
    pub fail_on_partial_warmup: bool,
    /// Bootstrap vbucket 0 in the active state.
    pub start_vb0: bool,
    /// Addressable vbucket ids.
    pub max_vbuckets: usize,
    /// Hash-table buckets per vbucket; 0 selects the default.
    pub ht_size: usize,
    /// Hash-table stripe locks per vbucket; 0 selects the default.
    pub ht_locks: usize,
    pub stored_val_type: StoredValueType,
    /// Memory ceiling. Also derives the watermarks when they are unset.
    pub max_size: usize,
    /// Pager low watermark; defaults to 60% of `max_size`.
    pub mem_low_wat: Option<usize>,
    /// Pager high watermark; defaults to 75% of `max_size`.
    pub mem_high_wat: Option<usize>,
    pub max_txn_size: usize,
    pub min_data_age: u32,
    pub queue_age_cap: u32,
    pub bg_fetch_delay: u32,
    /// Grace seconds applied to the flush-time expiry decision.
    pub expiry_window: u32,
    /// Expired-item pager period.
    pub exp_pager_stime: u64,
    /// Row-id range size for chunked vbucket deletion.
    pub vb_del_chunk_size: usize,
    /// Hard reject for values above this size.
    pub max_item_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            dbname: PathBuf::from("/tmp/penumbra.db"),
            init_file: None,
            post_init_file: None,
            db_strategy: DbStrategy::MultiDb,
            db_shards: 4,
            warmup: true,
            wait_for_warmup: true,
            fail_on_partial_warmup: true,
            start_vb0: true,
            max_vbuckets: 1024,
            ht_size: 0,
            ht_locks: 0,
            stored_val_type: StoredValueType::Full,
            max_size: usize::MAX / 2,
            mem_low_wat: None,
            mem_high_wat: None,
            max_txn_size: 250_000,
            min_data_age: 0,
            queue_age_cap: 900,
            bg_fetch_delay: 0,
            expiry_window: 3,
            exp_pager_stime: 3600,
            vb_del_chunk_size: 1000,
            max_item_size: 20 * 1024 * 1024,
        }
    }
}

impl Config {
    /// Small-footprint configuration for tests: one database file, tiny
    /// hash tables, no flush age gating, and no startup blocking.
    pub fn for_testing(dbname: impl AsRef<Path>) -> Self {
        Config {
            dbname: dbname.as_ref().to_path_buf(),
            db_strategy: DbStrategy::SingleDb,
            db_shards: 1,
            max_vbuckets: 16,
            ht_size: 13,
            ht_locks: 3,
            min_data_age: 0,
            queue_age_cap: 900,
            ..Config::default()
        }
    }

    /// Range-checks the whole configuration.
    pub fn validate(&self) -> Result<()> {
        fn check(name: &str, ok: bool) -> Result<()> {
            if ok {
                Ok(())
            } else {
                Err(EngineError::InvalidArgument(format!(
                    "{name} out of range"
                )))
            }
        }

        check(
            "max_txn_size",
            (1..=MAX_TXN_SIZE).contains(&self.max_txn_size),
        )?;
        check("min_data_age", self.min_data_age <= MAX_DATA_AGE_PARAM)?;
        check("queue_age_cap", self.queue_age_cap <= MAX_DATA_AGE_PARAM)?;
        check("bg_fetch_delay", self.bg_fetch_delay <= MAX_BG_FETCH_DELAY)?;
        check("db_shards", self.db_shards >= 1)?;
        check(
            "max_vbuckets",
            (1..=usize::from(u16::MAX) + 1).contains(&self.max_vbuckets),
        )?;
        check("vb_del_chunk_size", self.vb_del_chunk_size >= 1)?;
        if self.ht_size != 0 && self.ht_locks != 0 {
            check("ht_locks", self.ht_locks < self.ht_size)?;
        }
        let low = self.effective_mem_low_wat();
        let high = self.effective_mem_high_wat();
        check("mem_low_wat", low < high)?;
        check("mem_high_wat", high <= self.max_size)?;
        Ok(())
    }

    /// Low watermark, derived from `max_size` when unset.
    pub fn effective_mem_low_wat(&self) -> usize {
        self.mem_low_wat.unwrap_or(percent_of(self.max_size, 0.6))
    }

    /// High watermark, derived from `max_size` when unset.
    pub fn effective_mem_high_wat(&self) -> usize {
        self.mem_high_wat.unwrap_or(percent_of(self.max_size, 0.75))
    }

    /// Number of kv shards the backend should open.
    pub fn shard_count(&self) -> usize {
        match self.db_strategy {
            DbStrategy::SingleDb => 1,
            DbStrategy::MultiDb => self.db_shards,
        }
    }
}

/// Integer percentage used for watermark derivation.
pub fn percent_of(value: usize, ratio: f64) -> usize {
    (value as f64 * ratio) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn txn_size_bounds_are_enforced() {
        let mut cfg = Config::default();
        cfg.max_txn_size = 0;
        assert!(cfg.validate().is_err());
        cfg.max_txn_size = MAX_TXN_SIZE + 1;
        assert!(cfg.validate().is_err());
        cfg.max_txn_size = MAX_TXN_SIZE;
        cfg.validate().unwrap();
    }

    #[test]
    fn watermarks_derive_from_max_size() {
        let mut cfg = Config::default();
        cfg.max_size = 1000;
        assert_eq!(cfg.effective_mem_low_wat(), 600);
        assert_eq!(cfg.effective_mem_high_wat(), 750);
        cfg.mem_low_wat = Some(800);
        assert!(cfg.validate().is_err(), "low watermark above high");
    }
}
