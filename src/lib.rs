//! # Penumbra - Eventually-Persistent Key/Value Cache
//!
//! Penumbra is the core of an eventually-persistent cache: a
//! vbucket-partitioned in-memory store fronting a durable SQLite log.
//! Values are acknowledged to clients from memory, queued for
//! asynchronous persistence, and flushed in batched transactions; a
//! background fetcher rehydrates values ejected under memory pressure.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use penumbra::{Config, Engine, Notifier, Status};
//!
//! struct NoopNotifier;
//! impl Notifier for NoopNotifier {
//!     fn notify_io_complete(&self, _cookie: u64, _status: Status) {}
//! }
//!
//! let engine = Engine::new(
//!     Config::for_testing("/tmp/demo.db"),
//!     Arc::new(NoopNotifier),
//! )?;
//!
//! let mut item = engine.item_allocate("greeting", 0, 0, "hello").unwrap();
//! let (status, cas) = engine.store_item(&mut item, 1, penumbra::StoreOperation::Set, 0);
//! assert_eq!(status, Status::Success);
//! assert!(cas > 0);
//! # Ok::<(), penumbra::EngineError>(())
//! ```
//!
//! ## Architecture
//!
//! - **Hash table**: per-vbucket bucket array with a smaller stripe-lock
//!   array; soft deletes, CAS, expiry, locking, and value ejection
//! - **Flush pipeline**: multi-producer intake queue drained into batched
//!   backend transactions, with age eligibility and reject/requeue
//! - **Dispatchers**: two priority-ordered task runners driving the
//!   flusher, background fetches, snapshots, deletions, and pagers
//! - **VBucket lifecycle**: active/replica/pending/dead transitions with
//!   pending-operation queueing and version-stamped chunked deletion

pub mod backend;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod flusher;
pub mod hashtable;
pub mod item;
pub mod logging;
pub mod pager;
pub mod queue;
pub mod stats;
pub mod store;
pub mod stored_value;
pub mod time;
pub mod vbucket;

// Re-export the main public API
pub use crate::config::{Config, DbStrategy, StoredValueType};
pub use crate::engine::{ControlCommand, ControlResponse, Engine, StoreOperation};
pub use crate::error::{ControlStatus, EngineError, Result, Status};
pub use crate::flusher::FlusherState;
pub use crate::item::{Cookie, GetValue, Item, Notifier};
pub use crate::stats::StatsSnapshot;
pub use crate::store::{GetLockedResult, KeyStats, Store};
pub use crate::time::Clock;
pub use crate::vbucket::VBucketState;
