use std::io;
use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors surfaced by engine construction and administration paths.
///
/// Per-operation outcomes on the data path are reported as [`Status`]
/// codes, not errors; a live request is never aborted by a persistence
/// failure.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("backend error: {0}")]
    Backend(#[from] rusqlite::Error),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("warmup failed: {0}")]
    Warmup(String),
}

/// Status codes observed by clients at the engine boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// The operation completed.
    Success,
    /// The key does not exist (or is deleted but not yet flushed).
    KeyNotFound,
    /// A CAS mismatch, or the record is locked.
    KeyExists,
    /// Store-operation precondition failed (add over a live key, replace
    /// of a missing key, cas with a zero wildcard).
    NotStored,
    /// The caller must wait for `notify_io_complete` and retry.
    WouldBlock,
    /// The vbucket is absent or in a state that rejects the operation.
    NotMyVBucket,
    /// Hard out-of-memory; eviction cannot plausibly help.
    OutOfMemory,
    /// Soft out-of-memory; the pager may free space, retry later.
    TempFail,
    /// The value exceeds the configured maximum item size.
    TooBig,
    /// Malformed input (e.g. a non-numeric payload for arithmetic).
    Invalid,
    /// The operation is not supported (e.g. a delayed flush).
    NotSupported,
    /// The connection should be dropped.
    Disconnect,
    /// Unrecoverable failure.
    Failed,
}

/// Outcome of an administrative control command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlStatus {
    /// Command applied.
    Success,
    /// Named key or parameter does not exist.
    KeyNotFound,
    /// Malformed or out-of-range input.
    Invalid,
    /// The addressed vbucket is not owned here.
    NotMyVBucket,
    /// The command failed for an unexpected internal reason.
    Internal,
    /// Unrecognized command.
    UnknownCommand,
}
