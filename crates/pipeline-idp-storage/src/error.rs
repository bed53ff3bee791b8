//! Storage error types.
//!
//! Every error variant carries enough context to diagnose the problem
//! without a debugger.

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// A compare-and-swap write lost the race against a concurrent writer.
    #[error("concurrent write detected, expected version {expected} but store is at a different version")]
    Contended { expected: u64 },

    /// The underlying backend failed for a reason unrelated to contention.
    #[error("storage backend error: {reason}")]
    Backend { reason: String },
}
