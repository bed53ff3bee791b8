//! Error types for `pipeline-idp-core`.
//!
//! Every error variant carries enough context to diagnose the problem
//! without a debugger. Crypto errors never include key material — only key
//! identifiers or operation descriptions.

use pipeline_idp_storage::StorageError;

/// Errors surfaced by the key manager, token generator, issuance controller,
/// and leader lease — the error-kind vocabulary every control loop in this
/// crate reports against.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration was missing a required field or contained a
    /// contradiction (e.g. `max_age <= rotation_period`).
    #[error("invalid configuration: {reason}")]
    ConfigInvalid { reason: String },

    /// The requested record does not exist in storage yet.
    #[error("not found: {reason}")]
    NotFound { reason: String },

    /// A compare-and-swap write lost the race against a concurrent writer.
    #[error("concurrent write detected: {0}")]
    Contended(#[from] ContendedError),

    /// The storage backend failed for a reason unrelated to contention.
    #[error("storage backend error: {reason}")]
    Backend { reason: String },

    /// Signing a token failed.
    #[error("failed to sign token: {reason}")]
    SignError { reason: String },

    /// Verifying a self-issued token failed for a reason other than
    /// ordinary expiry.
    #[error("failed to verify token: {reason}")]
    VerifyError { reason: String },

    /// This instance's leader lease was lost or could not be renewed; the
    /// only safe action is to stop.
    #[error("leader lease lost")]
    LeaseLost,
}

/// Marker wrapper so [`StorageError::Contended`] converts into
/// [`Error::Contended`] without losing the expected-version context.
#[derive(Debug, thiserror::Error)]
#[error("expected version {expected}, store has moved on")]
pub struct ContendedError {
    pub expected: u64,
}

impl From<StorageError> for Error {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Contended { expected } => {
                Self::Contended(ContendedError { expected })
            }
            StorageError::Backend { reason } => Self::Backend { reason },
        }
    }
}
