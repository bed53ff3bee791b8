//! Storage backend abstraction for `pipeline-idp`.
//!
//! This crate defines the [`StorageBackend`] trait — the single seam between
//! the control loops in `pipeline-idp-core` and whatever secret store backs
//! them. `acquire_lease` and `put_keyset` use compare-and-swap internally
//! against the backend's own version counter and retry through contention
//! themselves: per the error-kind policy these loops follow, `Contended`
//! never escapes to a caller, only `Backend` does.

mod error;
mod memory;
#[cfg(feature = "vault-backend")]
mod vault;

pub use error::StorageError;
pub use memory::MemoryBackend;
#[cfg(feature = "vault-backend")]
pub use vault::VaultBackend;

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Coordinates a token record's storage location.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TokenPath {
    pub team: String,
    pub pipeline: String,
    pub path: String,
}

impl TokenPath {
    #[must_use]
    pub fn storage_key(&self) -> String {
        format!("{}/{}/{}", self.team, self.pipeline, self.path)
    }
}

/// A single RSA signing key as persisted in the keyset blob.
///
/// This is the storage-layer projection — `pipeline-idp-core`'s key manager
/// owns the in-memory `SigningKey` type that wraps an actual
/// `rsa::RsaPrivateKey`; this struct is its serializable shadow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredKey {
    pub kid: String,
    pub created_at: DateTime<Utc>,
    /// PKCS#1 DER-encoded RSA private key, base64-encoded for JSON transport.
    pub private_key_der_b64: String,
}

/// A pluggable, single-writer-safe key-value storage backend.
///
/// Implementations must be safe to share across async tasks (`Send + Sync`).
#[async_trait::async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Read the persisted token for a pipeline.
    ///
    /// Returns `Ok(None)` if no token has been written yet.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Backend`] if the underlying backend fails.
    async fn read_token(&self, path: &TokenPath) -> Result<Option<String>, StorageError>;

    /// Write the issued token for a pipeline, overwriting any existing value.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Backend`] if the underlying backend fails.
    async fn write_token(&self, path: &TokenPath, token: &str) -> Result<(), StorageError>;

    /// Read the full signing keyset. An empty set is not an error.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Backend`] if the underlying backend fails.
    async fn get_keyset(&self) -> Result<Vec<StoredKey>, StorageError>;

    /// Write the full signing keyset as a single versioned blob.
    ///
    /// Uses the backend's own CAS primitive against its own freshly-read
    /// version internally (defense in depth against a split-brain writer
    /// during lease handover); a handful of `Contended` retries are
    /// swallowed here rather than surfaced, since the only caller is
    /// expected to be the current lease holder.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Backend`] if the underlying backend fails, or
    /// if CAS contention persists across every retry.
    async fn put_keyset(&self, keys: &[StoredKey]) -> Result<(), StorageError>;

    /// Acquire or renew the leader lease for `holder`.
    ///
    /// Blocks until the lease is held: reads the current lease, and if it is
    /// held by a different, unexpired holder, sleeps until it expires before
    /// retrying the compare-and-swap write. Returns only once the write
    /// succeeds. Calling this again with the same `holder` renews it.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Backend`] if the underlying backend fails.
    /// Never returns `Contended` — CAS conflicts are retried internally.
    async fn acquire_lease(&self, holder: &str, ttl: Duration) -> Result<(), StorageError>;

    /// Release the leader lease unconditionally, best-effort.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Backend`] if the underlying backend fails.
    async fn release_lease(&self) -> Result<(), StorageError>;
}
