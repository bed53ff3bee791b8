//! In-memory storage backend for the `dev` profile and tests.
//!
//! Not persistent — all data is lost when the process exits. CAS is
//! implemented with a monotonic `u64` counter per record, which is exactly
//! what a single-process dev deployment needs and is trivial to reason
//! about in tests.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;

use crate::{StorageBackend, StorageError, StoredKey, TokenPath};

#[derive(Clone)]
struct LeaseRecord {
    holder: String,
    expires_at: chrono::DateTime<Utc>,
}

#[derive(Default)]
struct Versioned<T> {
    value: T,
    version: u64,
}

/// An in-memory [`StorageBackend`], backed by a `BTreeMap` and two versioned
/// slots for the keyset and the leader lease.
#[derive(Clone)]
pub struct MemoryBackend {
    tokens: Arc<RwLock<BTreeMap<String, String>>>,
    keyset: Arc<RwLock<Versioned<Vec<StoredKey>>>>,
    lease: Arc<RwLock<Versioned<Option<LeaseRecord>>>>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self {
            tokens: Arc::new(RwLock::new(BTreeMap::new())),
            keyset: Arc::new(RwLock::new(Versioned::default())),
            lease: Arc::new(RwLock::new(Versioned::default())),
        }
    }

    /// Attempt a single CAS write of the lease. Returns `Contended` if the
    /// observed version has moved on.
    async fn try_acquire_lease_once(
        &self,
        holder: &str,
        ttl: Duration,
    ) -> Result<(), StorageError> {
        let mut lease = self.lease.write().await;
        let observed_version = lease.version;
        let now = Utc::now();

        if let Some(current) = &lease.value {
            if current.expires_at > now && current.holder != holder {
                return Err(StorageError::Contended {
                    expected: observed_version,
                });
            }
        }

        let expires_at = now
            + chrono::Duration::from_std(ttl)
                .map_err(|e| StorageError::Backend { reason: e.to_string() })?;
        lease.value = Some(LeaseRecord {
            holder: holder.to_owned(),
            expires_at,
        });
        lease.version = lease.version.saturating_add(1);
        Ok(())
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl StorageBackend for MemoryBackend {
    async fn read_token(&self, path: &TokenPath) -> Result<Option<String>, StorageError> {
        let tokens = self.tokens.read().await;
        Ok(tokens.get(&path.storage_key()).cloned())
    }

    async fn write_token(&self, path: &TokenPath, token: &str) -> Result<(), StorageError> {
        let mut tokens = self.tokens.write().await;
        tokens.insert(path.storage_key(), token.to_owned());
        Ok(())
    }

    async fn get_keyset(&self) -> Result<Vec<StoredKey>, StorageError> {
        let keyset = self.keyset.read().await;
        Ok(keyset.value.clone())
    }

    async fn put_keyset(&self, keys: &[StoredKey]) -> Result<(), StorageError> {
        // A single in-process lock already serializes writers; there is no
        // external version to race against, so the write is unconditional
        // once the lock is held.
        let mut keyset = self.keyset.write().await;
        keyset.value = keys.to_vec();
        keyset.version = keyset.version.saturating_add(1);
        Ok(())
    }

    async fn acquire_lease(&self, holder: &str, ttl: Duration) -> Result<(), StorageError> {
        loop {
            match self.try_acquire_lease_once(holder, ttl).await {
                Ok(()) => return Ok(()),
                Err(StorageError::Contended { .. }) => {
                    let wait = {
                        let lease = self.lease.read().await;
                        lease
                            .value
                            .as_ref()
                            .map(|l| (l.expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO))
                            .unwrap_or(Duration::ZERO)
                    };
                    tokio::time::sleep(wait).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn release_lease(&self) -> Result<(), StorageError> {
        let mut lease = self.lease.write().await;
        lease.value = None;
        lease.version = lease.version.saturating_add(1);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn path() -> TokenPath {
        TokenPath {
            team: "myteam".to_owned(),
            pipeline: "mypipeline".to_owned(),
            path: "idtoken".to_owned(),
        }
    }

    fn key(kid: &str) -> StoredKey {
        StoredKey {
            kid: kid.to_owned(),
            created_at: Utc::now(),
            private_key_der_b64: "deadbeef".to_owned(),
        }
    }

    #[tokio::test]
    async fn read_token_missing_returns_none() {
        let backend = MemoryBackend::new();
        assert_eq!(backend.read_token(&path()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn write_then_read_token_roundtrips() {
        let backend = MemoryBackend::new();
        backend.write_token(&path(), "jwt-value").await.unwrap();
        assert_eq!(
            backend.read_token(&path()).await.unwrap(),
            Some("jwt-value".to_owned())
        );
    }

    #[tokio::test]
    async fn keyset_starts_empty() {
        let backend = MemoryBackend::new();
        assert!(backend.get_keyset().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn put_then_get_keyset_roundtrips() {
        let backend = MemoryBackend::new();
        backend.put_keyset(&[key("1")]).await.unwrap();
        let keys = backend.get_keyset().await.unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(keys[0].kid, "1");
    }

    #[tokio::test]
    async fn acquire_lease_when_free_succeeds_immediately() {
        let backend = MemoryBackend::new();
        backend
            .acquire_lease("instance-a", Duration::from_secs(30))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn acquire_lease_is_idempotent_for_same_holder() {
        let backend = MemoryBackend::new();
        backend
            .acquire_lease("instance-a", Duration::from_secs(30))
            .await
            .unwrap();
        // Renewal by the same holder must not block.
        backend
            .acquire_lease("instance-a", Duration::from_secs(30))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn acquire_lease_blocks_a_different_holder_until_expiry() {
        let backend = MemoryBackend::new();
        backend
            .acquire_lease("instance-a", Duration::from_millis(50))
            .await
            .unwrap();

        let start = tokio::time::Instant::now();
        backend
            .acquire_lease("instance-b", Duration::from_secs(30))
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn release_lease_clears_holder() {
        let backend = MemoryBackend::new();
        backend
            .acquire_lease("instance-a", Duration::from_secs(30))
            .await
            .unwrap();
        backend.release_lease().await.unwrap();

        // A different holder can now acquire without waiting.
        let start = tokio::time::Instant::now();
        backend
            .acquire_lease("instance-b", Duration::from_secs(30))
            .await
            .unwrap();
        assert!(start.elapsed() < Duration::from_millis(20));
    }
}
