//! HashiCorp Vault-backed [`StorageBackend`].
//!
//! Every pipeline's token lives at `<mount>/<team>/<pipeline>/<path>` in a
//! KV-v2 secrets engine. The keyset and the leader lease live as single
//! blobs under a configured config mount (`<config_mount>/keys` and
//! `<config_mount>/lock`). CAS uses Vault's own per-path version counter via
//! `kv2::set_with_options(..., &[KvOpt::Cas(version)])`, the same mechanism
//! the reference Go implementation drives through its `cas` write option.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use vaultrs::client::VaultClient;
use vaultrs::kv2;
use vaultrs::kv2::KvOpt;

use crate::{StorageBackend, StorageError, StoredKey, TokenPath};

const MAX_KEYSET_CAS_ATTEMPTS: u32 = 5;
/// Per-call deadline on every Vault round trip, so a stalled connection
/// can't wedge a control loop forever.
const VAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

fn backend_err(reason: impl std::fmt::Display) -> StorageError {
    StorageError::Backend {
        reason: reason.to_string(),
    }
}

/// Race a Vault client call against [`VAULT_CALL_TIMEOUT`].
async fn with_timeout<F, T>(call: F) -> Result<T, StorageError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(VAULT_CALL_TIMEOUT, call)
        .await
        .map_err(|_| backend_err("vault call timed out after 10s"))
}

fn is_not_found(err: &vaultrs::error::ClientError) -> bool {
    err.to_string().contains("404") || err.to_string().contains("Not Found")
}

fn is_cas_conflict(err: &vaultrs::error::ClientError) -> bool {
    err.to_string().contains("check-and-set")
}

/// A Vault KV-v2-backed storage implementation.
pub struct VaultBackend {
    client: VaultClient,
    /// Mount point holding per-pipeline token secrets.
    token_mount: String,
    /// Mount point holding the shared keyset and lock blobs.
    config_mount: String,
}

impl VaultBackend {
    #[must_use]
    pub fn new(client: VaultClient, token_mount: String, config_mount: String) -> Self {
        Self {
            client,
            token_mount,
            config_mount,
        }
    }

    /// Current version of the `lock` path, or `0` if it has never been
    /// written.
    async fn lock_version(&self) -> Result<u64, StorageError> {
        match with_timeout(kv2::read_metadata(&self.client, &self.config_mount, "lock")).await? {
            Ok(meta) => Ok(meta.current_version),
            Err(e) if is_not_found(&e) => Ok(0),
            Err(e) => Err(backend_err(e)),
        }
    }
}

#[async_trait::async_trait]
impl StorageBackend for VaultBackend {
    async fn read_token(&self, path: &TokenPath) -> Result<Option<String>, StorageError> {
        let target = format!("{}/{}/{}", path.team, path.pipeline, path.path);
        let data: Result<HashMap<String, String>, _> =
            with_timeout(kv2::read(&self.client, &self.token_mount, &target)).await?;
        match data {
            Ok(mut map) => Ok(map.remove("value")),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(backend_err(e)),
        }
    }

    async fn write_token(&self, path: &TokenPath, token: &str) -> Result<(), StorageError> {
        let target = format!("{}/{}/{}", path.team, path.pipeline, path.path);
        let mut data = HashMap::new();
        data.insert("value".to_owned(), token.to_owned());
        with_timeout(kv2::set(&self.client, &self.token_mount, &target, &data))
            .await?
            .map_err(backend_err)?;
        Ok(())
    }

    async fn get_keyset(&self) -> Result<Vec<StoredKey>, StorageError> {
        let data: Result<HashMap<String, String>, _> =
            with_timeout(kv2::read(&self.client, &self.config_mount, "keys")).await?;

        let map = match data {
            Ok(map) => map,
            Err(e) if is_not_found(&e) => return Ok(Vec::new()),
            Err(e) => return Err(backend_err(e)),
        };

        let mut keys = Vec::with_capacity(map.len());
        for encoded in map.values() {
            let key: StoredKey = serde_json::from_str(encoded)
                .map_err(|e| backend_err(format!("corrupt keyset entry: {e}")))?;
            keys.push(key);
        }
        Ok(keys)
    }

    async fn put_keyset(&self, keys: &[StoredKey]) -> Result<(), StorageError> {
        let mut data = HashMap::with_capacity(keys.len());
        for key in keys {
            let encoded = serde_json::to_string(key).map_err(backend_err)?;
            data.insert(key.kid.clone(), encoded);
        }

        for attempt in 0..MAX_KEYSET_CAS_ATTEMPTS {
            let version = match with_timeout(kv2::read_metadata(&self.client, &self.config_mount, "keys")).await? {
                Ok(meta) => meta.current_version,
                Err(e) if is_not_found(&e) => 0,
                Err(e) => return Err(backend_err(e)),
            };

            let opts = [KvOpt::Cas(version)];
            match with_timeout(kv2::set_with_options(
                &self.client,
                &self.config_mount,
                "keys",
                &data,
                &opts,
            ))
            .await?
            {
                Ok(_) => return Ok(()),
                Err(e) if is_cas_conflict(&e) && attempt + 1 < MAX_KEYSET_CAS_ATTEMPTS => continue,
                Err(e) => return Err(backend_err(e)),
            }
        }
        Err(backend_err("keyset write contended after retries"))
    }

    async fn acquire_lease(&self, holder: &str, ttl: Duration) -> Result<(), StorageError> {
        loop {
            let current: Result<HashMap<String, String>, _> =
                with_timeout(kv2::read(&self.client, &self.config_mount, "lock")).await?;

            let (current_holder, current_exp) = match current {
                Ok(map) => {
                    let holder = map.get("sub").cloned();
                    let exp: Option<i64> = map.get("exp").and_then(|s| s.parse().ok());
                    (holder, exp)
                }
                Err(e) if is_not_found(&e) => (None, None),
                Err(e) => return Err(backend_err(e)),
            };

            let version = self.lock_version().await?;
            let now = chrono::Utc::now().timestamp();

            if let (Some(other), Some(exp)) = (&current_holder, current_exp) {
                if exp > now && other != holder {
                    let wait = u64::try_from(exp - now).unwrap_or(0);
                    sleep(Duration::from_secs(wait)).await;
                    continue;
                }
            }

            let new_exp = now
                + i64::try_from(ttl.as_secs())
                    .map_err(|e| backend_err(format!("ttl out of range: {e}")))?;
            let mut data = HashMap::new();
            data.insert("sub".to_owned(), holder.to_owned());
            data.insert("exp".to_owned(), new_exp.to_string());

            let opts = [KvOpt::Cas(version)];
            match with_timeout(kv2::set_with_options(
                &self.client,
                &self.config_mount,
                "lock",
                &data,
                &opts,
            ))
            .await?
            {
                Ok(_) => return Ok(()),
                Err(e) if is_cas_conflict(&e) => continue,
                Err(e) => return Err(backend_err(e)),
            }
        }
    }

    async fn release_lease(&self) -> Result<(), StorageError> {
        with_timeout(kv2::delete_metadata(&self.client, &self.config_mount, "lock"))
            .await?
            .map_err(backend_err)?;
        Ok(())
    }
}
