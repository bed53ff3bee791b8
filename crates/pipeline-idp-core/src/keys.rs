//! Signing-key manager: the only component that mutates the shared signing
//! key.
//!
//! Generates and rotates RSA-4096 signing keys, retires keys past their
//! maximum age, and persists the keyset through a [`StorageBackend`]. The
//! current key is held behind a [`tokio::sync::RwLock`] — one writer (this
//! manager's tick loop), many readers (the token generator, the JWKS route)
//! — the same single-writer/many-reader shape as a sealed/unsealed root key.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use jsonwebtoken::{DecodingKey, EncodingKey};
use pipeline_idp_storage::{StorageBackend, StoredKey};
use rand::Rng;
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey, EncodeRsaPublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::Serialize;
use tokio::sync::{watch, RwLock};
use tracing::{info, warn};

use crate::error::Error;

const RSA_BITS: usize = 4096;
/// Extra slack added to every computed wake time so the tick loop never
/// fires a few milliseconds early and spins.
const WAKE_SLACK: Duration = Duration::from_secs(2);
/// Backoff used when a tick fails outright (storage unreachable, corrupt
/// keyset, ...).
const RETRY_BACKOFF: Duration = Duration::from_secs(10 * 60);

/// A single RSA signing key, live in process memory.
pub struct SigningKey {
    pub kid: String,
    pub created_at: DateTime<Utc>,
    private_key: RsaPrivateKey,
}

impl SigningKey {
    fn generate() -> Result<Self, Error> {
        let mut rng = rand::rngs::OsRng;
        let private_key = RsaPrivateKey::new(&mut rng, RSA_BITS).map_err(|e| Error::SignError {
            reason: format!("failed to generate RSA key: {e}"),
        })?;
        Ok(Self {
            kid: generate_kid(),
            created_at: Utc::now(),
            private_key,
        })
    }

    fn public_key(&self) -> RsaPublicKey {
        RsaPublicKey::from(&self.private_key)
    }

    /// Signing key for `jsonwebtoken`'s RS256 encoder.
    pub fn encoding_key(&self) -> Result<EncodingKey, Error> {
        let der = self.private_key.to_pkcs1_der().map_err(|e| Error::SignError {
            reason: format!("failed to encode private key: {e}"),
        })?;
        Ok(EncodingKey::from_rsa_der(der.as_bytes()))
    }

    /// Verification key for `jsonwebtoken`'s RS256 decoder.
    pub fn decoding_key(&self) -> Result<DecodingKey, Error> {
        let der = self.public_key().to_pkcs1_der().map_err(|e| Error::VerifyError {
            reason: format!("failed to encode public key: {e}"),
        })?;
        Ok(DecodingKey::from_rsa_der(der.as_bytes()))
    }

    /// Project the public half of this key as an RFC 7517 JWK.
    pub fn to_jwk(&self) -> Jwk {
        let public = self.public_key();
        Jwk {
            kty: "RSA".to_owned(),
            kid: self.kid.clone(),
            key_use: "sign".to_owned(),
            alg: "RS256".to_owned(),
            n: URL_SAFE_NO_PAD.encode(public.n().to_bytes_be()),
            e: URL_SAFE_NO_PAD.encode(public.e().to_bytes_be()),
        }
    }

    fn to_stored(&self) -> Result<StoredKey, Error> {
        let der = self.private_key.to_pkcs1_der().map_err(|e| Error::SignError {
            reason: format!("failed to encode private key for storage: {e}"),
        })?;
        Ok(StoredKey {
            kid: self.kid.clone(),
            created_at: self.created_at,
            private_key_der_b64: STANDARD.encode(der.as_bytes()),
        })
    }

    fn from_stored(stored: &StoredKey) -> Result<Self, Error> {
        let der = STANDARD
            .decode(&stored.private_key_der_b64)
            .map_err(|e| Error::SignError {
                reason: format!("corrupt stored key {}: {e}", stored.kid),
            })?;
        let private_key = RsaPrivateKey::from_pkcs1_der(&der).map_err(|e| Error::SignError {
            reason: format!("corrupt stored key {}: {e}", stored.kid),
        })?;
        Ok(Self {
            kid: stored.kid.clone(),
            created_at: stored.created_at,
            private_key,
        })
    }
}

/// A fresh 63-bit cryptographic random, decimal-encoded. Deliberately not
/// derived from the current time — two keys minted in the same second (or
/// by two racing writers) must not collide, and nothing downstream should
/// be tempted to parse a `kid` back into a timestamp.
fn generate_kid() -> String {
    let value: u64 = rand::thread_rng().gen_range(0..(1u64 << 63));
    value.to_string()
}

/// JSON Web Key per RFC 7517, public material only.
#[derive(Debug, Clone, Serialize)]
pub struct Jwk {
    pub kty: String,
    pub kid: String,
    #[serde(rename = "use")]
    pub key_use: String,
    pub alg: String,
    pub n: String,
    pub e: String,
}

/// JSON Web Key Set per RFC 7517.
#[derive(Debug, Clone, Serialize, Default)]
pub struct Jwks {
    pub keys: Vec<Jwk>,
}

/// Shared handle to the current signing key. Cloning is cheap; all clones
/// see the same underlying lock.
pub type CurrentKey = Arc<RwLock<Option<Arc<SigningKey>>>>;

/// Owns the signing keyset: rotation, retirement, persistence, and the
/// shared "current key" slot read by the token generator and the JWKS
/// route.
pub struct KeyManager {
    storage: Arc<dyn StorageBackend>,
    rotation_period: Duration,
    max_age: Duration,
    current: CurrentKey,
}

impl KeyManager {
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>, rotation_period: Duration, max_age: Duration) -> Self {
        Self {
            storage,
            rotation_period,
            max_age,
            current: Arc::new(RwLock::new(None)),
        }
    }

    /// A clone of the shared current-key handle, to be read by the token
    /// generator and the JWKS route without touching storage.
    #[must_use]
    pub fn current_key_handle(&self) -> CurrentKey {
        Arc::clone(&self.current)
    }

    /// The currently selected signing key, if one has been loaded yet.
    pub async fn current_key(&self) -> Option<Arc<SigningKey>> {
        self.current.read().await.clone()
    }

    /// Public projection of every live key in the keyset, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Backend`] if the keyset cannot be read, or
    /// [`Error::SignError`] if a stored key is corrupt.
    pub async fn jwks(&self) -> Result<Jwks, Error> {
        let mut stored = self.storage.get_keyset().await?;
        stored.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.kid.cmp(&a.kid)));

        let mut keys = Vec::with_capacity(stored.len());
        for entry in &stored {
            keys.push(SigningKey::from_stored(entry)?.to_jwk());
        }
        Ok(Jwks { keys })
    }

    /// Run the key-management loop until `shutdown` reports `true`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let next_run = match self.tick().await {
                Ok(next_run) => next_run,
                Err(e) => {
                    warn!(error = %e, "signing key tick failed, retrying later");
                    Utc::now() + chrono::Duration::from_std(RETRY_BACKOFF).unwrap_or_default()
                }
            };

            let delay = (next_run - Utc::now())
                .to_std()
                .unwrap_or(Duration::ZERO)
                + WAKE_SLACK;

            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// Load, select, rotate, and retire the keyset once; publish the
    /// resulting current key and return the next time this should run
    /// again.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Backend`] if storage cannot be read or written, or
    /// [`Error::SignError`] if key generation or (de)serialization fails.
    pub async fn tick(&self) -> Result<DateTime<Utc>, Error> {
        info!("checking signing keys");

        let mut stored = self.storage.get_keyset().await?;
        if stored.is_empty() {
            let fresh = SigningKey::generate()?;
            info!(kid = %fresh.kid, "no existing signing keys found, generated new key");
            let entry = fresh.to_stored()?;
            self.storage.put_keyset(std::slice::from_ref(&entry)).await?;
            stored.push(entry);
        }

        let mut keys: Vec<SigningKey> = stored
            .iter()
            .map(SigningKey::from_stored)
            .collect::<Result<_, _>>()?;

        let newest_idx = newest_index(&keys).ok_or_else(|| Error::Backend {
            reason: "keyset became empty after load".to_owned(),
        })?;

        self.publish(&keys[newest_idx]).await;

        let mut changed = false;
        let now = Utc::now();
        let newest_created_at = keys[newest_idx].created_at;

        let mut next_run = if now - newest_created_at > chrono_duration(self.rotation_period) {
            info!("rotating signing key");
            let fresh = SigningKey::generate()?;
            keys.push(fresh);
            changed = true;
            now + chrono_duration(self.rotation_period)
        } else {
            newest_created_at + chrono_duration(self.rotation_period)
        };

        let max_age = self.max_age;
        keys.retain(|key| {
            let age = now - key.created_at;
            if age > chrono_duration(max_age) {
                info!(kid = %key.kid, "retiring signing key past max age");
                changed = true;
                false
            } else {
                let retire_at = key.created_at + chrono_duration(max_age);
                if retire_at < next_run {
                    next_run = retire_at;
                }
                true
            }
        });

        if changed {
            let to_store: Vec<StoredKey> = keys.iter().map(SigningKey::to_stored).collect::<Result<_, _>>()?;
            self.storage.put_keyset(&to_store).await?;

            let newest_idx = newest_index(&keys).ok_or_else(|| Error::Backend {
                reason: "keyset became empty after rotation".to_owned(),
            })?;
            self.publish(&keys[newest_idx]).await;
        }

        Ok(next_run)
    }

    async fn publish(&self, key: &SigningKey) {
        let mut guard = self.current.write().await;
        let needs_update = guard.as_ref().is_none_or(|current| current.kid != key.kid);
        if needs_update {
            *guard = Some(Arc::new(SigningKey {
                kid: key.kid.clone(),
                created_at: key.created_at,
                private_key: key.private_key.clone(),
            }));
        }
    }
}

fn newest_index(keys: &[SigningKey]) -> Option<usize> {
    keys.iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.created_at.cmp(&b.created_at).then(a.kid.cmp(&b.kid)))
        .map(|(idx, _)| idx)
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::zero())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pipeline_idp_storage::MemoryBackend;

    fn manager(rotation_period: Duration, max_age: Duration) -> KeyManager {
        KeyManager::new(Arc::new(MemoryBackend::new()), rotation_period, max_age)
    }

    #[tokio::test]
    async fn tick_generates_a_key_when_keyset_is_empty() {
        let mgr = manager(Duration::from_secs(3600), Duration::from_secs(7200));
        mgr.tick().await.unwrap();

        let key = mgr.current_key().await;
        assert!(key.is_some());
    }

    #[tokio::test]
    async fn tick_is_idempotent_within_the_rotation_period() {
        let mgr = manager(Duration::from_secs(3600), Duration::from_secs(7200));
        mgr.tick().await.unwrap();
        let first_kid = mgr.current_key().await.unwrap().kid.clone();

        mgr.tick().await.unwrap();
        let second_kid = mgr.current_key().await.unwrap().kid.clone();

        assert_eq!(first_kid, second_kid);
    }

    #[tokio::test]
    async fn tick_rotates_once_the_rotation_period_has_elapsed() {
        let mgr = manager(Duration::from_millis(0), Duration::from_secs(3600));
        mgr.tick().await.unwrap();
        let first_kid = mgr.current_key().await.unwrap().kid.clone();

        tokio::time::sleep(Duration::from_millis(5)).await;
        mgr.tick().await.unwrap();
        let second_kid = mgr.current_key().await.unwrap().kid.clone();

        assert_ne!(first_kid, second_kid);
    }

    #[tokio::test]
    async fn jwks_lists_keys_newest_first() {
        let mgr = manager(Duration::from_millis(0), Duration::from_secs(3600));
        mgr.tick().await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        mgr.tick().await.unwrap();

        let jwks = mgr.jwks().await.unwrap();
        assert_eq!(jwks.keys.len(), 2);
        assert_eq!(jwks.keys[0].kid, mgr.current_key().await.unwrap().kid);
    }

    #[tokio::test]
    async fn generate_kid_produces_distinct_decimal_strings() {
        let a = generate_kid();
        let b = generate_kid();
        assert_ne!(a, b);
        assert!(a.parse::<u64>().is_ok());
    }
}
