//! Issuance controller: mints and renews the token for every configured
//! pipeline, failure-isolated per pipeline.
//!
//! Keeps an in-memory renewal cache so a restart doesn't immediately remint
//! every token — on startup it reads what's already on disk and, if still
//! valid, just remembers when to renew it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use pipeline_idp_storage::{StorageBackend, TokenPath};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::TokenConfig;
use crate::token::TokenGenerator;

/// Slack applied when computing a renewal deadline, matching the slack
/// tolerated when recomputing a wake time elsewhere in this crate.
const RENEWAL_SLACK: Duration = Duration::from_secs(2);
/// Upper bound on how long the controller will sleep between ticks, even if
/// every pipeline's cache entry is far from expiring.
const MAX_SLEEP: Duration = Duration::from_secs(24 * 3600);

struct CacheEntry {
    token: String,
    renew_at: DateTime<Utc>,
}

/// Drives the per-pipeline mint/renew loop.
pub struct Controller {
    tokens: Vec<TokenConfig>,
    generator: Arc<TokenGenerator>,
    storage: Arc<dyn StorageBackend>,
    cache: HashMap<String, CacheEntry>,
}

impl Controller {
    #[must_use]
    pub fn new(tokens: Vec<TokenConfig>, generator: Arc<TokenGenerator>, storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            tokens,
            generator,
            storage,
            cache: HashMap::new(),
        }
    }

    fn path_for(config: &TokenConfig) -> TokenPath {
        TokenPath {
            team: config.team.clone(),
            pipeline: config.pipeline.clone(),
            path: config.path.clone(),
        }
    }

    fn renewal_time(exp: i64, renew_before: Duration) -> DateTime<Utc> {
        let valid_until = DateTime::from_timestamp(exp, 0).unwrap_or_else(Utc::now);
        let lead = chrono::Duration::from_std(renew_before).unwrap_or_default()
            - chrono::Duration::from_std(RENEWAL_SLACK).unwrap_or_default();
        valid_until - lead
    }

    /// Warm the renewal cache from whatever is already persisted.
    ///
    /// A missing (`NotFound`) or invalid token simply leaves that pipeline's
    /// cache entry absent, forcing the first tick to mint immediately — this
    /// is deliberately non-fatal even when the read fails for some other
    /// backend reason, since one unreachable pipeline's storage path must
    /// never prevent every other pipeline from being served.
    pub async fn warm_cache(&mut self) {
        for config in self.tokens.clone() {
            let path = Self::path_for(&config);
            let existing = match self.storage.read_token(&path).await {
                Ok(Some(token)) => token,
                Ok(None) => continue,
                Err(e) => {
                    warn!(pipeline = %config.canonical_name(), error = %e, "failed to read existing token during warm-up");
                    continue;
                }
            };

            match self.generator.verify_self(&existing).await {
                Ok((true, exp)) => {
                    info!(pipeline = %config.canonical_name(), "found existing valid token");
                    self.cache.insert(
                        config.canonical_name(),
                        CacheEntry {
                            token: existing,
                            renew_at: Self::renewal_time(exp, config.renew_before),
                        },
                    );
                }
                Ok((false, _)) => {
                    info!(pipeline = %config.canonical_name(), "existing token expired, will mint fresh");
                }
                Err(e) => {
                    warn!(pipeline = %config.canonical_name(), error = %e, "existing token failed verification, will mint fresh");
                }
            }
        }
    }

    fn needs_renewal(&self, config: &TokenConfig) -> bool {
        match self.cache.get(&config.canonical_name()) {
            Some(entry) => Utc::now() >= entry.renew_at,
            None => true,
        }
    }

    async fn renew_one(&mut self, config: &TokenConfig) -> bool {
        if !self.needs_renewal(config) {
            return false;
        }

        let (token, exp) = match self.generator.generate(config).await {
            Ok(result) => result,
            Err(e) => {
                warn!(pipeline = %config.canonical_name(), error = %e, "failed to mint token");
                return false;
            }
        };

        if let Err(e) = self.storage.write_token(&Self::path_for(config), &token).await {
            warn!(pipeline = %config.canonical_name(), error = %e, "failed to store minted token");
            return false;
        }

        self.cache.insert(
            config.canonical_name(),
            CacheEntry {
                token,
                renew_at: Self::renewal_time(exp, config.renew_before),
            },
        );
        true
    }

    /// Run one pass over every configured pipeline, minting or renewing
    /// where due. A failure on one pipeline is logged and skipped — it
    /// never stops the others or the loop itself.
    pub async fn tick(&mut self) {
        for config in self.tokens.clone() {
            if self.renew_one(&config).await {
                info!(pipeline = %config.canonical_name(), "renewed token");
            }
        }
    }

    fn next_sleep(&self) -> Duration {
        let now = Utc::now();
        let mut next = now + chrono::Duration::from_std(MAX_SLEEP).unwrap_or_default();
        for entry in self.cache.values() {
            if entry.renew_at < next {
                next = entry.renew_at;
            }
        }
        (next - now).to_std().unwrap_or(Duration::ZERO)
    }

    /// Run the controller loop until `shutdown` reports `true`.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        self.warm_cache().await;

        loop {
            self.tick().await;

            tokio::select! {
                () = tokio::time::sleep(self.next_sleep()) => {}
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// A defensive in-memory read of the current cached token, used by
    /// tests and health checks; not part of the control-flow contract.
    #[cfg(test)]
    fn cached_token(&self, config: &TokenConfig) -> Option<&str> {
        self.cache.get(&config.canonical_name()).map(|e| e.token.as_str())
    }
}
