//! Configuration for `pipeline-idp`.
//!
//! Loads a closed [`Config`] struct from environment variables (prefix
//! `CPIDP_`) with typed defaults, then validates it — turning a missing or
//! contradictory setting into [`Error::ConfigInvalid`] before any control
//! loop starts.

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::Error;

/// Which storage backend to construct.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackendKind {
    /// In-memory, for local development — no CAS contention is possible.
    Dev,
    /// HashiCorp Vault KV-v2.
    Vault,
}

/// Connection details for the Vault backend. Only consulted when
/// `backend == StorageBackendKind::Vault`.
#[derive(Debug, Clone, Default)]
pub struct VaultOpts {
    pub url: String,
    pub token: String,
    pub approle_id: String,
    pub approle_secret: String,
    /// Mount under which per-pipeline token secrets live.
    pub concourse_path: String,
    /// Mount under which the shared keyset and lease blobs live.
    pub config_path: String,
}

/// Signing-key rotation and retirement schedule.
#[derive(Debug, Clone)]
pub struct KeyOpts {
    pub rotation_period: Duration,
    pub max_age: Duration,
}

impl Default for KeyOpts {
    fn default() -> Self {
        Self {
            rotation_period: Duration::from_secs(24 * 3600),
            max_age: Duration::from_secs(48 * 3600),
        }
    }
}

/// Leader-election parameters.
#[derive(Debug, Clone)]
pub struct LeaderElectionOpts {
    pub enabled: bool,
    pub name: String,
    pub ttl: Duration,
}

impl Default for LeaderElectionOpts {
    fn default() -> Self {
        Self {
            enabled: true,
            name: String::new(),
            ttl: Duration::from_secs(60),
        }
    }
}

/// What goes into the `sub` claim of a minted token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubjectScope {
    /// `sub` omits the pipeline identity entirely (empty string).
    None,
    /// `sub` is just the team name.
    Team,
    /// `sub` is `team/pipeline`, the default.
    #[default]
    Pipeline,
}

/// Per-pipeline token configuration, with defaults filled in by
/// [`TokenConfig::new`].
#[derive(Debug, Clone)]
pub struct TokenConfig {
    pub team: String,
    pub pipeline: String,
    pub subject_scope: SubjectScope,
    pub audiences: Vec<String>,
    pub ttl: Duration,
    pub renew_before: Duration,
    /// Storage path segment under `<team>/<pipeline>/`, defaults to
    /// `idtoken` per spec §6.
    pub path: String,
}

impl TokenConfig {
    #[must_use]
    pub fn new(team: impl Into<String>, pipeline: impl Into<String>) -> Self {
        Self {
            team: team.into(),
            pipeline: pipeline.into(),
            subject_scope: SubjectScope::default(),
            audiences: Vec::new(),
            ttl: Duration::from_secs(60),
            renew_before: Duration::from_secs(30),
            path: "idtoken".to_owned(),
        }
    }

    #[must_use]
    pub fn canonical_name(&self) -> String {
        format!("{}/{}", self.team, self.pipeline)
    }

    /// Validate inter-field invariants.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigInvalid`] if `renew_before >= ttl`.
    pub fn validate(&self) -> Result<(), Error> {
        if self.team.is_empty() || self.pipeline.is_empty() {
            return Err(Error::ConfigInvalid {
                reason: "token config team and pipeline must be non-empty".to_owned(),
            });
        }
        if self.renew_before >= self.ttl {
            return Err(Error::ConfigInvalid {
                reason: format!(
                    "token config {}: renewBefore must be less than ttl",
                    self.canonical_name()
                ),
            });
        }
        Ok(())
    }
}

/// Top-level configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub external_url: String,
    pub listen_addr: SocketAddr,
    pub backend: StorageBackendKind,
    pub vault: VaultOpts,
    pub leader_election: LeaderElectionOpts,
    pub key: KeyOpts,
    pub tokens: Vec<TokenConfig>,
    pub log_level: String,
    /// Optional `jku` header value emitted on minted tokens, off by default.
    pub jku: Option<String>,
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_duration_secs(name: &str, default: Duration) -> Duration {
    env_var(name)
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    env_var(name)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from `CPIDP_*` environment variables.
    ///
    /// Per-pipeline token configs are read from `CPIDP_PIPELINES`, a
    /// comma-separated list of `team/pipeline` pairs; every pipeline gets
    /// the shared `CPIDP_TOKEN_*` TTL/renewBefore/audience settings.
    /// [`TokenConfig`] supports finer per-pipeline overrides structurally,
    /// but this loader is intentionally a thin adapter and doesn't expose
    /// them as individual env vars.
    #[must_use]
    pub fn from_env() -> Self {
        let external_url = env_var("CPIDP_EXTERNAL_URL").unwrap_or_default();

        let listen_addr = env_var("CPIDP_LISTEN_ADDR")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 8080)));

        let backend = match env_var("CPIDP_BACKEND").as_deref() {
            Some("vault") => StorageBackendKind::Vault,
            _ => StorageBackendKind::Dev,
        };

        let vault = VaultOpts {
            url: env_var("CPIDP_VAULT_URL").unwrap_or_default(),
            token: env_var("CPIDP_VAULT_TOKEN").unwrap_or_default(),
            approle_id: env_var("CPIDP_VAULT_APPROLEID").unwrap_or_default(),
            approle_secret: env_var("CPIDP_VAULT_APPROLESECRET").unwrap_or_default(),
            concourse_path: env_var("CPIDP_VAULT_CONCOURSEPATH")
                .unwrap_or_else(|| "concourse".to_owned()),
            config_path: env_var("CPIDP_VAULT_CONFIGPATH")
                .unwrap_or_else(|| "concourse/pipeline-idp".to_owned()),
        };

        let mut leader_election = LeaderElectionOpts {
            enabled: env_bool("CPIDP_LEADERELECTION_ENABLED", true),
            ttl: env_duration_secs("CPIDP_LEADERELECTION_TTL", Duration::from_secs(60)),
            ..LeaderElectionOpts::default()
        };
        leader_election.name = env_var("CPIDP_LEADERELECTION_NAME")
            .or_else(|| env_var("HOSTNAME"))
            .unwrap_or_else(|| "pipeline-idp".to_owned());

        let key = KeyOpts {
            rotation_period: env_duration_secs("CPIDP_KEY_ROTATIONPERIOD", Duration::from_secs(24 * 3600)),
            max_age: env_duration_secs("CPIDP_KEY_MAXAGE", Duration::from_secs(48 * 3600)),
        };

        let ttl = env_duration_secs("CPIDP_TOKEN_TTL", Duration::from_secs(60));
        let renew_before = env_duration_secs("CPIDP_TOKEN_RENEWBEFORE", Duration::from_secs(30));
        let audiences: Vec<String> = env_var("CPIDP_TOKEN_AUDIENCES")
            .map(|v| v.split(',').map(str::to_owned).collect())
            .unwrap_or_default();

        let tokens = env_var("CPIDP_PIPELINES")
            .map(|v| {
                v.split(',')
                    .filter_map(|entry| {
                        let (team, pipeline) = entry.trim().split_once('/')?;
                        let mut cfg = TokenConfig::new(team, pipeline);
                        cfg.ttl = ttl;
                        cfg.renew_before = renew_before;
                        cfg.audiences = audiences.clone();
                        Some(cfg)
                    })
                    .collect()
            })
            .unwrap_or_default();

        let log_level = env_var("CPIDP_LOG_LEVEL").unwrap_or_else(|| "info".to_owned());
        let jku = env_var("CPIDP_TOKEN_JKU");

        Self {
            external_url,
            listen_addr,
            backend,
            vault,
            leader_election,
            key,
            tokens,
            log_level,
            jku,
        }
    }

    /// Validate the configuration, rejecting contradictions before any
    /// control loop starts.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigInvalid`] if `external_url` is unset, the
    /// vault backend is selected without credentials, any per-pipeline
    /// config is invalid, or `key.max_age <= key.rotation_period`.
    pub fn validate(&self) -> Result<(), Error> {
        if self.external_url.is_empty() {
            return Err(Error::ConfigInvalid {
                reason: "externalUrl must be set".to_owned(),
            });
        }

        if self.backend == StorageBackendKind::Vault {
            if self.vault.url.is_empty() {
                return Err(Error::ConfigInvalid {
                    reason: "vault.url must be set".to_owned(),
                });
            }
            let has_token = !self.vault.token.is_empty();
            let has_approle = !self.vault.approle_id.is_empty() && !self.vault.approle_secret.is_empty();
            if !has_token && !has_approle {
                return Err(Error::ConfigInvalid {
                    reason: "vault.token or vault.approleId+vault.approleSecret must be set".to_owned(),
                });
            }
        }

        for token_config in &self.tokens {
            token_config.validate()?;
        }

        if self.key.max_age <= self.key.rotation_period {
            return Err(Error::ConfigInvalid {
                reason: "key.maxAge must be larger than key.rotationPeriod".to_owned(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            external_url: "https://idp.example.com".to_owned(),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            backend: StorageBackendKind::Dev,
            vault: VaultOpts::default(),
            leader_election: LeaderElectionOpts::default(),
            key: KeyOpts::default(),
            tokens: vec![TokenConfig::new("myteam", "mypipeline")],
            log_level: "info".to_owned(),
            jku: None,
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn missing_external_url_is_invalid() {
        let mut cfg = base_config();
        cfg.external_url.clear();
        assert!(matches!(cfg.validate(), Err(Error::ConfigInvalid { .. })));
    }

    #[test]
    fn vault_backend_without_credentials_is_invalid() {
        let mut cfg = base_config();
        cfg.backend = StorageBackendKind::Vault;
        cfg.vault.url = "https://vault.example.com".to_owned();
        assert!(matches!(cfg.validate(), Err(Error::ConfigInvalid { .. })));
    }

    #[test]
    fn max_age_not_greater_than_rotation_period_is_invalid() {
        let mut cfg = base_config();
        cfg.key.max_age = cfg.key.rotation_period;
        assert!(matches!(cfg.validate(), Err(Error::ConfigInvalid { .. })));
    }

    #[test]
    fn renew_before_not_less_than_ttl_is_invalid() {
        let mut cfg = base_config();
        cfg.tokens[0].renew_before = cfg.tokens[0].ttl;
        assert!(matches!(cfg.validate(), Err(Error::ConfigInvalid { .. })));
    }
}
