//! Token generator: mints and self-verifies per-pipeline JWTs.
//!
//! Reads the shared current signing key published by [`crate::keys::KeyManager`]
//! — this is the only place outside the key manager that touches key
//! material, and it only ever reads.

use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::config::{SubjectScope, TokenConfig};
use crate::error::Error;
use crate::keys::CurrentKey;

/// Claims embedded in every minted token, per RFC 7519 plus two custom
/// fields identifying the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub iss: String,
    pub sub: String,
    pub aud: Vec<String>,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
    pub jti: String,
    pub team: String,
    pub pipeline: String,
}

/// Mints and verifies tokens for one configured pipeline against the
/// process-wide signing key.
pub struct TokenGenerator {
    issuer: String,
    jku: Option<String>,
    current_key: CurrentKey,
}

impl TokenGenerator {
    #[must_use]
    pub fn new(issuer: String, jku: Option<String>, current_key: CurrentKey) -> Self {
        Self {
            issuer,
            jku,
            current_key,
        }
    }

    /// Mint a fresh token for `config`'s pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SignError`] if no signing key has been published
    /// yet, or the JWS encoding step fails.
    pub async fn generate(&self, config: &TokenConfig) -> Result<(String, i64), Error> {
        let key = self
            .current_key
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::SignError {
                reason: "no signing key available yet".to_owned(),
            })?;

        let now = Utc::now().timestamp();
        let exp = now + i64::try_from(config.ttl.as_secs()).unwrap_or(i64::MAX);

        let claims = Claims {
            iss: self.issuer.clone(),
            sub: subject_for(config),
            aud: config.audiences.clone(),
            iat: now,
            nbf: now,
            exp,
            jti: generate_jti(),
            team: config.team.clone(),
            pipeline: config.pipeline.clone(),
        };

        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(key.kid.clone());
        header.jku = self.jku.clone();

        let encoding_key: EncodingKey = key.encoding_key()?;
        let jwt = encode(&header, &claims, &encoding_key).map_err(|e| Error::SignError {
            reason: e.to_string(),
        })?;

        Ok((jwt, exp))
    }

    /// Verify a previously-issued token against the current signing key.
    ///
    /// Returns `(false, 0)` without an error for a token that is well-formed
    /// and correctly signed but simply expired — that is an expected steady
    /// state, not a failure. Any other problem (bad signature, wrong
    /// issuer, malformed token, no key loaded yet) is an [`Error::VerifyError`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::VerifyError`] for any verification failure other
    /// than ordinary expiry.
    pub async fn verify_self(&self, jwt: &str) -> Result<(bool, i64), Error> {
        let key = self
            .current_key
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::VerifyError {
                reason: "no signing key available yet".to_owned(),
            })?;

        let decoding_key: DecodingKey = key.decoding_key()?;

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[self.issuer.clone()]);

        match decode::<Claims>(jwt, &decoding_key, &validation) {
            Ok(data) => Ok((true, data.claims.exp)),
            Err(e) if matches!(e.kind(), jsonwebtoken::errors::ErrorKind::ExpiredSignature) => {
                Ok((false, 0))
            }
            Err(e) => Err(Error::VerifyError { reason: e.to_string() }),
        }
    }
}

fn subject_for(config: &TokenConfig) -> String {
    match config.subject_scope {
        SubjectScope::None => String::new(),
        SubjectScope::Team => config.team.clone(),
        SubjectScope::Pipeline => config.canonical_name(),
    }
}

/// A 128-bit cryptographic random, decimal-encoded. `u128` is exactly 128
/// bits wide, so a uniformly random value needs no bignum dependency.
fn generate_jti() -> String {
    let hi = u128::from(rand::rngs::OsRng.next_u64());
    let lo = u128::from(rand::rngs::OsRng.next_u64());
    ((hi << 64) | lo).to_string()
}
