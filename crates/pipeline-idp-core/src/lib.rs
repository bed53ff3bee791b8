//! Core control loops for `pipeline-idp`: signing-key management, token
//! issuance, per-pipeline renewal, and leader election.
//!
//! None of these types know how they're exposed over HTTP — that's
//! `pipeline-idp-server`'s job. This crate only needs a
//! [`pipeline_idp_storage::StorageBackend`] to run.

pub mod config;
pub mod controller;
pub mod error;
pub mod keys;
pub mod lease;
pub mod token;

pub use config::Config;
pub use controller::Controller;
pub use error::Error;
pub use keys::{CurrentKey, Jwk, Jwks, KeyManager, SigningKey};
pub use lease::Lease;
pub use token::{Claims, TokenGenerator};
