//! Shared application state for the JWKS HTTP server.

use std::sync::Arc;

use pipeline_idp_core::KeyManager;

/// Shared state passed to every Axum handler.
pub struct AppState {
    /// The running key manager, read-only from HTTP's perspective — the
    /// background key-management loop is the only writer.
    pub key_manager: Arc<KeyManager>,
    /// Public base URL this instance is reachable at, used to build
    /// `issuer` and `jwks_uri` in the discovery document.
    pub external_url: String,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("external_url", &self.external_url)
            .finish_non_exhaustive()
    }
}
