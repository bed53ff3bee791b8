//! HTTP discovery routes: OIDC discovery document and JWKS.

use std::sync::Arc;

use axum::http::header::CACHE_CONTROL;
use axum::http::HeaderValue;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::error::AppError;
use crate::state::AppState;

/// Upper bound on how long a client may cache the JWKS response, per the
/// bounded-freshness requirement on this endpoint.
const JWKS_MAX_AGE_SECS: u64 = 10;

/// Build the discovery + JWKS router.
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/.well-known/openid-configuration", get(openid_configuration))
        .route("/keys", get(keys))
}

#[derive(Serialize)]
struct OpenIdConfiguration {
    issuer: String,
    jwks_uri: String,
}

async fn openid_configuration(
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
) -> Json<OpenIdConfiguration> {
    Json(OpenIdConfiguration {
        issuer: state.external_url.clone(),
        jwks_uri: format!("{}/keys", state.external_url),
    })
}

async fn keys(
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
) -> Result<Response, AppError> {
    let jwks = state.key_manager.jwks().await?;

    let mut response = Json(jwks).into_response();
    response.headers_mut().insert(
        CACHE_CONTROL,
        HeaderValue::from_str(&format!("max-age={JWKS_MAX_AGE_SECS}"))
            .unwrap_or_else(|_| HeaderValue::from_static("max-age=10")),
    );
    Ok(response)
}
