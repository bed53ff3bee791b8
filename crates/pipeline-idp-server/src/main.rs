//! `pipeline-idp` entry point.
//!
//! Bootstraps the storage backend and the signing-key manager, issuance
//! controller, and leader lease, then starts the Axum JWKS server. All three
//! background loops and the HTTP server run as independent Tokio tasks and
//! are stopped together on `SIGINT`/`SIGTERM`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::http::HeaderValue;
use axum::Router;
use pipeline_idp_core::config::StorageBackendKind;
use pipeline_idp_core::{Config, Controller, KeyManager, Lease, TokenGenerator};
use pipeline_idp_storage::{MemoryBackend, StorageBackend};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;

use pipeline_idp_server::routes;
use pipeline_idp_server::state::AppState;

use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level)),
        )
        .json()
        .init();

    config.validate().context("invalid configuration")?;

    info!(backend = ?config.backend, "pipeline-idp starting");

    let storage = build_storage(&config).await?;

    let key_manager = Arc::new(KeyManager::new(
        Arc::clone(&storage),
        config.key.rotation_period,
        config.key.max_age,
    ));

    let generator = Arc::new(TokenGenerator::new(
        config.external_url.clone(),
        config.jku.clone(),
        key_manager.current_key_handle(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // The signal handler starts listening immediately so that a lease
    // acquisition blocked on a contended lock can still be cancelled by
    // `SIGINT`/`SIGTERM` — it must be running before T2 calls `acquire()`.
    let signal_handle = tokio::spawn(shutdown_signal(shutdown_tx));

    let mut handles = Vec::new();

    // T1: signing key management.
    handles.push(tokio::spawn({
        let key_manager = Arc::clone(&key_manager);
        let rx = shutdown_rx.clone();
        async move { key_manager.run(rx).await }
    }));

    // T2: leader lease, if enabled. Acquiring blocks startup until held, or
    // until shutdown is requested while still waiting.
    if config.leader_election.enabled {
        let lease = Lease::new(
            Arc::clone(&storage),
            config.leader_election.name.clone(),
            config.leader_election.ttl,
        );
        let mut acquire_rx = shutdown_rx.clone();
        if !lease.acquire(&mut acquire_rx).await {
            info!("shutdown requested before leader lease was acquired, exiting");
            let _ = tokio::time::timeout(Duration::from_secs(10), signal_handle).await;
            return Ok(());
        }
        handles.push(tokio::spawn({
            let rx = shutdown_rx.clone();
            async move { lease.run(rx).await }
        }));
    }

    // T3: per-pipeline issuance controller.
    handles.push(tokio::spawn({
        let mut controller = Controller::new(config.tokens.clone(), Arc::clone(&generator), Arc::clone(&storage));
        let rx = shutdown_rx.clone();
        async move { controller.run(rx).await }
    }));

    // T4: JWKS HTTP server.
    let state = Arc::new(AppState {
        key_manager: Arc::clone(&key_manager),
        external_url: config.external_url.clone(),
    });
    let app = build_router(state);

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.listen_addr))?;

    info!(addr = %config.listen_addr, "pipeline-idp listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown(shutdown_rx))
        .await
        .context("server error")?;

    info!("waiting for background workers to stop");
    for handle in handles {
        let _ = tokio::time::timeout(Duration::from_secs(10), handle).await;
    }
    let _ = tokio::time::timeout(Duration::from_secs(10), signal_handle).await;

    info!("pipeline-idp stopped");
    Ok(())
}

async fn build_storage(config: &Config) -> anyhow::Result<Arc<dyn StorageBackend>> {
    match config.backend {
        StorageBackendKind::Dev => {
            info!("using in-memory storage (data will not persist)");
            Ok(Arc::new(MemoryBackend::new()))
        }
        #[cfg(feature = "vault-backend")]
        StorageBackendKind::Vault => {
            info!(url = %config.vault.url, "using HashiCorp Vault storage");
            Ok(Arc::new(build_vault_backend(config).await?))
        }
        #[cfg(not(feature = "vault-backend"))]
        StorageBackendKind::Vault => {
            anyhow::bail!("vault backend requested but feature 'vault-backend' is not enabled");
        }
    }
}

#[cfg(feature = "vault-backend")]
async fn build_vault_backend(config: &Config) -> anyhow::Result<pipeline_idp_storage::VaultBackend> {
    use vaultrs::client::{VaultClient, VaultClientSettingsBuilder};

    let mut client = VaultClient::new(
        VaultClientSettingsBuilder::default()
            .address(&config.vault.url)
            .token(&config.vault.token)
            .build()
            .context("failed to build Vault client settings")?,
    )
    .context("failed to build Vault client")?;

    if config.vault.token.is_empty() {
        let login = vaultrs::auth::approle::login(
            &client,
            "approle",
            &config.vault.approle_id,
            &config.vault.approle_secret,
        )
        .await
        .context("vault approle login failed")?;

        client = VaultClient::new(
            VaultClientSettingsBuilder::default()
                .address(&config.vault.url)
                .token(&login.client_token)
                .build()
                .context("failed to build Vault client settings")?,
        )
        .context("failed to build Vault client")?;
    }

    Ok(pipeline_idp_storage::VaultBackend::new(
        client,
        config.vault.concourse_path.clone(),
        config.vault.config_path.clone(),
    ))
}

fn build_router(state: Arc<AppState>) -> Router {
    routes::router()
        .layer(TraceLayer::new_for_http())
        .layer(SetResponseHeaderLayer::overriding(
            axum::http::header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            axum::http::header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .with_state(state)
}

/// Wait for `shutdown_tx` to report `true`, for `axum`'s graceful shutdown
/// hook. Separate from [`shutdown_signal`] because a `watch::Sender` can only
/// be handed to one task, and that task must already be running by the time
/// the leader lease is acquired.
async fn wait_for_shutdown(mut shutdown_rx: watch::Receiver<bool>) {
    let _ = shutdown_rx.wait_for(|v| *v).await;
}

/// Wait for `SIGINT` or `SIGTERM`, then broadcast shutdown.
async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut sig) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            sig.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("shutdown signal received, stopping server");
    let _ = shutdown_tx.send(true);
}
