//! End-to-end scenarios driven through the real `KeyManager`/`Controller`/
//! `Lease`/routes wiring against a `MemoryBackend`, the same wiring `main`
//! assembles at startup, exercised in-process with `tower::ServiceExt::oneshot`
//! rather than a bound socket.

#![allow(clippy::unwrap_used)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use pipeline_idp_core::config::TokenConfig;
use pipeline_idp_core::{Controller, KeyManager, Lease, TokenGenerator};
use pipeline_idp_storage::{MemoryBackend, StorageBackend, StorageError, StoredKey, TokenPath};
use serde_json::Value;
use tokio::sync::watch;
use tower::ServiceExt;

use pipeline_idp_server::routes;
use pipeline_idp_server::state::AppState;

const ISSUER: &str = "https://idp.example.com";

fn router(key_manager: Arc<KeyManager>) -> axum::Router {
    let state = Arc::new(AppState {
        key_manager,
        external_url: ISSUER.to_owned(),
    });
    routes::router().with_state(state)
}

async fn get(app: &axum::Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn cold_start_serves_discovery_and_jwks() {
    let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    let key_manager = Arc::new(KeyManager::new(
        Arc::clone(&storage),
        Duration::from_secs(3600),
        Duration::from_secs(7200),
    ));
    key_manager.tick().await.unwrap();

    let app = router(Arc::clone(&key_manager));

    let (status, config) = get(&app, "/.well-known/openid-configuration").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(config["issuer"], ISSUER);
    assert_eq!(config["jwks_uri"], format!("{ISSUER}/keys"));

    let (status, jwks) = get(&app, "/keys").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(jwks["keys"].as_array().unwrap().len(), 1);
    assert_eq!(jwks["keys"][0]["use"], "sign");
}

#[tokio::test]
async fn renewal_mints_a_fresh_token_once_the_renewal_window_opens() {
    let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    let key_manager = KeyManager::new(Arc::clone(&storage), Duration::from_secs(3600), Duration::from_secs(7200));
    key_manager.tick().await.unwrap();

    let generator = Arc::new(TokenGenerator::new(ISSUER.to_owned(), None, key_manager.current_key_handle()));
    let mut config = TokenConfig::new("myteam", "mypipeline");
    // The renewal deadline is computed as `exp - (renewBefore - 2s slack)`, so
    // `renewBefore` has to clear the 2s slack for the deadline to land before
    // expiry at all.
    config.ttl = Duration::from_millis(2500);
    config.renew_before = Duration::from_millis(2200);

    let mut controller = Controller::new(vec![config.clone()], generator, Arc::clone(&storage));
    controller.warm_cache().await;
    controller.tick().await;

    let path = TokenPath {
        team: config.team.clone(),
        pipeline: config.pipeline.clone(),
        path: config.path.clone(),
    };
    let first = storage.read_token(&path).await.unwrap().unwrap();

    tokio::time::sleep(Duration::from_millis(2400)).await;
    controller.tick().await;
    let second = storage.read_token(&path).await.unwrap().unwrap();

    assert_ne!(first, second, "token should have been renewed ahead of expiry");
}

#[tokio::test]
async fn key_rotation_adds_a_new_key_while_keeping_the_old_one_published() {
    let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    let key_manager = Arc::new(KeyManager::new(
        Arc::clone(&storage),
        Duration::from_millis(0),
        Duration::from_secs(3600),
    ));
    key_manager.tick().await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    key_manager.tick().await.unwrap();

    let app = router(Arc::clone(&key_manager));
    let (status, jwks) = get(&app, "/keys").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(jwks["keys"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn leader_handover_next_instance_acquires_promptly_after_release() {
    let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());

    let lease_a = Lease::new(Arc::clone(&storage), "instance-a".to_owned(), Duration::from_secs(3600));
    let (_tx_a, mut rx_a) = watch::channel(false);
    assert!(lease_a.acquire(&mut rx_a).await);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let run_handle = tokio::spawn(async move { lease_a.run(shutdown_rx).await });
    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(1), run_handle).await.unwrap().unwrap();

    let lease_b = Lease::new(Arc::clone(&storage), "instance-b".to_owned(), Duration::from_secs(3600));
    let (_tx_b, mut rx_b) = watch::channel(false);
    let start = tokio::time::Instant::now();
    assert!(lease_b.acquire(&mut rx_b).await);
    assert!(start.elapsed() < Duration::from_millis(50), "handover must not wait out the old TTL");
}

struct FlakyBackend {
    inner: MemoryBackend,
    writes_to_fail: AtomicUsize,
}

#[async_trait::async_trait]
impl StorageBackend for FlakyBackend {
    async fn read_token(&self, path: &TokenPath) -> Result<Option<String>, StorageError> {
        self.inner.read_token(path).await
    }

    async fn write_token(&self, path: &TokenPath, token: &str) -> Result<(), StorageError> {
        if self.writes_to_fail.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok() {
            return Err(StorageError::Backend {
                reason: "simulated transient backend failure".to_owned(),
            });
        }
        self.inner.write_token(path, token).await
    }

    async fn get_keyset(&self) -> Result<Vec<StoredKey>, StorageError> {
        self.inner.get_keyset().await
    }

    async fn put_keyset(&self, keys: &[StoredKey]) -> Result<(), StorageError> {
        self.inner.put_keyset(keys).await
    }

    async fn acquire_lease(&self, holder: &str, ttl: Duration) -> Result<(), StorageError> {
        self.inner.acquire_lease(holder, ttl).await
    }

    async fn release_lease(&self) -> Result<(), StorageError> {
        self.inner.release_lease().await
    }
}

#[tokio::test]
async fn backend_transient_error_is_retried_on_the_next_tick_not_fatal() {
    let storage: Arc<dyn StorageBackend> = Arc::new(FlakyBackend {
        inner: MemoryBackend::new(),
        writes_to_fail: AtomicUsize::new(1),
    });

    let key_manager = KeyManager::new(Arc::clone(&storage), Duration::from_secs(3600), Duration::from_secs(7200));
    key_manager.tick().await.unwrap();

    let generator = Arc::new(TokenGenerator::new(ISSUER.to_owned(), None, key_manager.current_key_handle()));
    let config = TokenConfig::new("myteam", "mypipeline");
    let path = TokenPath {
        team: config.team.clone(),
        pipeline: config.pipeline.clone(),
        path: config.path.clone(),
    };

    let mut controller = Controller::new(vec![config.clone()], generator, Arc::clone(&storage));
    controller.warm_cache().await;

    controller.tick().await;
    assert!(
        storage.read_token(&path).await.unwrap().is_none(),
        "first tick's write should have failed and left nothing stored"
    );

    controller.tick().await;
    assert!(
        storage.read_token(&path).await.unwrap().is_some(),
        "second tick should succeed once the backend recovers"
    );
}

#[tokio::test]
async fn corrupted_token_on_disk_is_reminted_rather_than_fatal() {
    let storage: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    let key_manager = KeyManager::new(Arc::clone(&storage), Duration::from_secs(3600), Duration::from_secs(7200));
    key_manager.tick().await.unwrap();

    let generator = Arc::new(TokenGenerator::new(ISSUER.to_owned(), None, key_manager.current_key_handle()));
    let config = TokenConfig::new("myteam", "mypipeline");
    let path = TokenPath {
        team: config.team.clone(),
        pipeline: config.pipeline.clone(),
        path: config.path.clone(),
    };

    storage.write_token(&path, "not-a-jwt").await.unwrap();

    let mut controller = Controller::new(vec![config.clone()], generator, Arc::clone(&storage));
    controller.warm_cache().await;
    controller.tick().await;

    let stored = storage.read_token(&path).await.unwrap().unwrap();
    assert_ne!(stored, "not-a-jwt");
    assert_eq!(stored.split('.').count(), 3, "a fresh token should have replaced the corrupt one");
}
