//! Leader lease: ensures at most one running instance mints and persists
//! keys and tokens at a time.
//!
//! [`StorageBackend::acquire_lease`] already blocks until the lease is held,
//! so this module only has to call it once up front (racing a shutdown
//! signal, in case it never gets the chance) and then keep renewing on a
//! timer. There is no recovery path for a lost lease — a renewal failure
//! means another instance may already believe it holds the lease, so this
//! process exits rather than risk two writers.

use std::sync::Arc;
use std::time::Duration;

use pipeline_idp_storage::StorageBackend;
use tokio::sync::watch;
use tracing::{error, info};

/// Fraction of the lease TTL at which a renewal is attempted, matching
/// §4.E's default: renew at 90% of the TTL so a single missed tick still
/// leaves margin before the lease actually expires.
const DEFAULT_RENEW_FRACTION: f64 = 0.9;

/// Holds and renews the leader lease for this process.
pub struct Lease {
    storage: Arc<dyn StorageBackend>,
    holder: String,
    ttl: Duration,
}

impl Lease {
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>, holder: String, ttl: Duration) -> Self {
        Self { storage, holder, ttl }
    }

    /// Acquire the lease, blocking until it is held or `shutdown` reports
    /// `true`. Call this once before starting any work that requires
    /// leadership, with a `shutdown` receiver that is already being driven —
    /// a signal raised while still waiting out a contended lease must cut
    /// this short rather than block the process from exiting.
    ///
    /// Returns `true` once the lease is held, or `false` if shutdown was
    /// requested first.
    pub async fn acquire(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        info!(holder = %self.holder, "acquiring leader lease");
        tokio::select! {
            result = self.storage.acquire_lease(&self.holder, self.ttl) => {
                if let Err(e) = result {
                    error!(error = %e, "leader lease storage backend failed during acquisition");
                    std::process::exit(1);
                }
                info!(holder = %self.holder, "leader lease acquired");
                true
            }
            result = shutdown.changed() => {
                if result.is_err() || *shutdown.borrow() {
                    info!(holder = %self.holder, "shutdown requested while waiting for leader lease");
                    return false;
                }
                false
            }
        }
    }

    /// Renew the lease on a timer until `shutdown` reports `true`. Exits the
    /// process immediately if a renewal fails — per the `LeaseLost` policy,
    /// there is no safe way to keep running without the lease.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let renew_every = self.ttl.mul_f64(DEFAULT_RENEW_FRACTION);

        loop {
            tokio::select! {
                () = tokio::time::sleep(renew_every) => {
                    if let Err(e) = self.storage.acquire_lease(&self.holder, self.ttl).await {
                        error!(error = %e, "failed to renew leader lease, stopping");
                        std::process::exit(1);
                    }
                    info!(holder = %self.holder, "leader lease renewed");
                }
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        self.release().await;
                        return;
                    }
                }
            }
        }
    }

    /// Best-effort release on graceful shutdown, so the next instance up
    /// doesn't have to wait out the remaining TTL.
    async fn release(&self) {
        if let Err(e) = self.storage.release_lease().await {
            error!(error = %e, "failed to release leader lease on shutdown");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pipeline_idp_storage::MemoryBackend;

    #[tokio::test]
    async fn acquire_succeeds_when_lease_is_free() {
        let storage = Arc::new(MemoryBackend::new());
        let lease = Lease::new(storage, "instance-a".to_owned(), Duration::from_secs(30));
        let (_tx, mut rx) = watch::channel(false);
        assert!(lease.acquire(&mut rx).await);
    }

    #[tokio::test]
    async fn acquire_returns_promptly_on_shutdown_while_contended() {
        let storage = Arc::new(MemoryBackend::new());
        storage
            .acquire_lease("instance-a", Duration::from_secs(3600))
            .await
            .unwrap();

        let lease = Lease::new(Arc::clone(&storage), "instance-b".to_owned(), Duration::from_secs(3600));
        let (tx, mut rx) = watch::channel(false);

        let handle = tokio::spawn(async move { lease.acquire(&mut rx).await });
        tx.send(true).unwrap();

        let acquired = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(!acquired);
    }

    #[tokio::test]
    async fn run_exits_promptly_on_shutdown_signal() {
        let storage = Arc::new(MemoryBackend::new());
        let lease = Lease::new(storage, "instance-a".to_owned(), Duration::from_secs(3600));
        let (_acquire_tx, mut acquire_rx) = watch::channel(false);
        assert!(lease.acquire(&mut acquire_rx).await);

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            lease.run(rx).await;
        });

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
