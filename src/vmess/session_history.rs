//! Replay cache: a short-lived map from session fingerprint to expiry,
//! with a self-terminating background sweeper.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::vmess::protocol::SessionFingerprint;

const SESSION_TTL: Duration = Duration::from_secs(3 * 60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Shared, per-process replay cache. Cheap to clone (an `Arc` internally is
/// not required of callers — share one instance behind your own `Arc`).
pub struct SessionHistory {
    cache: RwLock<HashMap<SessionFingerprint, Instant>>,
    /// One-slot permit gating sweeper existence: acquiring it spawns the
    /// sweeper, failing to acquire means one is already running.
    sweeper_permit: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl SessionHistory {
    pub fn new(cancel: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            cache: RwLock::new(HashMap::with_capacity(128)),
            sweeper_permit: Arc::new(Semaphore::new(1)),
            cancel,
        })
    }

    /// `true` if `fingerprint` is present and its 3-minute window has not
    /// yet elapsed. Expired-but-not-yet-swept entries read as absent.
    pub async fn has(&self, fingerprint: &SessionFingerprint) -> bool {
        let cache = self.cache.read().await;
        match cache.get(fingerprint) {
            Some(expiry) => *expiry > Instant::now(),
            None => false,
        }
    }

    /// Records `fingerprint` with a fresh 3-minute expiry and ensures a
    /// sweeper is running. Does not itself check for a prior, unexpired
    /// entry — callers that care about replay rejection must `has` first.
    pub async fn add(self: &Arc<Self>, fingerprint: SessionFingerprint) {
        {
            let mut cache = self.cache.write().await;
            cache.insert(fingerprint, Instant::now() + SESSION_TTL);
        }

        if let Ok(permit) = Arc::clone(&self.sweeper_permit).try_acquire_owned() {
            let history = Arc::clone(self);
            tokio::spawn(async move {
                history.run_sweeper(permit).await;
            });
        }
    }

    async fn run_sweeper(self: Arc<Self>, permit: tokio::sync::OwnedSemaphorePermit) {
        debug!("vmess session history sweeper started");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("vmess session history sweeper cancelled");
                    break;
                }
                _ = tokio::time::sleep(SWEEP_INTERVAL) => {}
            }

            let mut cache = self.cache.write().await;
            if cache.is_empty() {
                debug!("vmess session history empty, sweeper exiting");
                break;
            }
            let now = Instant::now();
            let before = cache.len();
            cache.retain(|_, expiry| *expiry >= now);
            trace!(removed = before - cache.len(), "vmess session history swept");
        }
        drop(permit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(b: u8) -> SessionFingerprint {
        SessionFingerprint {
            user: [b; 16],
            key: [b; 16],
            nonce: [b; 16],
        }
    }

    #[tokio::test]
    async fn has_is_false_before_add() {
        let history = SessionHistory::new(CancellationToken::new());
        assert!(!history.has(&fp(1)).await);
    }

    #[tokio::test]
    async fn add_then_has_is_true() {
        let history = SessionHistory::new(CancellationToken::new());
        history.add(fp(2)).await;
        assert!(history.has(&fp(2)).await);
    }

    #[tokio::test]
    async fn distinct_fingerprints_independent() {
        let history = SessionHistory::new(CancellationToken::new());
        history.add(fp(3)).await;
        assert!(!history.has(&fp(4)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_removes_expired_entries() {
        let history = SessionHistory::new(CancellationToken::new());
        history.add(fp(5)).await;
        assert!(history.has(&fp(5)).await);

        tokio::time::advance(SESSION_TTL + Duration::from_secs(1)).await;
        // has() already reports false purely from the expiry check.
        assert!(!history.has(&fp(5)).await);

        // Let the sweeper observe the empty-after-expiry map and exit.
        tokio::time::advance(SWEEP_INTERVAL + Duration::from_secs(1)).await;
        tokio::task::yield_now().await;

        assert_eq!(history.sweeper_permit.available_permits(), 1);
    }

    #[tokio::test]
    async fn cancellation_stops_sweeper() {
        let cancel = CancellationToken::new();
        let history = SessionHistory::new(cancel.clone());
        history.add(fp(6)).await;
        cancel.cancel();
        tokio::task::yield_now().await;
        // has/add still function after cancellation.
        assert!(history.has(&fp(6)).await);
        history.add(fp(7)).await;
        assert!(history.has(&fp(7)).await);
    }
}
