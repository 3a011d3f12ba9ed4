//! Service lifecycle: readiness, request tracking, graceful drain.
//!
//! ```text
//! Starting → Ready → ShuttingDown → Stopped
//! ```
//!
//! Requests are tracked with RAII guards so the drain phase can wait for
//! in-flight work; the drain budget comes from `DELAY_SHUTDOWN_SECONDS`.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

/// Outcome of the drain phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainResult {
    /// All in-flight requests completed.
    Complete,
    /// The budget elapsed with requests still in flight.
    Timeout { remaining: usize },
}

/// Shared lifecycle state.
#[derive(Debug, Default)]
pub struct LifecycleManager {
    ready: AtomicBool,
    shutting_down: AtomicBool,
    active_requests: Arc<AtomicUsize>,
}

impl LifecycleManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Flip the readiness probe to 200. Called once startup completed.
    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst) && !self.is_shutting_down()
    }

    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub fn active_request_count(&self) -> usize {
        self.active_requests.load(Ordering::SeqCst)
    }

    /// Track one request. Returns `None` during shutdown so the caller can
    /// reject new work.
    pub fn track_request(&self) -> Option<RequestGuard> {
        if self.is_shutting_down() {
            return None;
        }
        self.active_requests.fetch_add(1, Ordering::SeqCst);
        Some(RequestGuard {
            active_requests: self.active_requests.clone(),
        })
    }

    /// Wait for in-flight requests to finish, bounded by `budget`.
    pub async fn drain_requests(&self, budget: Duration) -> DrainResult {
        let deadline = Instant::now() + budget;
        loop {
            let remaining = self.active_request_count();
            if remaining == 0 {
                info!("All in-flight requests drained");
                return DrainResult::Complete;
            }
            if Instant::now() >= deadline {
                warn!(remaining, "Drain budget elapsed with requests in flight");
                return DrainResult::Timeout { remaining };
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

/// RAII guard decrementing the in-flight counter, panic-safe.
#[derive(Debug)]
pub struct RequestGuard {
    active_requests: Arc<AtomicUsize>,
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.active_requests.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_states() {
        let lifecycle = LifecycleManager::new();
        assert!(!lifecycle.is_ready());

        lifecycle.mark_ready();
        assert!(lifecycle.is_ready());

        lifecycle.begin_shutdown();
        assert!(!lifecycle.is_ready());
        assert!(lifecycle.is_shutting_down());
    }

    #[test]
    fn test_request_tracking() {
        let lifecycle = LifecycleManager::new();
        lifecycle.mark_ready();

        let guard = lifecycle.track_request();
        assert!(guard.is_some());
        assert_eq!(lifecycle.active_request_count(), 1);
        drop(guard);
        assert_eq!(lifecycle.active_request_count(), 0);

        lifecycle.begin_shutdown();
        assert!(lifecycle.track_request().is_none());
    }

    #[test]
    fn test_guard_is_panic_safe() {
        let lifecycle = Arc::new(LifecycleManager::new());
        lifecycle.mark_ready();

        let inner = lifecycle.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _guard = inner.track_request();
            panic!("simulated handler panic");
        }));
        assert!(result.is_err());
        assert_eq!(lifecycle.active_request_count(), 0);
    }

    #[tokio::test]
    async fn test_drain_completes_when_idle() {
        let lifecycle = LifecycleManager::new();
        lifecycle.mark_ready();
        lifecycle.begin_shutdown();
        assert_eq!(
            lifecycle.drain_requests(Duration::from_secs(1)).await,
            DrainResult::Complete
        );
    }

    #[tokio::test]
    async fn test_drain_times_out_with_inflight_requests() {
        let lifecycle = LifecycleManager::new();
        lifecycle.mark_ready();
        let _guard = lifecycle.track_request();
        lifecycle.begin_shutdown();

        let result = lifecycle.drain_requests(Duration::from_millis(120)).await;
        assert_eq!(result, DrainResult::Timeout { remaining: 1 });
    }
}
