//! One-shot readiness latch.
//!
//! The coordinator role signals the gate once its listener is bound; worker
//! and client roles wait on it before touching the engine.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

/// Errors returned while waiting on a [`ReadinessGate`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GateError {
    /// The gate was not signaled within the allowed time
    #[error("prerequisite not ready after {0:?}")]
    NotReady(Duration),
}

/// Single-shot latch that releases every waiter once signaled.
///
/// The latch only ever moves from "not ready" to "ready". Waiters that arrive
/// after the transition return immediately.
#[derive(Clone, Debug)]
pub struct ReadinessGate {
    tx: Arc<watch::Sender<bool>>,
}

impl ReadinessGate {
    /// Create a new gate in the "not ready" state
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Mark the gate as ready and wake every waiter.
    ///
    /// Returns `true` for the call that performed the transition and `false`
    /// for every later call, which leave the gate untouched.
    pub fn signal(&self) -> bool {
        self.tx.send_if_modified(|ready| {
            if *ready {
                false
            } else {
                *ready = true;
                true
            }
        })
    }

    /// Whether the gate has been signaled
    pub fn is_signaled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the gate is signaled
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender is owned by `self`, so the channel cannot close under us.
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Wait until the gate is signaled or `limit` elapses
    pub async fn wait_timeout(&self, limit: Duration) -> Result<(), GateError> {
        tokio::time::timeout(limit, self.wait())
            .await
            .map_err(|_| GateError::NotReady(limit))
    }
}

impl Default for ReadinessGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_waiters_before_signal_are_released() {
        let gate = ReadinessGate::new();
        let released = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let gate = gate.clone();
            let released = released.clone();
            handles.push(tokio::spawn(async move {
                gate.wait().await;
                released.fetch_add(1, Ordering::SeqCst);
            }));
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(released.load(Ordering::SeqCst), 0);

        assert!(gate.signal());
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .expect("waiter should be released")
                .unwrap();
        }
        assert_eq!(released.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn test_waiter_after_signal_returns_immediately() {
        let gate = ReadinessGate::new();
        gate.signal();

        tokio::time::timeout(Duration::from_millis(10), gate.wait())
            .await
            .expect("late waiter should not block");
        assert!(gate.wait_timeout(Duration::from_millis(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_signal_is_monotonic() {
        let gate = ReadinessGate::new();
        assert!(!gate.is_signaled());

        assert!(gate.signal());
        assert!(!gate.signal());
        assert!(gate.is_signaled());
        gate.wait().await;
    }

    #[tokio::test]
    async fn test_wait_timeout_reports_not_ready() {
        let gate = ReadinessGate::new();
        let err = gate
            .wait_timeout(Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err, GateError::NotReady(Duration::from_millis(20)));
        assert!(!gate.is_signaled());
    }
}
