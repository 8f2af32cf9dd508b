//! Join barrier counting outstanding roles.

use std::sync::Arc;
use tokio::sync::watch;

/// Counts roles that have started but not yet exited.
///
/// Each role holds a [`BarrierGuard`]; dropping the guard is the single
/// point where the count is decremented, so a role that returns, fails or
/// panics is released exactly once.
#[derive(Clone, Debug)]
pub struct JoinBarrier {
    tx: Arc<watch::Sender<usize>>,
}

/// Registration of one role in a [`JoinBarrier`]
#[derive(Debug)]
pub struct BarrierGuard {
    tx: Arc<watch::Sender<usize>>,
}

impl JoinBarrier {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0usize);
        Self { tx: Arc::new(tx) }
    }

    /// Register one more outstanding role
    pub fn enter(&self) -> BarrierGuard {
        self.tx.send_modify(|outstanding| *outstanding += 1);
        BarrierGuard {
            tx: self.tx.clone(),
        }
    }

    /// Number of roles that have not exited yet
    pub fn outstanding(&self) -> usize {
        *self.tx.borrow()
    }

    /// Wait until every registered role has exited
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|outstanding| *outstanding == 0).await;
    }
}

impl Default for JoinBarrier {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for BarrierGuard {
    fn drop(&mut self) {
        self.tx
            .send_modify(|outstanding| *outstanding = outstanding.saturating_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_returns_once_all_guards_dropped() {
        let barrier = JoinBarrier::new();
        let guards: Vec<_> = (0..3).map(|_| barrier.enter()).collect();
        assert_eq!(barrier.outstanding(), 3);

        let waiter = {
            let barrier = barrier.clone();
            tokio::spawn(async move { barrier.wait().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guards);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("barrier should open")
            .unwrap();
        assert_eq!(barrier.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_empty_barrier_is_open() {
        let barrier = JoinBarrier::new();
        tokio::time::timeout(Duration::from_millis(10), barrier.wait())
            .await
            .expect("empty barrier should not block");
    }

    #[tokio::test]
    async fn test_guard_released_when_task_panics() {
        let barrier = JoinBarrier::new();
        let guard = barrier.enter();

        let handle = tokio::spawn(async move {
            let _guard = guard;
            panic!("role blew up");
        });
        assert!(handle.await.is_err());

        assert_eq!(barrier.outstanding(), 0);
    }
}
