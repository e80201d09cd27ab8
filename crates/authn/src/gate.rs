//! Per-key mutual exclusion.
//!
//! [`GatePool`] hands out one async mutex per cache key so that the miss path
//! (durable read, mint, write-back) runs at most once at a time per identity.
//! Gates are created on first use and kept for the life of the pool; the
//! pool grows with the number of distinct identities, not with traffic.

use std::{collections::HashMap, sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;

use crate::error::{AuthError, Result};

type Gate = Arc<tokio::sync::Mutex<()>>;

/// Lazily populated set of per-key gates.
#[derive(Debug, Default)]
pub struct GatePool {
    gates: Mutex<HashMap<String, Gate>>,
}

/// Exclusive hold on one key's gate. Released on drop.
#[derive(Debug)]
#[must_use = "the gate is released as soon as the guard is dropped"]
pub struct GateGuard {
    _guard: OwnedMutexGuard<()>,
}

impl GateGuard {
    /// Releases the gate explicitly.
    pub fn release(self) {}
}

impl GatePool {
    /// Creates an empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn gate(&self, key: &str) -> Gate {
        let mut gates = self.gates.lock();
        Arc::clone(gates.entry(key.to_owned()).or_default())
    }

    /// Waits for exclusive use of `key`'s gate.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Cancelled`] if `cancel` fires first.
    pub async fn enter(&self, key: &str, cancel: &CancellationToken) -> Result<GateGuard> {
        let gate = self.gate(key);
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(AuthError::Cancelled),
            guard = gate.lock_owned() => Ok(GateGuard { _guard: guard }),
        }
    }

    /// Like [`enter`](Self::enter), but also gives up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Cancelled`] on cancellation or timeout.
    pub async fn enter_with_timeout(
        &self,
        key: &str,
        cancel: &CancellationToken,
        timeout: Duration,
    ) -> Result<GateGuard> {
        tokio::time::timeout(timeout, self.enter(key, cancel))
            .await
            .unwrap_or(Err(AuthError::Cancelled))
    }

    /// Takes the gate only if it is free right now.
    pub fn try_enter(&self, key: &str) -> Option<GateGuard> {
        self.gate(key).try_lock_owned().ok().map(|guard| GateGuard { _guard: guard })
    }

    /// Number of gates created so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.gates.lock().len()
    }

    /// Whether no gate has been created yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.gates.lock().is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn test_same_key_is_exclusive() {
        let pool = GatePool::new();
        let cancel = CancellationToken::new();

        let held = pool.enter("k", &cancel).await.unwrap();
        assert!(pool.try_enter("k").is_none());
        assert!(pool.try_enter("other").is_some());

        held.release();
        assert!(pool.try_enter("k").is_some());
        assert_eq!(pool.len(), 2);
    }

    #[tokio::test]
    async fn test_cancellation_while_waiting() {
        let pool = GatePool::new();
        let _held = pool.enter("k", &CancellationToken::new()).await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        crate::assert_auth_error!(pool.enter("k", &cancel).await, Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_while_waiting() {
        let pool = GatePool::new();
        let _held = pool.enter("k", &CancellationToken::new()).await.unwrap();

        let result =
            pool.enter_with_timeout("k", &CancellationToken::new(), Duration::from_secs(1)).await;
        crate::assert_auth_error!(result, Cancelled);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_serializes_critical_sections() {
        let pool = Arc::new(GatePool::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let inside = Arc::clone(&inside);
                let max_inside = Arc::clone(&max_inside);
                tokio::spawn(async move {
                    let _guard = pool.enter("k", &CancellationToken::new()).await.unwrap();
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }
}
