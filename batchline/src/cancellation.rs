//! Cancellation of polling loops.
//!
//! Each [`JobHandle`](crate::handle::JobHandle) owns a [`CancellationToken`]
//! shared with its polling task. A [`CancellationGroup`] ties together the
//! tokens of one chunked operation so a timeout or a failed chunk stops every
//! loop at once.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::watch;
use tracing::debug;

/// The token was cancelled before the future finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Cloneable one-shot cancellation signal.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    tx: Arc<watch::Sender<bool>>,
}

impl CancellationToken {
    /// Create an uncancelled token.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_if_modified(|cancelled| {
            let changed = !*cancelled;
            *cancelled = true;
            changed
        });
    }

    /// Resolve once cancellation is requested.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives as long as `self`, so `wait_for` only errors on a
        // dropped sender, which cannot happen here.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    /// Drive `future` unless the token is cancelled first.
    ///
    /// # Errors
    ///
    /// Returns [`Cancelled`] if cancellation wins the race.
    pub async fn run_until_cancelled<F, T>(&self, future: F) -> Result<T, Cancelled>
    where
        F: Future<Output = T>,
    {
        tokio::select! {
            biased;
            () = self.cancelled() => Err(Cancelled),
            result = future => Ok(result),
        }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Tokens of one chunked operation, keyed by chunk index.
#[derive(Debug, Clone, Default)]
pub struct CancellationGroup {
    tokens: Arc<RwLock<BTreeMap<usize, CancellationToken>>>,
}

impl CancellationGroup {
    /// Create an empty group.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track the token of chunk `chunk_index`.
    pub fn register(&self, chunk_index: usize, token: CancellationToken) {
        self.tokens.write().insert(chunk_index, token);
    }

    /// Stop tracking chunk `chunk_index`.
    pub fn unregister(&self, chunk_index: usize) {
        self.tokens.write().remove(&chunk_index);
    }

    /// Cancel the loop of one chunk. Returns whether it was tracked.
    pub fn cancel(&self, chunk_index: usize) -> bool {
        self.tokens.read().get(&chunk_index).is_some_and(|token| {
            token.cancel();
            true
        })
    }

    /// Cancel every tracked loop.
    pub fn cancel_all(&self) {
        let tokens = self.tokens.read();
        for token in tokens.values() {
            token.cancel();
        }
        debug!(count = tokens.len(), "Cancelled polling loops");
    }

    /// Number of tracked tokens.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.read().len()
    }

    /// Whether no token is tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_token_cancel_is_seen_by_clones() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());

        token.cancel();
        token.cancel();
        assert!(clone.is_cancelled());
        clone.cancelled().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_until_cancelled() {
        let token = CancellationToken::new();
        assert_eq!(token.run_until_cancelled(async { 7 }).await, Ok(7));

        let waiter = token.clone();
        let task = tokio::spawn(async move {
            waiter
                .run_until_cancelled(tokio::time::sleep(Duration::from_secs(3600)))
                .await
        });
        tokio::task::yield_now().await;
        token.cancel();
        assert_eq!(task.await.unwrap(), Err(Cancelled));
    }

    #[test]
    fn test_group_cancels_members() {
        let group = CancellationGroup::new();
        let first = CancellationToken::new();
        let second = CancellationToken::new();
        group.register(0, first.clone());
        group.register(1, second.clone());

        assert!(group.cancel(0));
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert!(!group.cancel(9));

        group.unregister(0);
        assert_eq!(group.len(), 1);
        group.cancel_all();
        assert!(second.is_cancelled());
    }
}
