//! Event-style boolean flag shared across tasks
//!
//! Used for the watch signal and for the one-shot ready/start barrier.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Thread-safe flag that can be set, cleared and awaited
///
/// Clones share state.
#[derive(Debug, Clone)]
pub struct Flag {
    tx: Arc<watch::Sender<bool>>,
}

impl Flag {
    /// Create a new flag (initially unset)
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn set(&self) {
        self.tx.send_replace(true);
    }

    pub fn clear(&self) {
        self.tx.send_replace(false);
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the flag is set; returns immediately if it already is
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so this cannot observe a closed channel
        let _ = rx.wait_for(|set| *set).await;
    }

    /// Wait up to `timeout` for the flag; returns whether it is set
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait()).await.is_ok()
    }
}

impl Default for Flag {
    fn default() -> Self {
        Self::new()
    }
}
