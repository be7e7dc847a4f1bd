//! One run of the primary listener

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

/// Handle to a listener generation
///
/// The interrupt token is the generation's only cancellation primitive.
/// Cancelling it asks the serve loop to unwind with
/// [`ServerError::RestartRequested`](crate::error::ServerError::RestartRequested).
#[derive(Debug)]
pub struct ListenerGeneration {
    id: u64,
    started_at: DateTime<Utc>,
    interrupt: CancellationToken,
}

impl ListenerGeneration {
    pub(crate) fn new(id: u64) -> Self {
        Self {
            id,
            started_at: Utc::now(),
            interrupt: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Request that this generation stop; idempotent
    pub fn interrupt(&self) {
        self.interrupt.cancel();
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupt.is_cancelled()
    }

    /// Resolves once the generation has been interrupted
    pub async fn interrupted(&self) {
        self.interrupt.cancelled().await
    }
}
