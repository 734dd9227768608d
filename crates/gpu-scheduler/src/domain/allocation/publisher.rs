use std::time::Duration;

use api_types::AllocationUpdate;
use api_types::NodeInventory;
use async_trait::async_trait;
use error_stack::Report;
use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::warn;

use crate::config::PUSH_MAX_ATTEMPTS;

#[derive(Debug, derive_more::Display)]
pub enum PushError {
    #[display("failed to reach central service: {message}")]
    Transport { message: String },
    #[display("central service rejected the request with status {status}")]
    Rejected { status: u16 },
    #[display("push abandoned on shutdown")]
    Cancelled,
}

impl core::error::Error for PushError {}

impl PushError {
    /// Client errors are not retried, the same body would be rejected again.
    pub fn is_retryable(&self) -> bool {
        match self {
            PushError::Transport { .. } => true,
            PushError::Rejected { status } => *status >= 500,
            PushError::Cancelled => false,
        }
    }
}

/// Delivery of agent state to the central service.
#[async_trait]
pub trait AllocationPublisher: Send + Sync {
    async fn publish_inventory(&self, inventory: &NodeInventory) -> Result<(), Report<PushError>>;

    async fn publish_allocations(&self, update: &AllocationUpdate)
        -> Result<(), Report<PushError>>;
}

/// Bounded exponential backoff with full jitter.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: PUSH_MAX_ATTEMPTS,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Upper bound of the wait after the `retry`-th failure (0 based).
    pub fn backoff_cap(&self, retry: u32) -> Duration {
        self.initial_backoff
            .saturating_mul(1u32 << retry.min(16))
            .min(self.max_backoff)
    }

    fn jittered(&self, retry: u32) -> Duration {
        let cap = self.backoff_cap(retry).as_millis() as u64;
        Duration::from_millis(rand::rng().random_range(0..=cap))
    }
}

/// Pushes `update`, retrying transient failures.
///
/// Waiting between attempts is abandoned as soon as `cancellation_token`
/// fires.
pub async fn push_with_retry(
    publisher: &dyn AllocationPublisher,
    update: &AllocationUpdate,
    policy: RetryPolicy,
    cancellation_token: &CancellationToken,
) -> Result<(), Report<PushError>> {
    let mut retry = 0;
    loop {
        let error = match publisher.publish_allocations(update).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        if !error.current_context().is_retryable() || retry + 1 >= policy.max_attempts {
            return Err(error.attach_printable(format!("gave up after {} attempts", retry + 1)));
        }

        let delay = policy.jittered(retry);
        warn!(
            attempt = retry + 1,
            delay_ms = delay.as_millis() as u64,
            "allocation push failed, retrying: {error:?}"
        );
        retry += 1;

        tokio::select! {
            biased;
            _ = cancellation_token.cancelled() => {
                debug!("allocation push abandoned on shutdown");
                return Err(error.change_context(PushError::Cancelled));
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
