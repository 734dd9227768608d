use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use error_stack::Report;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

/// Errors returned by a single health probe.
#[derive(Debug, derive_more::Display)]
pub enum ProbeError {
    #[display("health probe timed out after {timeout:?}")]
    Timeout { timeout: Duration },
    #[display("health endpoint unreachable: {message}")]
    Unreachable { message: String },
    #[display("health endpoint answered with status {status}")]
    BadStatus { status: u16 },
}

impl core::error::Error for ProbeError {}

/// One liveness probe against the central service.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self) -> Result<(), Report<ProbeError>>;
}

/// Agent-side heartbeat against the central service.
#[derive(Clone)]
pub struct HealthChecker {
    probe: Arc<dyn HealthProbe>,
    probe_timeout: Duration,
    block_workers: usize,
    retry_interval: Duration,
}

impl HealthChecker {
    pub fn new(
        probe: Arc<dyn HealthProbe>,
        probe_timeout: Duration,
        block_workers: usize,
        retry_interval: Duration,
    ) -> Self {
        Self {
            probe,
            probe_timeout,
            block_workers: block_workers.max(1),
            retry_interval,
        }
    }

    /// Races `workers` parallel probes, each bounded by the probe timeout.
    /// Succeeds as soon as one of them does.
    async fn race(&self, workers: usize) -> Result<(), Report<ProbeError>> {
        let mut probes: FuturesUnordered<_> = (0..workers.max(1))
            .map(|_| {
                let probe = self.probe.clone();
                let timeout = self.probe_timeout;
                async move {
                    match tokio::time::timeout(timeout, probe.probe()).await {
                        Ok(result) => result,
                        Err(_) => Err(Report::new(ProbeError::Timeout { timeout })),
                    }
                }
            })
            .collect();

        let mut last_error = None;
        while let Some(result) = probes.next().await {
            match result {
                Ok(()) => return Ok(()),
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error.unwrap_or_else(|| {
            Report::new(ProbeError::Unreachable {
                message: "no probe was started".to_string(),
            })
        }))
    }

    /// Blocks until the central service answers a probe.
    ///
    /// Returns `false` when shutdown was requested before that happened.
    pub async fn check_health_block(&self, cancellation_token: &CancellationToken) -> bool {
        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => return false,
                result = self.race(self.block_workers) => {
                    match result {
                        Ok(()) => {
                            info!("central service is healthy");
                            return true;
                        }
                        Err(e) => warn!("central service not reachable yet: {e:?}"),
                    }
                }
            }

            tokio::select! {
                _ = cancellation_token.cancelled() => return false,
                _ = tokio::time::sleep(self.retry_interval) => {}
            }
        }
    }

    /// Probes in the background every `interval`.
    ///
    /// The returned receiver resolves once, on the first failed probe, and
    /// the background loop stops. It is dropped without a value on shutdown.
    pub fn check_health(
        &self,
        interval: Duration,
        cancellation_token: CancellationToken,
    ) -> oneshot::Receiver<()> {
        let (unhealthy_tx, unhealthy_rx) = oneshot::channel();
        let checker = self.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => break,
                    _ = ticker.tick() => {
                        match checker.race(1).await {
                            Ok(()) => debug!("health probe succeeded"),
                            Err(e) => {
                                warn!("health probe failed: {e:?}");
                                let _ = unhealthy_tx.send(());
                                break;
                            }
                        }
                    }
                }
            }
        });

        unhealthy_rx
    }
}
