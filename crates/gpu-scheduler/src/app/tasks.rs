use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Task manager, responsible for starting and supervising all background tasks
pub struct Tasks {
    pub tasks: Vec<JoinHandle<()>>,
    cancellation_token: CancellationToken,
}

impl Default for Tasks {
    fn default() -> Self {
        Self::new()
    }
}

impl Tasks {
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            cancellation_token: CancellationToken::new(),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Spawns `task` with a clone of the shared shutdown token.
    pub fn spawn<F, Fut>(&mut self, name: &'static str, task: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let future = task(self.cancellation_token.clone());
        self.tasks.push(tokio::spawn(async move {
            tracing::info!("Starting {name} task");
            future.await;
            tracing::info!("{name} task completed");
        }));
    }

    /// wait for tasks to complete or receive shutdown signal
    pub async fn wait_for_completion(&mut self) -> Result<()> {
        let signal_handler = {
            use tokio::signal::unix::signal;
            use tokio::signal::unix::SignalKind;
            let mut sigterm = signal(SignalKind::terminate())?;
            let mut sigint = signal(SignalKind::interrupt())?;

            tokio::spawn(async move {
                tokio::select! {
                    _ = sigterm.recv() => {
                        tracing::info!("Received SIGTERM, initiating graceful shutdown");
                    }
                    _ = sigint.recv() => {
                        tracing::info!("Received SIGINT, initiating graceful shutdown");
                    }
                }
            })
        };

        tokio::select! {
            _ = signal_handler => {
                tracing::info!("Shutdown signal received, cancelling all tasks");
                self.shutdown(Duration::from_secs(30)).await;
            }
            // a task finishing on its own is fatal
            result = futures::future::select_all(&mut self.tasks) => {
                let (result, index) = {
                    let (result, index, _remaining) = result;
                    (result, index)
                };
                self.tasks.swap_remove(index);
                if let Err(e) = result {
                    tracing::error!("Task completed with error: {e}");
                    self.shutdown(Duration::from_secs(30)).await;
                    return Err(e.into());
                }
                tracing::warn!("Task completed unexpectedly, shutting down");
                self.shutdown(Duration::from_secs(30)).await;
            }
        }

        Ok(())
    }

    /// Cancels every task and waits for them with a timeout.
    pub async fn shutdown(&mut self, timeout: Duration) {
        self.cancellation_token.cancel();
        tokio::time::timeout(timeout, async {
            for task in &mut self.tasks {
                if let Err(e) = task.await {
                    tracing::error!("Task failed during shutdown: {e}");
                }
            }
        })
        .await
        .unwrap_or_else(|_| {
            tracing::warn!("Task shutdown timed out after {:?}", timeout);
        });
    }
}
