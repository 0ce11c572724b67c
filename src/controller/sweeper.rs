use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::stream::StreamExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, IntervalStream};

use super::Controller;

/// A background task which polls every active operation on an interval.
///
/// Polling is what commits a succeeded operation's change and times out operations which
/// nobody polls through the API.
pub struct OperationSweeper {
    controller: Arc<Controller>,
    interval: Duration,
    /// A channel used for triggering graceful shutdown.
    shutdown: BroadcastStream<()>,
}

impl OperationSweeper {
    /// Create a new instance.
    pub fn new(controller: Arc<Controller>, interval: Duration, shutdown: broadcast::Receiver<()>) -> Self {
        Self { controller, interval, shutdown: BroadcastStream::new(shutdown) }
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut ticks = IntervalStream::new(tokio::time::interval(self.interval));

        tracing::info!(interval = ?self.interval, "operation sweeper initialized");
        loop {
            tokio::select! {
                Some(_) = ticks.next() => self.sweep().await,
                _ = self.shutdown.next() => break,
            }
        }

        tracing::debug!("operation sweeper shutdown");
        Ok(())
    }

    #[tracing::instrument(level = "trace", skip(self))]
    async fn sweep(&self) {
        for id in self.controller.orchestrator().active_operations().await {
            match self.controller.poll_operation(id).await {
                Ok(report) if report.error.is_some() => {
                    tracing::warn!(operation = %id, error = ?report.error, "operation succeeded but its change was not committed");
                }
                Ok(_) => (),
                Err(err) => tracing::warn!(error = ?err, operation = %id, "error polling operation"),
            }
        }
    }
}
