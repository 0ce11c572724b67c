use std::sync::Arc;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{BroadcastStream, SignalStream};
use tokio_stream::StreamMap;

use crate::config::Config;
use crate::controller::{Controller, OperationSweeper};
use crate::database::Database;
use crate::models::ConfigDomain;
use crate::orchestrator::{AnsibleRunner, Orchestrator};
use crate::server::{spawn_server, ServerState};
use crate::tickets::TicketBook;
use crate::topology::TopologyStore;
use crate::versions::{ConsulStore, CoordinationStore, MemoryStore, VersionManager};

/// The application object for when the controller is running as a server.
pub struct App {
    /// The application's runtime config.
    _config: Arc<Config>,
    /// The application's database system.
    db: Database,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// A channel used for triggering graceful shutdown.
    shutdown_rx: BroadcastStream<()>,

    /// The join handle of the operation sweeper.
    sweeper_handle: JoinHandle<Result<()>>,
    /// The join handle of the HTTP server.
    server_handle: JoinHandle<Result<()>>,
}

impl App {
    /// Create a new instance.
    pub async fn new(config: Arc<Config>, metrics: PrometheusHandle) -> Result<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);

        // Initialize storage & recover all state.
        let db = Database::new(config.clone()).await.context("error opening database")?;
        let topology = TopologyStore::new(&db).await.context("error recovering topology")?;
        let runner = Arc::new(AnsibleRunner::new(&config));
        let orchestrator = Orchestrator::new(&db, runner, config.operation_deadline())
            .await
            .context("error recovering operations")?;
        let store: Arc<dyn CoordinationStore> = match config.consul_address.as_deref() {
            Some(address) => Arc::new(ConsulStore::new(address, &config).context("error building consul client")?),
            None => {
                tracing::warn!("no consul address configured, config is only published to an in-process store");
                Arc::new(MemoryStore::default())
            }
        };
        let versions = VersionManager::new(&db, store, &config).await.context("error recovering config versions")?;
        let tickets = TicketBook::new(&db).await.context("error recovering tickets")?;
        let controller = Arc::new(Controller::new(topology, orchestrator, versions, tickets));

        // Push anything left unsynced by a previous run.
        for domain in ConfigDomain::ALL {
            match controller.sync_pending(domain).await {
                Ok(pushed) if !pushed.is_empty() => tracing::info!(%domain, ?pushed, "pushed config versions left unsynced"),
                Ok(_) => (),
                Err(err) => tracing::warn!(error = ?err, %domain, "error pushing unsynced config versions"),
            }
        }

        // Spawn various core tasks.
        let sweeper_handle = OperationSweeper::new(controller.clone(), config.operation_sweep_interval(), shutdown_tx.subscribe()).spawn();
        let server_handle = spawn_server(&config, ServerState { controller, metrics }, shutdown_tx.clone());

        Ok(Self {
            _config: config,
            db,
            shutdown_rx: BroadcastStream::new(shutdown_tx.subscribe()),
            shutdown_tx,
            sweeper_handle,
            server_handle,
        })
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) -> Result<()> {
        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));

        loop {
            tokio::select! {
                Some((_, sig)) = signals.next() => {
                    tracing::debug!(signal = ?sig, "signal received, beginning graceful shutdown");
                    let _ = self.shutdown_tx.send(());
                    break;
                }
                _ = self.shutdown_rx.next() => break,
            }
        }

        // Begin shutdown routine.
        tracing::debug!("shardctl is shutting down");
        if let Err(err) = self.sweeper_handle.await.context("error joining operation sweeper handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down operation sweeper");
        }
        if let Err(err) = self.server_handle.await.context("error joining HTTP server handle").and_then(|res| res) {
            tracing::error!(error = ?err, "error shutting down HTTP server");
        }
        if let Err(err) = self.db.flush().await {
            tracing::error!(error = ?err, "error flushing database");
        }

        tracing::debug!("shardctl shutdown complete");
        Ok(())
    }
}
