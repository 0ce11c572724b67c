//! Database management.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use sled::{Config as SledConfig, Db, IVec};

use crate::config::Config;
use crate::error::{ShutdownError, ShutdownResult, ERR_DB_FLUSH};
use crate::models::ConfigDomain;

pub type Tree = sled::Tree;

/// The default path to use for data storage.
pub const DEFAULT_DATA_PATH: &str = "/usr/local/shardctl/data";
/// The DB tree used for the topology graph.
const TREE_TOPOLOGY: &str = "topology";
/// The DB tree used for operation records.
const TREE_OPERATIONS: &str = "operations";
/// The DB tree used for tickets.
const TREE_TICKETS: &str = "tickets";
/// The DB tree prefix used for per-domain config version logs.
const TREE_VERSIONS_PREFIX: &str = "versions";

/// The default path to use for data storage.
pub fn default_data_path() -> String {
    DEFAULT_DATA_PATH.to_string()
}

/// An abstraction over the controller database.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

struct DatabaseInner {
    /// The underlying DB handle.
    db: Db,
}

impl Database {
    /// Open the database for usage.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        // Determine the database path, and ensure it exists.
        let dbpath = PathBuf::from(&config.storage_data_path);
        tokio::fs::create_dir_all(&dbpath)
            .await
            .context("error creating dir for controller database")?;

        Self::spawn_blocking(move || -> Result<Self> {
            let db = SledConfig::new().path(dbpath).mode(sled::Mode::HighThroughput).open()?;
            let inner = Arc::new(DatabaseInner { db });
            Ok(Self { inner })
        })
        .await?
    }

    /// Spawn a blocking database-related function, returning a ShutdownError if anything goes
    /// wrong related to spawning & joining.
    #[tracing::instrument(level = "trace", skip(f), err)]
    pub async fn spawn_blocking<F, R>(f: F) -> ShutdownResult<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        tokio::task::spawn_blocking(f)
            .await
            .map_err(|err| ShutdownError::from(anyhow::Error::from(err)))
    }

    /// Get a handle to the DB tree holding the topology graph.
    pub async fn get_topology_tree(&self) -> ShutdownResult<Tree> {
        self.open_tree(TREE_TOPOLOGY.to_string()).await
    }

    /// Get a handle to the DB tree holding operation records.
    pub async fn get_operations_tree(&self) -> ShutdownResult<Tree> {
        self.open_tree(TREE_OPERATIONS.to_string()).await
    }

    /// Get a handle to the DB tree holding tickets.
    pub async fn get_tickets_tree(&self) -> ShutdownResult<Tree> {
        self.open_tree(TREE_TICKETS.to_string()).await
    }

    /// Get a handle to the DB tree holding the version log of the given config domain.
    pub async fn get_versions_tree(&self, domain: ConfigDomain) -> ShutdownResult<Tree> {
        self.open_tree(format!("{}/{}", TREE_VERSIONS_PREFIX, domain)).await
    }

    /// Flush all pending writes to disk.
    pub async fn flush(&self) -> ShutdownResult<()> {
        self.inner
            .db
            .flush_async()
            .await
            .map(|_| ())
            .map_err(|err| ShutdownError(anyhow!("{}: {}", ERR_DB_FLUSH, err)))
    }

    async fn open_tree(&self, name: String) -> ShutdownResult<Tree> {
        let (db, ivname) = (self.inner.db.clone(), IVec::from(name.as_str()));
        let tree = Self::spawn_blocking(move || -> Result<Tree> { Ok(db.open_tree(ivname)?) })
            .await
            .and_then(|res| res.map_err(|err| ShutdownError(anyhow!("could not open DB tree {} {}", &name, err))))?;
        Ok(tree)
    }
}
