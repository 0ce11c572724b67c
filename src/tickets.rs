//! Change tickets.
//!
//! A ticket records a human-initiated change request along with the operations and config
//! versions carried out on its behalf.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::Mutex;

use crate::database::{Database, Tree};
use crate::error::{AppError, ShutdownError, ERR_DECODE_ROW, ERR_ITER_FAILURE};
use crate::models::{OperationId, Ticket, TicketId, TicketState, VersionRef};
use crate::utils;

/// The key prefix used for storing tickets.
const PREFIX_TICKET: &[u8; 1] = b"t";
/// The key used to store the last allocated ticket id.
const KEY_LAST_ID: &[u8; 1] = b"i";

/// The store of change tickets.
#[derive(Clone)]
pub struct TicketBook {
    inner: Arc<Mutex<TicketLog>>,
}

struct TicketLog {
    tree: Tree,
    last_id: TicketId,
    tickets: BTreeMap<TicketId, Ticket>,
}

impl TicketLog {
    fn persist(&self, ticket: &Ticket) -> Result<()> {
        let mut batch = sled::Batch::default();
        batch.insert(&utils::encode_byte_prefix(PREFIX_TICKET, ticket.id), utils::encode_model(ticket)?);
        batch.insert(KEY_LAST_ID, &utils::encode_u64(self.last_id));
        self.tree
            .apply_batch(batch)
            .context("error persisting ticket")
            .map_err(ShutdownError::from)?;
        Ok(())
    }

    fn get(&self, id: TicketId) -> Result<Ticket> {
        match self.tickets.get(&id) {
            Some(ticket) => Ok(ticket.clone()),
            None => bail!(AppError::ResourceNotFound(format!("ticket {}", id))),
        }
    }

    /// Apply a change to a ticket, persisting it.
    fn update<F>(&mut self, id: TicketId, f: F) -> Result<Ticket>
    where
        F: FnOnce(&mut Ticket) -> Result<()>,
    {
        let mut ticket = self.get(id)?;
        f(&mut ticket)?;
        ticket.updated_at = utils::now_millis();
        self.persist(&ticket)?;
        self.tickets.insert(id, ticket.clone());
        Ok(ticket)
    }
}

impl TicketBook {
    pub async fn new(db: &Database) -> Result<Self> {
        let tree = db.get_tickets_tree().await?;
        let (last_id, tickets) = Self::recover(tree.clone()).await?;
        Ok(Self { inner: Arc::new(Mutex::new(TicketLog { tree, last_id, tickets })) })
    }

    pub async fn create(&self, description: String) -> Result<Ticket> {
        if description.trim().is_empty() {
            bail!(AppError::InvalidInput("a ticket needs a description".into()));
        }
        let mut log = self.inner.lock().await;
        let now = utils::now_millis();
        log.last_id += 1;
        let ticket = Ticket {
            id: log.last_id,
            description,
            state: TicketState::Open,
            operations: vec![],
            versions: vec![],
            reason: None,
            created_at: now,
            updated_at: now,
        };
        log.persist(&ticket)?;
        log.tickets.insert(ticket.id, ticket.clone());
        Ok(ticket)
    }

    pub async fn get(&self, id: TicketId) -> Result<Ticket> {
        self.inner.lock().await.get(id)
    }

    /// All tickets, ascending by id.
    pub async fn list(&self) -> Vec<Ticket> {
        self.inner.lock().await.tickets.values().cloned().collect()
    }

    /// Move an open ticket to processing.
    pub async fn start(&self, id: TicketId) -> Result<Ticket> {
        self.inner.lock().await.update(id, |ticket| match ticket.state {
            TicketState::Open => {
                ticket.state = TicketState::Processing;
                Ok(())
            }
            state => bail!(AppError::InvalidInput(format!("ticket {} is {} and cannot be started", ticket.id, state))),
        })
    }

    /// Record operations & versions carried out for a ticket, which starts it if still open.
    pub async fn link(&self, id: TicketId, operations: Vec<OperationId>, versions: Vec<VersionRef>) -> Result<Ticket> {
        self.inner.lock().await.update(id, move |ticket| {
            if matches!(ticket.state, TicketState::Done | TicketState::Rejected) {
                bail!(AppError::InvalidInput(format!("ticket {} is {} and cannot be changed", ticket.id, ticket.state)));
            }
            for op in operations {
                if !ticket.operations.contains(&op) {
                    ticket.operations.push(op);
                }
            }
            for version in versions {
                if !ticket.versions.contains(&version) {
                    ticket.versions.push(version);
                }
            }
            ticket.state = TicketState::Processing;
            Ok(())
        })
    }

    /// Move a processing ticket to done.
    pub async fn complete(&self, id: TicketId) -> Result<Ticket> {
        self.inner.lock().await.update(id, |ticket| match ticket.state {
            TicketState::Processing => {
                ticket.state = TicketState::Done;
                Ok(())
            }
            state => bail!(AppError::InvalidInput(format!("ticket {} is {} and cannot be completed", ticket.id, state))),
        })
    }

    /// Reject a ticket which is not yet finished.
    pub async fn reject(&self, id: TicketId, reason: String) -> Result<Ticket> {
        self.inner.lock().await.update(id, move |ticket| match ticket.state {
            TicketState::Open | TicketState::Processing => {
                ticket.state = TicketState::Rejected;
                ticket.reason = Some(reason);
                Ok(())
            }
            state => bail!(AppError::InvalidInput(format!("ticket {} is {} and cannot be rejected", ticket.id, state))),
        })
    }

    #[tracing::instrument(level = "debug", skip(tree))]
    async fn recover(tree: Tree) -> Result<(TicketId, BTreeMap<TicketId, Ticket>)> {
        let recovered = Database::spawn_blocking(move || -> Result<(TicketId, BTreeMap<TicketId, Ticket>)> {
            let last_id = match tree.get(KEY_LAST_ID).context(ERR_ITER_FAILURE).map_err(ShutdownError::from)? {
                Some(raw) => utils::decode_u64(&raw)?,
                None => 0,
            };
            let mut tickets = BTreeMap::new();
            for kv_res in tree.scan_prefix(PREFIX_TICKET) {
                let (_, val) = kv_res.context(ERR_ITER_FAILURE).map_err(ShutdownError::from)?;
                let ticket: Ticket = utils::decode_model(&val).context(ERR_DECODE_ROW).map_err(ShutdownError::from)?;
                tickets.insert(ticket.id, ticket);
            }
            Ok((last_id, tickets))
        })
        .await??;
        Ok(recovered)
    }
}
