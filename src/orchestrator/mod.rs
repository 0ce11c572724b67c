//! Operation orchestrator.
//!
//! ## Overview
//! Every node-lifecycle action is executed by the automation runner as an `Operation`, one runner
//! job per target node. The orchestrator never waits on the runner: `submit` returns as soon as
//! every job has been accepted and progress is observed only through `poll`.
//!
//! A node belongs to at most one non-terminal operation at a time. Targets are reserved before
//! any runner call is made and released when the operation reaches a terminal state, or when
//! submission fails, in which case no operation is recorded at all.
//!
//! Operations are persisted on every state transition. Only non-terminal operations are held in
//! memory; once terminal an operation is archived and served from its tree. Operations which were
//! still in flight when the controller stopped cannot be resumed, they are failed during recovery.

#[cfg(test)]
mod mod_test;
mod runner;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::database::{Database, Tree};
use crate::error::{AppError, ShutdownError, ERR_DECODE_ROW, ERR_ITER_FAILURE};
use crate::models::{JobState, NodeId, Operation, OperationId, OperationState, RunnerJob};
use crate::utils;

pub use runner::{AnsibleRunner, Runner, RunnerRequest, RunnerStatus, RunnerTarget, LOG_DONE, LOG_FAILED};

const METRIC_OPERATIONS_SUBMITTED: &str = "shardctl_operations_submitted";
const METRIC_OPERATIONS_TERMINAL: &str = "shardctl_operations_terminal";

/// The error recorded on operations cancelled through the API.
pub const ERR_CANCELLED: &str = "cancelled by operator";
/// The error recorded on operations found in flight during recovery.
pub const ERR_RESTARTED: &str = "controller restarted";
/// The error recorded on operations which exceeded their deadline.
pub const ERR_TIMED_OUT: &str = "operation exceeded its deadline";

/// The orchestrator of runner operations.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<OrchestratorInner>,
}

struct OrchestratorInner {
    runner: Arc<dyn Runner>,
    tree: Tree,
    deadline: Duration,
    state: Mutex<OrchestratorState>,
}

#[derive(Default)]
struct OrchestratorState {
    /// Non-terminal operations.
    active: HashMap<OperationId, Operation>,
    /// Nodes reserved by a submission in progress or held by a non-terminal operation.
    busy: HashMap<NodeId, OperationId>,
}

impl OrchestratorState {
    fn release(&mut self, op: &Operation) {
        for node in op.targets.iter() {
            if self.busy.get(node) == Some(&op.id) {
                self.busy.remove(node);
            }
        }
    }
}

impl Orchestrator {
    /// Create a new instance, failing every operation left in flight on disk.
    pub async fn new(db: &Database, runner: Arc<dyn Runner>, deadline: Duration) -> Result<Self> {
        let tree = db.get_operations_tree().await?;
        let (count, failed) = Self::recover(tree.clone()).await?;
        tracing::debug!(count, failed, "recovered operation records");
        metrics::register_counter!(METRIC_OPERATIONS_SUBMITTED, metrics::Unit::Count, "operations accepted by the runner");
        metrics::register_counter!(METRIC_OPERATIONS_TERMINAL, metrics::Unit::Count, "operations which reached a terminal state");
        Ok(Self {
            inner: Arc::new(OrchestratorInner {
                runner,
                tree,
                deadline,
                state: Mutex::new(OrchestratorState::default()),
            }),
        })
    }

    /// Submit one runner job per request as a single operation.
    ///
    /// Fails with `NodeBusy` if any target already belongs to a non-terminal operation and with
    /// `SubmissionError` if the runner rejects any job. In both cases no operation is recorded.
    #[tracing::instrument(level = "debug", skip(self, requests), fields(targets = requests.len()))]
    pub async fn submit(&self, requests: Vec<RunnerRequest>) -> Result<Operation> {
        let kind = match requests.first() {
            Some(req) => req.kind,
            None => bail!(AppError::InvalidInput("an operation needs at least one target".into())),
        };
        if requests.iter().any(|req| req.kind != kind) {
            bail!(AppError::InvalidInput("all targets of an operation must share one kind".into()));
        }
        let targets: Vec<NodeId> = requests.iter().map(|req| req.target.node_id).collect();
        let id = Uuid::new_v4();

        // Reserve every target up front.
        {
            let mut state = self.inner.state.lock().await;
            for node in targets.iter() {
                if let Some(holder) = state.busy.get(node) {
                    bail!(AppError::NodeBusy { node_id: *node, operation_id: *holder });
                }
            }
            if let Some(dup) = targets.iter().enumerate().find(|(idx, node)| targets[..*idx].contains(node)) {
                bail!(AppError::InvalidInput(format!("node {} is targeted more than once", dup.1)));
            }
            state.busy.extend(targets.iter().map(|node| (*node, id)));
        }

        let mut jobs = Vec::with_capacity(requests.len());
        for req in requests.iter() {
            match self.inner.runner.run(req).await {
                Ok(job_id) => jobs.push(RunnerJob { node_id: req.target.node_id, job_id, state: JobState::Running, detail: String::new() }),
                Err(err) => {
                    tracing::warn!(error = ?err, node = req.target.node_id, "runner rejected job, abandoning submission");
                    for job in jobs.iter() {
                        if let Err(err) = self.inner.runner.cancel(&job.job_id).await {
                            tracing::warn!(error = ?err, job = %job.job_id, "error cancelling job of abandoned submission");
                        }
                    }
                    let mut state = self.inner.state.lock().await;
                    for node in targets.iter() {
                        if state.busy.get(node) == Some(&id) {
                            state.busy.remove(node);
                        }
                    }
                    bail!(AppError::SubmissionError(format!("{:#}", err)));
                }
            }
        }

        let op = Operation {
            id,
            kind,
            targets,
            state: OperationState::Pending,
            created_at: utils::now_millis(),
            started_at: None,
            finished_at: None,
            last_polled_at: None,
            jobs,
            result: None,
            error: None,
            cancelled: false,
        };
        let mut state = self.inner.state.lock().await;
        if let Err(err) = self.persist(&op) {
            state.release(&op);
            return Err(err);
        }
        state.active.insert(id, op.clone());
        metrics::increment_counter!(METRIC_OPERATIONS_SUBMITTED, "kind" => kind.to_string());
        tracing::info!(operation = %id, %kind, targets = ?op.targets, "operation submitted");
        Ok(op)
    }

    /// Observe the progress of an operation, advancing its state from the runner's reports.
    ///
    /// Polling a terminal operation returns it unchanged.
    #[tracing::instrument(level = "trace", skip(self))]
    pub async fn poll(&self, id: OperationId) -> Result<Operation> {
        let mut op = self.get(id).await?;
        if op.state.is_terminal() {
            return Ok(op);
        }

        let now = utils::now_millis();
        for job in op.jobs.iter_mut().filter(|job| job.state == JobState::Running) {
            match self.inner.runner.status(&job.job_id).await {
                Ok(status) => {
                    job.state = status.state;
                    job.detail = status.detail;
                }
                Err(err) => tracing::warn!(error = ?err, job = %job.job_id, "error fetching job status"),
            }
        }
        op.started_at.get_or_insert(now);
        op.state = aggregate_state(&op.jobs);

        // The deadline only applies while some job has not reported a terminal state.
        let elapsed = Duration::from_millis(now.saturating_sub(op.created_at).max(0) as u64);
        if op.state == OperationState::Running && elapsed > self.inner.deadline {
            for job in op.jobs.iter().filter(|job| job.state == JobState::Running) {
                if let Err(err) = self.inner.runner.cancel(&job.job_id).await {
                    tracing::warn!(error = ?err, job = %job.job_id, "error cancelling timed out job");
                }
            }
            op.state = OperationState::TimedOut;
            op.error = Some(ERR_TIMED_OUT.into());
        } else if op.state == OperationState::Failed {
            let failed: Vec<String> = op
                .jobs
                .iter()
                .filter(|job| job.state == JobState::Failed)
                .map(|job| format!("node {}", job.node_id))
                .collect();
            op.error = Some(format!("runner job failed on {}", failed.join(", ")));
        }
        op.last_polled_at = Some(now);
        if op.state.is_terminal() {
            op.finished_at = Some(now);
            op.result = Some(op.jobs.iter().map(|job| job.detail.as_str()).collect::<Vec<_>>().join("\n"));
        }

        let mut state = self.inner.state.lock().await;
        if !state.active.contains_key(&id) {
            // A concurrent poll or cancel already finished and archived this operation.
            drop(state);
            return match self.load(id)? {
                Some(archived) => Ok(archived),
                None => bail!(AppError::ResourceNotFound(format!("operation {}", id))),
            };
        }
        self.persist(&op)?;
        if op.state.is_terminal() {
            state.release(&op);
            state.active.remove(&id);
            metrics::increment_counter!(METRIC_OPERATIONS_TERMINAL, "state" => op.state.to_string());
            tracing::info!(operation = %id, state = %op.state, "operation finished");
        } else {
            state.active.insert(id, op.clone());
        }
        Ok(op)
    }

    /// Cancel a non-terminal operation, which is recorded as failed.
    ///
    /// The runner is signalled on a best-effort basis; the node state it leaves behind is unknown.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn cancel(&self, id: OperationId) -> Result<Operation> {
        let op = {
            let mut state = self.inner.state.lock().await;
            let mut op = match state.active.get(&id) {
                Some(op) => op.clone(),
                None => match self.load(id)? {
                    Some(archived) => bail!(AppError::InvalidInput(format!("operation {} is already {}", id, archived.state))),
                    None => bail!(AppError::ResourceNotFound(format!("operation {}", id))),
                },
            };
            let now = utils::now_millis();
            op.state = OperationState::Failed;
            op.cancelled = true;
            op.error = Some(ERR_CANCELLED.into());
            op.finished_at = Some(now);
            op.last_polled_at = Some(now);
            self.persist(&op)?;
            state.release(&op);
            state.active.remove(&id);
            metrics::increment_counter!(METRIC_OPERATIONS_TERMINAL, "state" => op.state.to_string());
            op
        };
        for job in op.jobs.iter().filter(|job| job.state == JobState::Running) {
            if let Err(err) = self.inner.runner.cancel(&job.job_id).await {
                tracing::warn!(error = ?err, job = %job.job_id, "error signalling runner to cancel job");
            }
        }
        tracing::info!(operation = %id, "operation cancelled");
        Ok(op)
    }

    pub async fn get(&self, id: OperationId) -> Result<Operation> {
        if let Some(op) = self.inner.state.lock().await.active.get(&id) {
            return Ok(op.clone());
        }
        match self.load(id)? {
            Some(op) => Ok(op),
            None => bail!(AppError::ResourceNotFound(format!("operation {}", id))),
        }
    }

    /// All known operations, newest first, archived ones included.
    pub async fn list(&self) -> Result<Vec<Operation>> {
        let tree = self.inner.tree.clone();
        let mut ops = Database::spawn_blocking(move || -> Result<Vec<Operation>> {
            let mut ops = vec![];
            for kv_res in tree.iter() {
                let (_, val) = kv_res.context(ERR_ITER_FAILURE).map_err(ShutdownError::from)?;
                ops.push(utils::decode_model::<Operation>(&val).context(ERR_DECODE_ROW)?);
            }
            Ok(ops)
        })
        .await??;
        ops.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        Ok(ops)
    }

    /// The ids of all non-terminal operations.
    pub async fn active_operations(&self) -> Vec<OperationId> {
        let state = self.inner.state.lock().await;
        let mut ids: Vec<(i64, OperationId)> = state.active.values().map(|op| (op.created_at, op.id)).collect();
        ids.sort();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    /// The operation currently holding the given node, including a submission in progress.
    pub async fn active_for(&self, node_id: NodeId) -> Option<OperationId> {
        self.inner.state.lock().await.busy.get(&node_id).copied()
    }

    /// Read an operation record from its tree.
    fn load(&self, id: OperationId) -> Result<Option<Operation>> {
        let row = self
            .inner
            .tree
            .get(id.as_bytes())
            .context("error reading operation")
            .map_err(ShutdownError::from)?;
        match row {
            Some(row) => Ok(Some(utils::decode_model(&row).context(ERR_DECODE_ROW)?)),
            None => Ok(None),
        }
    }

    fn persist(&self, op: &Operation) -> Result<()> {
        let row = utils::encode_model(op)?;
        self.inner
            .tree
            .insert(op.id.as_bytes(), row)
            .context("error persisting operation")
            .map_err(ShutdownError::from)?;
        Ok(())
    }

    /// Fail every operation which was still in flight, returning the record and failure counts.
    #[tracing::instrument(level = "debug", skip(tree))]
    async fn recover(tree: Tree) -> Result<(usize, usize)> {
        let counts = Database::spawn_blocking(move || -> Result<(usize, usize)> {
            let (mut count, mut failed) = (0, 0);
            let mut batch = sled::Batch::default();
            for kv_res in tree.iter() {
                let (_, val) = kv_res.context(ERR_ITER_FAILURE).map_err(ShutdownError::from)?;
                let mut op: Operation = utils::decode_model(&val).context(ERR_DECODE_ROW).map_err(ShutdownError::from)?;
                if !op.state.is_terminal() {
                    tracing::warn!(operation = %op.id, state = %op.state, "failing operation which was in flight at shutdown");
                    op.state = OperationState::Failed;
                    op.error = Some(ERR_RESTARTED.into());
                    op.finished_at = Some(utils::now_millis());
                    batch.insert(op.id.as_bytes(), utils::encode_model(&op)?);
                    failed += 1;
                }
                count += 1;
            }
            tree.apply_batch(batch).context("error persisting recovered operations").map_err(ShutdownError::from)?;
            Ok((count, failed))
        })
        .await??;
        Ok(counts)
    }
}

/// The state of an operation given the states of its jobs.
///
/// An operation finishes once every job has; it fails if any job failed.
fn aggregate_state(jobs: &[RunnerJob]) -> OperationState {
    if jobs.iter().any(|job| job.state == JobState::Running) {
        OperationState::Running
    } else if jobs.iter().any(|job| job.state == JobState::Failed) {
        OperationState::Failed
    } else {
        OperationState::Succeeded
    }
}
