//! Topology controller.
//!
//! ## Overview
//! The controller is the single entry point for topology mutations. Purely logical changes are
//! planned & committed in one step. Changes which need work on the nodes themselves are planned
//! up front, dry-run against the store and then submitted to the orchestrator as an operation;
//! the planned assignment is committed by the first poll which observes the operation succeed.
//!
//! A change's assignment delta is computed against the group's assignment version at planning
//! time. When the group has moved on by the time the operation succeeds, the commit is refused
//! with `StaleDelta` and the change is kept until `recompute_change` replans it against the
//! current state.
//!
//! Every committed change republishes the derived config domains whose document changed. A
//! failed push never fails the commit, it is reported on the outcome and retried on the next
//! publication or through the sync API.

mod change;
mod sweeper;

use std::collections::{BTreeMap, HashMap, VecDeque};

use anyhow::{bail, Context, Result};
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::assignment::table::{self, ListStrategy, ShardListAssignment, ShardMetrics};
use crate::assignment::{self, AssignmentPlan};
use crate::error::AppError;
use crate::models::{
    AnsibleConfig, AssignmentDelta, Cluster, ClusterId, ConfigDomain, ConfigVersion, DataCenter, Group, GroupId, Node, NodeId,
    NodeRole, NodeStatus, OperationId, OperationKind, OperationState, ShardAssignment, ShardId, Table, TableId, VersionedPayload,
};
use crate::orchestrator::{Orchestrator, RunnerRequest, RunnerTarget};
use crate::tickets::TicketBook;
use crate::topology::{TableDocument, TopologyDocument, TopologySnapshot, TopologyStore, TopologyTx};
use crate::validator::{self, ConfigDrift, GroupReadiness};
use crate::versions::VersionManager;

pub use change::{
    BatchItem, ChangeAction, ChangeHandle, GroupSettings, MutationOutcome, NewAnsibleConfig, NewGroup, NewNode, OperationReport,
    PendingChange, Publication,
};
pub use sweeper::OperationSweeper;

/// The number of settled outcomes kept for reporting on later polls.
const SETTLED_CAPACITY: usize = 1024;

/// Changes awaiting their operation, and the outcomes of the most recently settled ones.
#[derive(Default)]
struct ChangeBook {
    pending: HashMap<OperationId, PendingChange>,
    settled: HashMap<OperationId, MutationOutcome>,
    /// Settlement order of `settled`, oldest first.
    settled_order: VecDeque<OperationId>,
}

impl ChangeBook {
    /// Record the outcome of a committed change, evicting the oldest beyond capacity.
    fn settle(&mut self, id: OperationId, outcome: MutationOutcome) {
        if self.settled.insert(id, outcome).is_none() {
            self.settled_order.push_back(id);
        }
        while self.settled_order.len() > SETTLED_CAPACITY {
            if let Some(oldest) = self.settled_order.pop_front() {
                self.settled.remove(&oldest);
            }
        }
    }
}

/// The topology controller.
pub struct Controller {
    topology: TopologyStore,
    orchestrator: Orchestrator,
    versions: VersionManager,
    tickets: TicketBook,
    changes: Mutex<ChangeBook>,
    /// Serializes building & appending derived config versions.
    publish_lock: Mutex<()>,
}

impl Controller {
    pub fn new(topology: TopologyStore, orchestrator: Orchestrator, versions: VersionManager, tickets: TicketBook) -> Self {
        Self {
            topology,
            orchestrator,
            versions,
            tickets,
            changes: Mutex::new(ChangeBook::default()),
            publish_lock: Mutex::new(()),
        }
    }

    pub fn topology(&self) -> &TopologyStore {
        &self.topology
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn versions(&self) -> &VersionManager {
        &self.versions
    }

    pub fn tickets(&self) -> &TicketBook {
        &self.tickets
    }

    /// The changes still waiting on an operation, or left stale by one.
    pub async fn pending_changes(&self) -> Vec<PendingChange> {
        let mut changes: Vec<PendingChange> = self.changes.lock().await.pending.values().cloned().collect();
        changes.sort_by_key(|change| (change.group_id, change.operation_id));
        changes
    }

    /////////////////////////////////////////////////////////////////////////
    // Catalogue ////////////////////////////////////////////////////////////

    pub async fn add_cluster(&self, name: String) -> Result<Cluster> {
        require_name("cluster", &name)?;
        self.topology
            .transact(|tx| {
                let cluster = Cluster { id: tx.next_id(), name: name.clone(), dc_ids: Default::default() };
                tx.put_cluster(cluster.clone());
                Ok(cluster)
            })
            .await
    }

    pub async fn add_dc(&self, cluster_id: ClusterId, name: String) -> Result<DataCenter> {
        require_name("data center", &name)?;
        self.topology
            .transact(|tx| {
                let mut cluster = match tx.snapshot().clusters.get(&cluster_id) {
                    Some(cluster) => cluster.clone(),
                    None => bail!(AppError::ResourceNotFound(format!("cluster {}", cluster_id))),
                };
                let dc = DataCenter { id: tx.next_id(), name: name.clone(), cluster_id };
                cluster.dc_ids.insert(dc.id);
                tx.put_dc(dc.clone());
                tx.put_cluster(cluster);
                Ok(dc)
            })
            .await
    }

    #[tracing::instrument(level = "debug", skip(self, new), fields(name = %new.name))]
    pub async fn add_group(&self, new: NewGroup) -> Result<(Group, MutationOutcome)> {
        require_name("group", &new.name)?;
        if new.shard_count == 0 || new.replica_factor == 0 {
            bail!(AppError::InvalidInput("a group needs at least one shard and a replica factor of at least 1".into()));
        }
        let group = self
            .topology
            .transact(|tx| {
                let group = Group {
                    id: tx.next_id(),
                    name: new.name.clone(),
                    cluster_id: new.cluster_id,
                    dc_id: new.dc_id,
                    shard_count: new.shard_count,
                    replica_factor: new.replica_factor,
                    reduce_rate: new.reduce_rate,
                    assignment_version: 0,
                };
                tx.put_group(group.clone());
                Ok(group)
            })
            .await?;
        let outcome = MutationOutcome { group_id: Some(group.id), published: self.publish(None).await?, ..Default::default() };
        Ok((group, outcome))
    }

    /// Change a group's settings.
    ///
    /// A new shard count or replica factor replans the group against its current assignment,
    /// the throttling ratio alone leaves placement untouched.
    #[tracing::instrument(level = "debug", skip(self, settings))]
    pub async fn update_group(&self, group_id: GroupId, settings: GroupSettings) -> Result<MutationOutcome> {
        if settings.shard_count == Some(0) || settings.replica_factor == Some(0) {
            bail!(AppError::InvalidInput("a group needs at least one shard and a replica factor of at least 1".into()));
        }
        let guard = self.topology.lock_group(group_id).await;
        let current = self.group(group_id)?;
        let mut next = current.clone();
        next.shard_count = settings.shard_count.unwrap_or(current.shard_count);
        next.replica_factor = settings.replica_factor.unwrap_or(current.replica_factor);
        next.reduce_rate = settings.reduce_rate.unwrap_or(current.reduce_rate);
        let replan = next.shard_count != current.shard_count || next.replica_factor != current.replica_factor;

        let (version, under_replicated) = self
            .topology
            .transact(|tx| {
                let previous = ShardAssignment::derive(&current, &tx.snapshot().group_nodes(group_id));
                tx.put_group(next.clone());
                if !replan {
                    return Ok((None, vec![]));
                }
                let plan = assignment::plan(&next, &tx.snapshot().group_nodes(group_id), &previous)?;
                let version = tx.set_assignment(group_id, &plan.assignment)?;
                Ok((Some(version), plan.under_replicated))
            })
            .await?;
        drop(guard);

        let published = self.publish(None).await?;
        Ok(MutationOutcome { group_id: Some(group_id), assignment_version: version, under_replicated, published })
    }

    pub async fn add_ansible_config(&self, new: NewAnsibleConfig) -> Result<AnsibleConfig> {
        require_name("ansible config", &new.name)?;
        self.topology
            .transact(|tx| {
                let config = AnsibleConfig { id: tx.next_id(), name: new.name.clone(), vars: new.vars.clone(), roles: new.roles.clone() };
                tx.put_ansible_config(config.clone());
                Ok(config)
            })
            .await
    }

    /// Create or replace a table, a table with id `0` is assigned a fresh id.
    #[tracing::instrument(level = "debug", skip(self, table), fields(table = %table.name))]
    pub async fn upsert_table(&self, table: Table) -> Result<(Table, MutationOutcome)> {
        require_name("table", &table.name)?;
        require_name("database", &table.database)?;
        let table = self
            .topology
            .transact(|tx| {
                let mut table = table.clone();
                if table.id == 0 {
                    table.id = tx.next_id();
                } else if !tx.snapshot().tables.contains_key(&table.id) {
                    bail!(AppError::ResourceNotFound(format!("table {}", table.id)));
                }
                tx.put_table(table.clone());
                Ok(table)
            })
            .await?;
        let outcome = MutationOutcome { group_id: Some(table.group_id), published: self.publish(None).await?, ..Default::default() };
        Ok((table, outcome))
    }

    /////////////////////////////////////////////////////////////////////////
    // Node lifecycle ///////////////////////////////////////////////////////

    /// Add a node, which stays pending until its provisioning operation succeeds.
    #[tracing::instrument(level = "debug", skip(self, new), fields(address = %new.address()))]
    pub async fn add_node(&self, new: NewNode) -> Result<ChangeHandle> {
        let group = self.group(new.group_id)?;
        let node = self
            .topology
            .upsert_node(Node {
                id: 0,
                group_id: group.id,
                host: new.host,
                port: new.port,
                weight: new.weight,
                role: new.role,
                status: NodeStatus::Pending,
                leader_shards: vec![],
                follower_shards: vec![],
                is_edge: new.is_edge,
                ansible_config_id: new.ansible_config_id,
                config_id: new.config_id,
                description: new.description,
                deleted: false,
            })
            .await?;

        let action = ChangeAction::AddNode { node_id: node.id };
        match self.submit_change(group.id, action, OperationKind::Provision, None, Some(vec![node.id])).await {
            Ok(handle) => Ok(handle),
            Err(err) => {
                if let Err(cleanup_err) = self.topology.remove_node(node.id).await {
                    tracing::error!(error = ?cleanup_err, node = node.id, "error removing node after failed submission");
                }
                Err(err)
            }
        }
    }

    /// Remove a node. Active nodes are deprovisioned first, others are removed right away.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn remove_node(&self, node_id: NodeId) -> Result<ChangeHandle> {
        let node = self.node(node_id)?;
        if node.is_active() {
            let action = ChangeAction::RemoveNode { node_id };
            return self
                .submit_change(node.group_id, action, OperationKind::Deprovision, None, Some(vec![node_id]))
                .await;
        }
        self.ensure_idle(node_id).await?;
        self.topology.remove_node(node_id).await?;
        let published = self.publish(None).await?;
        Ok(ChangeHandle::Applied { outcome: MutationOutcome { group_id: Some(node.group_id), published, ..Default::default() } })
    }

    /// Change the configured role of a node, which restarts an active node in its new role.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn change_role(&self, node_id: NodeId, role: NodeRole) -> Result<ChangeHandle> {
        let node = self.node(node_id)?;
        if node.is_edge && role == NodeRole::Leader {
            bail!(AppError::InvariantViolation(vec![format!("edge node {} cannot take the leader role", node_id)]));
        }
        if node.role == role {
            bail!(AppError::InvalidInput(format!("node {} already has the {} role", node_id, role)));
        }
        if node.is_active() {
            let action = ChangeAction::ChangeRole { node_id, role };
            return self
                .submit_change(node.group_id, action, OperationKind::RoleChange, None, Some(vec![node_id]))
                .await;
        }
        self.ensure_idle(node_id).await?;
        self.topology
            .transact(|tx| {
                let mut node = tx.node(node_id)?;
                node.role = role;
                tx.put_node(node);
                Ok(())
            })
            .await?;
        Ok(ChangeHandle::Applied { outcome: MutationOutcome { group_id: Some(node.group_id), ..Default::default() } })
    }

    pub async fn restart_node(&self, node_id: NodeId) -> Result<ChangeHandle> {
        let node = self.node(node_id)?;
        if node.status == NodeStatus::Pending {
            bail!(AppError::InvalidInput(format!("node {} has not been provisioned", node_id)));
        }
        self.submit_change(node.group_id, ChangeAction::Restart, OperationKind::Restart, None, Some(vec![node_id]))
            .await
    }

    /// Mark a node active or inactive and replan its group, without touching the node itself.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn update_node_status(&self, node_id: NodeId, status: NodeStatus) -> Result<MutationOutcome> {
        if status == NodeStatus::Pending {
            bail!(AppError::InvalidInput("nodes only become pending when added".into()));
        }
        let guard = self.topology.lock_group(self.node(node_id)?.group_id).await;
        let node = self.node(node_id)?;
        if node.status == NodeStatus::Pending {
            bail!(AppError::InvalidInput(format!("node {} has not been provisioned", node_id)));
        }
        if node.status == status {
            bail!(AppError::InvalidInput(format!("node {} is already {}", node_id, status)));
        }
        self.ensure_idle(node_id).await?;

        let (version, under_replicated) = self
            .topology
            .transact(|tx| {
                let group = tx.group(node.group_id)?;
                let current = ShardAssignment::derive(&group, &tx.snapshot().group_nodes(group.id));
                let mut updated = tx.node(node_id)?;
                updated.status = status;
                tx.put_node(updated);
                let plan = assignment::plan(&group, &tx.snapshot().group_nodes(group.id), &current)?;
                Ok((tx.set_assignment(group.id, &plan.assignment)?, plan.under_replicated))
            })
            .await?;
        drop(guard);

        let published = self.publish(None).await?;
        Ok(MutationOutcome { group_id: Some(node.group_id), assignment_version: Some(version), under_replicated, published })
    }

    /// Submit a manually supplied assignment, restarting every node whose shards change.
    #[tracing::instrument(level = "debug", skip(self, manual))]
    pub async fn reassign_shards(&self, group_id: GroupId, manual: ShardAssignment) -> Result<ChangeHandle> {
        let group = self.group(group_id)?;
        if manual.shard_count != group.shard_count {
            bail!(AppError::InvalidInput(format!(
                "assignment covers {} shards but group {} has {}",
                manual.shard_count, group_id, group.shard_count
            )));
        }
        self.submit_change(group_id, ChangeAction::Reassign, OperationKind::Restart, Some(manual), None)
            .await
    }

    /// Replan a group against its current assignment and commit the result.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn rebalance_group(&self, group_id: GroupId) -> Result<MutationOutcome> {
        let guard = self.topology.lock_group(group_id).await;
        let (version, under_replicated) = self
            .topology
            .transact(|tx| {
                let group = tx.group(group_id)?;
                let roster = tx.snapshot().group_nodes(group_id);
                let plan = assignment::plan(&group, &roster, &ShardAssignment::derive(&group, &roster))?;
                if plan.delta.is_empty() {
                    return Ok((None, plan.under_replicated));
                }
                Ok((Some(tx.set_assignment(group_id, &plan.assignment)?), plan.under_replicated))
            })
            .await?;
        drop(guard);

        let published = self.publish(None).await?;
        Ok(MutationOutcome { group_id: Some(group_id), assignment_version: version, under_replicated, published })
    }

    /// Add several nodes, each independently of the others.
    pub async fn batch_store_nodes(&self, nodes: Vec<NewNode>) -> Vec<BatchItem> {
        let mut items = Vec::with_capacity(nodes.len());
        for new in nodes {
            let address = new.address();
            items.push(batch_item(address, self.add_node(new).await));
        }
        items
    }

    /// Remove several nodes, each independently of the others.
    pub async fn batch_delete_nodes(&self, node_ids: Vec<NodeId>) -> Vec<BatchItem> {
        let mut items = Vec::with_capacity(node_ids.len());
        for node_id in node_ids {
            items.push(batch_item(node_id.to_string(), self.remove_node(node_id).await));
        }
        items
    }

    /////////////////////////////////////////////////////////////////////////
    // Operations ///////////////////////////////////////////////////////////

    /// Poll an operation, committing or abandoning its change once terminal.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn poll_operation(&self, id: OperationId) -> Result<OperationReport> {
        let operation = self.orchestrator.poll(id).await?;
        let mut report = OperationReport { operation, change: None, outcome: None, error: None, error_kind: None };
        let change = {
            let mut book = self.changes.lock().await;
            if !report.operation.state.is_terminal() {
                report.change = book.pending.get(&id).cloned();
                return Ok(report);
            }
            report.outcome = book.settled.get(&id).cloned();
            match book.pending.remove(&id) {
                Some(change) if change.stale => {
                    book.pending.insert(id, change.clone());
                    report.change = Some(change);
                    return Ok(report);
                }
                Some(change) => change,
                None => return Ok(report),
            }
        };

        if report.operation.state.is_failure() {
            self.abandon_change(&change).await;
            return Ok(report);
        }
        match self.commit_change(&change, true).await {
            Ok(outcome) => {
                self.changes.lock().await.settle(id, outcome.clone());
                report.outcome = Some(outcome);
            }
            Err(err) => {
                tracing::warn!(error = ?err, operation = %id, "error committing change of succeeded operation");
                let stale = PendingChange { stale: true, ..change };
                self.changes.lock().await.pending.insert(id, stale.clone());
                report.change = Some(stale);
                report.error_kind = err.downcast_ref::<AppError>().map(AppError::kind);
                report.error = Some(err.to_string());
            }
        }
        Ok(report)
    }

    /// Cancel an operation, abandoning its change.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn cancel_operation(&self, id: OperationId) -> Result<OperationReport> {
        let operation = self.orchestrator.cancel(id).await?;
        let change = self.changes.lock().await.pending.remove(&id);
        if let Some(change) = change.as_ref() {
            self.abandon_change(change).await;
        }
        Ok(OperationReport { operation, change: None, outcome: None, error: None, error_kind: None })
    }

    /// Replan the stale change of a succeeded operation against the current state and commit it.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn recompute_change(&self, id: OperationId) -> Result<MutationOutcome> {
        let operation = self.orchestrator.get(id).await?;
        let change = match self.changes.lock().await.pending.get(&id) {
            Some(change) if change.stale => change.clone(),
            Some(_) => bail!(AppError::InvalidInput(format!("the change of operation {} is not stale", id))),
            None => bail!(AppError::ResourceNotFound(format!("stale change of operation {}", id))),
        };
        if operation.state != OperationState::Succeeded {
            bail!(AppError::InvalidInput(format!("operation {} is {}", id, operation.state)));
        }

        let guard = self.topology.lock_group(change.group_id).await;
        let mut replanned = change.clone();
        if change.assignment.is_some() && change.action != ChangeAction::Reassign {
            let snapshot = self.topology.snapshot();
            let plan = plan_change(&snapshot, change.group_id, &change.action)?;
            replanned.assignment = Some(plan.assignment);
            replanned.delta = Some(plan.delta);
        }
        let version = self.topology.transact(|tx| apply_change(tx, &replanned, false)).await?;
        drop(guard);

        let outcome = self.committed_outcome(change.group_id, version, Some(id)).await?;
        let mut book = self.changes.lock().await;
        book.pending.remove(&id);
        book.settle(id, outcome.clone());
        Ok(outcome)
    }

    /// Plan a change, dry-run its commit and submit its operation.
    ///
    /// `manual` replaces the planned assignment, `targets` defaults to every node the
    /// assignment delta affects.
    async fn submit_change(
        &self, group_id: GroupId, action: ChangeAction, kind: OperationKind, manual: Option<ShardAssignment>, targets: Option<Vec<NodeId>>,
    ) -> Result<ChangeHandle> {
        let (mut change, requests) = {
            let _guard = self.topology.lock_group(group_id).await;
            let snapshot = self.topology.snapshot();
            let group = self.group(group_id)?;
            let current = ShardAssignment::derive(&group, &snapshot.group_nodes(group_id));
            let assignment = match (&action, manual) {
                (ChangeAction::Restart, _) => None,
                (_, Some(manual)) => Some(manual),
                (action, None) => Some(plan_change(&snapshot, group_id, action)?.assignment),
            };
            let delta = assignment
                .as_ref()
                .map(|next| AssignmentDelta::between(group_id, group.assignment_version, &current, next));
            let change = PendingChange { operation_id: Uuid::nil(), group_id, action, assignment, delta, stale: false };
            self.topology.dry_run(|tx| apply_change(tx, &change, true))?;

            let targets = match (targets, change.delta.as_ref()) {
                (Some(targets), _) => targets,
                (None, Some(delta)) => delta.affected_nodes().into_iter().collect(),
                (None, None) => vec![],
            };
            if targets.is_empty() {
                bail!(AppError::InvalidInput("the change affects no node".into()));
            }
            let requests = targets
                .iter()
                .map(|id| match snapshot.nodes.get(id) {
                    Some(node) => Ok(runner_request(&snapshot, kind, node, &change)),
                    None => bail!(AppError::ResourceNotFound(format!("node {}", id))),
                })
                .collect::<Result<Vec<_>>>()?;
            (change, requests)
        };

        let operation = self.orchestrator.submit(requests).await?;
        change.operation_id = operation.id;
        self.changes.lock().await.pending.insert(operation.id, change.clone());
        tracing::info!(operation = %operation.id, group = group_id, kind = %kind, "submitted topology change");
        Ok(ChangeHandle::Submitted { operation, change })
    }

    async fn commit_change(&self, change: &PendingChange, check_version: bool) -> Result<MutationOutcome> {
        let guard = self.topology.lock_group(change.group_id).await;
        let version = self.topology.transact(|tx| apply_change(tx, change, check_version)).await?;
        drop(guard);
        tracing::info!(operation = %change.operation_id, group = change.group_id, ?version, "committed topology change");
        self.committed_outcome(change.group_id, version, Some(change.operation_id)).await
    }

    async fn committed_outcome(&self, group_id: GroupId, version: Option<u64>, caused_by: Option<OperationId>) -> Result<MutationOutcome> {
        let under_replicated = self.group_readiness(group_id)?.under_replicated;
        let published = self.publish(caused_by).await?;
        Ok(MutationOutcome { group_id: Some(group_id), assignment_version: version, under_replicated, published })
    }

    /// Settle the change of a failed operation. Only a node still pending provisioning is rolled
    /// back, the state any other node was left in is unknown.
    async fn abandon_change(&self, change: &PendingChange) {
        let node_id = match change.action {
            ChangeAction::AddNode { node_id } => node_id,
            _ => {
                tracing::warn!(operation = %change.operation_id, action = ?change.action, "operation failed, node state needs inspection");
                return;
            }
        };
        let res = self
            .topology
            .transact(|tx| {
                let mut node = tx.node(node_id)?;
                if node.status == NodeStatus::Pending {
                    node.status = NodeStatus::Inactive;
                    tx.put_node(node);
                }
                Ok(())
            })
            .await;
        if let Err(err) = res {
            tracing::error!(error = ?err, node = node_id, "error marking node inactive after failed provisioning");
        }
    }

    /////////////////////////////////////////////////////////////////////////
    // Config versions //////////////////////////////////////////////////////

    /// Snapshot a config domain. Derived domains are built from the topology, proxy config is
    /// supplied by the caller.
    pub async fn snapshot_config(&self, domain: ConfigDomain, payload: Option<Value>) -> Result<ConfigVersion> {
        let version = match (domain, payload) {
            (ConfigDomain::ProxyConfig, Some(payload)) => self.versions.snapshot(domain, payload, None).await?,
            (ConfigDomain::ProxyConfig, None) => bail!(AppError::InvalidInput("proxy config needs a payload".into())),
            (_, Some(_)) => bail!(AppError::InvalidInput(format!("{} is derived from the topology and takes no payload", domain))),
            (_, None) => {
                let _guard = self.publish_lock.lock().await;
                let payload = self.build_document(domain)?;
                self.versions.snapshot(domain, payload, None).await?
            }
        };
        Ok(version)
    }

    /// Roll a domain back to an earlier version.
    ///
    /// Rolling back the group topology also restores the shard assignment of every group the
    /// target version lists and which still exists. Rolling back the table config restores the
    /// table rows, and is refused when the topology can no longer reproduce the target version.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn rollback(&self, domain: ConfigDomain, to_version: u64) -> Result<MutationOutcome> {
        let target = self.versions.get(domain, to_version).await?;
        let version = {
            let _publish = self.publish_lock.lock().await;
            if domain == ConfigDomain::GroupTopology {
                let document: TopologyDocument =
                    serde_json::from_value(target.payload).context("error decoding group topology version")?;
                let snapshot = self.topology.snapshot();
                let assignments: BTreeMap<GroupId, ShardAssignment> = document
                    .assignments()
                    .into_iter()
                    .filter(|(id, _)| snapshot.groups.contains_key(id))
                    .collect();
                // Ascending group order, like every other multi-group lock holder.
                let mut guards = Vec::with_capacity(assignments.len());
                for id in assignments.keys() {
                    guards.push(self.topology.lock_group(*id).await);
                }
                self.topology
                    .transact(|tx| {
                        for (id, assignment) in assignments.iter() {
                            tx.set_assignment(*id, assignment)?;
                        }
                        Ok(())
                    })
                    .await?;
            } else if domain == ConfigDomain::TableConfig {
                let document: TableDocument = serde_json::from_value(target.payload).context("error decoding table config version")?;
                self.topology.transact(|tx| document.restore(tx)).await?;
            }
            self.versions.rollback(domain, to_version).await?
        };
        tracing::info!(%domain, from = to_version, version = version.version, "rolled back config domain");
        Ok(MutationOutcome { published: vec![self.push(domain, version.version).await], ..Default::default() })
    }

    pub async fn sync(&self, domain: ConfigDomain, version: u64) -> Result<bool> {
        self.versions.sync(domain, version).await
    }

    pub async fn sync_pending(&self, domain: ConfigDomain) -> Result<Vec<u64>> {
        self.versions.sync_pending(domain).await
    }

    pub async fn published(&self, domain: ConfigDomain) -> Result<Option<VersionedPayload>> {
        self.versions.published(domain).await
    }

    /// Compare the config a domain should publish with what the coordination store holds.
    ///
    /// Derived domains are rebuilt from the topology, the proxy config is its current version.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn drift(&self, domain: ConfigDomain) -> Result<ConfigDrift> {
        let expected = match domain {
            ConfigDomain::ProxyConfig => self.versions.current(domain).await?.map(|current| current.payload).unwrap_or(Value::Null),
            ConfigDomain::GroupTopology | ConfigDomain::TableConfig => self.build_document(domain)?,
        };
        let published = self.versions.published(domain).await?;
        Ok(validator::check_config_drift(domain, &expected, published.as_ref()))
    }

    /// Append a version of every derived domain whose document changed, then push them.
    async fn publish(&self, caused_by: Option<OperationId>) -> Result<Vec<Publication>> {
        let appended = {
            let _guard = self.publish_lock.lock().await;
            let mut appended = vec![];
            for domain in [ConfigDomain::GroupTopology, ConfigDomain::TableConfig] {
                let payload = self.build_document(domain)?;
                let unchanged = self.versions.current(domain).await?.map(|current| current.payload == payload).unwrap_or(false);
                if !unchanged {
                    appended.push(self.versions.snapshot(domain, payload, caused_by).await?);
                }
            }
            appended
        };
        let mut published = Vec::with_capacity(appended.len());
        for version in appended {
            published.push(self.push(version.domain, version.version).await);
        }
        Ok(published)
    }

    /// Push every pending version of a domain, reporting on the given one.
    async fn push(&self, domain: ConfigDomain, version: u64) -> Publication {
        match self.versions.sync_pending(domain).await {
            Ok(_) => Publication { domain, version, synced: true, sync_error: None },
            Err(err) => {
                tracing::warn!(error = ?err, %domain, version, "error pushing config version, it remains unsynced");
                Publication { domain, version, synced: false, sync_error: Some(err.to_string()) }
            }
        }
    }

    fn build_document(&self, domain: ConfigDomain) -> Result<Value> {
        let snapshot = self.topology.snapshot();
        let payload = match domain {
            ConfigDomain::GroupTopology => serde_json::to_value(snapshot.topology_document()),
            ConfigDomain::TableConfig => serde_json::to_value(snapshot.table_document()),
            ConfigDomain::ProxyConfig => bail!(AppError::InvalidInput("proxy config is not derived from the topology".into())),
        };
        payload.context("error encoding config document")
    }

    /////////////////////////////////////////////////////////////////////////
    // Reads ////////////////////////////////////////////////////////////////

    pub fn group_readiness(&self, group_id: GroupId) -> Result<GroupReadiness> {
        let group = self.group(group_id)?;
        Ok(validator::check_group_ready(&group, &self.topology.list_nodes(group_id)))
    }

    /// Split the shards of a table into lists. Shards without metrics count as empty.
    pub fn assign_table_shard_lists(
        &self, table_id: TableId, list_count: u32, strategy: ListStrategy, metrics: BTreeMap<ShardId, ShardMetrics>,
    ) -> Result<ShardListAssignment> {
        let table = match self.topology.snapshot().tables.get(&table_id) {
            Some(table) => table.clone(),
            None => bail!(AppError::ResourceNotFound(format!("table {}", table_id))),
        };
        if let Some(shard) = metrics.keys().find(|shard| **shard >= table.shard_count) {
            bail!(AppError::InvalidInput(format!(
                "shard {} is outside of table {} which has {} shards",
                shard, table.name, table.shard_count
            )));
        }
        let shards: BTreeMap<ShardId, ShardMetrics> = (0..table.shard_count)
            .map(|shard| (shard, metrics.get(&shard).copied().unwrap_or_default()))
            .collect();
        table::assign_shard_lists(&shards, list_count, strategy)
    }

    /// Fail with `NodeBusy` if an operation holds the given node, or a change left stale by one
    /// targets it.
    async fn ensure_idle(&self, node_id: NodeId) -> Result<()> {
        if let Some(operation_id) = self.orchestrator.active_for(node_id).await {
            bail!(AppError::NodeBusy { node_id, operation_id });
        }
        let book = self.changes.lock().await;
        let busy = book.pending.values().find(|change| match change.action {
            ChangeAction::AddNode { node_id: id } | ChangeAction::RemoveNode { node_id: id } | ChangeAction::ChangeRole { node_id: id, .. } => {
                id == node_id
            }
            ChangeAction::Reassign | ChangeAction::Restart => false,
        });
        match busy {
            Some(change) => bail!(AppError::NodeBusy { node_id, operation_id: change.operation_id }),
            None => Ok(()),
        }
    }

    fn group(&self, id: GroupId) -> Result<Group> {
        match self.topology.get_group(id) {
            Some(group) => Ok(group),
            None => bail!(AppError::ResourceNotFound(format!("group {}", id))),
        }
    }

    fn node(&self, id: NodeId) -> Result<Node> {
        match self.topology.get_node(id) {
            Some(node) if !node.deleted => Ok(node),
            _ => bail!(AppError::ResourceNotFound(format!("node {}", id))),
        }
    }
}

fn require_name(entity: &str, name: &str) -> Result<()> {
    if name.trim().is_empty() {
        bail!(AppError::InvalidInput(format!("a {} needs a name", entity)));
    }
    Ok(())
}

fn batch_item(node: String, res: Result<ChangeHandle>) -> BatchItem {
    match res {
        Ok(handle) => BatchItem { node, handle: Some(handle), error: None },
        Err(err) => BatchItem { node, handle: None, error: Some(err.to_string()) },
    }
}

/// Plan a group as it will stand once the given action is applied.
fn plan_change(snapshot: &TopologySnapshot, group_id: GroupId, action: &ChangeAction) -> Result<AssignmentPlan> {
    let group = match snapshot.groups.get(&group_id) {
        Some(group) => group,
        None => bail!(AppError::ResourceNotFound(format!("group {}", group_id))),
    };
    let nodes = snapshot.group_nodes(group_id);
    let current = ShardAssignment::derive(group, &nodes);
    let mut roster = nodes;
    match action {
        ChangeAction::AddNode { node_id } => roster
            .iter_mut()
            .filter(|node| node.id == *node_id)
            .for_each(|node| node.status = NodeStatus::Active),
        ChangeAction::RemoveNode { node_id } => roster.retain(|node| node.id != *node_id),
        ChangeAction::ChangeRole { node_id, role } => roster
            .iter_mut()
            .filter(|node| node.id == *node_id)
            .for_each(|node| node.role = *role),
        ChangeAction::Reassign | ChangeAction::Restart => (),
    }
    assignment::plan(group, &roster, &current)
}

/// Apply a change to a transaction, returning the group's new assignment version if the change
/// carries an assignment.
fn apply_change(tx: &mut TopologyTx, change: &PendingChange, check_version: bool) -> Result<Option<u64>> {
    if let (true, Some(delta)) = (check_version, change.delta.as_ref()) {
        tx.expect_version(change.group_id, delta.base_version)?;
    }
    match &change.action {
        ChangeAction::AddNode { node_id } => {
            let mut node = tx.node(*node_id)?;
            node.status = NodeStatus::Active;
            tx.put_node(node);
        }
        ChangeAction::ChangeRole { node_id, role } => {
            let mut node = tx.node(*node_id)?;
            node.role = *role;
            tx.put_node(node);
        }
        ChangeAction::RemoveNode { .. } | ChangeAction::Reassign | ChangeAction::Restart => (),
    }
    let version = match change.assignment.as_ref() {
        Some(assignment) => Some(tx.set_assignment(change.group_id, assignment)?),
        None => None,
    };
    if let ChangeAction::RemoveNode { node_id } = &change.action {
        tx.remove_node(*node_id)?;
    }
    Ok(version)
}

/// Build the runner request of one target of a change.
///
/// Targets receive their shard lists & role as they will stand once the change is committed.
fn runner_request(snapshot: &TopologySnapshot, kind: OperationKind, node: &Node, change: &PendingChange) -> RunnerRequest {
    let group = snapshot.groups.get(&node.group_id);
    let dc = group.and_then(|group| snapshot.dcs.get(&group.dc_id));
    let config = node.ansible_config_id.and_then(|id| snapshot.ansible_configs.get(&id));
    let role = match &change.action {
        ChangeAction::ChangeRole { node_id, role } if *node_id == node.id => *role,
        _ => node.role,
    };

    let mut vars = config.map(|config| config.vars.clone()).unwrap_or_default();
    vars.insert("node_role".into(), role.to_string());
    vars.insert("is_edge".into(), node.is_edge.to_string());
    if let Some(assignment) = change.assignment.as_ref() {
        vars.insert("leader_shards".into(), join_shards(&assignment.leader_shards_of(node.id)));
        vars.insert("follower_shards".into(), join_shards(&assignment.follower_shards_of(node.id)));
    }
    RunnerRequest {
        kind,
        target: RunnerTarget {
            node_id: node.id,
            host: node.host.clone(),
            port: node.port,
            group_name: group.map(|group| group.name.clone()).unwrap_or_default(),
            dc: dc.map(|dc| dc.name.clone()).unwrap_or_default(),
        },
        vars,
        roles: config.map(|config| config.roles.clone()).unwrap_or_default(),
    }
}

fn join_shards(shards: &[ShardId]) -> String {
    shards.iter().map(|shard| shard.to_string()).collect::<Vec<_>>().join(",")
}
