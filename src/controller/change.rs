use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::models::{
    AssignmentDelta, ClusterId, ConfigDomain, DcId, GroupId, NodeId, NodeRole, Operation, OperationId, ShardAssignment, UnderReplicated,
};

/// The topology effect an operation applies once it succeeds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ChangeAction {
    /// Activate a pending node.
    AddNode { node_id: NodeId },
    /// Soft delete a node.
    RemoveNode { node_id: NodeId },
    ChangeRole { node_id: NodeId, role: NodeRole },
    /// Commit a manually supplied assignment.
    Reassign,
    /// Nothing to commit.
    Restart,
}

/// A topology change waiting on its operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PendingChange {
    pub operation_id: OperationId,
    pub group_id: GroupId,
    pub action: ChangeAction,
    /// The assignment to commit, `None` for changes which leave placement untouched.
    pub assignment: Option<ShardAssignment>,
    pub delta: Option<AssignmentDelta>,
    /// Set once the operation succeeded but the group moved past `delta.base_version`.
    pub stale: bool,
}

/// A config version published by a mutation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Publication {
    pub domain: ConfigDomain,
    pub version: u64,
    pub synced: bool,
    pub sync_error: Option<String>,
}

/// The committed result of a mutation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MutationOutcome {
    pub group_id: Option<GroupId>,
    /// The group's assignment version after the commit.
    pub assignment_version: Option<u64>,
    pub under_replicated: Vec<UnderReplicated>,
    pub published: Vec<Publication>,
}

/// The result of a mutation request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChangeHandle {
    /// The change needs runner work, poll the operation to see it through.
    Submitted { operation: Operation, change: PendingChange },
    /// The change was purely logical and is already committed.
    Applied { outcome: MutationOutcome },
}

/// The state of an operation and of its topology change.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct OperationReport {
    pub operation: Operation,
    /// The change still waiting on this operation, or left stale by it.
    pub change: Option<PendingChange>,
    /// Set by the poll which committed the change.
    pub outcome: Option<MutationOutcome>,
    /// Set by the poll which failed to commit the change.
    pub error: Option<String>,
    /// The kind of `error`, e.g. `StaleDelta`.
    pub error_kind: Option<&'static str>,
}

/// The outcome for one node of a batch request.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BatchItem {
    pub node: String,
    pub handle: Option<ChangeHandle>,
    pub error: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct NewGroup {
    pub name: String,
    pub cluster_id: ClusterId,
    pub dc_id: DcId,
    pub shard_count: u32,
    pub replica_factor: u32,
    #[serde(default)]
    pub reduce_rate: u32,
}

/// Changes to a group's settings, absent fields are left as they are.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct GroupSettings {
    pub shard_count: Option<u32>,
    pub replica_factor: Option<u32>,
    pub reduce_rate: Option<u32>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct NewNode {
    pub group_id: GroupId,
    pub host: String,
    pub port: u16,
    pub weight: u32,
    pub role: NodeRole,
    #[serde(default)]
    pub is_edge: bool,
    #[serde(default)]
    pub ansible_config_id: Option<u64>,
    #[serde(default)]
    pub config_id: Option<u64>,
    #[serde(default)]
    pub description: String,
}

impl NewNode {
    /// The `host:port` address the node will claim.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct NewAnsibleConfig {
    pub name: String,
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
    #[serde(default)]
    pub roles: Vec<String>,
}
