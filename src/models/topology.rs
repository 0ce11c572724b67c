use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use super::{AnsibleConfigId, ClusterId, DcId, GroupId, NodeId, ShardId, TableId};

/// A named cluster spanning one or more data centers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cluster {
    pub id: ClusterId,
    pub name: String,
    #[serde(default)]
    pub dc_ids: BTreeSet<DcId>,
}

/// A data center belonging to exactly one cluster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataCenter {
    pub id: DcId,
    pub name: String,
    pub cluster_id: ClusterId,
}

/// A set of nodes collectively responsible for every shard of one dataset.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub cluster_id: ClusterId,
    pub dc_id: DcId,
    /// Shards of this group are identified by ids in `[0, shard_count)`.
    pub shard_count: u32,
    /// The total number of copies of each shard, leader included.
    pub replica_factor: u32,
    /// Traffic throttling ratio as a percentage.
    pub reduce_rate: u32,
    /// Incremented on every committed shard assignment of this group.
    #[serde(default)]
    pub assignment_version: u64,
}

/// The role a node is configured to hold within its group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Leader,
    Follower,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Leader => write!(f, "leader"),
            Self::Follower => write!(f, "follower"),
        }
    }
}

/// The lifecycle status of a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Active,
    Inactive,
    /// Created, but not yet provisioned.
    Pending,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Inactive => write!(f, "inactive"),
            Self::Pending => write!(f, "pending"),
        }
    }
}

/// A physical storage node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub group_id: GroupId,
    pub host: String,
    pub port: u16,
    pub weight: u32,
    pub role: NodeRole,
    pub status: NodeStatus,
    /// Shards this node currently leads, ascending.
    #[serde(default)]
    pub leader_shards: Vec<ShardId>,
    /// Shards this node currently follows, ascending.
    #[serde(default)]
    pub follower_shards: Vec<ShardId>,
    #[serde(default)]
    pub is_edge: bool,
    #[serde(default)]
    pub ansible_config_id: Option<AnsibleConfigId>,
    #[serde(default)]
    pub config_id: Option<u64>,
    #[serde(default)]
    pub description: String,
    /// Soft deletion marker; deleted nodes are kept for audit only.
    #[serde(default)]
    pub deleted: bool,
}

impl Node {
    /// The `host:port` address of this node.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Whether this node currently holds any shard.
    pub fn holds_shards(&self) -> bool {
        !self.leader_shards.is_empty() || !self.follower_shards.is_empty()
    }

    /// Whether this node is active and may therefore hold shards.
    pub fn is_active(&self) -> bool {
        !self.deleted && self.status == NodeStatus::Active
    }

    /// Whether this node occupies its address, which is the case unless deleted or inactive.
    pub fn claims_address(&self) -> bool {
        !self.deleted && self.status != NodeStatus::Inactive
    }

    /// Whether this node may be given the leader role for shards.
    pub fn is_leader_capable(&self) -> bool {
        self.role == NodeRole::Leader && !self.is_edge
    }
}

/// A parameter template used to drive the automation runner.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnsibleConfig {
    pub id: AnsibleConfigId,
    pub name: String,
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

/// A table whose data is partitioned across the shards of one group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    pub id: TableId,
    pub database: String,
    pub name: String,
    pub group_id: GroupId,
    pub shard_count: u32,
    #[serde(default)]
    pub ttl_seconds: u64,
    #[serde(default)]
    pub config_name: Option<String>,
    /// Percentage of this table's traffic routed to edge nodes.
    #[serde(default)]
    pub edge_flow_ratio: u32,
    /// Edge nodes serving this table.
    #[serde(default)]
    pub bind_edge_nodes: Vec<NodeId>,
}
