use std::collections::BTreeSet;

use anyhow::{bail, Result};

use super::{TopologySnapshot, PREFIX_ANSIBLE_CONFIG, PREFIX_CLUSTER, PREFIX_DC, PREFIX_GROUP, PREFIX_NODE, PREFIX_TABLE};
use crate::assignment;
use crate::error::AppError;
use crate::models::{AnsibleConfig, Cluster, DataCenter, Group, GroupId, Node, NodeId, ShardAssignment, Table};
use crate::utils;
use crate::validator::{self, Violations};

/// A stored row touched by a transaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub(super) enum RowKey {
    Cluster(u64),
    Dc(u64),
    Group(u64),
    Node(u64),
    Table(u64),
    AnsibleConfig(u64),
}

impl RowKey {
    /// Encode the storage key of this row along with its current value, `None` if absent.
    pub(super) fn encode(&self, snapshot: &TopologySnapshot) -> Result<([u8; 9], Option<Vec<u8>>)> {
        Ok(match self {
            Self::Cluster(id) => (utils::encode_byte_prefix(PREFIX_CLUSTER, *id), snapshot.clusters.get(id).map(utils::encode_model).transpose()?),
            Self::Dc(id) => (utils::encode_byte_prefix(PREFIX_DC, *id), snapshot.dcs.get(id).map(utils::encode_model).transpose()?),
            Self::Group(id) => (utils::encode_byte_prefix(PREFIX_GROUP, *id), snapshot.groups.get(id).map(utils::encode_model).transpose()?),
            Self::Node(id) => (utils::encode_byte_prefix(PREFIX_NODE, *id), snapshot.nodes.get(id).map(utils::encode_model).transpose()?),
            Self::Table(id) => (utils::encode_byte_prefix(PREFIX_TABLE, *id), snapshot.tables.get(id).map(utils::encode_model).transpose()?),
            Self::AnsibleConfig(id) => (
                utils::encode_byte_prefix(PREFIX_ANSIBLE_CONFIG, *id),
                snapshot.ansible_configs.get(id).map(utils::encode_model).transpose()?,
            ),
        })
    }
}

/// A pending topology mutation.
///
/// Every mutation records the rows it touched, `verify` then re-checks every invariant which
/// those rows participate in.
pub struct TopologyTx {
    snapshot: TopologySnapshot,
    touched: BTreeSet<RowKey>,
}

impl TopologyTx {
    pub(super) fn new(snapshot: TopologySnapshot) -> Self {
        Self { snapshot, touched: BTreeSet::new() }
    }

    pub(super) fn into_parts(self) -> (TopologySnapshot, Vec<RowKey>) {
        (self.snapshot, self.touched.into_iter().collect())
    }

    /// The state of the graph including this transaction's changes.
    pub fn snapshot(&self) -> &TopologySnapshot {
        &self.snapshot
    }

    /// Allocate a fresh entity id.
    pub fn next_id(&mut self) -> u64 {
        self.snapshot.next_id += 1;
        self.snapshot.next_id
    }

    pub fn group(&self, id: GroupId) -> Result<Group> {
        match self.snapshot.groups.get(&id) {
            Some(group) => Ok(group.clone()),
            None => bail!(AppError::ResourceNotFound(format!("group {}", id))),
        }
    }

    pub fn node(&self, id: NodeId) -> Result<Node> {
        match self.snapshot.nodes.get(&id) {
            Some(node) if !node.deleted => Ok(node.clone()),
            _ => bail!(AppError::ResourceNotFound(format!("node {}", id))),
        }
    }

    pub fn put_cluster(&mut self, cluster: Cluster) {
        self.touched.insert(RowKey::Cluster(cluster.id));
        self.snapshot.clusters.insert(cluster.id, cluster);
    }

    pub fn put_dc(&mut self, dc: DataCenter) {
        self.touched.insert(RowKey::Dc(dc.id));
        self.snapshot.dcs.insert(dc.id, dc);
    }

    pub fn put_group(&mut self, group: Group) {
        self.touched.insert(RowKey::Group(group.id));
        self.snapshot.groups.insert(group.id, group);
    }

    pub fn put_node(&mut self, node: Node) {
        self.touched.insert(RowKey::Node(node.id));
        self.touched.insert(RowKey::Group(node.group_id));
        self.snapshot.nodes.insert(node.id, node);
    }

    pub fn put_table(&mut self, table: Table) {
        self.touched.insert(RowKey::Table(table.id));
        self.snapshot.tables.insert(table.id, table);
    }

    pub fn put_ansible_config(&mut self, config: AnsibleConfig) {
        self.touched.insert(RowKey::AnsibleConfig(config.id));
        self.snapshot.ansible_configs.insert(config.id, config);
    }

    /// Insert a node, allocating an id if it has none, or replace an existing one.
    ///
    /// A replaced node keeps its current shard lists, these only change through `set_assignment`.
    pub fn put_new_or_existing_node(&mut self, mut node: Node) -> Result<Node> {
        if node.id == 0 {
            node.id = self.next_id();
            node.leader_shards.clear();
            node.follower_shards.clear();
        } else {
            let existing = self.node(node.id)?;
            if existing.group_id != node.group_id {
                bail!(AppError::InvalidInput(format!("node {} cannot move between groups", node.id)));
            }
            node.leader_shards = existing.leader_shards;
            node.follower_shards = existing.follower_shards;
        }
        self.put_node(node.clone());
        Ok(node)
    }

    /// Soft delete a node.
    pub fn remove_node(&mut self, id: NodeId) -> Result<()> {
        let mut node = self.node(id)?;
        if node.holds_shards() {
            bail!(AppError::InvariantViolation(vec![format!(
                "node {} still holds leader shards {:?} and follower shards {:?}",
                id, node.leader_shards, node.follower_shards
            )]));
        }
        node.deleted = true;
        self.put_node(node);
        Ok(())
    }

    /// Fail with `StaleDelta` unless the group is at the expected assignment version.
    pub fn expect_version(&self, group_id: GroupId, expected: u64) -> Result<()> {
        let group = self.group(group_id)?;
        if group.assignment_version != expected {
            bail!(AppError::StaleDelta { group_id, expected, found: group.assignment_version });
        }
        Ok(())
    }

    /// Rewrite the shard lists of a group's nodes to match the given assignment.
    ///
    /// The assignment is validated against the group's active nodes as they stand in this
    /// transaction. Returns the group's new assignment version.
    pub fn set_assignment(&mut self, group_id: GroupId, assignment: &ShardAssignment) -> Result<u64> {
        let mut group = self.group(group_id)?;
        let members = self.snapshot.group_nodes(group_id);
        assignment::validate_assignment(&group, &members, assignment)?;
        for mut node in members {
            let (leaders, followers) = (assignment.leader_shards_of(node.id), assignment.follower_shards_of(node.id));
            if node.leader_shards != leaders || node.follower_shards != followers {
                node.leader_shards = leaders;
                node.follower_shards = followers;
                self.put_node(node);
            }
        }
        group.assignment_version += 1;
        let version = group.assignment_version;
        self.put_group(group);
        Ok(version)
    }

    /// Verify every invariant touched by this transaction.
    pub(super) fn verify(&self) -> Result<()> {
        let mut violations = Violations::new();
        let snapshot = &self.snapshot;
        let mut groups = BTreeSet::new();
        for key in self.touched.iter() {
            match key {
                RowKey::Cluster(id) => {
                    if let Some(cluster) = snapshot.clusters.get(id) {
                        if snapshot.clusters.values().any(|other| other.id != cluster.id && other.name == cluster.name) {
                            violations.push(format!("cluster name {} is already in use", cluster.name));
                        }
                    }
                }
                RowKey::Dc(id) => {
                    if let Some(dc) = snapshot.dcs.get(id) {
                        if !snapshot.clusters.contains_key(&dc.cluster_id) {
                            violations.push(format!("data center {} references unknown cluster {}", dc.name, dc.cluster_id));
                        }
                        if snapshot.dcs.values().any(|other| other.id != dc.id && other.cluster_id == dc.cluster_id && other.name == dc.name) {
                            violations.push(format!("data center name {} is already in use in cluster {}", dc.name, dc.cluster_id));
                        }
                    }
                }
                RowKey::Group(id) => {
                    groups.insert(*id);
                }
                RowKey::Node(id) => {
                    if let Some(node) = snapshot.nodes.get(id) {
                        self.verify_node(node, &mut violations);
                    }
                }
                RowKey::Table(id) => {
                    if let Some(table) = snapshot.tables.get(id) {
                        if snapshot
                            .tables
                            .values()
                            .any(|other| other.id != table.id && other.database == table.database && other.name == table.name)
                        {
                            violations.push(format!("table {}.{} already exists", table.database, table.name));
                        }
                        if snapshot.groups.contains_key(&table.group_id) {
                            groups.insert(table.group_id);
                        } else {
                            violations.push(format!("table {}.{} references unknown group {}", table.database, table.name, table.group_id));
                        }
                    }
                }
                RowKey::AnsibleConfig(id) => {
                    if let Some(config) = snapshot.ansible_configs.get(id) {
                        if snapshot.ansible_configs.values().any(|other| other.id != config.id && other.name == config.name) {
                            violations.push(format!("ansible config name {} is already in use", config.name));
                        }
                    }
                }
            }
        }
        for id in groups {
            self.verify_group(id, &mut violations);
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(validator::into_error(violations))
        }
    }

    fn verify_node(&self, node: &Node, violations: &mut Violations) {
        let snapshot = &self.snapshot;
        if !snapshot.groups.contains_key(&node.group_id) {
            violations.push(format!("node {} references unknown group {}", node.id, node.group_id));
        }
        if let Some(config) = node.ansible_config_id {
            if !snapshot.ansible_configs.contains_key(&config) {
                violations.push(format!("node {} references unknown ansible config {}", node.id, config));
            }
        }
        if node.host.is_empty() || node.port == 0 {
            violations.push(format!("node {} must have a host and a non-zero port", node.id));
        }
        if node.is_edge && node.role == crate::models::NodeRole::Leader {
            violations.push(format!("edge node {} cannot take the leader role", node.id));
        }
        if node.claims_address()
            && snapshot
                .nodes
                .values()
                .any(|other| other.id != node.id && other.claims_address() && other.host == node.host && other.port == node.port)
        {
            violations.push(format!("address {} is already in use by another node", node.address()));
        }
    }

    fn verify_group(&self, id: GroupId, violations: &mut Violations) {
        let snapshot = &self.snapshot;
        let group = match snapshot.groups.get(&id) {
            Some(group) => group,
            None => return,
        };
        match snapshot.dcs.get(&group.dc_id) {
            Some(dc) if dc.cluster_id == group.cluster_id => (),
            Some(dc) => violations.push(format!("group {} data center {} belongs to cluster {}", group.name, dc.id, dc.cluster_id)),
            None => violations.push(format!("group {} references unknown data center {}", group.name, group.dc_id)),
        }
        if snapshot
            .groups
            .values()
            .any(|other| other.id != group.id && other.cluster_id == group.cluster_id && other.name == group.name)
        {
            violations.push(format!("group name {} is already in use in cluster {}", group.name, group.cluster_id));
        }

        let members = snapshot.all_group_nodes(id);
        let assignment = ShardAssignment::derive(group, &members);
        if let Err(found) = validator::check_group_invariants(group, &members, &assignment) {
            violations.extend(found);
        }
        for table in snapshot.group_tables(id) {
            if let Err(found) = validator::check_table_shard_bounds(&table, group) {
                violations.extend(found);
            }
            for node in table.bind_edge_nodes.iter() {
                match snapshot.nodes.get(node) {
                    Some(node) if node.group_id == id && node.is_edge && !node.deleted => (),
                    _ => violations.push(format!("table {}.{} binds node {} which is not an edge node of group {}", table.database, table.name, node, id)),
                }
            }
        }
    }
}
