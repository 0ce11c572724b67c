//! Documents published for the topology & table config domains.

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use super::{TopologySnapshot, TopologyTx};
use crate::error::AppError;
use crate::models::{GroupId, Node, NodeId, NodeRole, ShardAssignment, ShardId, Table};

/// The published view of every cluster's groups and their active nodes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyDocument {
    pub clusters: Vec<ClusterDocument>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterDocument {
    pub name: String,
    pub dcs: Vec<String>,
    pub groups: Vec<GroupDocument>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupDocument {
    pub id: GroupId,
    pub name: String,
    pub dc: String,
    pub shard_count: u32,
    pub replica_factor: u32,
    pub reduce_rate: u32,
    pub nodes: Vec<NodeDocument>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDocument {
    pub id: NodeId,
    pub address: String,
    pub weight: u32,
    pub role: NodeRole,
    pub is_edge: bool,
    pub leader_shards: Vec<ShardId>,
    pub follower_shards: Vec<ShardId>,
}

impl TopologyDocument {
    /// Build the document from a snapshot. Inactive, pending & deleted nodes are left out.
    pub fn build(snapshot: &TopologySnapshot) -> Self {
        let mut clusters: Vec<ClusterDocument> = snapshot
            .clusters
            .values()
            .map(|cluster| {
                let mut dcs: Vec<String> = cluster.dc_ids.iter().filter_map(|id| snapshot.dcs.get(id)).map(|dc| dc.name.clone()).collect();
                dcs.sort();
                let mut groups: Vec<GroupDocument> = snapshot
                    .groups
                    .values()
                    .filter(|group| group.cluster_id == cluster.id)
                    .map(|group| GroupDocument {
                        id: group.id,
                        name: group.name.clone(),
                        dc: snapshot.dcs.get(&group.dc_id).map(|dc| dc.name.clone()).unwrap_or_default(),
                        shard_count: group.shard_count,
                        replica_factor: group.replica_factor,
                        reduce_rate: group.reduce_rate,
                        nodes: snapshot
                            .group_nodes(group.id)
                            .into_iter()
                            .filter(|node| node.is_active())
                            .map(|node| NodeDocument {
                                id: node.id,
                                address: node.address(),
                                weight: node.weight,
                                role: node.role,
                                is_edge: node.is_edge,
                                leader_shards: node.leader_shards,
                                follower_shards: node.follower_shards,
                            })
                            .collect(),
                    })
                    .collect();
                groups.sort_by(|a, b| a.name.cmp(&b.name));
                ClusterDocument { name: cluster.name.clone(), dcs, groups }
            })
            .collect();
        clusters.sort_by(|a, b| a.name.cmp(&b.name));
        Self { clusters }
    }

    /// The shard assignment recorded for each group of this document.
    pub fn assignments(&self) -> BTreeMap<GroupId, ShardAssignment> {
        self.clusters
            .iter()
            .flat_map(|cluster| cluster.groups.iter())
            .map(|group| {
                let lists = group
                    .nodes
                    .iter()
                    .map(|node| (node.id, node.leader_shards.as_slice(), node.follower_shards.as_slice()));
                (group.id, ShardAssignment::from_shard_lists(group.shard_count, lists))
            })
            .collect()
    }
}

/// The published view of every table, grouped by database.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableDocument {
    pub databases: Vec<DatabaseDocument>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseDocument {
    pub name: String,
    pub tables: Vec<TableEntry>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableEntry {
    pub name: String,
    pub group: String,
    pub dc: String,
    pub shard_count: u32,
    pub ttl_seconds: u64,
    pub config_name: Option<String>,
    pub edge_flow_ratio: u32,
    /// Addresses of the edge nodes serving this table.
    pub bind_edge_nodes: Vec<String>,
}

impl TableDocument {
    pub fn build(snapshot: &TopologySnapshot) -> Self {
        let mut databases: BTreeMap<String, Vec<TableEntry>> = BTreeMap::new();
        for table in snapshot.tables.values() {
            let group = snapshot.groups.get(&table.group_id);
            databases.entry(table.database.clone()).or_default().push(TableEntry {
                name: table.name.clone(),
                group: group.map(|group| group.name.clone()).unwrap_or_default(),
                dc: group
                    .and_then(|group| snapshot.dcs.get(&group.dc_id))
                    .map(|dc| dc.name.clone())
                    .unwrap_or_default(),
                shard_count: table.shard_count,
                ttl_seconds: table.ttl_seconds,
                config_name: table.config_name.clone(),
                edge_flow_ratio: table.edge_flow_ratio,
                bind_edge_nodes: table
                    .bind_edge_nodes
                    .iter()
                    .filter_map(|id| snapshot.nodes.get(id))
                    .map(|node| node.address())
                    .collect(),
            });
        }
        let databases = databases
            .into_iter()
            .map(|(name, mut tables)| {
                tables.sort_by(|a, b| a.name.cmp(&b.name));
                DatabaseDocument { name, tables }
            })
            .collect();
        Self { databases }
    }

    /// Rewrite the table rows of a transaction so that they publish as this document.
    ///
    /// Tables are matched by database and name, tables missing from the topology are created.
    /// Fails with `InvariantViolation` when the topology can no longer express the document: a
    /// group or edge node it names is gone, or a table exists which it does not list.
    pub fn restore(&self, tx: &mut TopologyTx) -> Result<()> {
        let mut violations = vec![];
        for database in self.databases.iter() {
            for entry in database.tables.iter() {
                let snapshot = tx.snapshot();
                let group_id = snapshot
                    .groups
                    .values()
                    .find(|group| group.name == entry.group && snapshot.dcs.get(&group.dc_id).map(|dc| dc.name.as_str()) == Some(entry.dc.as_str()))
                    .map(|group| group.id);
                let group_id = match group_id {
                    Some(id) => id,
                    None => {
                        violations.push(format!(
                            "table {}.{} names group {} in data center {} which no longer exists",
                            database.name, entry.name, entry.group, entry.dc
                        ));
                        continue;
                    }
                };
                let mut bind_edge_nodes = Vec::with_capacity(entry.bind_edge_nodes.len());
                for address in entry.bind_edge_nodes.iter() {
                    let candidates: Vec<&Node> = snapshot
                        .nodes
                        .values()
                        .filter(|node| node.group_id == group_id && &node.address() == address)
                        .collect();
                    match candidates.iter().find(|node| !node.deleted).or_else(|| candidates.first()) {
                        Some(node) => bind_edge_nodes.push(node.id),
                        None => violations.push(format!("edge node {} of table {}.{} no longer exists", address, database.name, entry.name)),
                    }
                }
                let existing = snapshot
                    .tables
                    .values()
                    .find(|table| table.database == database.name && table.name == entry.name)
                    .map(|table| table.id);
                let id = match existing {
                    Some(id) => id,
                    None => tx.next_id(),
                };
                tx.put_table(Table {
                    id,
                    database: database.name.clone(),
                    name: entry.name.clone(),
                    group_id,
                    shard_count: entry.shard_count,
                    ttl_seconds: entry.ttl_seconds,
                    config_name: entry.config_name.clone(),
                    edge_flow_ratio: entry.edge_flow_ratio,
                    bind_edge_nodes,
                });
            }
        }
        for table in tx.snapshot().tables.values() {
            if !self.lists(&table.database, &table.name) {
                violations.push(format!("table {}.{} was created after this version and cannot be rolled back", table.database, table.name));
            }
        }
        if violations.is_empty() && &Self::build(tx.snapshot()) != self {
            violations.push("the restored tables do not reproduce the target version".into());
        }
        if !violations.is_empty() {
            bail!(AppError::InvariantViolation(violations));
        }
        Ok(())
    }

    fn lists(&self, database: &str, name: &str) -> bool {
        self.databases
            .iter()
            .any(|db| db.name == database && db.tables.iter().any(|entry| entry.name == name))
    }
}
