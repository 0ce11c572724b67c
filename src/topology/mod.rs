//! Topology store.
//!
//! ## Overview
//! The store owns the Cluster → DataCenter → Group → Node graph along with tables & ansible
//! configs. Readers load an immutable `TopologySnapshot`; writers run a transaction closure
//! against a private copy of the latest snapshot, the result is verified and then swapped in
//! atomically. A transaction which fails verification leaves no trace.
//!
//! Snapshots are built from persistent maps so copying one for a write is cheap. Commits are
//! serialized by a short commit lock held from copying the latest snapshot until its rows are
//! on disk, so the order of writes on disk is the order of snapshots in memory and a snapshot is
//! only published once it is durable. No I/O other than the sled batch happens under it.
//!
//! Callers which need a read-plan-commit sequence to be serialized, e.g. the controller
//! computing a new shard assignment, take the group's lock from `TopologyStore::lock_group` first.
//! These locks are never held across runner or coordination store I/O.

mod payload;
#[cfg(test)]
mod payload_test;
mod tx;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use arc_swap::ArcSwap;
use im::OrdMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::database::{Database, Tree};
use crate::error::{ShutdownError, ERR_DECODE_ROW, ERR_ITER_FAILURE};
use crate::models::{AnsibleConfig, Cluster, DataCenter, Group, GroupId, Node, NodeId, ShardAssignment, Table};
use crate::utils;

pub use payload::{TableDocument, TopologyDocument};
pub use tx::TopologyTx;

/// The key prefix used for storing clusters.
///
/// NOTE: in order to preserve lexicographical ordering of keys, it is important to always use
/// the `utils::encode_byte_prefix` method.
pub const PREFIX_CLUSTER: &[u8; 1] = b"c";
/// The key prefix used for storing data centers.
pub const PREFIX_DC: &[u8; 1] = b"d";
/// The key prefix used for storing groups.
pub const PREFIX_GROUP: &[u8; 1] = b"g";
/// The key prefix used for storing nodes.
pub const PREFIX_NODE: &[u8; 1] = b"n";
/// The key prefix used for storing tables.
pub const PREFIX_TABLE: &[u8; 1] = b"t";
/// The key prefix used for storing ansible configs.
pub const PREFIX_ANSIBLE_CONFIG: &[u8; 1] = b"a";
/// The key used to store the next entity id.
pub const KEY_NEXT_ID: &[u8; 1] = b"i";

const METRIC_TOPOLOGY_COMMITS: &str = "shardctl_topology_commits";

/// An immutable view of the full topology graph.
#[derive(Clone, Debug, Default)]
pub struct TopologySnapshot {
    pub clusters: OrdMap<u64, Cluster>,
    pub dcs: OrdMap<u64, DataCenter>,
    pub groups: OrdMap<u64, Group>,
    pub nodes: OrdMap<u64, Node>,
    pub tables: OrdMap<u64, Table>,
    pub ansible_configs: OrdMap<u64, AnsibleConfig>,
    pub(crate) next_id: u64,
}

impl TopologySnapshot {
    /// Every node ever added to the given group, deleted nodes included, ascending by id.
    pub fn all_group_nodes(&self, group_id: GroupId) -> Vec<Node> {
        self.nodes.values().filter(|node| node.group_id == group_id).cloned().collect()
    }

    /// The non-deleted nodes of the given group, ascending by id.
    pub fn group_nodes(&self, group_id: GroupId) -> Vec<Node> {
        self.nodes
            .values()
            .filter(|node| node.group_id == group_id && !node.deleted)
            .cloned()
            .collect()
    }

    /// The tables bound to the given group.
    pub fn group_tables(&self, group_id: GroupId) -> Vec<Table> {
        self.tables.values().filter(|table| table.group_id == group_id).cloned().collect()
    }

    /// The current shard assignment of the given group.
    pub fn assignment(&self, group_id: GroupId) -> Option<ShardAssignment> {
        let group = self.groups.get(&group_id)?;
        Some(ShardAssignment::derive(group, &self.group_nodes(group_id)))
    }

    /// Build the published document of all groups.
    pub fn topology_document(&self) -> TopologyDocument {
        TopologyDocument::build(self)
    }

    /// Build the published document of all tables.
    pub fn table_document(&self) -> TableDocument {
        TableDocument::build(self)
    }
}

/// The authoritative store of the topology graph.
#[derive(Clone)]
pub struct TopologyStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    tree: Tree,
    snapshot: ArcSwap<TopologySnapshot>,
    /// Held across copy, verify, persist & swap of every commit.
    commit: std::sync::Mutex<()>,
    locks: Mutex<HashMap<GroupId, Arc<Mutex<()>>>>,
}

impl TopologyStore {
    /// Open the store, recovering the graph from disk.
    pub async fn new(db: &Database) -> Result<Self> {
        let tree = db.get_topology_tree().await?;
        let snapshot = Self::recover(tree.clone()).await?;
        tracing::debug!(
            clusters = snapshot.clusters.len(),
            groups = snapshot.groups.len(),
            nodes = snapshot.nodes.len(),
            "recovered topology graph"
        );
        metrics::register_counter!(METRIC_TOPOLOGY_COMMITS, metrics::Unit::Count, "committed topology transactions");
        Ok(Self {
            inner: Arc::new(StoreInner {
                tree,
                snapshot: ArcSwap::from_pointee(snapshot),
                commit: std::sync::Mutex::new(()),
                locks: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Load the current snapshot.
    pub fn snapshot(&self) -> Arc<TopologySnapshot> {
        self.inner.snapshot.load_full()
    }

    /// Acquire the write lock of the given group.
    pub async fn lock_group(&self, id: GroupId) -> OwnedMutexGuard<()> {
        let lock = self.inner.locks.lock().await.entry(id).or_default().clone();
        lock.lock_owned().await
    }

    pub fn get_group(&self, id: GroupId) -> Option<Group> {
        self.snapshot().groups.get(&id).cloned()
    }

    pub fn get_node(&self, id: NodeId) -> Option<Node> {
        self.snapshot().nodes.get(&id).cloned()
    }

    /// The non-deleted nodes of the given group.
    pub fn list_nodes(&self, group_id: GroupId) -> Vec<Node> {
        self.snapshot().group_nodes(group_id)
    }

    /// Insert or replace a node. A node with id `0` is assigned a fresh id.
    pub async fn upsert_node(&self, node: Node) -> Result<Node> {
        self.transact(|tx| tx.put_new_or_existing_node(node.clone())).await
    }

    /// Soft delete a node, which must no longer hold any shard.
    pub async fn remove_node(&self, id: NodeId) -> Result<()> {
        self.transact(|tx| tx.remove_node(id)).await
    }

    /// Commit a new shard assignment for a group, returning the group's new assignment version.
    #[cfg(test)]
    pub async fn set_shard_assignment(&self, group_id: GroupId, assignment: ShardAssignment) -> Result<u64> {
        self.transact(|tx| tx.set_assignment(group_id, &assignment)).await
    }

    /// Run a transaction against the latest snapshot and verify it, without committing.
    pub fn dry_run<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut TopologyTx) -> Result<R>,
    {
        let mut tx = TopologyTx::new(TopologySnapshot::clone(&self.snapshot()));
        let val = f(&mut tx)?;
        tx.verify()?;
        Ok(val)
    }

    /// Run a transaction against the latest snapshot and commit it.
    pub async fn transact<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut TopologyTx) -> Result<R>,
    {
        let _commit = self.inner.commit.lock().map_err(|_| anyhow!("topology commit lock poisoned"))?;
        let mut tx = TopologyTx::new(TopologySnapshot::clone(&self.snapshot()));
        let val = f(&mut tx)?;
        tx.verify()?;
        let (next, touched) = tx.into_parts();
        if touched.is_empty() {
            return Ok(val);
        }

        let mut batch = sled::Batch::default();
        for key in touched.iter() {
            match key.encode(&next)? {
                (key, Some(row)) => batch.insert(&key, row),
                (key, None) => batch.remove(&key),
            }
        }
        batch.insert(KEY_NEXT_ID, &utils::encode_u64(next.next_id));
        self.inner
            .tree
            .apply_batch(batch)
            .context("error persisting topology transaction")
            .map_err(ShutdownError::from)?;
        self.inner.snapshot.store(Arc::new(next));
        metrics::increment_counter!(METRIC_TOPOLOGY_COMMITS);
        Ok(val)
    }

    /// Recover the topology graph from disk.
    #[tracing::instrument(level = "debug", skip(tree))]
    async fn recover(tree: Tree) -> Result<TopologySnapshot> {
        let snapshot = Database::spawn_blocking(move || -> Result<TopologySnapshot> {
            let mut snapshot = TopologySnapshot::default();
            for kv_res in tree.iter() {
                let (key, val) = kv_res.context(ERR_ITER_FAILURE).map_err(ShutdownError::from)?;
                if key.as_ref() == KEY_NEXT_ID {
                    snapshot.next_id = utils::decode_u64(&val)?;
                    continue;
                }
                let (prefix, id) = match key.split_first() {
                    Some((prefix, id)) => (*prefix, utils::decode_u64(id)?),
                    None => continue,
                };
                let decoded = match prefix {
                    p if p == PREFIX_CLUSTER[0] => utils::decode_model(&val).map(|row| {
                        snapshot.clusters.insert(id, row);
                    }),
                    p if p == PREFIX_DC[0] => utils::decode_model(&val).map(|row| {
                        snapshot.dcs.insert(id, row);
                    }),
                    p if p == PREFIX_GROUP[0] => utils::decode_model(&val).map(|row| {
                        snapshot.groups.insert(id, row);
                    }),
                    p if p == PREFIX_NODE[0] => utils::decode_model(&val).map(|row| {
                        snapshot.nodes.insert(id, row);
                    }),
                    p if p == PREFIX_TABLE[0] => utils::decode_model(&val).map(|row| {
                        snapshot.tables.insert(id, row);
                    }),
                    p if p == PREFIX_ANSIBLE_CONFIG[0] => utils::decode_model(&val).map(|row| {
                        snapshot.ansible_configs.insert(id, row);
                    }),
                    _ => {
                        tracing::warn!(prefix, id, "skipping unknown topology row");
                        Ok(())
                    }
                };
                decoded.context(ERR_DECODE_ROW).map_err(ShutdownError::from)?;
            }
            Ok(snapshot)
        })
        .await??;
        Ok(snapshot)
    }
}
