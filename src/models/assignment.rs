use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::{Group, GroupId, Node, NodeId, ShardId};

/// The placement of a single shard.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardSlot {
    pub leader: NodeId,
    /// Followers in replication order.
    #[serde(default)]
    pub followers: Vec<NodeId>,
}

/// A mapping of shard id to its placement within one group.
///
/// This is a view derived from the shard lists of a group's nodes, it is never stored on its own.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardAssignment {
    pub shard_count: u32,
    pub slots: BTreeMap<ShardId, ShardSlot>,
}

impl ShardAssignment {
    /// An assignment with no placed shards.
    pub fn empty(shard_count: u32) -> Self {
        Self { shard_count, slots: BTreeMap::new() }
    }

    /// Derive the assignment of a group from the shard lists of its nodes.
    ///
    /// Deleted nodes and nodes of other groups are ignored.
    pub fn derive(group: &Group, nodes: &[Node]) -> Self {
        let members = nodes
            .iter()
            .filter(|node| node.group_id == group.id && !node.deleted)
            .map(|node| (node.id, node.leader_shards.as_slice(), node.follower_shards.as_slice()));
        Self::from_shard_lists(group.shard_count, members)
    }

    /// Build an assignment from per-node `(id, leader shards, follower shards)` lists.
    ///
    /// Followers are ordered by their position in the node-id ring starting just after the
    /// shard's leader. Followers of a shard without a leader are not representable and are
    /// dropped.
    pub fn from_shard_lists<'a, I>(shard_count: u32, lists: I) -> Self
    where
        I: IntoIterator<Item = (NodeId, &'a [ShardId], &'a [ShardId])>,
    {
        let mut members: Vec<(NodeId, &'a [ShardId], &'a [ShardId])> = lists.into_iter().collect();
        members.sort_by_key(|(id, _, _)| *id);
        let ring: Vec<NodeId> = members.iter().map(|(id, _, _)| *id).collect();

        let mut slots: BTreeMap<ShardId, ShardSlot> = BTreeMap::new();
        for (id, leaders, _) in members.iter() {
            for shard in leaders.iter() {
                slots.insert(*shard, ShardSlot { leader: *id, followers: vec![] });
            }
        }
        for (id, _, followers) in members.iter() {
            for shard in followers.iter() {
                if let Some(slot) = slots.get_mut(shard) {
                    slot.followers.push(*id);
                }
            }
        }
        for slot in slots.values_mut() {
            let start = ring.iter().position(|id| *id == slot.leader).unwrap_or(0);
            slot.followers.sort_by_key(|follower| {
                let idx = ring.iter().position(|id| id == follower).unwrap_or(0);
                (idx + ring.len() - start) % ring.len().max(1)
            });
        }
        Self { shard_count, slots }
    }

    /// Whether no shard is placed.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// The shards led by the given node, ascending.
    pub fn leader_shards_of(&self, node: NodeId) -> Vec<ShardId> {
        self.slots.iter().filter(|(_, slot)| slot.leader == node).map(|(shard, _)| *shard).collect()
    }

    /// The shards followed by the given node, ascending.
    pub fn follower_shards_of(&self, node: NodeId) -> Vec<ShardId> {
        self.slots
            .iter()
            .filter(|(_, slot)| slot.followers.contains(&node))
            .map(|(shard, _)| *shard)
            .collect()
    }
}

/// A change to the placement of a single shard.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardChange {
    pub shard_id: ShardId,
    pub before: Option<ShardSlot>,
    pub after: Option<ShardSlot>,
}

/// The minimal set of shard placement changes between two assignments of a group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentDelta {
    pub group_id: GroupId,
    /// The group assignment version this delta was computed against.
    pub base_version: u64,
    pub changes: Vec<ShardChange>,
}

impl AssignmentDelta {
    /// Compute the delta between two assignments.
    pub fn between(group_id: GroupId, base_version: u64, before: &ShardAssignment, after: &ShardAssignment) -> Self {
        let shards: BTreeSet<ShardId> = before.slots.keys().chain(after.slots.keys()).copied().collect();
        let changes = shards
            .into_iter()
            .filter_map(|shard_id| {
                let (old, new) = (before.slots.get(&shard_id), after.slots.get(&shard_id));
                if old == new {
                    return None;
                }
                Some(ShardChange { shard_id, before: old.cloned(), after: new.cloned() })
            })
            .collect();
        Self { group_id, base_version, changes }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// The nodes whose leader or follower shard sets are altered by this delta.
    pub fn affected_nodes(&self) -> BTreeSet<NodeId> {
        let mut nodes = BTreeSet::new();
        for change in self.changes.iter() {
            let candidates = change
                .before
                .iter()
                .chain(change.after.iter())
                .flat_map(|slot| std::iter::once(slot.leader).chain(slot.followers.iter().copied()));
            for node in candidates {
                if role_in(change.before.as_ref(), node) != role_in(change.after.as_ref(), node) {
                    nodes.insert(node);
                }
            }
        }
        nodes
    }
}

/// `Some(true)` if leader, `Some(false)` if follower, `None` if absent.
fn role_in(slot: Option<&ShardSlot>, node: NodeId) -> Option<bool> {
    let slot = slot?;
    if slot.leader == node {
        Some(true)
    } else if slot.followers.contains(&node) {
        Some(false)
    } else {
        None
    }
}

/// A shard which received fewer followers than its group's replica factor calls for.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnderReplicated {
    pub shard_id: ShardId,
    pub wanted: u32,
    pub assigned: u32,
}
