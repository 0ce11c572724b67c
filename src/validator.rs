//! Consistency validation.
//!
//! Pure checks run before every topology commit. Each check returns the full list of violated
//! invariants so that callers can report every problem of a rejected mutation at once.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use serde_json::Value;

use crate::error::AppError;
use crate::models::{ConfigDomain, DiffEntry, Group, GroupId, Node, NodeId, ShardAssignment, ShardId, Table, UnderReplicated, VersionedPayload};
use crate::versions;

/// Descriptions of violated invariants.
pub type Violations = Vec<String>;

/// The upper bound of a reduce-rate or edge-flow percentage.
pub const MAX_RATIO: u32 = 100;

/// Convert a set of violations into the corresponding application error.
pub fn into_error(violations: Violations) -> anyhow::Error {
    anyhow::Error::from(AppError::InvariantViolation(violations))
}

/// Check that a group's reduce-rate is a valid percentage.
pub fn check_reduce_rate(group: &Group) -> Result<(), Violations> {
    if group.reduce_rate > MAX_RATIO {
        return Err(vec![format!(
            "group {} reduce-rate {} is outside of [0, {}]",
            group.id, group.reduce_rate, MAX_RATIO
        )]);
    }
    Ok(())
}

/// Check every invariant binding a group, its node roster and its shard assignment.
pub fn check_group_invariants(group: &Group, nodes: &[Node], assignment: &ShardAssignment) -> Result<(), Violations> {
    let mut violations = check_reduce_rate(group).err().unwrap_or_default();
    if group.replica_factor == 0 {
        violations.push(format!("group {} replica-factor must be at least 1", group.id));
    }

    let mut leaders: BTreeMap<ShardId, Vec<NodeId>> = BTreeMap::new();
    let mut any_held = false;
    for node in nodes.iter() {
        if node.group_id != group.id {
            violations.push(format!("node {} does not belong to group {}", node.id, group.id));
            continue;
        }
        if node.holds_shards() {
            any_held = true;
            if !node.is_active() {
                violations.push(format!("node {} is {} but still holds shards", node.id, node.status));
            }
        }
        if node.is_edge && !node.leader_shards.is_empty() {
            violations.push(format!("edge node {} cannot lead shards", node.id));
        }
        let mut seen = BTreeSet::new();
        for shard in node.leader_shards.iter().chain(node.follower_shards.iter()) {
            if *shard >= group.shard_count {
                violations.push(format!(
                    "node {} references shard {} outside of group range [0, {})",
                    node.id, shard, group.shard_count
                ));
            }
            if !seen.insert(*shard) {
                violations.push(format!("node {} holds shard {} more than once", node.id, shard));
            }
        }
        for shard in node.leader_shards.iter() {
            leaders.entry(*shard).or_default().push(node.id);
        }
    }
    for (shard, holders) in leaders.iter().filter(|(_, holders)| holders.len() > 1) {
        violations.push(format!("shard {} has {} leaders {:?}", shard, holders.len(), holders));
    }

    let active: BTreeSet<NodeId> = nodes.iter().filter(|node| node.group_id == group.id && node.is_active()).map(|node| node.id).collect();
    let max_followers = group.replica_factor.saturating_sub(1) as usize;
    for (shard, slot) in assignment.slots.iter() {
        if *shard >= group.shard_count {
            violations.push(format!("assignment places shard {} outside of group range [0, {})", shard, group.shard_count));
        }
        if slot.followers.len() > max_followers {
            violations.push(format!(
                "shard {} has {} followers, replica-factor {} allows at most {}",
                shard,
                slot.followers.len(),
                group.replica_factor,
                max_followers
            ));
        }
        let distinct: BTreeSet<NodeId> = slot.followers.iter().copied().collect();
        if distinct.len() != slot.followers.len() || distinct.contains(&slot.leader) {
            violations.push(format!("shard {} repeats a node across its leader and followers", shard));
        }
        for node in std::iter::once(&slot.leader).chain(slot.followers.iter()) {
            if !active.contains(node) {
                violations.push(format!("shard {} is placed on node {} which is not an active member of group {}", shard, node, group.id));
            }
        }
    }

    if any_held || !assignment.is_empty() {
        let missing: Vec<ShardId> = (0..group.shard_count).filter(|shard| !assignment.slots.contains_key(shard)).collect();
        if !missing.is_empty() {
            violations.push(format!("shards {:?} of group {} have no leader", missing, group.id));
        }
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(violations)
    }
}

/// Check that a table's declared shard count fits the group it is bound to.
pub fn check_table_shard_bounds(table: &Table, group: &Group) -> Result<(), Violations> {
    let mut violations = vec![];
    if table.group_id != group.id {
        violations.push(format!("table {}.{} is bound to group {}, not group {}", table.database, table.name, table.group_id, group.id));
    }
    if table.shard_count == 0 || table.shard_count > group.shard_count {
        violations.push(format!(
            "table {}.{} shard count {} is outside of [1, {}] for group {}",
            table.database, table.name, table.shard_count, group.shard_count, group.id
        ));
    }
    if table.edge_flow_ratio > MAX_RATIO {
        violations.push(format!(
            "table {}.{} edge flow ratio {} is outside of [0, {}]",
            table.database, table.name, table.edge_flow_ratio, MAX_RATIO
        ));
    }
    if violations.is_empty() {
        Ok(())
    } else {
        Err(violations)
    }
}

/// A report on whether a group can serve all of its shards.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct GroupReadiness {
    pub group_id: GroupId,
    pub ready: bool,
    pub missing_leaders: Vec<ShardId>,
    pub duplicate_leaders: Vec<ShardId>,
    pub inactive_holders: Vec<NodeId>,
    pub under_replicated: Vec<UnderReplicated>,
}

/// Report the readiness of a group from the shard lists of its nodes.
///
/// A group is ready when each of its shards has exactly one leader and no shard is held by a
/// node which is not active. Under-replication is reported but does not block readiness.
pub fn check_group_ready(group: &Group, nodes: &[Node]) -> GroupReadiness {
    let members: Vec<&Node> = nodes.iter().filter(|node| node.group_id == group.id && !node.deleted).collect();
    let mut leader_counts: BTreeMap<ShardId, usize> = BTreeMap::new();
    let mut follower_counts: BTreeMap<ShardId, u32> = BTreeMap::new();
    let mut inactive_holders = vec![];
    for node in members.iter() {
        if node.holds_shards() && !node.is_active() {
            inactive_holders.push(node.id);
        }
        for shard in node.leader_shards.iter() {
            *leader_counts.entry(*shard).or_default() += 1;
        }
        for shard in node.follower_shards.iter() {
            *follower_counts.entry(*shard).or_default() += 1;
        }
    }

    let missing_leaders: Vec<ShardId> = (0..group.shard_count).filter(|shard| !leader_counts.contains_key(shard)).collect();
    let duplicate_leaders: Vec<ShardId> = leader_counts.iter().filter(|(_, count)| **count > 1).map(|(shard, _)| *shard).collect();
    let wanted = group.replica_factor.saturating_sub(1);
    let under_replicated = (0..group.shard_count)
        .filter_map(|shard| {
            let assigned = follower_counts.get(&shard).copied().unwrap_or(0);
            (assigned < wanted).then(|| UnderReplicated { shard_id: shard, wanted, assigned })
        })
        .collect();
    GroupReadiness {
        group_id: group.id,
        ready: missing_leaders.is_empty() && duplicate_leaders.is_empty() && inactive_holders.is_empty(),
        missing_leaders,
        duplicate_leaders,
        inactive_holders,
        under_replicated,
    }
}

/// A comparison of the config a domain should publish with the config the store holds.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ConfigDrift {
    pub domain: ConfigDomain,
    pub in_sync: bool,
    /// The version held by the coordination store, `None` if nothing was ever published.
    pub published_version: Option<u64>,
    /// Differences from the published payload to the expected one.
    pub differences: Vec<DiffEntry>,
}

/// Compare an expected payload with the published one. Nothing published compares as `null`.
pub fn check_config_drift(domain: ConfigDomain, expected: &Value, published: Option<&VersionedPayload>) -> ConfigDrift {
    let differences = versions::diff_payloads(published.map(|p| &p.payload).unwrap_or(&Value::Null), expected);
    ConfigDrift {
        domain,
        in_sync: differences.is_empty(),
        published_version: published.map(|p| p.version),
        differences,
    }
}
