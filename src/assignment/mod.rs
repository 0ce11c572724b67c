//! Shard assignment engine.
//!
//! ## Overview
//! The engine computes the leader/follower placement of every shard of a group from the group's
//! active node roster. Planning is deterministic for a given roster and prior assignment.
//!
//! Leaders. Each active, leader-capable node with a positive weight receives a quota of
//! `floor(S * weight / total_weight)` leader slots; the slots left over are handed out one each
//! by descending remainder, ties broken by ascending node id. Shards already led by a node are
//! kept by that node up to its quota. Orphaned shards are then filled in ascending order into
//! the nodes with free quota, walked by ascending node id. For a fresh group this yields
//! contiguous blocks, e.g. `S = 4` over weights `[2, 1]` leads `{0, 1, 2}` and `{3}`.
//!
//! Followers. Existing followers of a shard are kept while they remain active and distinct from
//! the new leader. Remaining follower slots are filled by walking the node-id ring starting just
//! after the leader, skipping nodes which already hold the shard, until `R - 1` followers are
//! found or the ring is exhausted. A shortfall is reported, it is not an error.
//!
//! The resulting `AssignmentDelta` only lists shards whose placement actually changed.

#[cfg(test)]
mod mod_test;
pub mod table;

use std::collections::{BTreeMap, BTreeSet};

use anyhow::{bail, Result};
use serde::Serialize;

use crate::error::AppError;
use crate::models::{AssignmentDelta, Group, Node, NodeId, ShardAssignment, ShardId, ShardSlot, UnderReplicated};

/// The output of planning a group's assignment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AssignmentPlan {
    pub assignment: ShardAssignment,
    pub delta: AssignmentDelta,
    pub under_replicated: Vec<UnderReplicated>,
}

/// Plan the assignment of the given group over the active members of `roster`.
///
/// `current` is the assignment the plan is diffed against and which the plan tries to preserve.
#[tracing::instrument(level = "trace", skip(group, roster, current), fields(group = group.id))]
pub fn plan(group: &Group, roster: &[Node], current: &ShardAssignment) -> Result<AssignmentPlan> {
    let mut active: Vec<&Node> = roster.iter().filter(|node| node.group_id == group.id && node.is_active()).collect();
    active.sort_by_key(|node| node.id);

    let mut assignment = ShardAssignment::empty(group.shard_count);
    let mut under_replicated = vec![];
    if !active.is_empty() && group.shard_count > 0 {
        let leaders = place_leaders(group, &active, current)?;
        let ring: Vec<NodeId> = active.iter().map(|node| node.id).collect();
        let wanted = group.replica_factor.saturating_sub(1);
        for (shard, leader) in leaders {
            let previous = current.slots.get(&shard).map(|slot| slot.followers.as_slice()).unwrap_or(&[]);
            let followers = place_followers(&ring, leader, previous, wanted as usize);
            if (followers.len() as u32) < wanted {
                under_replicated.push(UnderReplicated { shard_id: shard, wanted, assigned: followers.len() as u32 });
            }
            assignment.slots.insert(shard, ShardSlot { leader, followers });
        }
    }

    validate_assignment(group, roster, &assignment)?;
    let delta = AssignmentDelta::between(group.id, group.assignment_version, current, &assignment);
    Ok(AssignmentPlan { assignment, delta, under_replicated })
}

/// Validate an assignment of the given group against the active members of `roster`.
///
/// An empty assignment is valid only for a group without active members.
pub fn validate_assignment(group: &Group, roster: &[Node], assignment: &ShardAssignment) -> Result<()> {
    let active: BTreeMap<NodeId, &Node> = roster
        .iter()
        .filter(|node| node.group_id == group.id && node.is_active())
        .map(|node| (node.id, node))
        .collect();
    if let Some(shard) = assignment.slots.keys().find(|shard| **shard >= group.shard_count) {
        bail!(invalid(*shard, format!("shard is outside of group range [0, {})", group.shard_count)));
    }
    if assignment.is_empty() && active.is_empty() {
        return Ok(());
    }

    let max_followers = group.replica_factor.saturating_sub(1) as usize;
    for shard in 0..group.shard_count {
        let slot = match assignment.slots.get(&shard) {
            Some(slot) => slot,
            None => bail!(invalid(shard, "shard has no leader".into())),
        };
        match active.get(&slot.leader) {
            None => bail!(invalid(shard, format!("leader node {} is not an active member of the group", slot.leader))),
            Some(node) if !node.is_leader_capable() => bail!(invalid(shard, format!("node {} is not leader-capable", node.id))),
            Some(_) => (),
        }
        if slot.followers.len() > max_followers {
            bail!(invalid(
                shard,
                format!("{} followers exceed replica-factor {}", slot.followers.len(), group.replica_factor)
            ));
        }
        let mut seen = BTreeSet::from([slot.leader]);
        for follower in slot.followers.iter() {
            if !seen.insert(*follower) {
                bail!(invalid(shard, format!("node {} appears more than once", follower)));
            }
            if !active.contains_key(follower) {
                bail!(invalid(shard, format!("follower node {} is not an active member of the group", follower)));
            }
        }
    }
    Ok(())
}

fn invalid(shard_id: ShardId, reason: String) -> AppError {
    AppError::InvalidAssignment { shard_id, reason }
}

/// Compute the leader of every shard, ascending by shard id.
fn place_leaders(group: &Group, active: &[&Node], current: &ShardAssignment) -> Result<BTreeMap<ShardId, NodeId>> {
    let capable: Vec<&Node> = active.iter().copied().filter(|node| node.is_leader_capable() && node.weight > 0).collect();
    if capable.is_empty() {
        bail!(invalid(0, format!("group {} has no active leader-capable node with a positive weight", group.id)));
    }

    let mut quotas = leader_quotas(group.shard_count, &capable);
    let mut leaders = BTreeMap::new();
    for (node, quota) in quotas.iter_mut() {
        let kept: Vec<ShardId> = current
            .leader_shards_of(*node)
            .into_iter()
            .filter(|shard| *shard < group.shard_count)
            .take(*quota as usize)
            .collect();
        *quota -= kept.len() as u32;
        leaders.extend(kept.into_iter().map(|shard| (shard, *node)));
    }

    let orphans: Vec<ShardId> = (0..group.shard_count).filter(|shard| !leaders.contains_key(shard)).collect();
    let mut orphans = orphans.into_iter();
    for (node, quota) in quotas.iter() {
        for shard in orphans.by_ref().take(*quota as usize) {
            leaders.insert(shard, *node);
        }
    }
    Ok(leaders)
}

/// Compute each node's share of `shard_count` leader slots, ascending by node id.
///
/// Shares are weight proportional, the remainder goes to the largest fractional parts with
/// ties broken by ascending node id. The sum of all quotas is exactly `shard_count`.
pub fn leader_quotas(shard_count: u32, capable: &[&Node]) -> Vec<(NodeId, u32)> {
    let total: u64 = capable.iter().map(|node| u64::from(node.weight)).sum();
    if total == 0 {
        return capable.iter().map(|node| (node.id, 0)).collect();
    }
    let mut shares: Vec<(NodeId, u32, u64)> = capable
        .iter()
        .map(|node| {
            let scaled = u64::from(shard_count) * u64::from(node.weight);
            (node.id, (scaled / total) as u32, scaled % total)
        })
        .collect();
    let assigned: u32 = shares.iter().map(|(_, base, _)| *base).sum();
    let mut by_remainder: Vec<usize> = (0..shares.len()).collect();
    by_remainder.sort_by(|a, b| shares[*b].2.cmp(&shares[*a].2).then(shares[*a].0.cmp(&shares[*b].0)));
    for idx in by_remainder.into_iter().take((shard_count - assigned) as usize) {
        shares[idx].1 += 1;
    }
    let mut quotas: Vec<(NodeId, u32)> = shares.into_iter().map(|(id, quota, _)| (id, quota)).collect();
    quotas.sort_by_key(|(id, _)| *id);
    quotas
}

/// Choose up to `wanted` followers for a shard led by `leader`, in ring order.
fn place_followers(ring: &[NodeId], leader: NodeId, previous: &[NodeId], wanted: usize) -> Vec<NodeId> {
    let start = ring.iter().position(|id| *id == leader).unwrap_or(0);
    let ring_pos = |node: &NodeId| ring.iter().position(|id| id == node).map(|idx| (idx + ring.len() - start) % ring.len());

    let mut followers: Vec<NodeId> = vec![];
    for node in previous.iter() {
        if followers.len() < wanted && *node != leader && !followers.contains(node) && ring_pos(node).is_some() {
            followers.push(*node);
        }
    }
    for offset in 1..ring.len() {
        if followers.len() >= wanted {
            break;
        }
        let node = ring[(start + offset) % ring.len()];
        if node != leader && !followers.contains(&node) {
            followers.push(node);
        }
    }
    followers.sort_by_key(|node| ring_pos(node).unwrap_or(usize::MAX));
    followers
}
