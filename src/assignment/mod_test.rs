use anyhow::{Context, Result};

use super::*;
use crate::fixtures;
use crate::models::{NodeRole, NodeStatus};

#[test]
fn plan_fresh_group_is_weight_proportional() -> Result<()> {
    let group = fixtures::group(1, 4, 2);
    let roster = vec![fixtures::node(1, 1, 2), fixtures::node(2, 1, 1)];

    let plan = plan(&group, &roster, &ShardAssignment::empty(4))?;

    assert_eq!(plan.assignment.leader_shards_of(1), vec![0, 1, 2], "expected N1 to lead shards 0-2");
    assert_eq!(plan.assignment.leader_shards_of(2), vec![3], "expected N2 to lead shard 3");
    assert_eq!(plan.assignment.follower_shards_of(2), vec![0, 1, 2], "expected N2 to follow shards 0-2");
    assert_eq!(plan.assignment.follower_shards_of(1), vec![3], "expected shard 3 follower to wrap to N1");
    assert!(plan.under_replicated.is_empty(), "expected no under replication, got {:?}", plan.under_replicated);
    assert_eq!(plan.delta.changes.len(), 4, "expected every shard to be part of the initial delta");
    Ok(())
}

#[test]
fn plan_node_removal_moves_only_orphaned_leader() -> Result<()> {
    let group = fixtures::group(1, 4, 2);
    let roster = vec![fixtures::node(1, 1, 2), fixtures::node(2, 1, 1)];
    let initial = plan(&group, &roster, &ShardAssignment::empty(4))?.assignment;

    let remaining = vec![roster[0].clone()];
    let plan = plan(&group, &remaining, &initial)?;

    assert_eq!(plan.assignment.leader_shards_of(1), vec![0, 1, 2, 3], "expected N1 to lead every shard");
    for change in plan.delta.changes.iter() {
        let (before, after) = (change.before.as_ref().context("missing before")?, change.after.as_ref().context("missing after")?);
        if change.shard_id == 3 {
            assert_eq!((before.leader, after.leader), (2, 1), "expected shard 3 leader to move from N2 to N1");
        } else {
            assert_eq!(before.leader, after.leader, "expected shard {} to keep its leader", change.shard_id);
            assert!(after.followers.is_empty(), "expected shard {} follower set to be emptied", change.shard_id);
        }
    }
    let affected: Vec<_> = plan.delta.affected_nodes().into_iter().collect();
    assert_eq!(affected, vec![1, 2], "expected nodes 1 & 2 to be affected, got {:?}", affected);
    assert_eq!(plan.under_replicated.len(), 4, "expected all shards to be reported under replicated");
    Ok(())
}

#[test]
fn plan_node_addition_keeps_existing_leaders_within_quota() -> Result<()> {
    let group = fixtures::group(1, 6, 1);
    let roster = vec![fixtures::node(1, 1, 1), fixtures::node(2, 1, 1)];
    let initial = plan(&group, &roster, &ShardAssignment::empty(6))?.assignment;

    let mut grown = roster.clone();
    grown.push(fixtures::node(3, 1, 1));
    let plan = plan(&group, &grown, &initial)?;

    assert_eq!(plan.assignment.leader_shards_of(1), vec![0, 1], "expected N1 to keep its lowest shards");
    assert_eq!(plan.assignment.leader_shards_of(2), vec![3, 4], "expected N2 to keep its lowest shards");
    assert_eq!(plan.assignment.leader_shards_of(3), vec![2, 5], "expected N3 to receive the released shards");
    assert_eq!(plan.delta.changes.len(), 2, "expected only two shards to move, got {:?}", plan.delta.changes);
    Ok(())
}

#[test]
fn plan_is_stable_when_roster_is_unchanged() -> Result<()> {
    let group = fixtures::group(1, 7, 3);
    let roster = vec![fixtures::node(1, 1, 3), fixtures::node(2, 1, 1), fixtures::node(3, 1, 2)];
    let first = plan(&group, &roster, &ShardAssignment::empty(7))?;
    let second = plan(&group, &roster, &first.assignment)?;

    assert!(second.delta.is_empty(), "expected replanning to yield no delta, got {:?}", second.delta);
    Ok(())
}

#[test]
fn plan_never_leads_with_follower_or_edge_nodes() -> Result<()> {
    let group = fixtures::group(1, 3, 3);
    let mut roster = vec![fixtures::node(1, 1, 1), fixtures::node(2, 1, 5), fixtures::node(3, 1, 5)];
    roster[1].role = NodeRole::Follower;
    roster[2].is_edge = true;

    let plan = plan(&group, &roster, &ShardAssignment::empty(3))?;

    assert_eq!(plan.assignment.leader_shards_of(1), vec![0, 1, 2], "expected the only leader-capable node to lead all shards");
    assert_eq!(plan.assignment.follower_shards_of(2), vec![0, 1, 2], "expected follower node to follow all shards");
    assert_eq!(plan.assignment.follower_shards_of(3), vec![0, 1, 2], "expected edge node to follow all shards");
    Ok(())
}

#[test]
fn plan_fails_without_leader_capable_nodes() -> Result<()> {
    let group = fixtures::group(1, 2, 1);
    let mut roster = vec![fixtures::node(1, 1, 1)];
    roster[0].role = NodeRole::Follower;

    let err = plan(&group, &roster, &ShardAssignment::empty(2)).err().context("expected planning to fail")?;

    let app_err = err.downcast::<AppError>().context("unexpected error type")?;
    assert!(matches!(app_err, AppError::InvalidAssignment { shard_id: 0, .. }), "unexpected error returned {:?}", app_err);
    Ok(())
}

#[test]
fn plan_ignores_inactive_nodes_and_drains_empty_group() -> Result<()> {
    let group = fixtures::group(1, 2, 1);
    let mut roster = vec![fixtures::node(1, 1, 1)];
    let initial = plan(&group, &roster, &ShardAssignment::empty(2))?.assignment;
    roster[0].status = NodeStatus::Inactive;

    let plan = plan(&group, &roster, &initial)?;

    assert!(plan.assignment.is_empty(), "expected empty assignment for a group without active nodes");
    assert_eq!(plan.delta.changes.len(), 2, "expected both shards to be released");
    Ok(())
}

#[test]
fn leader_quotas_sum_to_shard_count() {
    let nodes = vec![fixtures::node(4, 1, 1), fixtures::node(2, 1, 1), fixtures::node(9, 1, 1)];
    let refs: Vec<&Node> = nodes.iter().collect();

    let quotas = leader_quotas(10, &refs);

    assert_eq!(quotas, vec![(2, 4), (4, 3), (9, 3)], "expected remainder to go to the lowest node id, got {:?}", quotas);
}

#[test]
fn validate_assignment_rejects_gaps_and_duplicates() -> Result<()> {
    let group = fixtures::group(1, 2, 2);
    let roster = vec![fixtures::node(1, 1, 1), fixtures::node(2, 1, 1)];
    let mut assignment = ShardAssignment::empty(2);
    assignment.slots.insert(0, ShardSlot { leader: 1, followers: vec![2] });

    let err = validate_assignment(&group, &roster, &assignment).err().context("expected missing shard to be rejected")?;
    let app_err = err.downcast::<AppError>().context("unexpected error type")?;
    assert!(matches!(app_err, AppError::InvalidAssignment { shard_id: 1, .. }), "unexpected error returned {:?}", app_err);

    assignment.slots.insert(1, ShardSlot { leader: 2, followers: vec![2] });
    let err = validate_assignment(&group, &roster, &assignment).err().context("expected duplicate node to be rejected")?;
    let app_err = err.downcast::<AppError>().context("unexpected error type")?;
    assert!(
        matches!(&app_err, AppError::InvalidAssignment { shard_id: 1, reason } if reason.contains("more than once")),
        "unexpected error returned {:?}",
        app_err
    );

    assignment.slots.insert(1, ShardSlot { leader: 2, followers: vec![1] });
    validate_assignment(&group, &roster, &assignment)?;
    Ok(())
}

#[test]
fn validate_assignment_rejects_excess_followers() -> Result<()> {
    let group = fixtures::group(1, 1, 1);
    let roster = vec![fixtures::node(1, 1, 1), fixtures::node(2, 1, 1)];
    let mut assignment = ShardAssignment::empty(1);
    assignment.slots.insert(0, ShardSlot { leader: 1, followers: vec![2] });

    let err = validate_assignment(&group, &roster, &assignment).err().context("expected excess followers to be rejected")?;

    let app_err = err.downcast::<AppError>().context("unexpected error type")?;
    assert!(matches!(app_err, AppError::InvalidAssignment { shard_id: 0, .. }), "unexpected error returned {:?}", app_err);
    Ok(())
}
