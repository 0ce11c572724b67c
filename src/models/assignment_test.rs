use super::*;
use crate::fixtures;

#[test]
fn derive_orders_followers_by_ring_position() {
    let group = fixtures::group(1, 4, 3);
    let mut nodes = vec![fixtures::node(1, 1, 1), fixtures::node(2, 1, 1), fixtures::node(3, 1, 1)];
    nodes[1].leader_shards = vec![0];
    nodes[0].follower_shards = vec![0];
    nodes[2].follower_shards = vec![0];

    let assignment = ShardAssignment::derive(&group, &nodes);

    let slot = assignment.slots.get(&0).cloned();
    assert_eq!(
        slot,
        Some(ShardSlot { leader: 2, followers: vec![3, 1] }),
        "expected followers of shard 0 to wrap from node 3 to node 1, got {:?}",
        slot
    );
}

#[test]
fn derive_ignores_deleted_nodes() {
    let group = fixtures::group(1, 2, 1);
    let mut nodes = vec![fixtures::node(1, 1, 1), fixtures::node(2, 1, 1)];
    nodes[0].leader_shards = vec![0, 1];
    nodes[1].leader_shards = vec![1];
    nodes[1].deleted = true;

    let assignment = ShardAssignment::derive(&group, &nodes);

    assert_eq!(assignment.leader_shards_of(1), vec![0, 1], "expected node 1 to lead both shards");
    assert!(assignment.leader_shards_of(2).is_empty(), "expected deleted node to lead nothing");
}

#[test]
fn delta_affected_nodes_only_counts_role_changes() {
    let mut before = ShardAssignment::empty(2);
    before.slots.insert(0, ShardSlot { leader: 1, followers: vec![2] });
    before.slots.insert(1, ShardSlot { leader: 2, followers: vec![1] });
    let mut after = before.clone();
    after.slots.insert(1, ShardSlot { leader: 1, followers: vec![3] });

    let delta = AssignmentDelta::between(9, 4, &before, &after);

    assert_eq!(delta.changes.len(), 1, "expected one changed shard, got {:?}", delta.changes);
    assert_eq!(delta.base_version, 4, "expected base version to be carried");
    let affected: Vec<_> = delta.affected_nodes().into_iter().collect();
    assert_eq!(affected, vec![1, 2, 3], "expected nodes 1, 2 & 3 to be affected, got {:?}", affected);
}

#[test]
fn delta_between_equal_assignments_is_empty() {
    let mut assignment = ShardAssignment::empty(1);
    assignment.slots.insert(0, ShardSlot { leader: 1, followers: vec![] });
    let delta = AssignmentDelta::between(1, 0, &assignment, &assignment.clone());
    assert!(delta.is_empty(), "expected empty delta, got {:?}", delta);
    assert!(delta.affected_nodes().is_empty(), "expected no affected nodes");
}
