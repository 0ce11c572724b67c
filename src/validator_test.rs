use anyhow::Result;
use serde_json::json;

use crate::fixtures;
use crate::models::{ConfigDomain, NodeStatus, ShardAssignment, VersionedPayload};
use crate::validator;

#[test]
fn check_group_invariants_accepts_consistent_group() -> Result<()> {
    let group = fixtures::group(1, 4, 2);
    let nodes = fixtures::placed_nodes(&group, vec![(1, 2, vec![0, 1, 2], vec![3]), (2, 1, vec![3], vec![0, 1, 2])]);
    let assignment = ShardAssignment::derive(&group, &nodes);

    let res = validator::check_group_invariants(&group, &nodes, &assignment);

    assert!(res.is_ok(), "expected consistent group to pass validation, got {:?}", res);
    Ok(())
}

#[test]
fn check_group_invariants_reports_every_violation() {
    let mut group = fixtures::group(1, 2, 2);
    group.reduce_rate = 120;
    let mut nodes = fixtures::placed_nodes(&group, vec![(1, 1, vec![0, 5], vec![]), (2, 1, vec![0], vec![])]);
    nodes[1].status = NodeStatus::Inactive;
    let assignment = ShardAssignment::derive(&group, &nodes);

    let violations = validator::check_group_invariants(&group, &nodes, &assignment).err().unwrap_or_default();

    let expect = |needle: &str| {
        assert!(
            violations.iter().any(|val| val.contains(needle)),
            "expected a violation containing {:?}, got {:?}",
            needle,
            violations
        )
    };
    expect("reduce-rate 120");
    expect("outside of group range");
    expect("shard 0 has 2 leaders");
    expect("is inactive but still holds shards");
    expect("have no leader");
}

#[test]
fn check_group_invariants_rejects_edge_leader() {
    let group = fixtures::group(1, 1, 1);
    let mut nodes = fixtures::placed_nodes(&group, vec![(1, 1, vec![0], vec![])]);
    nodes[0].is_edge = true;
    let assignment = ShardAssignment::derive(&group, &nodes);

    let violations = validator::check_group_invariants(&group, &nodes, &assignment).err().unwrap_or_default();

    assert!(
        violations.iter().any(|val| val.contains("edge node 1 cannot lead")),
        "expected edge leader violation, got {:?}",
        violations
    );
}

#[test]
fn check_group_invariants_allows_empty_group() {
    let group = fixtures::group(1, 8, 3);
    let nodes = vec![fixtures::node(1, 1, 1)];
    let res = validator::check_group_invariants(&group, &nodes, &ShardAssignment::empty(8));
    assert!(res.is_ok(), "expected group without placed shards to pass, got {:?}", res);
}

#[test]
fn check_reduce_rate_bounds() {
    let mut group = fixtures::group(1, 1, 1);
    group.reduce_rate = 100;
    assert!(validator::check_reduce_rate(&group).is_ok(), "expected reduce-rate 100 to be accepted");
    group.reduce_rate = 101;
    assert!(validator::check_reduce_rate(&group).is_err(), "expected reduce-rate 101 to be rejected");
}

#[test]
fn check_table_shard_bounds_rejects_oversized_table() {
    let group = fixtures::group(1, 4, 1);
    let mut table = fixtures::table(1, 1, 4);
    assert!(validator::check_table_shard_bounds(&table, &group).is_ok(), "expected table with 4 shards to fit group with 4 shards");

    table.shard_count = 5;
    table.edge_flow_ratio = 150;
    let violations = validator::check_table_shard_bounds(&table, &group).err().unwrap_or_default();
    assert_eq!(violations.len(), 2, "expected shard count and edge ratio violations, got {:?}", violations);
}

#[test]
fn check_group_ready_reports_gaps() {
    let group = fixtures::group(1, 3, 2);
    let mut nodes = fixtures::placed_nodes(&group, vec![(1, 1, vec![0], vec![1]), (2, 1, vec![1], vec![0])]);
    nodes[1].status = NodeStatus::Inactive;

    let readiness = validator::check_group_ready(&group, &nodes);

    assert!(!readiness.ready, "expected group to be reported as not ready");
    assert_eq!(readiness.missing_leaders, vec![2], "expected shard 2 to be missing a leader, got {:?}", readiness.missing_leaders);
    assert_eq!(readiness.inactive_holders, vec![2], "expected node 2 to be an inactive holder");
    assert_eq!(readiness.under_replicated.len(), 1, "expected shard 2 to be under replicated, got {:?}", readiness.under_replicated);
}

#[test]
fn check_config_drift_reports_published_differences() {
    let expected = json!({"tables": [{"name": "orders", "shard_count": 4}]});
    let published = VersionedPayload {
        domain: ConfigDomain::TableConfig,
        version: 3,
        payload: json!({"tables": [{"name": "orders", "shard_count": 2}]}),
    };

    let drift = validator::check_config_drift(ConfigDomain::TableConfig, &expected, Some(&published));
    assert!(!drift.in_sync, "expected differing payloads to drift");
    assert_eq!(drift.published_version, Some(3), "expected the published version to be reported");
    assert_eq!(drift.differences.len(), 1, "expected one difference, got {:?}", drift.differences);
    assert_eq!(drift.differences[0].path, "/tables/0/shard_count", "expected the shard count to differ");

    let synced = VersionedPayload { payload: expected.clone(), ..published };
    let drift = validator::check_config_drift(ConfigDomain::TableConfig, &expected, Some(&synced));
    assert!(drift.in_sync, "expected equal payloads to be in sync, got {:?}", drift.differences);

    let drift = validator::check_config_drift(ConfigDomain::TableConfig, &expected, None);
    assert!(!drift.in_sync, "expected an unpublished domain to drift");
    assert_eq!(drift.published_version, None, "expected no published version");
}
