use anyhow::{Context, Result};

use crate::assignment;
use crate::config::Config;
use crate::database::Database;
use crate::fixtures;
use crate::models::{NodeStatus, ShardAssignment};
use crate::topology::TopologyStore;

#[tokio::test]
async fn topology_document_lists_active_nodes_only() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let db = Database::new(config).await?;
    let store = TopologyStore::new(&db).await?;
    let group = fixtures::seed_topology(&store, 2, 1).await?;
    let active = store.upsert_node(fixtures::node(0, group.id, 1)).await?;
    let mut idle = fixtures::node(0, group.id, 1);
    idle.host = "10.0.9.9".into();
    idle.status = NodeStatus::Inactive;
    let idle = store.upsert_node(idle).await?;

    let doc = store.snapshot().topology_document();

    let cluster = doc.clusters.first().context("expected one cluster")?;
    assert_eq!(cluster.dcs, vec!["dc".to_string()], "expected the seeded dc, got {:?}", cluster.dcs);
    let group_doc = cluster.groups.first().context("expected one group")?;
    let ids: Vec<_> = group_doc.nodes.iter().map(|node| node.id).collect();
    assert_eq!(ids, vec![active.id], "expected only node {} and not {}, got {:?}", active.id, idle.id, ids);
    Ok(())
}

#[tokio::test]
async fn topology_document_assignments_match_store() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let db = Database::new(config).await?;
    let store = TopologyStore::new(&db).await?;
    let group = fixtures::seed_topology(&store, 4, 2).await?;
    store.upsert_node(fixtures::node(0, group.id, 2)).await?;
    let mut second = fixtures::node(0, group.id, 1);
    second.host = "10.0.1.1".into();
    store.upsert_node(second).await?;
    let plan = assignment::plan(&group, &store.list_nodes(group.id), &ShardAssignment::empty(4))?;
    store.set_shard_assignment(group.id, plan.assignment.clone()).await?;

    let doc = store.snapshot().topology_document();
    let decoded: crate::topology::TopologyDocument = serde_json::from_value(serde_json::to_value(&doc)?)?;

    let assignments = decoded.assignments();
    assert_eq!(assignments.get(&group.id), Some(&plan.assignment), "expected published assignment to match the plan");
    Ok(())
}

#[tokio::test]
async fn table_document_groups_tables_by_database() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let db = Database::new(config).await?;
    let store = TopologyStore::new(&db).await?;
    let group = fixtures::seed_topology(&store, 4, 1).await?;
    store
        .transact(|tx| {
            for (name, database) in [("users", "app"), ("events", "app"), ("audit", "ops")] {
                let id = tx.next_id();
                let mut table = fixtures::table(id, group.id, 2);
                table.name = name.into();
                table.database = database.into();
                tx.put_table(table);
            }
            Ok(())
        })
        .await?;

    let doc = store.snapshot().table_document();

    let names: Vec<(String, Vec<String>)> = doc
        .databases
        .iter()
        .map(|db| (db.name.clone(), db.tables.iter().map(|table| table.name.clone()).collect()))
        .collect();
    assert_eq!(
        names,
        vec![("app".into(), vec!["events".into(), "users".into()]), ("ops".into(), vec!["audit".into()])],
        "expected tables sorted within databases, got {:?}",
        names
    );
    assert!(doc.databases.iter().flat_map(|db| db.tables.iter()).all(|table| table.group == group.name), "expected group names");
    Ok(())
}
