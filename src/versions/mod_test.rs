use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::json;

use super::*;
use crate::config::Config;
use crate::database::Database;
use crate::error::AppError;
use crate::fixtures::RecordingStore;

async fn setup() -> Result<(VersionManager, Arc<RecordingStore>, Database, tempfile::TempDir)> {
    let (config, tmpdir) = Config::new_test()?;
    let db = Database::new(config.clone()).await?;
    let store = Arc::new(RecordingStore::default());
    let versions = VersionManager::new(&db, store.clone(), &config).await?;
    Ok((versions, store, db, tmpdir))
}

fn pushed_versions(store: &RecordingStore, key: &str) -> Result<Vec<u64>> {
    store
        .history()
        .into_iter()
        .filter(|(k, _)| k == key)
        .map(|(_, raw)| Ok(serde_json::from_slice::<VersionedPayload>(&raw)?.version))
        .collect()
}

#[tokio::test]
async fn snapshot_versions_are_monotonic_per_domain() -> Result<()> {
    let (versions, _store, _db, _tmpdir) = setup().await?;

    let t1 = versions.snapshot(ConfigDomain::TableConfig, json!({"a": 1}), None).await?;
    let t2 = versions.snapshot(ConfigDomain::TableConfig, json!({"a": 2}), None).await?;
    let p1 = versions.snapshot(ConfigDomain::ProxyConfig, json!({"p": 1}), None).await?;

    assert_eq!((t1.version, t2.version), (1, 2), "expected table config versions 1 & 2");
    assert_eq!(p1.version, 1, "expected proxy config to have its own log");
    let current = versions.current(ConfigDomain::TableConfig).await?.context("expected a current version")?;
    assert_eq!(current.payload, json!({"a": 2}), "expected current to be the highest version");
    assert!(!current.synced, "expected new versions to be unsynced");
    Ok(())
}

#[tokio::test]
async fn rollback_appends_payload_equal_version() -> Result<()> {
    let (versions, _store, _db, _tmpdir) = setup().await?;
    let domain = ConfigDomain::GroupTopology;
    versions.snapshot(domain, json!({"nodes": [1, 2]}), None).await?;
    versions.snapshot(domain, json!({"nodes": [1, 2, 3]}), None).await?;

    let rolled = versions.rollback(domain, 1).await?;
    let next = versions.snapshot(domain, json!({"nodes": [1]}), None).await?;

    assert_eq!(rolled.version, 3, "expected rollback to append version 3");
    assert_eq!(rolled.rollback_of, Some(1), "expected rollback source to be recorded");
    assert!(versions.diff(domain, 1, 3).await?.is_empty(), "expected rolled back payload to equal version 1");
    assert!(next.version > rolled.version, "expected versions to keep increasing after rollback");
    assert_eq!(versions.list(domain).await?.len(), 4, "expected history to be preserved");
    Ok(())
}

#[tokio::test]
async fn rollback_to_unknown_version_is_not_found() -> Result<()> {
    let (versions, _store, _db, _tmpdir) = setup().await?;

    let err = versions.rollback(ConfigDomain::TableConfig, 7).await.err().context("expected rollback to fail")?;

    assert!(
        matches!(err.downcast_ref::<AppError>(), Some(AppError::ResourceNotFound(_))),
        "expected ResourceNotFound, got {:?}",
        err
    );
    Ok(())
}

#[test]
fn diff_payloads_reports_paths() {
    let before = json!({"name": "kv", "shards": [0, 1], "ttl": 10});
    let after = json!({"name": "kv", "shards": [0, 2, 3], "owner": "ops"});

    let diff = diff_payloads(&before, &after);

    let paths: Vec<&str> = diff.iter().map(|entry| entry.path.as_str()).collect();
    assert_eq!(paths, vec!["/owner", "/shards/1", "/shards/2", "/ttl"], "unexpected diff paths {:?}", diff);
    assert_eq!(diff[0].change, DiffKind::Added { value: json!("ops") }, "expected owner to be added");
    assert_eq!(diff[1].change, DiffKind::Changed { before: json!(1), after: json!(2) }, "expected shard 1 to change");
    assert_eq!(diff[3].change, DiffKind::Removed { value: json!(10) }, "expected ttl to be removed");
    let root = diff_payloads(&json!(1), &json!(2));
    assert_eq!(root.first().map(|entry| entry.path.as_str()), Some("/"), "expected root path for scalar payloads");
}

#[tokio::test]
async fn sync_refuses_version_ahead_of_unsynced_predecessor() -> Result<()> {
    let (versions, store, _db, _tmpdir) = setup().await?;
    let domain = ConfigDomain::TableConfig;
    versions.snapshot(domain, json!({"v": 1}), None).await?;
    versions.snapshot(domain, json!({"v": 2}), None).await?;

    let err = versions.sync(domain, 2).await.err().context("expected out of order sync to fail")?;
    assert!(
        matches!(err.downcast_ref::<AppError>(), Some(AppError::SyncFailure(_))),
        "expected SyncFailure, got {:?}",
        err
    );
    assert!(store.history().is_empty(), "expected nothing to be pushed");

    assert!(versions.sync(domain, 1).await?, "expected version 1 to sync");
    assert!(versions.sync(domain, 2).await?, "expected version 2 to sync");
    assert!(versions.sync(domain, 2).await?, "expected repeated sync to be a no-op");
    assert_eq!(pushed_versions(&store, &versions.config_key(domain))?, vec![1, 2], "expected one push per version in order");
    let markers = store.history().into_iter().filter(|(key, _)| key == &versions.marker_key(domain)).count();
    assert_eq!(markers, 2, "expected a change marker after each push");
    assert_eq!(versions.config_key(domain), "services/kv/config/configs/table_schema", "unexpected config key");
    assert_eq!(versions.config_key(ConfigDomain::ProxyConfig), "services/kv_proxy/config/configs/proxy_table_config");
    Ok(())
}

#[tokio::test]
async fn failed_sync_leaves_version_unsynced() -> Result<()> {
    let (versions, store, _db, _tmpdir) = setup().await?;
    let domain = ConfigDomain::ProxyConfig;
    versions.snapshot(domain, json!({"routes": []}), None).await?;
    store.set_unavailable(true);

    let err = versions.sync(domain, 1).await.err().context("expected sync to fail")?;

    assert!(
        matches!(err.downcast_ref::<AppError>(), Some(AppError::SyncFailure(_))),
        "expected SyncFailure, got {:?}",
        err
    );
    assert!(!versions.get(domain, 1).await?.synced, "expected version to remain unsynced");
    store.set_unavailable(false);
    assert_eq!(versions.sync_pending(domain).await?, vec![1], "expected retry to push version 1");
    let published = versions.published(domain).await?.context("expected published config")?;
    assert_eq!(published.version, 1, "expected published version 1");
    Ok(())
}

#[tokio::test]
async fn concurrent_syncs_push_in_version_order() -> Result<()> {
    let (versions, store, _db, _tmpdir) = setup().await?;
    let domain = ConfigDomain::GroupTopology;
    for idx in 1..=8 {
        versions.snapshot(domain, json!({"v": idx}), None).await?;
    }

    let mut handles = vec![];
    for version in (1..=8).rev() {
        let versions = versions.clone();
        handles.push(tokio::spawn(async move { versions.sync(domain, version).await }));
    }
    for handle in handles {
        let _ = handle.await?;
    }
    versions.sync_pending(domain).await?;

    let pushed = pushed_versions(&store, &versions.config_key(domain))?;
    assert_eq!(pushed, (1..=8).collect::<Vec<u64>>(), "expected every version pushed exactly once in order");
    assert!(versions.list(domain).await?.iter().all(|v| v.synced), "expected every version to be synced");
    Ok(())
}

#[tokio::test]
async fn version_logs_are_recovered() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let db = Database::new(config.clone()).await?;
    let versions = VersionManager::new(&db, Arc::new(MemoryStore::default()), &config).await?;
    versions.snapshot(ConfigDomain::TableConfig, json!({"v": 1}), None).await?;
    versions.sync(ConfigDomain::TableConfig, 1).await?;
    versions.snapshot(ConfigDomain::TableConfig, json!({"v": 2}), None).await?;

    let recovered = VersionManager::new(&db, Arc::new(MemoryStore::default()), &config).await?;

    let log = recovered.list(ConfigDomain::TableConfig).await?;
    let state: Vec<(u64, bool)> = log.iter().map(|v| (v.version, v.synced)).collect();
    assert_eq!(state, vec![(1, true), (2, false)], "expected versions and sync markers to be recovered");
    Ok(())
}
