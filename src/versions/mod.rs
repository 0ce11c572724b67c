//! Configuration version manager.
//!
//! ## Overview
//! Each config domain has an append-only log of numbered versions. Versions are never rewritten
//! except for their `synced` marker; rolling back appends a new version carrying an earlier
//! payload, so "current" is always simply the highest version of a domain.
//!
//! Versions are pushed to the coordination store by explicit `sync` calls only. Pushes for one
//! domain are serialized and a version is refused while an earlier version of its domain is not
//! yet synced, so the store only ever observes a domain's versions in increasing order. A failed
//! push leaves the version unsynced and is never retried implicitly.

mod coordination;
#[cfg(test)]
mod mod_test;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::config::Config;
use crate::database::{Database, Tree};
use crate::error::{AppError, ShutdownError, ERR_DECODE_ROW, ERR_ITER_FAILURE};
use crate::models::{ConfigDomain, ConfigVersion, DiffEntry, DiffKind, OperationId, VersionedPayload};
use crate::utils;

pub use coordination::{ConsulStore, CoordinationStore, MemoryStore};

const METRIC_CONFIG_VERSIONS: &str = "shardctl_config_versions";
const METRIC_SYNC_FAILURES: &str = "shardctl_sync_failures";

/// The manager of all config version logs.
#[derive(Clone)]
pub struct VersionManager {
    inner: Arc<VersionManagerInner>,
}

struct VersionManagerInner {
    store: Arc<dyn CoordinationStore>,
    key_prefix: String,
    service_name: String,
    proxy_service_name: String,
    domains: BTreeMap<ConfigDomain, DomainSlot>,
}

struct DomainSlot {
    log: Mutex<DomainLog>,
    /// Serializes pushes of this domain, never taken while holding `log`.
    push: Mutex<()>,
}

struct DomainLog {
    tree: Tree,
    versions: BTreeMap<u64, ConfigVersion>,
}

impl DomainLog {
    fn persist(&self, record: &ConfigVersion) -> Result<()> {
        self.tree
            .insert(&utils::encode_u64(record.version), utils::encode_model(record)?)
            .context("error persisting config version")
            .map_err(ShutdownError::from)?;
        Ok(())
    }
}

impl VersionManager {
    /// Create a new instance, recovering every domain's version log from disk.
    pub async fn new(db: &Database, store: Arc<dyn CoordinationStore>, config: &Config) -> Result<Self> {
        let mut domains = BTreeMap::new();
        for domain in ConfigDomain::ALL {
            let tree = db.get_versions_tree(domain).await?;
            let versions = Self::recover(tree.clone()).await?;
            tracing::debug!(%domain, count = versions.len(), "recovered config version log");
            domains.insert(domain, DomainSlot { log: Mutex::new(DomainLog { tree, versions }), push: Mutex::new(()) });
        }
        metrics::register_counter!(METRIC_CONFIG_VERSIONS, metrics::Unit::Count, "config versions appended");
        metrics::register_counter!(METRIC_SYNC_FAILURES, metrics::Unit::Count, "failed coordination store pushes");
        Ok(Self {
            inner: Arc::new(VersionManagerInner {
                store,
                key_prefix: config.consul_key_prefix.trim_matches('/').to_string(),
                service_name: config.service_name.clone(),
                proxy_service_name: config.proxy_service_name.clone(),
                domains,
            }),
        })
    }

    /// Append a new version of the given domain.
    #[tracing::instrument(level = "debug", skip(self, payload))]
    pub async fn snapshot(&self, domain: ConfigDomain, payload: Value, caused_by: Option<OperationId>) -> Result<ConfigVersion> {
        self.append(domain, payload, caused_by, None).await
    }

    /// Append a new version carrying the payload of an earlier one.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn rollback(&self, domain: ConfigDomain, to_version: u64) -> Result<ConfigVersion> {
        let target = self.get(domain, to_version).await?;
        self.append(domain, target.payload, None, Some(to_version)).await
    }

    /// The highest version of the given domain.
    pub async fn current(&self, domain: ConfigDomain) -> Result<Option<ConfigVersion>> {
        let log = self.slot(domain)?.log.lock().await;
        Ok(log.versions.values().next_back().cloned())
    }

    pub async fn get(&self, domain: ConfigDomain, version: u64) -> Result<ConfigVersion> {
        let log = self.slot(domain)?.log.lock().await;
        match log.versions.get(&version) {
            Some(record) => Ok(record.clone()),
            None => bail!(AppError::ResourceNotFound(format!("{} version {}", domain, version))),
        }
    }

    /// Every version of the given domain, ascending.
    pub async fn list(&self, domain: ConfigDomain) -> Result<Vec<ConfigVersion>> {
        let log = self.slot(domain)?.log.lock().await;
        Ok(log.versions.values().cloned().collect())
    }

    /// The structured difference between two versions of a domain.
    pub async fn diff(&self, domain: ConfigDomain, from: u64, to: u64) -> Result<Vec<DiffEntry>> {
        let (before, after) = (self.get(domain, from).await?, self.get(domain, to).await?);
        Ok(diff_payloads(&before.payload, &after.payload))
    }

    /// Push a version to the coordination store, returning whether it is now synced.
    ///
    /// Syncing an already synced version is a no-op.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn sync(&self, domain: ConfigDomain, version: u64) -> Result<bool> {
        let slot = self.slot(domain)?;
        let _push = slot.push.lock().await;
        let record = {
            let log = slot.log.lock().await;
            let record = match log.versions.get(&version) {
                Some(record) => record.clone(),
                None => bail!(AppError::ResourceNotFound(format!("{} version {}", domain, version))),
            };
            if record.synced {
                return Ok(true);
            }
            if let Some(earlier) = log.versions.range(..version).map(|(_, v)| v).find(|v| !v.synced) {
                bail!(AppError::SyncFailure(format!(
                    "{} version {} must be synced before version {}",
                    domain, earlier.version, version
                )));
            }
            record
        };

        if let Err(err) = self.push(&record).await {
            metrics::increment_counter!(METRIC_SYNC_FAILURES, "domain" => domain.to_string());
            tracing::warn!(error = ?err, %domain, version, "error pushing config version");
            bail!(AppError::SyncFailure(format!("{:#}", err)));
        }

        let mut log = slot.log.lock().await;
        let mut synced = record;
        synced.synced = true;
        synced.synced_at = Some(utils::now_millis());
        log.persist(&synced)?;
        log.versions.insert(version, synced);
        tracing::info!(%domain, version, "config version synced");
        Ok(true)
    }

    /// Sync every unsynced version of a domain in order, stopping at the first failure.
    ///
    /// Returns the versions which were pushed.
    pub async fn sync_pending(&self, domain: ConfigDomain) -> Result<Vec<u64>> {
        let pending: Vec<u64> = self.list(domain).await?.into_iter().filter(|v| !v.synced).map(|v| v.version).collect();
        let mut pushed = Vec::with_capacity(pending.len());
        for version in pending {
            self.sync(domain, version).await?;
            pushed.push(version);
        }
        Ok(pushed)
    }

    /// The payload currently held by the coordination store for a domain.
    pub async fn published(&self, domain: ConfigDomain) -> Result<Option<VersionedPayload>> {
        let key = self.config_key(domain);
        match self.inner.store.get(&key).await.map_err(|err| AppError::SyncFailure(format!("{:#}", err)))? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw).context("error decoding published config")?)),
            None => Ok(None),
        }
    }

    /// The coordination store key holding the given domain's config.
    pub fn config_key(&self, domain: ConfigDomain) -> String {
        format!("{}/{}/config/configs/{}", self.inner.key_prefix, self.service_of(domain), domain.store_key())
    }

    /// The coordination store key holding the change marker of the service owning a domain.
    pub fn marker_key(&self, domain: ConfigDomain) -> String {
        format!("{}/{}/config/version", self.inner.key_prefix, self.service_of(domain))
    }

    fn service_of(&self, domain: ConfigDomain) -> &str {
        match domain {
            ConfigDomain::ProxyConfig => &self.inner.proxy_service_name,
            ConfigDomain::TableConfig | ConfigDomain::GroupTopology => &self.inner.service_name,
        }
    }

    async fn push(&self, record: &ConfigVersion) -> Result<()> {
        let body = serde_json::to_vec(&VersionedPayload {
            domain: record.domain,
            version: record.version,
            payload: record.payload.clone(),
        })?;
        self.inner.store.put(&self.config_key(record.domain), &body).await?;
        let marker = utils::now_millis().to_string();
        self.inner.store.put(&self.marker_key(record.domain), marker.as_bytes()).await?;
        Ok(())
    }

    async fn append(&self, domain: ConfigDomain, payload: Value, caused_by: Option<OperationId>, rollback_of: Option<u64>) -> Result<ConfigVersion> {
        let mut log = self.slot(domain)?.log.lock().await;
        let version = log.versions.keys().next_back().copied().unwrap_or(0) + 1;
        let record = ConfigVersion {
            domain,
            version,
            payload,
            created_at: utils::now_millis(),
            caused_by,
            rollback_of,
            synced: false,
            synced_at: None,
        };
        log.persist(&record)?;
        log.versions.insert(version, record.clone());
        metrics::increment_counter!(METRIC_CONFIG_VERSIONS, "domain" => domain.to_string());
        tracing::info!(%domain, version, ?rollback_of, "config version appended");
        Ok(record)
    }

    fn slot(&self, domain: ConfigDomain) -> Result<&DomainSlot> {
        self.inner
            .domains
            .get(&domain)
            .with_context(|| format!("no version log for domain {}", domain))
    }

    #[tracing::instrument(level = "debug", skip(tree))]
    async fn recover(tree: Tree) -> Result<BTreeMap<u64, ConfigVersion>> {
        let versions = Database::spawn_blocking(move || -> Result<BTreeMap<u64, ConfigVersion>> {
            let mut versions = BTreeMap::new();
            for kv_res in tree.iter() {
                let (key, val) = kv_res.context(ERR_ITER_FAILURE).map_err(ShutdownError::from)?;
                let version = utils::decode_u64(&key)?;
                let record: ConfigVersion = utils::decode_model(&val).context(ERR_DECODE_ROW).map_err(ShutdownError::from)?;
                versions.insert(version, record);
            }
            Ok(versions)
        })
        .await??;
        Ok(versions)
    }
}

/// Compute the structured difference between two payloads.
///
/// Objects are compared key by key and arrays index by index, any other differing values are
/// reported as changed. Equal payloads yield no entries.
pub fn diff_payloads(before: &Value, after: &Value) -> Vec<DiffEntry> {
    let mut entries = vec![];
    diff_into(String::new(), before, after, &mut entries);
    entries
}

fn diff_into(path: String, before: &Value, after: &Value, entries: &mut Vec<DiffEntry>) {
    let entry_path = |path: &str| if path.is_empty() { "/".to_string() } else { path.to_string() };
    match (before, after) {
        (Value::Object(old), Value::Object(new)) => {
            let keys: std::collections::BTreeSet<&String> = old.keys().chain(new.keys()).collect();
            for key in keys {
                let child = format!("{}/{}", path, key);
                match (old.get(key), new.get(key)) {
                    (Some(a), Some(b)) => diff_into(child, a, b, entries),
                    (Some(a), None) => entries.push(DiffEntry { path: child, change: DiffKind::Removed { value: a.clone() } }),
                    (None, Some(b)) => entries.push(DiffEntry { path: child, change: DiffKind::Added { value: b.clone() } }),
                    (None, None) => (),
                }
            }
        }
        (Value::Array(old), Value::Array(new)) => {
            for idx in 0..old.len().max(new.len()) {
                let child = format!("{}/{}", path, idx);
                match (old.get(idx), new.get(idx)) {
                    (Some(a), Some(b)) => diff_into(child, a, b, entries),
                    (Some(a), None) => entries.push(DiffEntry { path: child, change: DiffKind::Removed { value: a.clone() } }),
                    (None, Some(b)) => entries.push(DiffEntry { path: child, change: DiffKind::Added { value: b.clone() } }),
                    (None, None) => (),
                }
            }
        }
        (old, new) if old != new => entries.push(DiffEntry {
            path: entry_path(&path),
            change: DiffKind::Changed { before: old.clone(), after: new.clone() },
        }),
        _ => (),
    }
}
