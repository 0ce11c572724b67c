use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::OperationId;
use crate::error::AppError;

/// A logical configuration domain with its own version log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigDomain {
    TableConfig,
    ProxyConfig,
    GroupTopology,
}

impl ConfigDomain {
    pub const ALL: [ConfigDomain; 3] = [ConfigDomain::TableConfig, ConfigDomain::ProxyConfig, ConfigDomain::GroupTopology];

    /// The key under which this domain is published to the coordination store.
    pub fn store_key(&self) -> &'static str {
        match self {
            Self::TableConfig => "table_schema",
            Self::ProxyConfig => "proxy_table_config",
            Self::GroupTopology => "cluster_info",
        }
    }
}

impl fmt::Display for ConfigDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TableConfig => write!(f, "table_config"),
            Self::ProxyConfig => write!(f, "proxy_config"),
            Self::GroupTopology => write!(f, "group_topology"),
        }
    }
}

impl FromStr for ConfigDomain {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "table_config" => Ok(Self::TableConfig),
            "proxy_config" => Ok(Self::ProxyConfig),
            "group_topology" => Ok(Self::GroupTopology),
            _ => bail!(AppError::InvalidInput(format!("unknown config domain {}", s))),
        }
    }
}

/// An immutable, numbered snapshot of a configuration domain.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConfigVersion {
    pub domain: ConfigDomain,
    pub version: u64,
    pub payload: Value,
    pub created_at: i64,
    /// The operation whose completion produced this version, `None` for manual edits.
    #[serde(default)]
    pub caused_by: Option<OperationId>,
    /// The version whose payload this version restores.
    #[serde(default)]
    pub rollback_of: Option<u64>,
    #[serde(default)]
    pub synced: bool,
    #[serde(default)]
    pub synced_at: Option<i64>,
}

/// The body pushed to the coordination store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VersionedPayload {
    pub domain: ConfigDomain,
    pub version: u64,
    pub payload: Value,
}

/// One difference between two config payloads.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DiffEntry {
    /// A `/` separated path into the payload, `/` for the root.
    pub path: String,
    #[serde(flatten)]
    pub change: DiffKind,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DiffKind {
    Added { value: Value },
    Removed { value: Value },
    Changed { before: Value, after: Value },
}
