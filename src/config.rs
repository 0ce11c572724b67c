//! Runtime configuration.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The server's logging config, which uses Rust's `env_logger` directives.
    pub rust_log: String,
    /// The port which the HTTP API and metrics endpoint listen on.
    #[serde(default = "Config::default_http_port")]
    pub http_port: u16,

    /// The path to the database on disk.
    #[serde(default = "crate::database::default_data_path")]
    pub storage_data_path: String,

    /// The service namespace under which table and topology config is published.
    pub service_name: String,
    /// The service namespace under which proxy config is published.
    pub proxy_service_name: String,
    /// The address of the consul agent, e.g. `http://127.0.0.1:8500`.
    ///
    /// When unset, config is published to an in-process store only.
    #[serde(default)]
    pub consul_address: Option<String>,
    /// The ACL token presented to consul.
    #[serde(default)]
    pub consul_token: Option<String>,
    /// The root key prefix of all published config.
    #[serde(default = "Config::default_consul_key_prefix")]
    pub consul_key_prefix: String,

    /// The `ansible-playbook` executable to invoke.
    #[serde(default = "Config::default_ansible_playbook_bin")]
    pub ansible_playbook_bin: String,
    /// The directory in which per-job inventories & playbooks are written.
    #[serde(default = "Config::default_ansible_work_dir")]
    pub ansible_work_dir: String,
    /// The SSH port written into generated inventories.
    #[serde(default = "Config::default_ansible_ssh_port")]
    pub ansible_ssh_port: u16,

    /// Seconds after creation at which an unfinished operation is timed out.
    #[serde(default = "Config::default_operation_deadline_seconds")]
    pub operation_deadline_seconds: u64,
    /// Seconds between background polls of active operations.
    #[serde(default = "Config::default_operation_sweep_seconds")]
    pub operation_sweep_seconds: u64,
}

impl Config {
    /// Create a new config instance from the runtime environment.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        let config: Config = envy::from_env().context("error building config from env")?;
        Ok(config)
    }

    /// The deadline applied to every operation.
    pub fn operation_deadline(&self) -> Duration {
        Duration::from_secs(self.operation_deadline_seconds)
    }

    /// The interval of the background operation sweeper.
    pub fn operation_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.operation_sweep_seconds.max(1))
    }

    fn default_http_port() -> u16 {
        7000
    }

    fn default_consul_key_prefix() -> String {
        "services".into()
    }

    fn default_ansible_playbook_bin() -> String {
        "ansible-playbook".into()
    }

    fn default_ansible_work_dir() -> String {
        "/usr/local/shardctl/ansible".into()
    }

    fn default_ansible_ssh_port() -> u16 {
        22
    }

    fn default_operation_deadline_seconds() -> u64 {
        60 * 30
    }

    fn default_operation_sweep_seconds() -> u64 {
        10
    }
}

#[cfg(test)]
impl Config {
    /// Build a config for tests, rooted in a fresh temporary directory.
    pub fn new_test() -> Result<(std::sync::Arc<Self>, tempfile::TempDir)> {
        let tmpdir = tempfile::tempdir_in("/tmp").context("error creating tmp dir in /tmp")?;
        let config = Self {
            rust_log: "error".into(),
            http_port: 7000,
            storage_data_path: tmpdir.path().join("db").to_string_lossy().to_string(),
            service_name: "kv".into(),
            proxy_service_name: "kv_proxy".into(),
            consul_address: None,
            consul_token: None,
            consul_key_prefix: Self::default_consul_key_prefix(),
            ansible_playbook_bin: Self::default_ansible_playbook_bin(),
            ansible_work_dir: tmpdir.path().join("ansible").to_string_lossy().to_string(),
            ansible_ssh_port: 22,
            operation_deadline_seconds: 60,
            operation_sweep_seconds: 1,
        };
        Ok((std::sync::Arc::new(config), tmpdir))
    }
}
