//! Coordination store clients.

use std::collections::BTreeMap;
use std::sync::Mutex;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;

use crate::config::Config;

/// The header carrying the consul ACL token.
const HEADER_CONSUL_TOKEN: &str = "X-Consul-Token";

/// A key/value destination of published config.
#[async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    /// Write a value, returning only once the store acknowledged the write.
    async fn put(&self, key: &str, value: &[u8]) -> Result<()>;
    /// Read a value, `None` if the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
}

/// A consul KV client.
pub struct ConsulStore {
    client: reqwest::Client,
    address: String,
    token: Option<String>,
}

#[derive(Deserialize)]
struct ConsulKv {
    #[serde(rename = "Value", default)]
    value: Option<String>,
}

impl ConsulStore {
    pub fn new(address: &str, config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("error building consul client")?;
        Ok(Self {
            client,
            address: address.trim_end_matches('/').to_string(),
            token: config.consul_token.clone(),
        })
    }

    fn url(&self, key: &str) -> String {
        format!("{}/v1/kv/{}", self.address, key.trim_start_matches('/'))
    }

    fn with_token(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => req.header(HEADER_CONSUL_TOKEN, token),
            None => req,
        }
    }
}

#[async_trait]
impl CoordinationStore for ConsulStore {
    #[tracing::instrument(level = "debug", skip(self, value), fields(len = value.len()))]
    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let res = self
            .with_token(self.client.put(self.url(key)))
            .body(value.to_vec())
            .send()
            .await
            .context("error sending put to consul")?;
        let status = res.status();
        let body = res.text().await.context("error reading consul put response")?;
        if !status.is_success() {
            bail!("consul rejected put of {} with status {}: {}", key, status, body);
        }
        if body.trim() != "true" {
            bail!("consul did not acknowledge put of {}: {}", key, body);
        }
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let res = self
            .with_token(self.client.get(self.url(key)))
            .send()
            .await
            .context("error sending get to consul")?;
        if res.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let res = res.error_for_status().context("consul rejected get")?;
        let rows: Vec<ConsulKv> = res.json().await.context("error decoding consul get response")?;
        match rows.into_iter().next().and_then(|row| row.value) {
            Some(encoded) => base64::decode(encoded).map(Some).context("error decoding consul value"),
            None => Ok(None),
        }
    }
}

/// An in-process store, used when no consul agent is configured.
#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<BTreeMap<String, Vec<u8>>>,
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.values
            .lock()
            .map_err(|_| anyhow!("memory store poisoned"))?
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.values.lock().map_err(|_| anyhow!("memory store poisoned"))?.get(key).cloned())
    }
}
