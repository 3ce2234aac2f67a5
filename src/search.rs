use crate::config::AdminConfig;
use crate::errors::*;
use async_trait::async_trait;
use log::{debug, trace};
use reqwest::{Method, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

const ALLOCATION_ENABLE: &str = "cluster.routing.allocation.enable";
const MINIMUM_MASTER_NODES: &str = "discovery.zen.minimum_master_nodes";

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Green,
    Yellow,
    Red,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HealthStatus::Green => "green",
            HealthStatus::Yellow => "yellow",
            HealthStatus::Red => "red",
        })
    }
}

/// Values of `cluster.routing.allocation.enable`.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AllocationMode {
    None,
    Primaries,
    All,
}

impl AllocationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationMode::None => "none",
            AllocationMode::Primaries => "primaries",
            AllocationMode::All => "all",
        }
    }
}

/// Administrative calls the orchestrator makes against a running cluster.
///
/// Calls that change settings report whether the cluster acknowledged them;
/// it is up to the caller to decide if an unacknowledged change is fatal.
#[async_trait]
pub trait SearchAdmin: Send + Sync {
    async fn health_status(&self) -> Result<HealthStatus>;
    async fn set_shard_allocation(&self, mode: AllocationMode) -> Result<bool>;
    async fn clear_shard_allocation(&self) -> Result<bool>;
    async fn synchronized_flush(&self) -> Result<bool>;
    async fn node_count(&self) -> Result<i32>;
    async fn min_master_nodes(&self) -> Result<i32>;
    async fn set_min_master_nodes(&self, n: i32) -> Result<bool>;
}

#[derive(Deserialize, Debug)]
struct ClusterHealth {
    status: HealthStatus,
    #[serde(default)]
    number_of_nodes: i32,
}

#[derive(Deserialize, Debug)]
struct Acknowledged {
    #[serde(default)]
    acknowledged: bool,
}

/// HTTP(S) client for the administrative REST API of one cluster.
pub struct HttpSearchAdmin {
    client: reqwest::Client,
    base: String,
}

impl HttpSearchAdmin {
    pub fn new(config: &AdminConfig, cluster: &str, namespace: &str) -> Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(config.timeout());
        if let Some(path) = &config.ca_cert_path {
            let pem = std::fs::read(path)
                .chain_err(|| format!("reading admin CA bundle {}", path.display()))?;
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
        }
        let base = config
            .url_template
            .replace("{cluster}", cluster)
            .replace("{namespace}", namespace);

        Ok(HttpSearchAdmin {
            client: builder.build()?,
            base: base.trim_end_matches('/').to_string(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client.request(method, format!("{}{}", self.base, path))
    }

    async fn send(&self, req: RequestBuilder) -> Result<Value> {
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!(ErrorKind::AdminStatus(status.as_u16(), body));
        }
        let body = resp.json::<Value>().await?;
        trace!("admin response: {}", body);
        Ok(body)
    }

    async fn put_settings(&self, body: Value) -> Result<bool> {
        let resp = self
            .send(self.request(Method::PUT, "/_cluster/settings").json(&body))
            .await?;
        let ack: Acknowledged = serde_json::from_value(resp)?;
        Ok(ack.acknowledged)
    }

    async fn health(&self) -> Result<ClusterHealth> {
        let resp = self
            .send(self.request(Method::GET, "/_cluster/health"))
            .await?;
        Ok(serde_json::from_value(resp)?)
    }
}

#[async_trait]
impl SearchAdmin for HttpSearchAdmin {
    async fn health_status(&self) -> Result<HealthStatus> {
        Ok(self.health().await?.status)
    }

    async fn set_shard_allocation(&self, mode: AllocationMode) -> Result<bool> {
        debug!("setting {} to {}", ALLOCATION_ENABLE, mode.as_str());
        self.put_settings(json!({ "persistent": { ALLOCATION_ENABLE: mode.as_str() } }))
            .await
    }

    async fn clear_shard_allocation(&self) -> Result<bool> {
        debug!("clearing transient {}", ALLOCATION_ENABLE);
        self.put_settings(json!({ "transient": { ALLOCATION_ENABLE: null } }))
            .await
    }

    async fn synchronized_flush(&self) -> Result<bool> {
        let resp = self
            .send(self.request(Method::POST, "/_flush/synced"))
            .await?;
        Ok(flush_succeeded(&resp))
    }

    async fn node_count(&self) -> Result<i32> {
        Ok(self.health().await?.number_of_nodes)
    }

    async fn min_master_nodes(&self) -> Result<i32> {
        let resp = self
            .send(self.request(Method::GET, "/_cluster/settings?flat_settings=true"))
            .await?;
        Ok(min_master_setting(&resp))
    }

    async fn set_min_master_nodes(&self, n: i32) -> Result<bool> {
        self.put_settings(json!({ "persistent": { MINIMUM_MASTER_NODES: n } }))
            .await
    }
}

// a synced flush is only useful if no shard copy failed to flush.
fn flush_succeeded(resp: &Value) -> bool {
    resp.pointer("/_shards/failed")
        .and_then(Value::as_i64)
        .map(|failed| failed == 0)
        .unwrap_or(false)
}

// persistent wins over transient; the setting comes back as a string.
fn min_master_setting(resp: &Value) -> i32 {
    ["persistent", "transient"]
        .iter()
        .filter_map(|scope| resp.get(scope).and_then(|s| s.get(MINIMUM_MASTER_NODES)))
        .filter_map(|v| match v {
            Value::String(s) => s.parse().ok(),
            Value::Number(n) => n.as_i64().map(|n| n as i32),
            _ => None,
        })
        .next()
        .unwrap_or(0)
}

/// Majority of the master-eligible nodes.
pub fn quorum(master_nodes: i32) -> i32 {
    master_nodes / 2 + 1
}
