use crate::errors::*;
use crate::search::HealthStatus;
use log::info;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the YAML file `OperatorConfig` is read from.
pub const CONFIG_ENV: &str = "SHARDWISE_CONFIG";

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct OperatorConfig {
    /// Health statuses that let an operation start and that end its recovery.
    pub acceptable_health: Vec<HealthStatus>,
    pub poll_interval_ms: u64,
    /// How long a scaled down node may take to drop out of the membership view.
    pub leave_timeout_ms: u64,
    /// How long a single node restart waits for the node to come back within one pass.
    pub rejoin_timeout_ms: u64,
    /// How long a full-cluster restart waits for every node to stop serving.
    pub drain_timeout_ms: u64,
    pub status_conflict_retries: u32,
    pub requeue_secs: u64,
    pub retry_requeue_secs: u64,
    pub error_requeue_secs: u64,
    pub admin: AdminConfig,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        OperatorConfig {
            acceptable_health: vec![HealthStatus::Green, HealthStatus::Yellow],
            poll_interval_ms: 2_000,
            leave_timeout_ms: 60_000,
            rejoin_timeout_ms: 60_000,
            drain_timeout_ms: 120_000,
            status_conflict_retries: 5,
            requeue_secs: 300,
            retry_requeue_secs: 10,
            error_requeue_secs: 60,
            admin: AdminConfig::default(),
        }
    }
}

impl OperatorConfig {
    pub fn from_yaml(s: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(s)?)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .chain_err(|| format!("reading config {}", path.display()))?;
        Self::from_yaml(&raw).chain_err(|| format!("parsing config {}", path.display()))
    }

    /// Loads the file named by `SHARDWISE_CONFIG`, or the defaults when unset.
    pub fn load() -> Result<Self> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => {
                info!("loading config from {:?}", path);
                Self::from_file(Path::new(&path))
            }
            None => Ok(Self::default()),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn leave_timeout(&self) -> Duration {
        Duration::from_millis(self.leave_timeout_ms)
    }

    pub fn rejoin_timeout(&self) -> Duration {
        Duration::from_millis(self.rejoin_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct AdminConfig {
    /// Base URL of the administrative API; `{cluster}` and `{namespace}` are substituted.
    pub url_template: String,
    pub ca_cert_path: Option<PathBuf>,
    pub timeout_ms: u64,
}

impl Default for AdminConfig {
    fn default() -> Self {
        AdminConfig {
            url_template: "https://{cluster}.{namespace}.svc:9200".to_string(),
            ca_cert_path: None,
            timeout_ms: 30_000,
        }
    }
}

impl AdminConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}
