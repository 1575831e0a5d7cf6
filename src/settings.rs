//! Configuration for the bridge binary.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub log_format: LogFormat,
}

/// Output format for logs.
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Identity of the synthetic node.
#[derive(Debug, Deserialize, Clone)]
pub struct NodeConfig {
    /// Name the synthetic node registers under upstream.
    #[serde(default = "default_node_name")]
    pub name: String,
    #[serde(default = "default_kubelet_version")]
    pub kubelet_version: String,
    #[serde(default = "default_daemon_port")]
    pub daemon_port: i32,
    /// Advertised addresses. When unset, the TRESTLE_POD_IP and
    /// TRESTLE_EXTERNAL_POD_IP environment variables are consulted.
    #[serde(default)]
    pub internal_ip: Option<String>,
    #[serde(default)]
    pub external_ip: Option<String>,
    /// Extra labels stamped onto the synthetic node.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Kubeconfig for the downstream cluster. When unset, the default client
    /// configuration serves both sides.
    #[serde(default)]
    pub downstream_kubeconfig: Option<PathBuf>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: default_node_name(),
            kubelet_version: default_kubelet_version(),
            daemon_port: default_daemon_port(),
            internal_ip: None,
            external_ip: None,
            labels: BTreeMap::new(),
            downstream_kubeconfig: None,
        }
    }
}

fn default_node_name() -> String {
    "trestle".to_string()
}

fn default_kubelet_version() -> String {
    "v1.32.0".to_string()
}

fn default_daemon_port() -> i32 {
    10250
}

/// Node status sync loop settings.
#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    /// Workers draining the node-status queue.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Interval between full resyncs of the synthetic node.
    #[serde(default = "default_resync_interval_secs")]
    pub resync_interval_secs: u64,
    /// Initial per-key retry delay after a failed sync.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Upper bound on the per-key retry delay.
    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            resync_interval_secs: default_resync_interval_secs(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_secs: default_backoff_max_secs(),
        }
    }
}

fn default_workers() -> usize {
    2
}

fn default_resync_interval_secs() -> u64 {
    60
}

fn default_backoff_base_ms() -> u64 {
    100
}

fn default_backoff_max_secs() -> u64 {
    300
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let data = fs::read_to_string(p)?;
                let cfg: Self = toml::from_str(&data)?;
                Ok(cfg)
            }
            None => Ok(Self {
                node: NodeConfig::default(),
                sync: SyncConfig::default(),
                log_format: LogFormat::default(),
            }),
        }
    }
}
