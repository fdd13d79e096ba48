use crate::types::ProcessId;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    #[serde(default)]
    pub register: RegisterConfig,
    pub cluster: ClusterConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node_id: u16,
    #[serde(default)]
    pub epoch: u8,
    pub listen_addr: String,
    #[serde(default)]
    pub writable: bool,
}

impl NodeConfig {
    /// Get the ProcessId for this node
    pub fn process_id(&self) -> ProcessId {
        ProcessId::new(self.node_id, self.epoch)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterConfig {
    /// Group name every replica of the register joins
    #[serde(default = "default_register_name")]
    pub name: String,
    /// Give up on an operation after this long; absent means wait forever
    #[serde(default)]
    pub operation_timeout_ms: Option<u64>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_register_name() -> String {
    "abd".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    1000
}

impl Default for RegisterConfig {
    fn default() -> Self {
        Self {
            name: default_register_name(),
            operation_timeout_ms: None,
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl RegisterConfig {
    pub fn operation_timeout(&self) -> Option<Duration> {
        self.operation_timeout_ms.map(Duration::from_millis)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub replicas: Vec<ReplicaInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, PartialOrd, Eq, Ord)]
pub struct ReplicaInfo {
    pub node_id: u16,
    #[serde(default)]
    pub epoch: u8,
    pub addr: String,
}

impl ReplicaInfo {
    /// Get the ProcessId for this replica
    pub fn process_id(&self) -> ProcessId {
        ProcessId::new(self.node_id, self.epoch)
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .build()?;

        settings.try_deserialize()
    }
}
