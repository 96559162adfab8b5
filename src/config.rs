use crate::error::ConfigError;
use crate::mqtt::config::{BrokerConfig, ReconnectConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const CONFIG_DIR: &str = "aquahub";
const CONFIG_FILE: &str = "hub.toml";

/// Top level hub configuration, read once at startup
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct HubConfig {
    /// Client id presented to every broker
    pub client_id: String,
    pub keep_alive_secs: u64,
    /// Capacity of the rumqttc request channel per broker
    pub request_capacity: usize,
    /// Buffer of the outbound event sink
    pub event_capacity: usize,
    /// Buffer of each broker's command channel
    pub command_capacity: usize,
    /// Subscribe the greeting wildcard so untracked devices are seen
    pub discover_devices: bool,
    pub reconnect: ReconnectConfig,
    pub brokers: Vec<BrokerConfig>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            client_id: "SERVER".to_string(),
            keep_alive_secs: 30,
            request_capacity: 100,
            event_capacity: 1024,
            command_capacity: 64,
            discover_devices: true,
            reconnect: ReconnectConfig::default(),
            brokers: Vec::new(),
        }
    }
}

impl HubConfig {
    /// `<config dir>/aquahub/hub.toml`
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let mut path = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        Ok(path)
    }

    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        debug!("Reading hub config from {}", path.display());
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.display().to_string(),
                source,
            })?;
        let config = Self::from_toml(&content)?;
        info!(
            "Loaded hub config with {} broker(s) from {}",
            config.brokers.len(),
            path.display()
        );
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: HubConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.reconnect.validate()?;

        let mut seen = HashSet::new();
        for broker in &self.brokers {
            if !seen.insert(broker.id) {
                return Err(ConfigError::DuplicateBroker(broker.id));
            }
            broker.validate()?;
        }
        Ok(())
    }
}
