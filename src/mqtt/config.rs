use crate::error::ConfigError;
use crate::mqtt::topic::{BrokerId, DeviceId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Connection record of one community broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub id: BrokerId,
    /// Public name of the community
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Devices already known when the hub starts
    #[serde(default)]
    pub devices: Vec<DeviceId>,
}

impl BrokerConfig {
    pub fn new(id: u32, name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: BrokerId(id),
            name: name.into(),
            host: host.into(),
            port,
            username: None,
            password: None,
            devices: Vec::new(),
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_devices(mut self, devices: impl IntoIterator<Item = DeviceId>) -> Self {
        self.devices = devices.into_iter().collect();
        self
    }

    /// Username and password, only when both are present
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(user), Some(pw)) => Some((user.as_str(), pw.as_str())),
            _ => None,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::EmptyHost(self.id));
        }
        if self.port == 0 {
            return Err(ConfigError::ZeroPort(self.id));
        }
        if self.username.is_some() != self.password.is_some() {
            return Err(ConfigError::PartialCredentials(self.id));
        }
        Ok(())
    }
}

impl fmt::Display for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "<community broker {} | {} on {}:{}>",
            self.id, self.name, self.host, self.port
        )
    }
}

/// Reconnect backoff settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Delay before the first retry
    pub initial_delay_ms: u64,
    /// Upper bound of the delay before jitter
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Relative spread applied to each delay, `0.25` means +-25%
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

impl ReconnectConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.multiplier < 1.0 {
            return Err(ConfigError::Reconnect(format!(
                "multiplier {} must be at least 1.0",
                self.multiplier
            )));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(ConfigError::Reconnect(format!(
                "jitter {} must be in [0.0, 1.0)",
                self.jitter
            )));
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(ConfigError::Reconnect(format!(
                "initial delay {}ms exceeds max delay {}ms",
                self.initial_delay_ms, self.max_delay_ms
            )));
        }
        Ok(())
    }
}
