//! Fleet driver configuration
//!
//! Handles:
//! - Broker host and candidate ports
//! - Fleet size, message count and pacing
//! - Reconnection timings and the reconnect log location
//!
//! Read from TOML (`VIGIL_FLEET_CONFIG` or `fleet.toml`), then overridden by
//! the positional command-line arguments.

use crate::cli::Args;
use crate::fleet::FleetSettings;
use crate::reconnect::ReconnectPolicy;
use crate::sensor::DEFAULT_BASELINE;
use crate::session::SessionSettings;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use vigil_core::transport::MqttSettings;
use vigil_core::{topics, Endpoint};

pub const DEFAULT_CONFIG_PATH: &str = "fleet.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub broker: BrokerConfig,
    pub fleet: FleetSection,
    pub reconnect: ReconnectConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub host: String,
    /// Candidate ports, tried in order during failover
    pub ports: Vec<u16>,
    pub keep_alive_secs: u64,
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetSection {
    pub agents: usize,
    pub messages: u64,
    pub interval_ms: u64,
    pub stagger_ms: u64,
    pub topic: String,
    pub baseline: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub poll_interval_secs: u64,
    pub backoff_secs: u64,
    pub rotate_after: u32,
    pub retry_delay_ms: u64,
    pub log_path: PathBuf,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self { host: "localhost".to_string(), ports: vec![1883, 1884], keep_alive_secs: 30, connect_timeout_secs: 5 }
    }
}

impl Default for FleetSection {
    fn default() -> Self {
        Self {
            agents: 5,
            messages: 10,
            interval_ms: 1000,
            stagger_ms: 100,
            topic: topics::TELEMETRY_TOPIC.to_string(),
            baseline: DEFAULT_BASELINE,
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 2,
            backoff_secs: 3,
            rotate_after: 3,
            retry_delay_ms: 1000,
            log_path: PathBuf::from("./data/reconnect_logs.json"),
        }
    }
}

impl FleetConfig {
    /// Loads the file named by `--config` / `VIGIL_FLEET_CONFIG`, or
    /// `fleet.toml`. A missing file means defaults; an invalid one is an error.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));

        if !path.exists() {
            info!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config = toml::from_str(&content).with_context(|| format!("Invalid config in {}", path.display()))?;
        info!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Positional arguments win over the file.
    pub fn apply_args(&mut self, args: &Args) {
        if let Some(agents) = args.agents {
            self.fleet.agents = agents;
        }
        if let Some(messages) = args.messages {
            self.fleet.messages = messages;
        }
        if let Some(interval_ms) = args.interval_ms {
            self.fleet.interval_ms = interval_ms;
        }
        if let Some(broker) = &args.broker {
            self.broker.host = broker.clone();
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.broker.host.trim().is_empty() {
            bail!("broker host must not be empty");
        }
        if self.broker.ports.is_empty() {
            bail!("at least one broker port is required");
        }
        if self.reconnect.rotate_after == 0 {
            bail!("reconnect.rotate_after must be at least 1");
        }
        if self.reconnect.poll_interval_secs == 0 {
            bail!("reconnect.poll_interval_secs must be at least 1");
        }
        if self.fleet.topic.is_empty() {
            bail!("fleet.topic must not be empty");
        }
        Ok(())
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.broker.ports.iter().map(|port| Endpoint::new(&self.broker.host, *port)).collect()
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.fleet.interval_ms)
    }

    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            poll_interval: Duration::from_secs(self.reconnect.poll_interval_secs),
            backoff: Duration::from_secs(self.reconnect.backoff_secs),
            rotate_after: self.reconnect.rotate_after,
        }
    }

    pub fn mqtt_settings(&self) -> MqttSettings {
        MqttSettings {
            keep_alive: Duration::from_secs(self.broker.keep_alive_secs),
            connect_timeout: Duration::from_secs(self.broker.connect_timeout_secs),
            ..MqttSettings::default()
        }
    }

    pub fn fleet_settings(&self) -> FleetSettings {
        FleetSettings {
            session: SessionSettings {
                endpoints: self.endpoints(),
                policy: self.policy(),
                retry_delay: Duration::from_millis(self.reconnect.retry_delay_ms),
                baseline: self.fleet.baseline,
            },
            stagger: Duration::from_millis(self.fleet.stagger_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_default_config() {
        let config = FleetConfig::default();
        assert_eq!(config.fleet.agents, 5);
        assert_eq!(config.fleet.messages, 10);
        assert_eq!(config.fleet.interval_ms, 1000);
        assert_eq!(config.broker.host, "localhost");
        assert_eq!(config.endpoints().len(), 2);
        assert_eq!(config.endpoints()[1].port, 1884);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_args_override_file() {
        let mut config: FleetConfig = toml::from_str("[fleet]\nagents = 2\nmessages = 3\n").unwrap();
        assert_eq!(config.fleet.interval_ms, 1000);

        config.apply_args(&Args::parse_from(["vigil-fleet", "8", "20", "250", "broker.local"]));
        assert_eq!(config.fleet.agents, 8);
        assert_eq!(config.fleet.messages, 20);
        assert_eq!(config.interval(), Duration::from_millis(250));
        assert_eq!(config.endpoints()[0], Endpoint::new("broker.local", 1883));
    }

    #[test]
    fn test_validation() {
        let mut config = FleetConfig::default();
        config.broker.ports.clear();
        assert!(config.validate().is_err());

        let mut config = FleetConfig::default();
        config.reconnect.rotate_after = 0;
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_load_missing_and_invalid_files() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("fleet.toml");
        assert_eq!(FleetConfig::load(Some(&missing)).await.unwrap().fleet.agents, 5);

        std::fs::write(&missing, "[broker]\nports = \"not a list\"\n").unwrap();
        assert!(FleetConfig::load(Some(&missing)).await.is_err());

        std::fs::write(&missing, "[broker]\nhost = \"10.0.0.5\"\nports = [2883]\n").unwrap();
        let config = FleetConfig::load(Some(&missing)).await.unwrap();
        assert_eq!(config.endpoints(), vec![Endpoint::new("10.0.0.5", 2883)]);
    }
}
