use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::warn;
use vigil_core::models::WINDOW_CAPACITY;
use vigil_core::window::DEFAULT_THRESHOLD;
use vigil_core::{topics, Endpoint, SlidingWindowDetector};

pub const CONFIG_ENV: &str = "VIGIL_AGGREGATOR_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "aggregator.yaml";

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AggregatorConfig {
    pub mqtt: MqttConf,
    pub http: HttpConf,
    pub state_path: PathBuf,
    pub telemetry_topic: String,
    pub detector: DetectorConf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
    pub client_id: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConf {
    pub enabled: bool,
    pub port: u16,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct DetectorConf {
    pub window: usize,
    pub threshold: f64,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            mqtt: MqttConf::default(),
            http: HttpConf::default(),
            state_path: PathBuf::from("./data/state.json"),
            telemetry_topic: topics::TELEMETRY_TOPIC.into(),
            detector: DetectorConf::default(),
        }
    }
}

impl Default for MqttConf {
    fn default() -> Self {
        Self { host: "localhost".into(), port: 1883, client_id: "vigil-aggregator".into() }
    }
}

impl Default for HttpConf {
    fn default() -> Self {
        Self { enabled: true, port: 8080 }
    }
}

impl Default for DetectorConf {
    fn default() -> Self {
        Self { window: WINDOW_CAPACITY, threshold: DEFAULT_THRESHOLD }
    }
}

impl AggregatorConfig {
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::new(&self.mqtt.host, self.mqtt.port)
    }

    /// The window never exceeds the capacity of `SessionRecord::recent_readings`.
    pub fn detector(&self) -> SlidingWindowDetector {
        let window = self.detector.window.clamp(2, WINDOW_CAPACITY);
        if window != self.detector.window {
            warn!(configured = self.detector.window, used = window, "detector window out of range");
        }
        SlidingWindowDetector::new(window, self.detector.threshold)
    }
}

/// Reads `path`, or the file named by `VIGIL_AGGREGATOR_CONFIG`, or
/// `aggregator.yaml`. Missing, empty or invalid files fall back to defaults.
pub async fn load_config(path: Option<&Path>) -> AggregatorConfig {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => PathBuf::from(std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into())),
    };
    if !path.exists() {
        warn!(path = %path.display(), "no config file, using defaults");
        return AggregatorConfig::default();
    }

    let txt = fs::read_to_string(&path).await.unwrap_or_default();
    if txt.trim().is_empty() {
        return AggregatorConfig::default();
    }
    serde_yaml::from_str(&txt).unwrap_or_else(|e| {
        warn!(path = %path.display(), error = %e, "invalid config, using defaults");
        AggregatorConfig::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = AggregatorConfig::default();
        assert_eq!(cfg.endpoint(), Endpoint::new("localhost", 1883));
        assert_eq!(cfg.http.port, 8080);
        assert_eq!(cfg.telemetry_topic, "data/stream");
        assert_eq!(cfg.detector().capacity(), 10);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let cfg: AggregatorConfig = serde_yaml::from_str("mqtt:\n  port: 2883\nhttp:\n  enabled: false\n").unwrap();
        assert_eq!(cfg.mqtt.port, 2883);
        assert_eq!(cfg.mqtt.host, "localhost");
        assert!(!cfg.http.enabled);
        assert_eq!(cfg.state_path, PathBuf::from("./data/state.json"));
    }

    #[test]
    fn test_detector_window_is_clamped() {
        let mut cfg = AggregatorConfig::default();
        cfg.detector.window = 50;
        assert_eq!(cfg.detector().capacity(), 10);
        cfg.detector.window = 5;
        assert_eq!(cfg.detector().capacity(), 5);
    }

    #[tokio::test]
    async fn test_load_config_fallbacks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("aggregator.yaml");
        assert_eq!(load_config(Some(&path)).await.mqtt.port, 1883);

        std::fs::write(&path, "mqtt: [not, a, map]").unwrap();
        assert_eq!(load_config(Some(&path)).await.mqtt.port, 1883);

        std::fs::write(&path, "mqtt:\n  host: broker.lan\n").unwrap();
        assert_eq!(load_config(Some(&path)).await.mqtt.host, "broker.lan");
    }
}
