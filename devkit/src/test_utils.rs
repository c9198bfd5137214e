/*!
Test harness for Vigil components

- Temporary data directory for snapshot files
- Mock network shared by every agent of a test fleet
- Polling helpers for asynchronous assertions
*/

use crate::mqtt_stub::{MockNetwork, MockTransport};
use anyhow::Result;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub struct TestHarness {
    dir: TempDir,
    pub network: Arc<MockNetwork>,
}

impl TestHarness {
    pub fn new() -> Result<Self> {
        env_logger::try_init().ok(); // logging for tests

        Ok(Self {
            dir: tempfile::tempdir()?,
            network: Arc::new(MockNetwork::new()),
        })
    }

    /// Aggregator session snapshot path inside the temp dir
    pub fn state_path(&self) -> PathBuf {
        self.dir.path().join("data").join("state.json")
    }

    /// Agent-side reconnect log path inside the temp dir
    pub fn reconnect_log_path(&self) -> PathBuf {
        self.dir.path().join("data").join("reconnect_logs.json")
    }

    pub fn transport(&self, client_id: &str) -> Result<MockTransport> {
        self.network
            .transport(client_id)
            .ok_or_else(|| anyhow::anyhow!("no transport created for {}", client_id))
    }

    /// Polls `condition` until it holds or `timeout_ms` elapses.
    pub async fn wait_until<F>(&self, timeout_ms: u64, condition: F) -> bool
    where
        F: Fn() -> bool,
    {
        let start = tokio::time::Instant::now();
        while start.elapsed() < Duration::from_millis(timeout_ms) {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        log::warn!("⏰ Condition not met within {}ms", timeout_ms);
        condition()
    }

    /// Messages published per topic across every mock transport
    pub fn get_stats(&self) -> TestStats {
        let mut topic_counts = HashMap::new();
        let mut total_messages = 0;

        for client_id in self.network.client_ids() {
            if let Some(transport) = self.network.transport(&client_id) {
                for msg in transport.get_published_messages() {
                    *topic_counts.entry(msg.topic).or_insert(0) += 1;
                    total_messages += 1;
                }
            }
        }

        TestStats { total_messages, topic_counts }
    }
}

#[derive(Debug)]
pub struct TestStats {
    pub total_messages: usize,
    pub topic_counts: HashMap<String, usize>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::{Endpoint, Transport, TransportFactory};

    #[tokio::test]
    async fn test_harness_paths_and_stats() {
        let harness = TestHarness::new().unwrap();
        assert!(harness.state_path().ends_with("data/state.json"));
        assert_ne!(harness.state_path(), harness.reconnect_log_path());

        let (transport, _events) = harness.network.create("agent-001");
        transport.connect(&Endpoint::new("localhost", 1883)).await.unwrap();
        transport.publish("data/stream", b"{}".to_vec(), false).await.unwrap();
        transport.publish("data/stream", b"{}".to_vec(), false).await.unwrap();

        let stats = harness.get_stats();
        assert_eq!(stats.total_messages, 2);
        assert_eq!(stats.topic_counts["data/stream"], 2);
    }

    #[tokio::test]
    async fn test_wait_until() {
        let harness = TestHarness::new().unwrap();
        assert!(harness.wait_until(50, || true).await);
        assert!(!harness.wait_until(30, || false).await);
        assert!(harness.transport("nobody").is_err());
    }
}
