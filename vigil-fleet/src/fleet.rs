//! Fleet orchestration: staggered provisioning, parallel streaming and
//! parallel teardown of many agent sessions.

use crate::error::FleetError;
use crate::session::{AgentSession, SessionSettings, StreamSummary};
use chrono::Utc;
use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use vigil_core::{DurableStore, ReconnectRecord, SessionRecord, TransportFactory};

#[derive(Debug, Clone)]
pub struct FleetSettings {
    pub session: SessionSettings,
    /// Delay between two successive connect launches
    pub stagger: Duration,
}

impl Default for FleetSettings {
    fn default() -> Self {
        Self { session: SessionSettings::default(), stagger: Duration::from_millis(100) }
    }
}

/// Deterministic identity of the `index`-th agent (0-based).
pub fn agent_id(index: usize) -> String {
    format!("agent-{:03}", index + 1)
}

pub struct FleetOrchestrator {
    settings: FleetSettings,
    factory: Arc<dyn TransportFactory>,
    reconnect_log: Arc<DurableStore<ReconnectRecord>>,
    sessions: Vec<Arc<AgentSession>>,
    cancel: CancellationToken,
}

impl FleetOrchestrator {
    pub fn new(
        settings: FleetSettings,
        factory: Arc<dyn TransportFactory>,
        reconnect_log: Arc<DurableStore<ReconnectRecord>>,
    ) -> Self {
        Self { settings, factory, reconnect_log, sessions: Vec::new(), cancel: CancellationToken::new() }
    }

    /// Parent of every streaming token; cancelling it stops the whole fleet.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    #[cfg(test)]
    pub fn sessions(&self) -> &[Arc<AgentSession>] {
        &self.sessions
    }

    /// Creates `count` sessions and connects them, one launch every
    /// `stagger`. Waits for every outcome before reporting failures.
    pub async fn provision(&mut self, count: usize) -> Result<(), FleetError> {
        info!(count, "provisioning agents");
        let mut launches = Vec::with_capacity(count);

        for index in 0..count {
            let session = Arc::new(AgentSession::new(
                agent_id(index),
                self.factory.as_ref(),
                &self.settings.session,
                Arc::clone(&self.reconnect_log),
            )?);
            self.sessions.push(Arc::clone(&session));
            launches.push(tokio::spawn(async move {
                let outcome = session.connect().await;
                (session.agent_id().to_string(), outcome)
            }));

            if index + 1 < count {
                tokio::time::sleep(self.settings.stagger).await;
            }
        }

        let mut failures = Vec::new();
        for outcome in join_all(launches).await {
            match outcome {
                Ok((_, Ok(()))) => {}
                Ok((agent_id, Err(source))) => failures.push(FleetError::Connect { agent_id, source }.to_string()),
                Err(e) => failures.push(format!("connect task failed: {e}")),
            }
        }

        if failures.is_empty() {
            info!(count, "✅ all agents connected");
            Ok(())
        } else {
            for failure in &failures {
                error!("{}", failure);
            }
            Err(FleetError::Provision { failed: failures.len(), total: count, details: failures.join("; ") })
        }
    }

    /// Streams from every agent concurrently. Each agent gets its own child
    /// token, so it can be stopped without touching the others.
    pub async fn stream_all(&self, topic: &str, interval: Duration, count: u64) -> Vec<StreamSummary> {
        info!(agents = self.sessions.len(), topic, count, "streaming from all agents");

        let tasks = self.sessions.iter().map(|session| {
            let session = Arc::clone(session);
            let topic = topic.to_string();
            let token = self.cancel.child_token();
            tokio::spawn(async move { session.stream(&topic, interval, count, token).await })
        });

        let mut summaries = Vec::with_capacity(self.sessions.len());
        for result in join_all(tasks).await {
            match result {
                Ok(summary) => summaries.push(summary),
                Err(e) => error!(error = %e, "streaming task failed"),
            }
        }
        info!(agents = summaries.len(), "all agents completed streaming");
        summaries
    }

    pub fn display_stats(&self) {
        let now = Utc::now();
        info!("=== Agent statistics ===");
        for session in &self.sessions {
            let stats = session.stats();
            info!(
                agent_id = %stats.agent_id,
                sent = stats.messages_sent,
                received = stats.messages_received,
                connected = stats.is_connected(),
                endpoint_index = session.controller().endpoint_index(),
                connected_secs = format!("{:.1}", stats.connected_for(now)),
                "agent stats"
            );
        }
    }

    /// Shuts every session down in parallel and reports the final state.
    pub async fn teardown_all(&mut self) -> FleetReport {
        info!(agents = self.sessions.len(), "disconnecting all agents");
        self.cancel.cancel();

        let sessions = std::mem::take(&mut self.sessions);
        let records = join_all(sessions.iter().map(|session| session.shutdown())).await;
        let report = FleetReport { sessions: records, reconnects: self.reconnect_log.snapshot().await };
        info!(agents = report.sessions.len(), "all agents disconnected");
        report
    }
}

/// Final per-agent records plus the reconnect log
#[derive(Debug, Clone, Default)]
pub struct FleetReport {
    pub sessions: Vec<SessionRecord>,
    pub reconnects: BTreeMap<String, ReconnectRecord>,
}

impl FleetReport {
    pub fn total_sent(&self) -> u64 {
        self.sessions.iter().map(|s| s.messages_sent).sum()
    }

    pub fn total_received(&self) -> u64 {
        self.sessions.iter().map(|s| s.messages_received).sum()
    }

    pub fn log_summary(&self) {
        for record in &self.sessions {
            let until = record.disconnected_at.unwrap_or_else(Utc::now);
            info!(
                agent_id = %record.agent_id,
                sent = record.messages_sent,
                received = record.messages_received,
                connected_secs = format!("{:.1}", record.connected_for(until)),
                "final stats"
            );
        }
        for reconnect in self.reconnects.values() {
            info!(
                agent_id = %reconnect.agent_id,
                downtime_seconds = format!("{:.2}", reconnect.downtime_seconds),
                attempts = reconnect.attempts,
                "last reconnection"
            );
        }
        info!(
            agents = self.sessions.len(),
            sent = self.total_sent(),
            received = self.total_received(),
            reconnected = self.reconnects.len(),
            "📊 fleet totals"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_devkit::TestHarness;

    async fn orchestrator(harness: &TestHarness) -> FleetOrchestrator {
        let log = Arc::new(DurableStore::load(harness.reconnect_log_path()).await);
        FleetOrchestrator::new(FleetSettings::default(), harness.network.clone(), log)
    }

    #[test]
    fn test_agent_ids_are_sequential() {
        assert_eq!(agent_id(0), "agent-001");
        assert_eq!(agent_id(41), "agent-042");
    }

    #[tokio::test(start_paused = true)]
    async fn test_provision_staggers_launches() {
        let harness = TestHarness::new().unwrap();
        let mut fleet = orchestrator(&harness).await;

        let started = tokio::time::Instant::now();
        fleet.provision(5).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(400));
        assert_eq!(harness.network.client_ids(), vec!["agent-001", "agent-002", "agent-003", "agent-004", "agent-005"]);
        assert!(fleet.sessions().iter().all(|s| s.controller().is_online()));
        fleet.teardown_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_provision_fails_together() {
        let harness = TestHarness::new().unwrap();
        harness.network.make_unreachable("agent-002");
        let mut fleet = orchestrator(&harness).await;

        let err = fleet.provision(3).await.unwrap_err();
        match err {
            FleetError::Provision { failed, total, details } => {
                assert_eq!((failed, total), (1, 3));
                assert!(details.contains("agent-002"));
            }
            other => panic!("unexpected error: {other}"),
        }
        // Every launch ran, the others are connected
        assert_eq!(fleet.sessions().len(), 3);
        assert!(fleet.sessions()[2].controller().is_online());

        let report = fleet.teardown_all().await;
        assert_eq!(report.sessions.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_all_and_teardown_report() {
        let harness = TestHarness::new().unwrap();
        let mut fleet = orchestrator(&harness).await;
        fleet.provision(3).await.unwrap();

        let summaries = fleet.stream_all("data/stream", Duration::from_millis(50), 4).await;
        assert_eq!(summaries.len(), 3);
        assert!(summaries.iter().all(|s| s.published == 4));
        assert_eq!(harness.get_stats().topic_counts["data/stream"], 12);

        fleet.display_stats();
        let report = fleet.teardown_all().await;
        assert_eq!(report.total_sent(), 12);
        assert_eq!(report.total_received(), 0);
        assert!(report.sessions.iter().all(|s| s.disconnected_at.is_some()));
        assert!(report.reconnects.is_empty());
        assert!(fleet.sessions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_token_stops_every_stream() {
        let harness = TestHarness::new().unwrap();
        let mut fleet = orchestrator(&harness).await;
        fleet.provision(2).await.unwrap();

        let cancel = fleet.cancel_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            cancel.cancel();
        });
        let summaries = fleet.stream_all("data/stream", Duration::from_secs(1), 100).await;
        assert!(summaries.iter().all(|s| s.cancelled && s.published < 100));
        fleet.teardown_all().await;
    }
}
