/*!
Aggregator router: per-agent session state on connect, disconnect and telemetry.

Every mutating event goes through the durable store, which persists the whole
snapshot under its lock. Telemetry feeds the sliding window kept in the
agent's record; a spike produces an alert on `response/{agent_id}`.
*/

use crate::health::HealthTracker;
use crate::state::ActiveIndex;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use vigil_core::{topics, AlertMessage, DurableStore, SessionRecord, SlidingWindowDetector, StreamMessage, Transport};

pub struct AggregatorRouter {
    store: Arc<DurableStore<SessionRecord>>,
    active: ActiveIndex,
    detector: SlidingWindowDetector,
    transport: Arc<dyn Transport>,
    health: HealthTracker,
}

impl AggregatorRouter {
    pub fn new(
        store: Arc<DurableStore<SessionRecord>>,
        detector: SlidingWindowDetector,
        transport: Arc<dyn Transport>,
        health: HealthTracker,
    ) -> Self {
        Self { store, active: ActiveIndex::new(), detector, transport, health }
    }

    /// Reuses the durable record of a known identity, creates one otherwise.
    pub async fn on_connect(&self, agent_id: &str) {
        let now = Utc::now();
        let existed = self
            .store
            .upsert(agent_id, || SessionRecord::new(agent_id, now), |record, existed| {
                record.mark_connected(now);
                existed
            })
            .await;
        self.active.insert(agent_id);

        if existed {
            info!(agent_id, "agent reconnected");
        } else {
            info!(agent_id, "agent connected");
        }
        debug!(active = self.active.len(), "active agents");
    }

    /// Stamps the disconnect on a record still marked connected, including
    /// one restored from disk for an agent that left while we were down, and
    /// drops the identity from the active index. The durable record stays.
    pub async fn on_disconnect(&self, agent_id: &str) {
        let now = Utc::now();
        let stamped = self
            .store
            .update_if(agent_id, |record| {
                if !record.is_connected() {
                    return false;
                }
                record.mark_disconnected(now);
                true
            })
            .await;
        let was_active = self.active.remove(agent_id);

        match (was_active, stamped) {
            (true, _) => info!(agent_id, active = self.active.len(), "agent disconnected"),
            (false, true) => info!(agent_id, "restored session closed"),
            (false, false) => debug!(agent_id, "disconnect for inactive agent ignored"),
        }
    }

    /// Counts the reading, runs spike detection and replies on an alert.
    /// Returns the alert that was published, if any.
    pub async fn on_telemetry(&self, message: StreamMessage) -> Option<AlertMessage> {
        let agent_id = message.agent_id.as_str();
        if !self.active.contains(agent_id) {
            debug!(agent_id, "telemetry from inactive agent dropped");
            return None;
        }

        let now = Utc::now();
        let detector = self.detector;
        let spike = self
            .store
            .update(agent_id, |record| {
                record.record_received(now);
                detector.observe(&mut record.recent_readings, message.temperature)
            })
            .await
            .flatten()?;

        let alert = AlertMessage {
            agent_id: agent_id.to_string(),
            avg: spike.avg,
            deviation: spike.deviation,
            message: spike.message,
            timestamp: now,
        };
        info!(agent_id, sequence = message.sequence_number, "{}", alert.message);

        let payload = match serde_json::to_vec(&alert) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(agent_id, error = %e, "failed to encode alert");
                return None;
            }
        };
        if let Err(e) = self.transport.publish(&topics::reply_topic(agent_id), payload, false).await {
            warn!(agent_id, error = %e, "failed to send alert");
            return None;
        }

        self.health.record_alert();
        self.store.update(agent_id, |record| record.record_sent(Utc::now())).await;
        Some(alert)
    }

    pub fn active_agents(&self) -> Vec<String> {
        self.active.list()
    }

    pub fn is_active(&self, agent_id: &str) -> bool {
        self.active.contains(agent_id)
    }

    pub async fn sessions(&self) -> BTreeMap<String, SessionRecord> {
        self.store.snapshot().await
    }

    pub async fn session(&self, agent_id: &str) -> Option<SessionRecord> {
        self.store.get(agent_id).await
    }

    pub async fn tracked(&self) -> usize {
        self.store.len().await
    }

    pub fn persistence_failures(&self) -> u64 {
        self.store.save_failures()
    }
}
