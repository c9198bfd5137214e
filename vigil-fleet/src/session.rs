//! One simulated agent: transport, reconnect controller, local record and
//! the publish loop.

use crate::error::FleetError;
use crate::reconnect::{EndpointRotation, ReconnectController, ReconnectPolicy};
use crate::sensor::{SensorSimulator, DEFAULT_BASELINE};
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vigil_core::{
    topics, AlertMessage, DurableStore, Endpoint, EventReceiver, PresenceMessage, ReconnectRecord, SessionRecord,
    StreamMessage, Transport, TransportError, TransportEvent, TransportFactory,
};

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub endpoints: Vec<Endpoint>,
    pub policy: ReconnectPolicy,
    /// Wait before retrying a publish while the link is down
    pub retry_delay: Duration,
    pub baseline: f64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            endpoints: vec![Endpoint::new("localhost", 1883), Endpoint::new("localhost", 1884)],
            policy: ReconnectPolicy::default(),
            retry_delay: Duration::from_secs(1),
            baseline: DEFAULT_BASELINE,
        }
    }
}

/// Outcome of one `stream` call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StreamSummary {
    pub agent_id: String,
    pub published: u64,
    pub failed: u64,
    /// Iterations spent waiting for the link
    pub skipped: u64,
    pub cancelled: bool,
}

pub struct AgentSession {
    agent_id: String,
    transport: Arc<dyn Transport>,
    controller: Arc<ReconnectController>,
    record: Arc<Mutex<SessionRecord>>,
    sequence: AtomicU64,
    sensor: Mutex<SensorSimulator>,
    retry_delay: Duration,
    streaming: Mutex<Option<CancellationToken>>,
    events: Mutex<Option<EventReceiver>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl AgentSession {
    pub fn new(
        agent_id: impl Into<String>,
        factory: &dyn TransportFactory,
        settings: &SessionSettings,
        reconnect_log: Arc<DurableStore<ReconnectRecord>>,
    ) -> Result<Self, FleetError> {
        let agent_id = agent_id.into();
        let (transport, events) = factory.create(&agent_id);
        let record = Arc::new(Mutex::new(SessionRecord::new(&agent_id, Utc::now())));

        let rotation = EndpointRotation::new(settings.endpoints.clone(), settings.policy.rotate_after)?;
        let reconnected = Arc::clone(&record);
        let lost = Arc::clone(&record);
        let controller = ReconnectController::new(
            &agent_id,
            Arc::clone(&transport),
            rotation,
            settings.policy.clone(),
            reconnect_log,
        )
        .with_reconnect_hook(move |rec| reconnected.lock().mark_connected(rec.reconnected_at))
        .with_silent_loss_hook(move |at| lost.lock().mark_disconnected(at));

        Ok(Self {
            agent_id,
            transport,
            controller: Arc::new(controller),
            record,
            sequence: AtomicU64::new(0),
            sensor: Mutex::new(SensorSimulator::new(settings.baseline)),
            retry_delay: settings.retry_delay,
            streaming: Mutex::new(None),
            events: Mutex::new(Some(events)),
            pump: Mutex::new(None),
        })
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn controller(&self) -> &Arc<ReconnectController> {
        &self.controller
    }

    /// Initial handshake, then starts the event pump and the liveness monitor.
    pub async fn connect(&self) -> Result<(), TransportError> {
        self.controller.connect().await?;
        self.record.lock().mark_connected(Utc::now());

        if let Some(events) = self.events.lock().take() {
            let pump = handle_events(
                self.agent_id.clone(),
                events,
                Arc::clone(&self.controller),
                Arc::clone(&self.record),
            );
            *self.pump.lock() = Some(tokio::spawn(pump));
        }
        self.controller.start_monitor();
        Ok(())
    }

    /// Publishes `count` readings on `topic`, one every `interval`.
    pub async fn stream(&self, topic: &str, interval: Duration, count: u64, cancel: CancellationToken) -> StreamSummary {
        *self.streaming.lock() = Some(cancel.clone());
        let mut summary = StreamSummary { agent_id: self.agent_id.clone(), ..Default::default() };
        info!(agent_id = %self.agent_id, count, interval_ms = interval.as_millis() as u64, "streaming started");

        for _ in 0..count {
            if cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }

            // Waiting for the link uses up the iteration
            if !self.controller.is_online() {
                summary.skipped += 1;
                debug!(agent_id = %self.agent_id, "not connected, waiting");
                tokio::select! {
                    _ = cancel.cancelled() => { summary.cancelled = true; break; }
                    _ = tokio::time::sleep(self.retry_delay) => continue,
                }
            }

            let message = self.next_message();
            let published = match serde_json::to_vec(&message) {
                Ok(payload) => self.transport.publish(topic, payload, false).await.map_err(|e| e.to_string()),
                Err(e) => Err(e.to_string()),
            };
            match published {
                Ok(()) => {
                    self.record.lock().record_sent(message.timestamp);
                    summary.published += 1;
                    debug!(
                        agent_id = %self.agent_id,
                        sequence = message.sequence_number,
                        temperature = format!("{:.2}", message.temperature),
                        "reading published"
                    );
                }
                Err(e) => {
                    summary.failed += 1;
                    warn!(agent_id = %self.agent_id, sequence = message.sequence_number, error = %e, "publish failed");
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => { summary.cancelled = true; break; }
                _ = tokio::time::sleep(interval) => {}
            }
        }

        info!(
            agent_id = %self.agent_id,
            published = summary.published,
            failed = summary.failed,
            skipped = summary.skipped,
            cancelled = summary.cancelled,
            "streaming finished"
        );
        summary
    }

    pub fn stop_streaming(&self) {
        if let Some(token) = self.streaming.lock().take() {
            token.cancel();
        }
    }

    pub fn stats(&self) -> SessionRecord {
        self.record.lock().clone()
    }

    /// Stops streaming and the monitor, announces `offline` and closes the
    /// transport. Returns the final local record.
    pub async fn shutdown(&self) -> SessionRecord {
        self.stop_streaming();
        self.controller.shutdown().await;

        if self.transport.is_connected() {
            if let Err(e) = self.announce_offline().await {
                warn!(agent_id = %self.agent_id, error = %e, "failed to announce offline presence");
            }
        }
        if let Err(e) = self.transport.disconnect().await {
            warn!(agent_id = %self.agent_id, error = %e, "disconnect failed");
        }
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }

        let record = {
            let mut record = self.record.lock();
            record.mark_disconnected(Utc::now());
            record.clone()
        };
        info!(
            agent_id = %self.agent_id,
            sent = record.messages_sent,
            received = record.messages_received,
            "session closed"
        );
        record
    }

    fn next_message(&self) -> StreamMessage {
        StreamMessage {
            agent_id: self.agent_id.clone(),
            message_id: uuid::Uuid::new_v4().to_string(),
            temperature: self.sensor.lock().next_reading(),
            timestamp: Utc::now(),
            sequence_number: self.sequence.fetch_add(1, Ordering::SeqCst) + 1,
        }
    }

    async fn announce_offline(&self) -> Result<(), TransportError> {
        let payload = serde_json::to_vec(&PresenceMessage::offline(&self.agent_id))
            .map_err(|e| TransportError::Publish { topic: topics::presence_topic(&self.agent_id), reason: e.to_string() })?;
        self.transport.publish(&topics::presence_topic(&self.agent_id), payload, true).await
    }
}

/// Inbound side of one agent: alert replies and connection loss.
async fn handle_events(
    agent_id: String,
    mut events: EventReceiver,
    controller: Arc<ReconnectController>,
    record: Arc<Mutex<SessionRecord>>,
) {
    let reply_topic = topics::reply_topic(&agent_id);

    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Message { topic, payload } if topic == reply_topic => {
                match serde_json::from_slice::<AlertMessage>(&payload) {
                    Ok(alert) => {
                        record.lock().record_received(Utc::now());
                        info!(
                            agent_id = %agent_id,
                            avg = alert.avg,
                            deviation = alert.deviation,
                            "🚨 {}",
                            alert.message
                        );
                    }
                    Err(e) => warn!(agent_id = %agent_id, error = %e, "undecodable reply dropped"),
                }
            }
            TransportEvent::Message { topic, .. } => {
                debug!(agent_id = %agent_id, %topic, "ignoring message on unexpected topic");
            }
            TransportEvent::Disconnected { reason } => {
                let at = Utc::now();
                if controller.mark_disconnected(at, &reason) {
                    record.lock().mark_disconnected(at);
                }
            }
        }
    }
    debug!(agent_id = %agent_id, "event stream closed");
}
