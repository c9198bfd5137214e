/*!
Broker side of the aggregator.

- Decodes each inbound publish once (presence or telemetry)
- Routes it to a per-agent worker: one identity's events are handled in
  order, distinct identities run concurrently. Presence starts a worker,
  `offline` retires it; telemetry without a worker is dropped
- Supervises the aggregator's own broker link, retrying every 2s and
  re-subscribing after each reconnection
*/

use crate::health::HealthTracker;
use crate::router::AggregatorRouter;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{self, JoinHandle};
use tracing::{debug, error, info, warn};
use vigil_core::{
    topics, DecodeError, Endpoint, EventReceiver, PresenceMessage, PresenceStatus, StreamMessage, Transport,
    TransportError, TransportEvent,
};

pub const LINK_RETRY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub enum AgentEvent {
    Online,
    Offline,
    Telemetry(StreamMessage),
}

struct Worker {
    events: mpsc::UnboundedSender<AgentEvent>,
    handle: JoinHandle<()>,
}

/// Fans inbound events out to per-agent workers
pub struct Dispatcher {
    router: Arc<AggregatorRouter>,
    telemetry_topic: String,
    health: HealthTracker,
    workers: HashMap<String, Worker>,
    /// Workers draining their last events after `offline`
    retiring: HashMap<String, JoinHandle<()>>,
}

impl Dispatcher {
    pub fn new(router: Arc<AggregatorRouter>, telemetry_topic: impl Into<String>, health: HealthTracker) -> Self {
        Self {
            router,
            telemetry_topic: telemetry_topic.into(),
            health,
            workers: HashMap::new(),
            retiring: HashMap::new(),
        }
    }

    /// Identity and event carried by one publish.
    pub fn decode(&self, topic: &str, payload: &[u8]) -> Result<(String, AgentEvent), DecodeError> {
        if topic == self.telemetry_topic {
            let message: StreamMessage = serde_json::from_slice(payload)?;
            return Ok((message.agent_id.clone(), AgentEvent::Telemetry(message)));
        }

        let Some(agent_id) = topics::presence_agent(topic) else {
            return Err(DecodeError::UnknownTopic(topic.to_string()));
        };
        let presence: PresenceMessage = serde_json::from_slice(payload)?;
        if presence.agent_id != agent_id {
            return Err(DecodeError::IdentityMismatch { topic: topic.to_string(), agent_id: presence.agent_id });
        }
        let event = match presence.status {
            PresenceStatus::Online => AgentEvent::Online,
            PresenceStatus::Offline => AgentEvent::Offline,
        };
        Ok((presence.agent_id, event))
    }

    /// Malformed payloads are dropped and counted.
    pub fn dispatch(&mut self, topic: &str, payload: &[u8]) {
        match self.decode(topic, payload) {
            Ok((agent_id, event)) => self.route(agent_id, event),
            Err(e) => {
                self.health.record_decode_error();
                warn!(%topic, error = %e, "dropping undecodable message");
            }
        }
    }

    fn route(&mut self, agent_id: String, event: AgentEvent) {
        let retire = matches!(event, AgentEvent::Offline);
        let event = match self.workers.get(&agent_id) {
            Some(worker) => match worker.events.send(event) {
                Ok(()) => {
                    if retire {
                        self.retire(&agent_id);
                    }
                    return;
                }
                // Worker gone, respawn it with the event
                Err(mpsc::error::SendError(event)) => event,
            },
            None if matches!(event, AgentEvent::Telemetry(_)) => {
                self.health.record_dropped_telemetry();
                debug!(%agent_id, "telemetry without presence dropped");
                return;
            }
            None => event,
        };

        // Never overtake the previous worker of this identity
        let previous = self.retiring.remove(&agent_id);
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = task::spawn(run_worker(agent_id.clone(), Arc::clone(&self.router), previous, rx));
        if tx.send(event).is_ok() {
            debug!(%agent_id, "agent worker started");
        }
        self.workers.insert(agent_id.clone(), Worker { events: tx, handle });
        if retire {
            self.retire(&agent_id);
        }
    }

    /// Drops the sender so the worker exits once its queue is drained.
    fn retire(&mut self, agent_id: &str) {
        self.retiring.retain(|_, handle| !handle.is_finished());
        if let Some(worker) = self.workers.remove(agent_id) {
            self.retiring.insert(agent_id.to_string(), worker.handle);
            debug!(%agent_id, "agent worker retired");
        }
    }

    pub fn workers(&self) -> usize {
        self.workers.len()
    }
}

async fn run_worker(
    agent_id: String,
    router: Arc<AggregatorRouter>,
    previous: Option<JoinHandle<()>>,
    mut events: mpsc::UnboundedReceiver<AgentEvent>,
) {
    if let Some(previous) = previous {
        // a panicked or aborted predecessor is done too
        let _ = previous.await;
    }
    while let Some(event) = events.recv().await {
        let handled = AssertUnwindSafe(async {
            match event {
                AgentEvent::Online => router.on_connect(&agent_id).await,
                AgentEvent::Offline => router.on_disconnect(&agent_id).await,
                AgentEvent::Telemetry(message) => {
                    router.on_telemetry(message).await;
                }
            }
        })
        .catch_unwind()
        .await;
        if handled.is_err() {
            error!(%agent_id, "event handler panicked, worker keeps running");
        }
    }
}

/// Connects and subscribes to every filter. Any failure aborts the attempt.
pub async fn connect_and_subscribe(
    transport: &dyn Transport,
    endpoint: &Endpoint,
    subscriptions: &[String],
) -> Result<(), TransportError> {
    transport.connect(endpoint).await?;
    for topic in subscriptions {
        transport.subscribe(topic).await?;
        debug!(%topic, "subscribed");
    }
    Ok(())
}

/// Pumps inbound events into the dispatcher and restores the link when it
/// drops. Runs until the transport's event channel closes.
pub fn spawn_mqtt_listener(
    transport: Arc<dyn Transport>,
    mut events: EventReceiver,
    endpoint: Endpoint,
    subscriptions: Vec<String>,
    mut dispatcher: Dispatcher,
    health: HealthTracker,
) -> JoinHandle<()> {
    task::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Message { topic, payload } => dispatcher.dispatch(&topic, &payload),
                TransportEvent::Disconnected { reason } => {
                    health.mark_mqtt_disconnected();
                    warn!(%endpoint, %reason, "broker link lost");
                    loop {
                        tokio::time::sleep(LINK_RETRY).await;
                        health.mark_mqtt_reconnecting();
                        match connect_and_subscribe(transport.as_ref(), &endpoint, &subscriptions).await {
                            Ok(()) => {
                                health.record_reconnect();
                                info!(%endpoint, "broker link restored");
                                break;
                            }
                            Err(e) => warn!(%endpoint, error = %e, "broker reconnection failed"),
                        }
                    }
                }
            }
        }
        debug!("broker event stream closed");
    })
}
