/*!
Mock transport for developing and testing without a broker

Implements `vigil_core::Transport`, records everything published and
subscribed, and lets tests inject faults: refused endpoints, failing
handshakes, failing publishes, dropped connections and inbound messages.
*/

use async_trait::async_trait;
use rumqttc::QoS;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use vigil_core::{Endpoint, EventReceiver, Transport, TransportError, TransportEvent, TransportFactory};
use vigil_core::{PresenceMessage, StreamMessage};

#[derive(Debug, Clone)]
pub struct MockMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

struct MockInner {
    client_id: String,
    connected: AtomicBool,
    published: Mutex<Vec<MockMessage>>,
    subscriptions: Mutex<Vec<String>>,
    connect_attempts: Mutex<Vec<Endpoint>>,
    refused_ports: Mutex<HashSet<u16>>,
    failing_connects: AtomicU32,
    failing_publishes: AtomicBool,
    events: mpsc::UnboundedSender<TransportEvent>,
}

/// In-memory transport mimicking the MQTT adapter
#[derive(Clone)]
pub struct MockTransport {
    inner: Arc<MockInner>,
}

impl MockTransport {
    pub fn new(client_id: impl Into<String>) -> (Self, EventReceiver) {
        let (events, receiver) = mpsc::unbounded_channel();
        let inner = MockInner {
            client_id: client_id.into(),
            connected: AtomicBool::new(false),
            published: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
            connect_attempts: Mutex::new(Vec::new()),
            refused_ports: Mutex::new(HashSet::new()),
            failing_connects: AtomicU32::new(0),
            failing_publishes: AtomicBool::new(false),
            events,
        };
        (Self { inner: Arc::new(inner) }, receiver)
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    /// Every connect to `port` fails until `accept_port` is called.
    pub fn refuse_port(&self, port: u16) {
        self.inner.refused_ports.lock().unwrap().insert(port);
    }

    pub fn accept_port(&self, port: u16) {
        self.inner.refused_ports.lock().unwrap().remove(&port);
    }

    /// The next `count` connects fail regardless of endpoint.
    pub fn fail_next_connects(&self, count: u32) {
        self.inner.failing_connects.store(count, Ordering::SeqCst);
    }

    pub fn fail_publishes(&self, failing: bool) {
        self.inner.failing_publishes.store(failing, Ordering::SeqCst);
    }

    /// Simulates a lost connection (broker crash, network cut).
    pub fn drop_connection(&self, reason: &str) {
        if self.inner.connected.swap(false, Ordering::SeqCst) {
            let _ = self.inner.events.send(TransportEvent::Disconnected { reason: reason.to_string() });
            log::info!("🔌 [MOCK] {} connection dropped: {}", self.inner.client_id, reason);
        }
    }

    /// Simulates an inbound publish.
    pub fn simulate_incoming<S, V>(&self, topic: S, payload: V)
    where
        S: Into<String>,
        V: Into<Vec<u8>>,
    {
        let topic = topic.into();
        log::info!("📨 [MOCK] Simulated incoming: {}", topic);
        let _ = self.inner.events.send(TransportEvent::Message { topic, payload: payload.into() });
    }

    pub fn get_published_messages(&self) -> Vec<MockMessage> {
        self.inner.published.lock().unwrap().clone()
    }

    pub fn get_subscriptions(&self) -> Vec<String> {
        self.inner.subscriptions.lock().unwrap().clone()
    }

    /// Endpoints of every connect call, successful or not, in order.
    pub fn connect_attempts(&self) -> Vec<Endpoint> {
        self.inner.connect_attempts.lock().unwrap().clone()
    }

    pub fn find_messages_by_topic(&self, topic: &str) -> Vec<MockMessage> {
        self.inner
            .published
            .lock()
            .unwrap()
            .iter()
            .filter(|msg| msg.topic == topic)
            .cloned()
            .collect()
    }

    /// Parses the last message of a topic as JSON
    pub fn get_last_json_message<T>(&self, topic: &str) -> anyhow::Result<Option<T>>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        match self.find_messages_by_topic(topic).last() {
            Some(last_msg) => Ok(Some(serde_json::from_slice(&last_msg.payload)?)),
            None => Ok(None),
        }
    }

    pub fn clear(&self) {
        self.inner.published.lock().unwrap().clear();
        self.inner.subscriptions.lock().unwrap().clear();
        self.inner.connect_attempts.lock().unwrap().clear();
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, endpoint: &Endpoint) -> Result<(), TransportError> {
        self.inner.connect_attempts.lock().unwrap().push(endpoint.clone());
        self.inner.connected.store(false, Ordering::SeqCst);

        let forced_failure = self
            .inner
            .failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if forced_failure {
            return Err(TransportError::Connect { endpoint: endpoint.to_string(), reason: "injected failure".into() });
        }
        if self.inner.refused_ports.lock().unwrap().contains(&endpoint.port) {
            return Err(TransportError::Connect { endpoint: endpoint.to_string(), reason: "connection refused".into() });
        }

        self.inner.connected.store(true, Ordering::SeqCst);
        log::info!("✅ [MOCK] {} connected to {}", self.inner.client_id, endpoint);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        if self.inner.failing_publishes.load(Ordering::SeqCst) {
            return Err(TransportError::Publish { topic: topic.to_string(), reason: "injected failure".into() });
        }
        log::info!("📤 [MOCK] Published to {}: {} bytes", topic, payload.len());
        self.inner.published.lock().unwrap().push(MockMessage {
            topic: topic.to_string(),
            payload,
            qos: QoS::AtLeastOnce,
            retain,
        });
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.inner.subscriptions.lock().unwrap().push(topic.to_string());
        log::info!("📥 [MOCK] Subscribed to {}", topic);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.inner.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }
}

/// Transport factory handing out `MockTransport`s and keeping a handle on
/// each one so tests can inject faults per agent.
#[derive(Default)]
pub struct MockNetwork {
    transports: Mutex<BTreeMap<String, MockTransport>>,
    refused_ports: Mutex<HashSet<u16>>,
    unreachable: Mutex<HashSet<String>>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applied to every transport created afterwards.
    pub fn refuse_port(&self, port: u16) {
        self.refused_ports.lock().unwrap().insert(port);
    }

    /// The first connect of `client_id` fails.
    pub fn make_unreachable(&self, client_id: &str) {
        self.unreachable.lock().unwrap().insert(client_id.to_string());
    }

    pub fn transport(&self, client_id: &str) -> Option<MockTransport> {
        self.transports.lock().unwrap().get(client_id).cloned()
    }

    pub fn client_ids(&self) -> Vec<String> {
        self.transports.lock().unwrap().keys().cloned().collect()
    }
}

impl TransportFactory for MockNetwork {
    fn create(&self, client_id: &str) -> (Arc<dyn Transport>, EventReceiver) {
        let (transport, events) = MockTransport::new(client_id);
        for port in self.refused_ports.lock().unwrap().iter() {
            transport.refuse_port(*port);
        }
        if self.unreachable.lock().unwrap().contains(client_id) {
            transport.fail_next_connects(1);
        }
        self.transports.lock().unwrap().insert(client_id.to_string(), transport.clone());
        (Arc::new(transport), events)
    }
}

/// Builds wire payloads matching what agents and the aggregator exchange
pub struct VigilMessageBuilder;

impl VigilMessageBuilder {
    pub fn stream(agent_id: &str, sequence_number: u64, temperature: f64) -> Vec<u8> {
        to_bytes(&StreamMessage {
            agent_id: agent_id.to_string(),
            message_id: uuid::Uuid::new_v4().to_string(),
            temperature,
            timestamp: chrono::Utc::now(),
            sequence_number,
        })
    }

    pub fn online(agent_id: &str) -> Vec<u8> {
        to_bytes(&PresenceMessage::online(agent_id))
    }

    pub fn offline(agent_id: &str) -> Vec<u8> {
        to_bytes(&PresenceMessage::offline(agent_id))
    }
}

fn to_bytes<T: Serialize>(value: &T) -> Vec<u8> {
    serde_json::to_vec(value).unwrap_or_default()
}
