//! MQTT adapter for the `Transport` capability (rumqttc).
//!
//! Every `connect` builds a fresh client/event loop for the requested
//! endpoint and waits for CONNACK. A pump task then drives the event loop,
//! forwarding publishes and reporting connection loss once. The pump never
//! reconnects by itself: reconnection policy belongs to the caller.

use super::{Endpoint, EventReceiver, Transport, TransportEvent, TransportFactory};
use crate::error::TransportError;
use crate::models::PresenceMessage;
use crate::topics;
use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, Incoming, LastWill, MqttOptions, QoS};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub keep_alive: Duration,
    pub clean_session: bool,
    pub connect_timeout: Duration,
    pub channel_capacity: usize,
    /// (topic, payload) published retained by the broker on ungraceful loss
    pub last_will: Option<(String, Vec<u8>)>,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            keep_alive: Duration::from_secs(30),
            clean_session: false,
            connect_timeout: Duration::from_secs(5),
            channel_capacity: 64,
            last_will: None,
        }
    }
}

#[derive(Default)]
struct Link {
    generation: AtomicU64,
    connected: AtomicBool,
}

impl Link {
    /// Reports loss only for the current connection, and only once.
    fn lost(&self, generation: u64, reason: String, events: &mpsc::UnboundedSender<TransportEvent>) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = events.send(TransportEvent::Disconnected { reason });
        }
    }
}

pub struct MqttTransport {
    client_id: String,
    settings: MqttSettings,
    link: Arc<Link>,
    client: Mutex<Option<AsyncClient>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl MqttTransport {
    pub fn new(client_id: impl Into<String>, settings: MqttSettings) -> (Self, EventReceiver) {
        let (events, receiver) = mpsc::unbounded_channel();
        let transport = Self {
            client_id: client_id.into(),
            settings,
            link: Arc::new(Link::default()),
            client: Mutex::new(None),
            pump: Mutex::new(None),
            events,
        };
        (transport, receiver)
    }

    fn options(&self, endpoint: &Endpoint) -> MqttOptions {
        let mut opts = MqttOptions::new(&self.client_id, &endpoint.host, endpoint.port);
        opts.set_keep_alive(self.settings.keep_alive);
        opts.set_clean_session(self.settings.clean_session);
        if let Some((topic, payload)) = &self.settings.last_will {
            opts.set_last_will(LastWill::new(topic, payload.clone(), QoS::AtLeastOnce, true));
        }
        opts
    }

    fn current_client(&self) -> Result<AsyncClient, TransportError> {
        if !self.link.connected.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }
        self.client.lock().clone().ok_or(TransportError::NotConnected)
    }
}

async fn handshake(eventloop: &mut EventLoop, endpoint: &Endpoint) -> Result<(), TransportError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                return match ack.code {
                    ConnectReturnCode::Success => Ok(()),
                    code => Err(TransportError::Refused(format!("{code:?}"))),
                };
            }
            Ok(_) => {}
            Err(ConnectionError::ConnectionRefused(code)) => {
                return Err(TransportError::Refused(format!("{code:?}")));
            }
            Err(e) => {
                return Err(TransportError::Connect { endpoint: endpoint.to_string(), reason: e.to_string() });
            }
        }
    }
}

async fn pump(
    mut eventloop: EventLoop,
    generation: u64,
    link: Arc<Link>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                let _ = events.send(TransportEvent::Message {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                });
            }
            Ok(Event::Incoming(Incoming::Disconnect)) => {
                link.lost(generation, "broker closed the session".into(), &events);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                link.lost(generation, e.to_string(), &events);
                break;
            }
        }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn connect(&self, endpoint: &Endpoint) -> Result<(), TransportError> {
        // Older pumps become stale before the new session exists
        let generation = self.link.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.link.connected.store(false, Ordering::SeqCst);
        if let Some(old) = self.pump.lock().take() {
            old.abort();
        }

        let (client, mut eventloop) = AsyncClient::new(self.options(endpoint), self.settings.channel_capacity);
        tokio::time::timeout(self.settings.connect_timeout, handshake(&mut eventloop, endpoint))
            .await
            .map_err(|_| TransportError::Timeout(endpoint.to_string()))??;

        debug!(client_id = %self.client_id, %endpoint, "mqtt session established");
        *self.client.lock() = Some(client);
        self.link.connected.store(true, Ordering::SeqCst);
        let handle = tokio::spawn(pump(eventloop, generation, self.link.clone(), self.events.clone()));
        *self.pump.lock() = Some(handle);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), TransportError> {
        let client = self.current_client()?;
        client
            .publish(topic, QoS::AtLeastOnce, retain, payload)
            .await
            .map_err(|e| TransportError::Publish { topic: topic.to_string(), reason: e.to_string() })
    }

    async fn subscribe(&self, topic: &str) -> Result<(), TransportError> {
        let client = self.current_client()?;
        client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| TransportError::Subscribe { topic: topic.to_string(), reason: e.to_string() })
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        // Flipping the flag first keeps the pump from reporting our own close
        let was_connected = self.link.connected.swap(false, Ordering::SeqCst);
        let client = self.client.lock().take();
        let result = match (was_connected, client) {
            (true, Some(client)) => client.disconnect().await.map_err(|e| TransportError::Disconnect(e.to_string())),
            _ => Ok(()),
        };
        // Give the pump a moment to flush DISCONNECT before tearing it down
        let pump = self.pump.lock().take();
        if let Some(mut handle) = pump {
            if tokio::time::timeout(Duration::from_millis(500), &mut handle).await.is_err() {
                warn!(client_id = %self.client_id, "mqtt pump did not stop after disconnect, aborting");
                handle.abort();
            }
        }
        result
    }

    fn is_connected(&self) -> bool {
        self.link.connected.load(Ordering::SeqCst)
    }
}

/// Builds MQTT transports sharing the same settings. With
/// `presence_will` each client registers `offline` presence as its Last Will.
#[derive(Debug, Clone, Default)]
pub struct MqttTransportFactory {
    pub settings: MqttSettings,
    pub presence_will: bool,
}

impl TransportFactory for MqttTransportFactory {
    fn create(&self, client_id: &str) -> (Arc<dyn Transport>, EventReceiver) {
        let mut settings = self.settings.clone();
        if self.presence_will {
            if let Ok(payload) = serde_json::to_vec(&PresenceMessage::offline(client_id)) {
                settings.last_will = Some((topics::presence_topic(client_id), payload));
            }
        }
        let (transport, events) = MqttTransport::new(client_id, settings);
        (Arc::new(transport), events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_before_connect_is_rejected() {
        let (transport, _events) = MqttTransport::new("agent-001", MqttSettings::default());
        assert!(!transport.is_connected());
        let err = transport.publish("data/stream", b"{}".to_vec(), false).await.unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
        assert!(transport.disconnect().await.is_ok());
    }

    #[test]
    fn test_stale_generation_does_not_report() {
        let link = Link::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        link.generation.store(2, Ordering::SeqCst);
        link.connected.store(true, Ordering::SeqCst);

        link.lost(1, "old session".into(), &tx);
        assert!(rx.try_recv().is_err());

        link.lost(2, "current session".into(), &tx);
        link.lost(2, "current session again".into(), &tx);
        assert_eq!(rx.try_recv().unwrap(), TransportEvent::Disconnected { reason: "current session".into() });
        assert!(rx.try_recv().is_err());
    }
}
