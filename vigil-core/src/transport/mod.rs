//! Publish/subscribe capability consumed by agents and the aggregator.
//!
//! A transport is created together with its event receiver (like rumqttc's
//! client / event loop pair). Inbound publishes and connection loss arrive on
//! that receiver; everything else goes through the `Transport` trait.

pub mod mqtt;

use crate::error::TransportError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

pub use mqtt::{MqttSettings, MqttTransport, MqttTransportFactory};

/// Broker address a transport can connect to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Inbound side of a transport (`onMessage` / `onDisconnect`)
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message { topic: String, payload: Vec<u8> },
    Disconnected { reason: String },
}

pub type EventReceiver = mpsc::UnboundedReceiver<TransportEvent>;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens a session against `endpoint`, replacing any previous one.
    async fn connect(&self, endpoint: &Endpoint) -> Result<(), TransportError>;

    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), TransportError>;

    async fn subscribe(&self, topic: &str) -> Result<(), TransportError>;

    /// Graceful close. Does not produce a `Disconnected` event.
    async fn disconnect(&self) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;
}

/// Builds one transport per client identity.
pub trait TransportFactory: Send + Sync {
    fn create(&self, client_id: &str) -> (Arc<dyn Transport>, EventReceiver);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_display() {
        assert_eq!(Endpoint::new("localhost", 1884).to_string(), "localhost:1884");
    }
}
