//! Records and payloads exchanged between agents and the aggregator.
//!
//! `SessionRecord` is held on both sides, one per agent identity.
//! `ReconnectRecord` only lives in the agent-side reconnect log, where the
//! latest event per agent overwrites the previous one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Capacity of `SessionRecord::recent_readings`.
pub const WINDOW_CAPACITY: usize = 10;

/// Per-agent session state (agent-side and aggregator-side)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub agent_id: String,
    pub connected_at: DateTime<Utc>,
    /// Absent while connected
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disconnected_at: Option<DateTime<Utc>>,
    pub messages_sent: u64,
    pub messages_received: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sent_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_received_at: Option<DateTime<Utc>>,
    /// Oldest first, at most `WINDOW_CAPACITY` entries
    #[serde(default)]
    pub recent_readings: VecDeque<f64>,
}

impl SessionRecord {
    pub fn new(agent_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            agent_id: agent_id.into(),
            connected_at: now,
            disconnected_at: None,
            messages_sent: 0,
            messages_received: 0,
            last_sent_at: None,
            last_received_at: None,
            recent_readings: VecDeque::with_capacity(WINDOW_CAPACITY),
        }
    }

    /// A fresh connect succeeded for this identity.
    pub fn mark_connected(&mut self, now: DateTime<Utc>) {
        self.connected_at = now;
        self.disconnected_at = None;
    }

    pub fn mark_disconnected(&mut self, now: DateTime<Utc>) {
        self.disconnected_at = Some(now);
    }

    pub fn record_sent(&mut self, now: DateTime<Utc>) {
        self.messages_sent += 1;
        self.last_sent_at = Some(now);
    }

    pub fn record_received(&mut self, now: DateTime<Utc>) {
        self.messages_received += 1;
        self.last_received_at = Some(now);
    }

    pub fn is_connected(&self) -> bool {
        self.disconnected_at.is_none()
    }

    /// Seconds since the last successful connect.
    pub fn connected_for(&self, now: DateTime<Utc>) -> f64 {
        seconds_between(self.connected_at, now)
    }
}

/// Latest successful reconnection of one agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconnectRecord {
    pub agent_id: String,
    pub disconnected_at: DateTime<Utc>,
    pub reconnected_at: DateTime<Utc>,
    pub downtime_seconds: f64,
    /// Failed handshakes before the successful one
    pub attempts: u32,
}

impl ReconnectRecord {
    /// Downtime runs from the last known disconnect, or from the start of the
    /// reconnection attempt when no disconnect was recorded.
    pub fn new(
        agent_id: impl Into<String>,
        disconnected_at: Option<DateTime<Utc>>,
        attempt_started_at: DateTime<Utc>,
        reconnected_at: DateTime<Utc>,
        attempts: u32,
    ) -> Self {
        let since = disconnected_at.unwrap_or(attempt_started_at);
        Self {
            agent_id: agent_id.into(),
            disconnected_at: since,
            reconnected_at,
            downtime_seconds: seconds_between(since, reconnected_at),
            attempts,
        }
    }
}

fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 1000.0
}

/// Telemetry published by agents on the shared topic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamMessage {
    pub agent_id: String,
    pub message_id: String,
    pub temperature: f64,
    pub timestamp: DateTime<Utc>,
    pub sequence_number: u64,
}

/// Spike alert sent back on `response/{agent_id}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertMessage {
    pub agent_id: String,
    pub avg: f64,
    pub deviation: f64,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

/// Retained on `presence/{agent_id}`; the offline variant doubles as Last Will.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceMessage {
    pub agent_id: String,
    pub status: PresenceStatus,
}

impl PresenceMessage {
    pub fn online(agent_id: impl Into<String>) -> Self {
        Self { agent_id: agent_id.into(), status: PresenceStatus::Online }
    }

    pub fn offline(agent_id: impl Into<String>) -> Self {
        Self { agent_id: agent_id.into(), status: PresenceStatus::Offline }
    }
}
