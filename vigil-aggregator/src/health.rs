use crate::state::{new_state, Shared};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorHealth {
    pub uptime_seconds: u64,
    pub mqtt_status: String,
    pub mqtt_reconnects: u32,
    pub agents_tracked: usize,
    pub agents_active: usize,
    pub alerts_sent: u64,
    pub decode_errors: u64,
    pub telemetry_dropped: u64,
    pub persistence_failures: u64,
}

/// Counters shared by the broker link, the dispatcher and the router
#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    mqtt_reconnects: Arc<AtomicU32>,
    mqtt_status: Shared<String>,
    alerts_sent: Arc<AtomicU64>,
    decode_errors: Arc<AtomicU64>,
    telemetry_dropped: Arc<AtomicU64>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            mqtt_reconnects: Arc::new(AtomicU32::new(0)),
            mqtt_status: new_state("connecting".to_string()),
            alerts_sent: Arc::new(AtomicU64::new(0)),
            decode_errors: Arc::new(AtomicU64::new(0)),
            telemetry_dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn mark_mqtt_connected(&self) {
        *self.mqtt_status.lock() = "connected".to_string();
    }

    pub fn mark_mqtt_disconnected(&self) {
        *self.mqtt_status.lock() = "disconnected".to_string();
    }

    pub fn mark_mqtt_reconnecting(&self) {
        *self.mqtt_status.lock() = "reconnecting".to_string();
    }

    /// Counts a restored link, not an attempt.
    pub fn record_reconnect(&self) {
        self.mqtt_reconnects.fetch_add(1, Ordering::Relaxed);
        self.mark_mqtt_connected();
    }

    pub fn record_alert(&self) {
        self.alerts_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Telemetry for an identity with no presence worker
    pub fn record_dropped_telemetry(&self) {
        self.telemetry_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn mqtt_status(&self) -> String {
        self.mqtt_status.lock().clone()
    }

    pub fn mqtt_reconnects(&self) -> u32 {
        self.mqtt_reconnects.load(Ordering::Relaxed)
    }

    pub fn alerts_sent(&self) -> u64 {
        self.alerts_sent.load(Ordering::Relaxed)
    }

    pub fn decode_errors(&self) -> u64 {
        self.decode_errors.load(Ordering::Relaxed)
    }

    pub fn telemetry_dropped(&self) -> u64 {
        self.telemetry_dropped.load(Ordering::Relaxed)
    }

    /// Snapshot for `/health`; agent and persistence figures come from the router.
    pub fn get_health(&self, agents_tracked: usize, agents_active: usize, persistence_failures: u64) -> AggregatorHealth {
        AggregatorHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            mqtt_status: self.mqtt_status(),
            mqtt_reconnects: self.mqtt_reconnects(),
            agents_tracked,
            agents_active,
            alerts_sent: self.alerts_sent(),
            decode_errors: self.decode_errors(),
            telemetry_dropped: self.telemetry_dropped(),
            persistence_failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        let health = HealthTracker::new();
        assert_eq!(health.mqtt_status(), "connecting");
        health.mark_mqtt_connected();
        health.mark_mqtt_disconnected();
        health.mark_mqtt_reconnecting();
        health.mark_mqtt_reconnecting();
        assert_eq!(health.mqtt_status(), "reconnecting");
        assert_eq!(health.mqtt_reconnects(), 0);
        health.record_reconnect();
        assert_eq!(health.mqtt_reconnects(), 1);

        let snapshot = health.get_health(3, 2, 0);
        assert_eq!(snapshot.mqtt_status, "connected");
        assert_eq!((snapshot.agents_tracked, snapshot.agents_active), (3, 2));
    }
}
