//! Per-agent liveness monitoring and failover reconnection
//!
//! State machine: `Connected -> Disconnected` when the transport reports loss,
//! `Disconnected -> Reconnecting` on the next liveness poll, and
//! `Reconnecting -> Connected` once a handshake succeeds on one of the
//! candidate endpoints. Every third consecutive failure rotates to the next
//! endpoint. Each successful reconnection overwrites the agent's entry in the
//! reconnect log.

use crate::error::FleetError;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vigil_core::{topics, DurableStore, Endpoint, PersistenceError, PresenceMessage, ReconnectRecord, Transport, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    Disconnected,
    Reconnecting,
}

#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Liveness poll period
    pub poll_interval: Duration,
    /// Wait between two reconnection attempts
    pub backoff: Duration,
    /// Consecutive failures before moving to the next endpoint
    pub rotate_after: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            backoff: Duration::from_secs(3),
            rotate_after: 3,
        }
    }
}

/// Ordered candidate endpoints with a rotation index.
#[derive(Debug, Clone)]
pub struct EndpointRotation {
    endpoints: Vec<Endpoint>,
    index: usize,
    consecutive_failures: u32,
    rotate_after: u32,
}

impl EndpointRotation {
    pub fn new(endpoints: Vec<Endpoint>, rotate_after: u32) -> Result<Self, FleetError> {
        if endpoints.is_empty() {
            return Err(FleetError::NoEndpoints);
        }
        Ok(Self { endpoints, index: 0, consecutive_failures: 0, rotate_after: rotate_after.max(1) })
    }

    pub fn current(&self) -> &Endpoint {
        &self.endpoints[self.index]
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Counts a failed attempt; returns true when it advanced the rotation.
    pub fn record_failure(&mut self) -> bool {
        self.consecutive_failures += 1;
        if self.consecutive_failures % self.rotate_after != 0 {
            return false;
        }
        self.index = (self.index + 1) % self.endpoints.len();
        true
    }

    /// The index is kept for the next episode, only the streak resets.
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }
}

struct LinkStatus {
    state: LinkState,
    disconnected_at: Option<DateTime<Utc>>,
    rotation: EndpointRotation,
}

type ReconnectHook = Box<dyn Fn(&ReconnectRecord) + Send + Sync>;
type LossHook = Box<dyn Fn(DateTime<Utc>) + Send + Sync>;

pub struct ReconnectController {
    agent_id: String,
    transport: Arc<dyn Transport>,
    policy: ReconnectPolicy,
    status: Mutex<LinkStatus>,
    reconnect_log: Arc<DurableStore<ReconnectRecord>>,
    on_reconnect: Option<ReconnectHook>,
    on_silent_loss: Option<LossHook>,
    shutdown: CancellationToken,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl ReconnectController {
    pub fn new(
        agent_id: impl Into<String>,
        transport: Arc<dyn Transport>,
        rotation: EndpointRotation,
        policy: ReconnectPolicy,
        reconnect_log: Arc<DurableStore<ReconnectRecord>>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            transport,
            policy,
            status: Mutex::new(LinkStatus { state: LinkState::Disconnected, disconnected_at: None, rotation }),
            reconnect_log,
            on_reconnect: None,
            on_silent_loss: None,
            shutdown: CancellationToken::new(),
            monitor: Mutex::new(None),
        }
    }

    /// Called after every successful reconnection, before the log is written.
    pub fn with_reconnect_hook(mut self, hook: impl Fn(&ReconnectRecord) + Send + Sync + 'static) -> Self {
        self.on_reconnect = Some(Box::new(hook));
        self
    }

    /// Called when a liveness poll finds the link gone without any
    /// disconnect event, with the time of detection.
    pub fn with_silent_loss_hook(mut self, hook: impl Fn(DateTime<Utc>) + Send + Sync + 'static) -> Self {
        self.on_silent_loss = Some(Box::new(hook));
        self
    }

    pub fn state(&self) -> LinkState {
        self.status.lock().state
    }

    /// Connected according to both the state machine and the transport.
    pub fn is_online(&self) -> bool {
        self.state() == LinkState::Connected && self.transport.is_connected()
    }

    pub fn endpoint_index(&self) -> usize {
        self.status.lock().rotation.index()
    }

    /// Initial handshake on the current endpoint. A single attempt: the
    /// caller decides what an initial failure means.
    pub async fn connect(&self) -> Result<(), TransportError> {
        let endpoint = self.status.lock().rotation.current().clone();
        self.handshake(&endpoint).await?;

        let mut status = self.status.lock();
        status.state = LinkState::Connected;
        status.disconnected_at = None;
        info!(agent_id = %self.agent_id, %endpoint, "connected");
        Ok(())
    }

    /// Transport reported a lost connection. Returns false when the report
    /// did not change the state (stale event, already disconnected).
    pub fn mark_disconnected(&self, at: DateTime<Utc>, reason: &str) -> bool {
        // A late event from an older connection must not undo a reconnection
        if self.transport.is_connected() {
            debug!(agent_id = %self.agent_id, reason, "ignoring stale disconnect");
            return false;
        }
        let mut status = self.status.lock();
        if status.state != LinkState::Connected {
            return false;
        }
        status.state = LinkState::Disconnected;
        status.disconnected_at = Some(at);
        warn!(agent_id = %self.agent_id, reason, "disconnected, will attempt reconnection");
        true
    }

    /// Starts the liveness monitor once; later calls are no-ops.
    pub fn start_monitor(self: &Arc<Self>) {
        let mut monitor = self.monitor.lock();
        if monitor.is_some() {
            return;
        }
        let controller = Arc::clone(self);
        *monitor = Some(tokio::spawn(async move { controller.monitor_loop().await }));
    }

    /// Stops the monitor, abandoning any reconnection in flight.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = self.monitor.lock().take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(Duration::from_secs(1), &mut handle).await.is_err() {
                handle.abort();
            }
        }
        debug!(agent_id = %self.agent_id, "reconnect controller stopped");
    }

    async fn monitor_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.policy.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    match AssertUnwindSafe(self.check_liveness()).catch_unwind().await {
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => error!(agent_id = %self.agent_id, error = %e, "failed to record reconnection"),
                        Err(_) => error!(agent_id = %self.agent_id, "liveness check panicked, monitor keeps running"),
                    }
                }
            }
        }
    }

    /// One liveness poll. Runs the failover loop when the link is down.
    pub(crate) async fn check_liveness(&self) -> Result<Option<ReconnectRecord>, PersistenceError> {
        let (begin, silent_loss) = {
            let mut status = self.status.lock();
            let silent_loss = status.state == LinkState::Connected && !self.transport.is_connected();
            if silent_loss {
                // Loss without an event: no disconnect timestamp is known
                warn!(agent_id = %self.agent_id, "connection lost without notification");
                status.state = LinkState::Disconnected;
            }
            if status.state == LinkState::Disconnected {
                status.state = LinkState::Reconnecting;
                (true, silent_loss)
            } else {
                (false, silent_loss)
            }
        };
        if silent_loss {
            if let Some(hook) = &self.on_silent_loss {
                hook(Utc::now());
            }
        }
        if !begin {
            return Ok(None);
        }
        self.failover().await
    }

    async fn failover(&self) -> Result<Option<ReconnectRecord>, PersistenceError> {
        let started_at = Utc::now();
        let disconnected_at = self.status.lock().disconnected_at;
        let mut failures = 0u32;
        info!(agent_id = %self.agent_id, "starting reconnection attempts");

        loop {
            if self.shutdown.is_cancelled() {
                return Ok(None);
            }
            let endpoint = self.status.lock().rotation.current().clone();
            debug!(agent_id = %self.agent_id, attempt = failures + 1, %endpoint, "reconnection attempt");

            match self.handshake(&endpoint).await {
                Ok(()) => break,
                Err(e) => {
                    failures += 1;
                    warn!(agent_id = %self.agent_id, %endpoint, attempt = failures, error = %e, "reconnection attempt failed");
                    let mut status = self.status.lock();
                    if status.rotation.record_failure() {
                        info!(agent_id = %self.agent_id, next = %status.rotation.current(), "switching endpoint");
                    }
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(None),
                _ = tokio::time::sleep(self.policy.backoff) => {}
            }
        }

        let record = ReconnectRecord::new(&self.agent_id, disconnected_at, started_at, Utc::now(), failures);
        {
            let mut status = self.status.lock();
            status.state = LinkState::Connected;
            status.disconnected_at = None;
            status.rotation.record_success();
        }
        info!(
            agent_id = %self.agent_id,
            downtime_seconds = format!("{:.2}", record.downtime_seconds),
            failed_attempts = failures,
            "reconnected"
        );

        if let Some(hook) = &self.on_reconnect {
            hook(&record);
        }
        self.reconnect_log.commit(&self.agent_id, record.clone()).await?;
        Ok(Some(record))
    }

    /// Connect, re-subscribe to the reply channel, announce presence.
    async fn handshake(&self, endpoint: &Endpoint) -> Result<(), TransportError> {
        self.transport.connect(endpoint).await?;
        self.transport.subscribe(&topics::reply_topic(&self.agent_id)).await?;

        match serde_json::to_vec(&PresenceMessage::online(&self.agent_id)) {
            Ok(payload) => {
                if let Err(e) = self.transport.publish(&topics::presence_topic(&self.agent_id), payload, true).await {
                    warn!(agent_id = %self.agent_id, error = %e, "failed to announce presence");
                }
            }
            Err(e) => warn!(agent_id = %self.agent_id, error = %e, "failed to encode presence"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use vigil_devkit::{MockTransport, TestHarness};

    fn endpoints() -> Vec<Endpoint> {
        vec![Endpoint::new("localhost", 1883), Endpoint::new("localhost", 1884)]
    }

    async fn controller(harness: &TestHarness) -> (Arc<ReconnectController>, MockTransport) {
        let (mock, _events) = MockTransport::new("agent-001");
        let log = Arc::new(DurableStore::load(harness.reconnect_log_path()).await);
        let rotation = EndpointRotation::new(endpoints(), 3).unwrap();
        let controller = ReconnectController::new("agent-001", Arc::new(mock.clone()), rotation, ReconnectPolicy::default(), log);
        (Arc::new(controller), mock)
    }

    #[test]
    fn test_rotation_advances_every_third_failure_and_wraps() {
        let mut rotation = EndpointRotation::new(endpoints(), 3).unwrap();
        let mut indexes = Vec::new();
        for _ in 0..6 {
            rotation.record_failure();
            indexes.push(rotation.index());
        }
        assert_eq!(indexes, vec![0, 0, 1, 1, 1, 0]);
    }

    #[test]
    fn test_rotation_streak_resets_but_index_is_kept() {
        let mut rotation = EndpointRotation::new(endpoints(), 3).unwrap();
        rotation.record_failure();
        rotation.record_failure();
        rotation.record_success();
        assert!(!rotation.record_failure());
        assert!(!rotation.record_failure());
        assert!(rotation.record_failure());
        assert_eq!(rotation.current().port, 1884);
        rotation.record_success();
        assert_eq!(rotation.index(), 1);
    }

    #[test]
    fn test_rotation_requires_an_endpoint() {
        assert!(matches!(EndpointRotation::new(Vec::new(), 3), Err(FleetError::NoEndpoints)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failover_rotates_and_records_downtime() {
        let harness = TestHarness::new().unwrap();
        let (controller, mock) = controller(&harness).await;
        controller.connect().await.unwrap();
        assert_eq!(controller.state(), LinkState::Connected);

        mock.refuse_port(1883);
        mock.drop_connection("broker crashed");
        let lost_at = Utc::now();
        assert!(controller.mark_disconnected(lost_at, "broker crashed"));
        assert_eq!(controller.state(), LinkState::Disconnected);

        let record = controller.check_liveness().await.unwrap().expect("reconnected");
        assert_eq!(record.attempts, 3);
        assert_eq!(record.disconnected_at, lost_at);
        assert!(record.downtime_seconds >= 0.0);
        assert_eq!(controller.state(), LinkState::Connected);
        assert_eq!(controller.endpoint_index(), 1);

        let ports: Vec<u16> = mock.connect_attempts().iter().map(|e| e.port).collect();
        assert_eq!(ports, vec![1883, 1883, 1883, 1883, 1884]);
        let replies = mock.get_subscriptions().iter().filter(|t| *t == "response/agent-001").count();
        assert_eq!(replies, 2);

        let saved = DurableStore::<ReconnectRecord>::load(harness.reconnect_log_path()).await;
        assert_eq!(saved.get("agent-001").await, Some(record));
    }

    #[tokio::test(start_paused = true)]
    async fn test_only_latest_reconnection_is_kept() {
        let harness = TestHarness::new().unwrap();
        let (controller, mock) = controller(&harness).await;
        controller.connect().await.unwrap();

        mock.fail_next_connects(2);
        mock.drop_connection("first");
        controller.mark_disconnected(Utc::now(), "first");
        controller.check_liveness().await.unwrap();

        mock.drop_connection("second");
        controller.mark_disconnected(Utc::now(), "second");
        controller.check_liveness().await.unwrap();

        let saved = DurableStore::<ReconnectRecord>::load(harness.reconnect_log_path()).await;
        assert_eq!(saved.len().await, 1);
        assert_eq!(saved.get("agent-001").await.unwrap().attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_detects_silent_loss() {
        let harness = TestHarness::new().unwrap();
        let (mock, _events) = MockTransport::new("agent-001");
        let log = Arc::new(DurableStore::load(harness.reconnect_log_path()).await);
        let hook_calls = Arc::new(AtomicU32::new(0));
        let calls = hook_calls.clone();
        let controller = Arc::new(
            ReconnectController::new(
                "agent-001",
                Arc::new(mock.clone()),
                EndpointRotation::new(endpoints(), 3).unwrap(),
                ReconnectPolicy::default(),
                log,
            )
            .with_reconnect_hook(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            }),
        );
        controller.connect().await.unwrap();
        controller.start_monitor();

        // Drop without telling the controller
        mock.disconnect().await.unwrap();
        assert!(harness.wait_until(10_000, || hook_calls.load(Ordering::SeqCst) == 1).await);
        assert!(controller.is_online());

        let saved = DurableStore::<ReconnectRecord>::load(harness.reconnect_log_path()).await;
        let record = saved.get("agent-001").await.unwrap();
        assert_eq!(record.attempts, 0);
        assert!(record.reconnected_at >= record.disconnected_at);
        controller.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_loss_reports_detection_time() {
        let harness = TestHarness::new().unwrap();
        let (mock, _events) = MockTransport::new("agent-001");
        let log = Arc::new(DurableStore::load(harness.reconnect_log_path()).await);
        let detected = Arc::new(Mutex::new(None));
        let seen = Arc::clone(&detected);
        let controller = ReconnectController::new(
            "agent-001",
            Arc::new(mock.clone()),
            EndpointRotation::new(endpoints(), 3).unwrap(),
            ReconnectPolicy::default(),
            log,
        )
        .with_silent_loss_hook(move |at| *seen.lock() = Some(at));
        controller.connect().await.unwrap();

        // Poll with a healthy link reports nothing
        assert!(controller.check_liveness().await.unwrap().is_none());
        assert!(detected.lock().is_none());

        mock.disconnect().await.unwrap();
        let before = Utc::now();
        controller.check_liveness().await.unwrap().expect("reconnected");
        let at = (*detected.lock()).expect("loss reported");
        assert!(at >= before);
        assert_eq!(controller.state(), LinkState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_abandons_failover() {
        let harness = TestHarness::new().unwrap();
        let (controller, mock) = controller(&harness).await;
        controller.connect().await.unwrap();
        controller.start_monitor();

        mock.refuse_port(1883);
        mock.refuse_port(1884);
        mock.drop_connection("network down");
        controller.mark_disconnected(Utc::now(), "network down");

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(controller.state(), LinkState::Reconnecting);
        assert!(mock.connect_attempts().len() > 3);

        controller.shutdown().await;
        let attempts = mock.connect_attempts().len();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(mock.connect_attempts().len(), attempts);
        assert!(DurableStore::<ReconnectRecord>::load(harness.reconnect_log_path()).await.is_empty().await);
    }

    #[tokio::test]
    async fn test_stale_disconnect_is_ignored() {
        let harness = TestHarness::new().unwrap();
        let (controller, _mock) = controller(&harness).await;
        controller.connect().await.unwrap();
        assert!(!controller.mark_disconnected(Utc::now(), "late event from an old session"));
        assert_eq!(controller.state(), LinkState::Connected);
    }
}
