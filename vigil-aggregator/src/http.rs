/*!
Read-only HTTP status API

- `GET /health`: broker link, counters, agents tracked/active
- `GET /sessions`: every durable session record
- `GET /sessions/active`: identities currently online
- `GET /sessions/{agent_id}`: one record, 404 when unknown
*/

use crate::health::{AggregatorHealth, HealthTracker};
use crate::router::AggregatorRouter;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::{routing::get, Json, Router};
use serde::Serialize;
use std::sync::Arc;
use vigil_core::SessionRecord;

#[derive(Clone)]
pub struct AppState {
    pub router: Arc<AggregatorRouter>,
    pub health: HealthTracker,
}

#[derive(Debug, Serialize)]
pub struct SessionView {
    #[serde(flatten)]
    pub record: SessionRecord,
    pub active: bool,
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/sessions", get(get_sessions))
        .route("/sessions/active", get(get_active))
        .route("/sessions/{agent_id}", get(get_session))
        .with_state(app_state)
}

// GET /health
async fn get_health(State(app): State<AppState>) -> Json<AggregatorHealth> {
    let tracked = app.router.tracked().await;
    let active = app.router.active_agents().len();
    Json(app.health.get_health(tracked, active, app.router.persistence_failures()))
}

// GET /sessions
async fn get_sessions(State(app): State<AppState>) -> Json<Vec<SessionView>> {
    let sessions = app.router.sessions().await;
    let list = sessions
        .into_values()
        .map(|record| SessionView { active: app.router.is_active(&record.agent_id), record })
        .collect();
    Json(list)
}

// GET /sessions/active
async fn get_active(State(app): State<AppState>) -> Json<Vec<String>> {
    Json(app.router.active_agents())
}

// GET /sessions/{agent_id}
async fn get_session(
    State(app): State<AppState>,
    Path(agent_id): Path<String>,
) -> Result<Json<SessionView>, StatusCode> {
    let Some(record) = app.router.session(&agent_id).await else {
        return Err(StatusCode::NOT_FOUND);
    };
    Ok(Json(SessionView { active: app.router.is_active(&agent_id), record }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::{DurableStore, SlidingWindowDetector};
    use vigil_devkit::{MockTransport, TestHarness};

    async fn app(harness: &TestHarness) -> AppState {
        let (mock, _events) = MockTransport::new("vigil-aggregator");
        let store = Arc::new(DurableStore::load(harness.state_path()).await);
        let health = HealthTracker::new();
        let router = AggregatorRouter::new(store, SlidingWindowDetector::default(), Arc::new(mock), health.clone());
        AppState { router: Arc::new(router), health }
    }

    #[tokio::test]
    async fn test_session_endpoints() {
        let harness = TestHarness::new().unwrap();
        let app = app(&harness).await;
        app.router.on_connect("agent-001").await;
        app.router.on_connect("agent-002").await;
        app.router.on_disconnect("agent-002").await;

        let Json(all) = get_sessions(State(app.clone())).await;
        assert_eq!(all.len(), 2);
        assert!(all[0].active && !all[1].active);

        let Json(active) = get_active(State(app.clone())).await;
        assert_eq!(active, vec!["agent-001"]);

        let Json(one) = get_session(State(app.clone()), Path("agent-002".into())).await.unwrap();
        assert!(one.record.disconnected_at.is_some());

        let missing = get_session(State(app.clone()), Path("agent-404".into())).await;
        assert_eq!(missing.unwrap_err(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let harness = TestHarness::new().unwrap();
        let app = app(&harness).await;
        app.router.on_connect("agent-001").await;
        app.health.mark_mqtt_connected();

        let Json(health) = get_health(State(app)).await;
        assert_eq!(health.mqtt_status, "connected");
        assert_eq!((health.agents_tracked, health.agents_active), (1, 1));
        assert_eq!(health.persistence_failures, 0);
    }

    #[test]
    fn test_session_view_is_flat() {
        let view = SessionView { record: SessionRecord::new("agent-001", chrono::Utc::now()), active: true };
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["agent_id"], "agent-001");
        assert_eq!(json["active"], true);
    }
}
