//! HTTP surface (C10): read-only queries over C8, plus the teacher's
//! operability routes (`/health`, `/ready`, `/metrics`).
//!
//! Route/layer shape is a direct generalization of the teacher's
//! `main.rs` (`AppState`, `State` extractor, `ServiceBuilder` with
//! `TraceLayer` + `CompressionLayer`) — everything the teacher's rate-limit
//! and signature-verification middleware did is out of scope here (§10.5):
//! no auth layer, no CORS layer, no per-route rate limiting.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use tower::ServiceBuilder;
use tower_http::compression::CompressionLayer;
use tower_http::trace::TraceLayer;

use crate::metrics::{Metrics, MetricsResponse};
use crate::model::{now_unix, HistoryPoint, NodeId, PacketArchiveEntry};
use crate::mqtt::MqttClient;
use crate::store::{NodeView, StateStore};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<StateStore>,
    pub metrics: Arc<Metrics>,
    pub mqtt: Arc<MqttClient>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics))
        .route("/api/nodes", get(list_nodes))
        .route("/api/special/:node_id/history", get(special_history))
        .route("/api/special/packets", get(special_packets))
        .route("/api/gateways", get(gateways))
        .with_state(state)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(CompressionLayer::new()))
}

/// Always `200 OK` once the process is accepting connections — liveness,
/// not readiness.
async fn health() -> StatusCode {
    StatusCode::OK
}

/// `503` while the broker connection has never been confirmed — readiness
/// tied to whether the ingestion pipeline can actually receive data.
async fn ready(State(state): State<AppState>) -> StatusCode {
    use crate::mqtt::Liveness;
    match state.mqtt.liveness(now_unix()) {
        Liveness::Disconnected | Liveness::Connecting => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::OK,
    }
}

async fn metrics(State(state): State<AppState>) -> Json<MetricsResponse> {
    Json(state.metrics.snapshot())
}

#[derive(Deserialize, Default)]
struct ListNodesQuery {
    // accepted for forward-compatibility with the teacher's query-string
    // conventions; no filtering beyond the store's own show_all_nodes gate.
    #[allow(dead_code)]
    show_all: Option<bool>,
}

async fn list_nodes(State(state): State<AppState>, Query(_q): Query<ListNodesQuery>) -> Json<Vec<NodeView>> {
    Json(state.store.list_nodes(now_unix()))
}

#[derive(Deserialize)]
struct HistoryQuery {
    hours: Option<f64>,
}

async fn special_history(
    State(state): State<AppState>,
    Path(node_id): Path<NodeId>,
    Query(q): Query<HistoryQuery>,
) -> Json<Vec<HistoryPoint>> {
    Json(state.store.get_special_history(node_id, q.hours, now_unix()))
}

#[derive(Deserialize)]
struct PacketsQuery {
    node_id: Option<NodeId>,
    limit: Option<usize>,
}

#[derive(serde::Serialize)]
struct PacketEntryView {
    node_id: NodeId,
    #[serde(flatten)]
    packet: PacketArchiveEntry,
}

async fn special_packets(State(state): State<AppState>, Query(q): Query<PacketsQuery>) -> Json<Vec<PacketEntryView>> {
    let entries = state.store.get_special_node_packets(q.node_id, q.limit);
    Json(entries.into_iter().map(|(node_id, packet)| PacketEntryView { node_id, packet }).collect())
}

#[derive(serde::Serialize)]
struct GatewayView {
    gateway_id: NodeId,
    observed_by: Vec<NodeId>,
}

async fn gateways(State(state): State<AppState>) -> Json<Vec<GatewayView>> {
    Json(
        state
            .store
            .get_all_gateways()
            .into_iter()
            .map(|(gateway_id, observed_by)| GatewayView { gateway_id, observed_by })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::store::StoreConfig;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        let store = Arc::new(StateStore::new(StoreConfig::default()));
        let metrics = Arc::new(Metrics::new());
        let mqtt_config = Arc::new(crate::config::load(
            std::path::Path::new("/nonexistent/does/not/matter.ini"),
            None,
        ).unwrap_or_else(|_| dummy_config()));
        let mqtt = Arc::new(MqttClient::new(mqtt_config, metrics.clone()));
        AppState { store, metrics, mqtt }
    }

    fn dummy_config() -> Config {
        use crate::config::{AlertConfig, MqttConfig, SecurityConfig, WebappConfig};
        Config {
            app_title: "t".into(),
            app_version: "0".into(),
            mqtt: MqttConfig {
                broker: "x".into(),
                port: 1883,
                root_topic: "msh/US".into(),
                channel_name: "LongFast".into(),
                username: None,
                password: None,
                channel_key: [0u8; 16],
            },
            special_nodes: Default::default(),
            movement_threshold_meters: 50.0,
            history_hours: 24.0,
            stale_after_seconds: 3600.0,
            data_limit_time_hours: 1.0,
            persist_path: "state.json".into(),
            show_all_nodes: true,
            show_gateways: true,
            show_position_trails: true,
            trail_history_hours: 24.0,
            alerts: AlertConfig {
                enabled: false,
                cooldown_secs: 3600.0,
                tracker_url: None,
                smtp_host: "localhost".into(),
                smtp_port: 25,
                smtp_ssl: false,
                smtp_username: None,
                smtp_password: None,
                email_from: "tracker@example.com".into(),
                email_to: vec![],
            },
            low_battery_threshold_percent: 20.0,
            webapp: WebappConfig {
                host: "0.0.0.0".into(),
                port: 8080,
                default_center: (0.0, 0.0),
                default_zoom: 8,
                status_blue_threshold_secs: 3600.0,
                status_orange_threshold_secs: 43200.0,
                api_polling_interval_secs: 10,
                api_key: None,
            },
            debug_log_level: None,
            recent_message_buffer_size: 200,
            security: SecurityConfig { environment: "test".into(), trusted_proxies: vec![], allowed_origins: vec![] },
        }
    }

    #[tokio::test]
    async fn health_is_always_ok() {
        let app = router(test_state());
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn ready_is_unavailable_before_broker_confirms() {
        let app = router(test_state());
        let response = app
            .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn nodes_endpoint_returns_empty_array_for_fresh_store() {
        let app = router(test_state());
        let response = app
            .oneshot(Request::builder().uri("/api/nodes").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
