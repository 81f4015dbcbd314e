use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::{json, Value};

use crate::path::PathManager;
use crate::rtmp::RtmpServer;

/// Shared state of the introspection API.
#[derive(Clone)]
pub struct ApiState {
    pub server: Arc<RtmpServer>,
    pub path_manager: Arc<PathManager>,
    pub metrics_handle: Option<PrometheusHandle>,
}

/// Build the read-only introspection router.
pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/v1/rtmpconns/list", get(list_conns))
        .route("/v1/paths/list", get(list_paths))
        .route("/metrics", get(render_metrics))
        .with_state(state)
}

async fn list_conns(State(state): State<ApiState>) -> Json<Value> {
    Json(json!({ "items": state.server.conn_snapshots() }))
}

async fn list_paths(State(state): State<ApiState>) -> Json<Value> {
    Json(json!({ "items": state.path_manager.path_snapshots() }))
}

async fn render_metrics(State(state): State<ApiState>) -> String {
    state
        .metrics_handle
        .as_ref()
        .map(|h| h.render())
        .unwrap_or_default()
}
