//! Control-plane HTTP API.
//!
//! Every mutating endpoint validates its input, updates the state and waits for the shaping
//! rules to be recompiled before answering. Responses are JSON: `{"ok": true, ...}` on success,
//! `{"error": "..."}` otherwise.

use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use manet_model::{Config, LinkOverride, NodeId, Position, TopologyMode, UnknownTopology};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::debug;

use crate::{
    state::{StateError, StateHandle},
    telemetry::{NodeReport, Telemetry},
};

/// Shared state of every handler.
#[derive(Debug, Clone)]
pub struct AppState {
    pub state: StateHandle,
    pub telemetry: Arc<Telemetry>,
    pub config: Arc<Config>,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("invalid body: {0}")]
    Body(#[from] JsonRejection),
    #[error("invalid path: {0}")]
    Path(#[from] PathRejection),
    #[error(transparent)]
    Topology(#[from] UnknownTopology),
    #[error(transparent)]
    State(#[from] StateError),
    #[error("not found")]
    NotFound,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::State(StateError::Unavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        debug!(%status, error = %self, "request rejected");
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

type ApiResult = Result<Json<serde_json::Value>, ApiError>;

/// Builds the router with CORS open to any origin.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/config", get(config))
        .route("/position", post(set_position))
        .route("/environment", post(set_environment))
        .route("/topology", post(set_topology))
        .route("/positions/:id", post(set_peer_position))
        .route("/link_override", post(set_link_override))
        .route("/link_override/:target", delete(clear_link_override))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Serialize)]
struct Status {
    ok: bool,
    #[serde(flatten)]
    report: NodeReport,
}

async fn status(State(app): State<AppState>) -> Json<Status> {
    let report = NodeReport::collect(&app.state.snapshot(), &app.telemetry);
    Json(Status { ok: true, report })
}

#[derive(Serialize)]
struct ConfigView<'a> {
    ok: bool,
    #[serde(flatten)]
    config: &'a Config,
}

async fn config(State(app): State<AppState>) -> Response {
    Json(ConfigView { ok: true, config: &app.config }).into_response()
}

async fn set_position(
    State(app): State<AppState>,
    body: Result<Json<Position>, JsonRejection>,
) -> ApiResult {
    let Json(position) = body?;
    let snapshot = app.state.set_position(position).await?;
    Ok(Json(json!({ "ok": true, "position": snapshot.position })))
}

#[derive(Debug, Deserialize)]
struct EnvironmentRequest {
    #[serde(default = "default_environment")]
    profile: String,
}

fn default_environment() -> String {
    manet_model::config::DEFAULT_ENVIRONMENT.to_string()
}

async fn set_environment(
    State(app): State<AppState>,
    body: Result<Json<EnvironmentRequest>, JsonRejection>,
) -> ApiResult {
    let Json(request) = body?;
    let snapshot = app.state.set_environment(request.profile).await?;
    Ok(Json(json!({
        "ok": true,
        "environment": snapshot.environment,
        "bandwidth_kbps": snapshot.bandwidth_kbps,
    })))
}

#[derive(Debug, Deserialize)]
struct TopologyRequest {
    #[serde(default)]
    mode: Option<String>,
}

async fn set_topology(
    State(app): State<AppState>,
    body: Result<Json<TopologyRequest>, JsonRejection>,
) -> ApiResult {
    let Json(request) = body?;
    let mode = match request.mode {
        Some(mode) => mode.parse::<TopologyMode>()?,
        None => TopologyMode::default(),
    };

    let snapshot = app.state.set_topology(mode).await?;
    Ok(Json(json!({ "ok": true, "topology": snapshot.topology, "peers": snapshot.peers })))
}

async fn set_peer_position(
    State(app): State<AppState>,
    id: Result<Path<NodeId>, PathRejection>,
    body: Result<Json<Position>, JsonRejection>,
) -> ApiResult {
    let Path(id) = id?;
    let Json(position) = body?;

    let snapshot = app.state.set_peer_position(id, position).await?;
    Ok(Json(json!({ "ok": true, "id": id, "position": snapshot.positions.get(&id) })))
}

#[derive(Debug, Deserialize)]
struct OverrideRequest {
    target: NodeId,
    #[serde(flatten)]
    link_override: LinkOverride,
}

async fn set_link_override(
    State(app): State<AppState>,
    body: Result<Json<OverrideRequest>, JsonRejection>,
) -> ApiResult {
    let Json(OverrideRequest { target, link_override }) = body?;

    let snapshot = app.state.set_override(target, link_override).await?;
    Ok(Json(json!({
        "ok": true,
        "target": target,
        "link_override": link_override,
        "link_quality": snapshot.link_quality.get(&target),
    })))
}

async fn clear_link_override(
    State(app): State<AppState>,
    target: Result<Path<NodeId>, PathRejection>,
) -> ApiResult {
    let Path(target) = target?;

    let (removed, snapshot) = app.state.clear_override(target).await?;
    Ok(Json(json!({
        "ok": true,
        "target": target,
        "removed": removed.is_some(),
        "link_quality": snapshot.link_quality.get(&target),
    })))
}

async fn not_found() -> ApiError {
    ApiError::NotFound
}
