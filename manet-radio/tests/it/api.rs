use std::sync::Arc;

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use manet_radio::{
    api::{self, AppState},
    telemetry::Telemetry,
};
use manet_tc::{recording::Operation, RecordingBackend};
use serde_json::{json, Value};
use tower::ServiceExt;

use crate::{spawn_state, test_config};

async fn app() -> (Router, Arc<RecordingBackend>) {
    let _ = tracing_subscriber::fmt::try_init();

    let config = Arc::new(test_config());
    let (backend, state) = spawn_state(1, Arc::clone(&config)).await;
    let router = api::router(AppState { state, telemetry: Arc::new(Telemetry::new()), config });
    (router, backend)
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut request = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(body) => {
            request = request.header(header::CONTENT_TYPE, "application/json");
            Body::from(body.to_string())
        }
        None => Body::empty(),
    };

    let response = app.clone().oneshot(request.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn status_reports_model_state() {
    let (app, _) = app().await;

    let (status, body) = send(&app, Method::GET, "/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
    assert_eq!(body["node_id"], 1);
    assert_eq!(body["topology"], "mesh");
    assert_eq!(body["environment"], "clear");
    assert_eq!(body["bandwidth_kbps"], 1000);
    assert_eq!(body["peers"], json!([2, 3]));
    assert_eq!(body["link_quality"]["2"]["latency_ms"], 30.0);
    assert_eq!(body["link_quality"]["3"]["reachable"], false);
    assert!(body["link_quality"]["0"].is_object());
    assert!(body["link_overrides"].as_object().unwrap().is_empty());
    assert!(body["traffic"]["load_percent"].is_number());
}

#[tokio::test]
async fn config_is_served_as_loaded() {
    let (app, _) = app().await;

    let (status, body) = send(&app, Method::GET, "/config", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
    assert_eq!(body["radio"]["bandwidth_kbps"], 1000);
    assert_eq!(body["distance"]["max_range_m"], 1000.0);
    assert!(body["environment"]["profiles"]["storm"].is_object());
}

#[tokio::test]
async fn moving_recompiles_links() {
    let (app, backend) = app().await;
    backend.take_operations();

    let (status, body) =
        send(&app, Method::POST, "/position", Some(json!({ "x": 500.0, "y": 0.0 }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["position"], json!({ "x": 500.0, "y": 0.0, "z": 0.0 }));

    // Node 3 is now 700m away and comes back into range.
    let (_, body) = send(&app, Method::GET, "/status", None).await;
    assert_eq!(body["link_quality"]["3"]["reachable"], true);
    assert_eq!(body["link_quality"]["2"]["latency_ms"], 2.0);

    let ops = backend.operations();
    assert_eq!(ops[0], Operation::ResetInterface);
    assert_eq!(ops.iter().filter(|op| matches!(op, Operation::AddClass(_))).count(), 2);
}

#[tokio::test]
async fn unknown_environment_is_rejected_without_change() {
    let (app, backend) = app().await;
    backend.take_operations();

    let (status, body) =
        send(&app, Method::POST, "/environment", Some(json!({ "profile": "fog" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "unknown profile: fog");
    assert!(backend.operations().is_empty());

    let (status, body) =
        send(&app, Method::POST, "/environment", Some(json!({ "profile": "storm" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["environment"], "storm");
    assert_eq!(body["bandwidth_kbps"], 500);
    assert_eq!(backend.installed().bandwidth_kbps, Some(500));
}

#[tokio::test]
async fn topology_switch_replaces_peers() {
    let (app, backend) = app().await;

    let (status, body) = send(&app, Method::POST, "/topology", Some(json!({ "mode": "star" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["topology"], "star");
    assert_eq!(body["peers"], json!([0]));

    let installed = backend.installed();
    assert_eq!(installed.classes.len(), 1);
    assert_eq!(installed.classes[0].peer, 0);

    let (status, body) = send(&app, Method::POST, "/topology", Some(json!({ "mode": "ring" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "unknown topology: ring");
}

#[tokio::test]
async fn peer_positions_are_range_checked() {
    let (app, _) = app().await;

    let (status, body) =
        send(&app, Method::POST, "/positions/3", Some(json!({ "x": 100.0, "y": 0.0, "z": 0.0 }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], 3);

    let (_, body) = send(&app, Method::GET, "/status", None).await;
    assert_eq!(body["link_quality"]["3"]["reachable"], true);

    let (status, _) = send(&app, Method::POST, "/positions/4", Some(json!({ "x": 1.0 }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&app, Method::POST, "/positions/drone", Some(json!({ "x": 1.0 }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn link_override_lifecycle() {
    let (app, backend) = app().await;

    let (status, body) = send(
        &app,
        Method::POST,
        "/link_override",
        Some(json!({ "target": 2, "extra_latency_ms": 20, "extra_loss_percent": 5 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["link_quality"]["latency_ms"], 50.0);
    assert_eq!(body["link_quality"]["loss_percent"], 15.0);

    let (_, body) = send(&app, Method::GET, "/status", None).await;
    assert_eq!(body["link_overrides"]["2"]["extra_latency_ms"], 20.0);
    assert_eq!(body["link_overrides"]["2"]["partition"], false);

    let (status, body) =
        send(&app, Method::POST, "/link_override", Some(json!({ "target": 2, "partition": true }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["link_quality"]["loss_percent"], 100.0);
    let stage = backend.installed().stages.into_iter().find(|class| class.peer == 2).unwrap();
    assert_eq!(stage.loss_percent, 100.0);

    let (status, body) = send(&app, Method::DELETE, "/link_override/2", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["removed"], true);
    assert_eq!(body["link_quality"]["latency_ms"], 30.0);

    let (status, body) = send(&app, Method::DELETE, "/link_override/2", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["removed"], false);
}

#[tokio::test]
async fn invalid_overrides_are_rejected() {
    let (app, _) = app().await;

    for body in [
        json!({ "target": 1, "extra_latency_ms": 5 }),
        json!({ "target": 9, "extra_latency_ms": 5 }),
        json!({ "target": 2, "extra_latency_ms": -5 }),
        json!({ "target": 2, "extra_loss_percent": 101 }),
        json!({ "extra_latency_ms": 5 }),
    ] {
        let (status, response) = send(&app, Method::POST, "/link_override", Some(body.clone())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");
        assert!(response["error"].is_string());
    }
}

#[tokio::test]
async fn malformed_json_is_a_client_error() {
    let (app, _) = app().await;

    let request = Request::builder()
        .method(Method::POST)
        .uri("/position")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unknown_paths_are_not_found() {
    let (app, _) = app().await;

    let (status, body) = send(&app, Method::GET, "/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, json!({ "error": "not found" }));
}

#[tokio::test]
async fn responses_allow_any_origin() {
    let (app, _) = app().await;

    let request = Request::builder()
        .uri("/status")
        .header(header::ORIGIN, "http://dashboard.local")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
}
