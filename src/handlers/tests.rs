//! # Tests for Handlers
//!
//! Router-level tests against an in-memory SQLite database. The engine is
//! built but not started, so submitted jobs stay queued.

use std::sync::Arc;

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode},
    response::Json,
};
use migration::{Migrator, MigratorTrait};
use sea_orm::Database;
use serde_json::{Value, json};
use tower::ServiceExt;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::engine::JobEngine;
use crate::handlers::root;
use crate::models::ServiceInfo;
use crate::server::{AppState, create_app};
use crate::tasks::TaskRegistry;
use crate::tasks::example::{ExampleAnalysisBackend, ExampleMediaBackend};

async fn test_app() -> Router {
    let db = Database::connect("sqlite::memory:")
        .await
        .expect("connect in-memory sqlite");
    Migrator::up(&db, None).await.expect("run migrations");

    let mut config = AppConfig::default();
    config.lifecycle.status_cache_ttl_ms = 0;
    let registry = TaskRegistry::with_backends(
        Arc::new(ExampleMediaBackend::default()),
        Arc::new(ExampleAnalysisBackend::default()),
    );
    let engine = Arc::new(JobEngine::new(&config, db.clone(), registry));

    create_app(AppState {
        config: Arc::new(config),
        db,
        engine,
    })
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string())),
        None => builder.body(Body::empty()),
    }
    .expect("build request");

    let response = app.clone().oneshot(request).await.expect("route request");
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

#[tokio::test]
async fn test_root_handler_returns_expected_service_info() {
    let Json(service_info) = root().await;
    let expected = ServiceInfo::default();

    assert_eq!(service_info.service, expected.service);
    assert_eq!(service_info.version, expected.version);
}

#[tokio::test]
async fn test_status_of_unknown_job_is_not_found() {
    let app = test_app().await;
    let (status, body) = send(
        &app,
        "GET",
        &format!("/jobs/{}/status", Uuid::new_v4()),
        None,
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_submit_then_poll_status() {
    let app = test_app().await;
    let owner_id = Uuid::new_v4();
    let request = json!({
        "owner_id": owner_id,
        "priority": "high",
        "payload": {
            "type": "content_analysis",
            "target_entity_id": "creator-1",
            "unit_keys": ["post-1", "post-2", "post-3"]
        }
    });

    let (status, body) = send(&app, "POST", "/jobs", Some(request.clone())).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["deduplicated"], false);
    let job_id = body["job_id"].as_str().expect("job id").to_string();

    let (status, again) = send(&app, "POST", "/jobs", Some(request)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(again["deduplicated"], true);
    assert_eq!(again["job_id"], job_id.as_str());

    let (status, view) = send(&app, "GET", &format!("/jobs/{job_id}/status"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(view["status"], "pending");
    assert_eq!(view["progress"]["units_total"], 3);
    assert_eq!(view["progress"]["units_done"], 0);
    assert_eq!(view["health"]["is_hung"], false);

    let (status, job) = send(&app, "GET", &format!("/jobs/{job_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(job["priority"], "high");
    assert_eq!(job["state"], "queued");
}

#[tokio::test]
async fn test_submit_rejects_invalid_payload() {
    let app = test_app().await;
    let request = json!({
        "owner_id": Uuid::new_v4(),
        "payload": {"type": "profile_scrape", "username": "  "}
    });

    let (status, body) = send(&app, "POST", "/jobs", Some(request)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_FAILED");
}

#[tokio::test]
async fn test_submit_without_credits_is_payment_required() {
    let app = test_app().await;
    let request = json!({
        "owner_id": Uuid::new_v4(),
        "cost": 100,
        "payload": {"type": "profile_scrape", "username": "alice"}
    });

    let (status, body) = send(&app, "POST", "/jobs", Some(request)).await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["code"], "INSUFFICIENT_CREDITS");
    assert_eq!(body["details"]["available"], 0);
}

#[tokio::test]
async fn test_cancel_queued_job_refunds_reservation() {
    let app = test_app().await;
    let owner_id = Uuid::new_v4();

    let (status, balance) = send(
        &app,
        "POST",
        &format!("/credits/{owner_id}/deposit"),
        Some(json!({"amount": 250})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(balance["balance"], 250);

    let (status, submitted) = send(
        &app,
        "POST",
        "/jobs",
        Some(json!({
            "owner_id": owner_id,
            "cost": 100,
            "payload": {"type": "profile_scrape", "username": "alice"}
        })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let job_id = submitted["job_id"].as_str().expect("job id").to_string();
    let reservation_id = submitted["reservation_id"]
        .as_str()
        .expect("reservation id")
        .to_string();

    let (_, balance) = send(&app, "GET", &format!("/credits/{owner_id}"), None).await;
    assert_eq!(balance["balance"], 150);

    let (status, outcome) = send(&app, "POST", &format!("/jobs/{job_id}/cancel"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcome["outcome"], "cancelled");

    let (_, balance) = send(&app, "GET", &format!("/credits/{owner_id}"), None).await;
    assert_eq!(balance["balance"], 250);
    let (_, reservation) = send(
        &app,
        "GET",
        &format!("/credits/reservations/{reservation_id}"),
        None,
    )
    .await;
    assert_eq!(reservation["state"], "refunded");

    let (_, outcome) = send(&app, "POST", &format!("/jobs/{job_id}/cancel"), None).await;
    assert_eq!(outcome["outcome"], "already_finished");
    assert_eq!(outcome["state"], "failed");
}

#[tokio::test]
async fn test_repair_rejects_malformed_target() {
    let app = test_app().await;
    let (status, body) = send(
        &app,
        "POST",
        "/consistency/repair?target=not-a-target",
        None,
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_FAILED");
}

#[tokio::test]
async fn test_repair_of_unknown_analysis_is_not_found() {
    let app = test_app().await;
    let (status, _) = send(
        &app,
        "POST",
        &format!("/consistency/repair?target={}", Uuid::new_v4()),
        None,
    )
    .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_scan_and_repair_all_on_empty_store() {
    let app = test_app().await;

    let (status, report) = send(&app, "POST", "/consistency/scan", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["issues_detected"], 0);
    assert_eq!(report["hung_jobs_failed"], 0);

    let (status, report) = send(&app, "POST", "/consistency/repair?target=all", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["outcomes"], json!([]));

    let (status, issues) = send(&app, "GET", "/consistency/issues", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(issues["issues"], json!([]));
}

#[tokio::test]
async fn test_health_reports_queue_and_breakers() {
    let app = test_app().await;
    let (status, body) = send(&app, "GET", "/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["database"], true);
    assert_eq!(body["queue_depth"], 0);
    assert_eq!(body["in_flight"], 0);
    assert_eq!(body["jobs_by_state"]["queued"], 0);
}

#[tokio::test]
async fn test_list_jobs_rejects_unknown_state() {
    let app = test_app().await;
    let (status, body) = send(&app, "GET", "/jobs?state=sleeping", None).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION_FAILED");
}
