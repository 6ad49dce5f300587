mod common;

use chrono::{Duration, Utc};
use common::RecordingSender;
use fleetwatch::config::EngineConfig;
use fleetwatch::db::Db;
use fleetwatch::evaluator::StatusEvaluator;
use fleetwatch::models::{CheckType, NewChannel, NewMaintenanceWindow, NewService, Service};
use fleetwatch::probe::{ProbeOutcome, ProbeResult};
use fleetwatch::recorder::HistoryRecorder;
use fleetwatch::Engine;
use rocket::http::Status;
use rocket::local::blocking::Client;
use std::sync::Arc;

struct TestApp {
    client: Client,
    db: Arc<Db>,
    sender: Arc<RecordingSender>,
}

fn test_app_with(sender: RecordingSender) -> TestApp {
    let db_path = format!("/tmp/fleetwatch_test_{}.db", uuid::Uuid::new_v4());
    let config = EngineConfig {
        database_path: db_path,
        max_stagger: std::time::Duration::ZERO,
        ..EngineConfig::default()
    };
    let sender = Arc::new(sender);
    let engine = Engine::open(config, sender.clone()).expect("engine init failed");
    let db = engine.db.clone();
    let client = Client::tracked(engine.rocket()).expect("valid rocket instance");
    TestApp { client, db, sender }
}

fn test_app() -> TestApp {
    test_app_with(RecordingSender::default())
}

fn create_service(db: &Db, name: &str) -> Service {
    let mut input = NewService::new(name, CheckType::Tcp, "127.0.0.1:1");
    input.check_interval = 3600;
    db.create_service(&input).unwrap()
}

fn record_check(db: &Arc<Db>, service: &Service, outcome: ProbeOutcome) {
    let probe = ProbeResult::from(outcome);
    let evaluation = StatusEvaluator { degraded_response_ms: Some(5000), ssl_warning_days: 14 }
        .evaluate(service.status, &probe);
    HistoryRecorder::new(db.clone())
        .record(service, &evaluation, &probe, Utc::now())
        .unwrap();
}

#[test]
fn test_health() {
    let app = test_app();
    let resp = app.client.get("/api/v1/health").dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let body: serde_json::Value = resp.into_json().unwrap();
    assert_eq!(body["service"], "fleetwatch");
    assert_eq!(body["status"], "ok");
    assert_eq!(body["scheduled_services"], 0);
}

#[test]
fn test_list_and_get_services() {
    let app = test_app();
    let api = create_service(&app.db, "API");
    let gone = create_service(&app.db, "Old");
    app.db.soft_delete_service(&gone.id).unwrap();

    let resp = app.client.get("/api/v1/services").dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let body: serde_json::Value = resp.into_json().unwrap();
    let list = body.as_array().unwrap();
    assert_eq!(list.len(), 1);
    assert_eq!(list[0]["name"], "API");
    assert_eq!(list[0]["status"], "unknown");
    assert_eq!(list[0]["check_type"], "tcp");

    let resp = app.client.get(format!("/api/v1/services/{}", api.id)).dispatch();
    assert_eq!(resp.status(), Status::Ok);

    let resp = app.client.get(format!("/api/v1/services/{}", gone.id)).dispatch();
    assert_eq!(resp.status(), Status::NotFound);
    let body: serde_json::Value = resp.into_json().unwrap();
    assert_eq!(body["code"], "NOT_FOUND");
}

#[test]
fn test_unknown_route_uses_json_catcher() {
    let app = test_app();
    let resp = app.client.get("/api/v1/nope").dispatch();
    assert_eq!(resp.status(), Status::NotFound);
    let body: serde_json::Value = resp.into_json().unwrap();
    assert_eq!(body["code"], "NOT_FOUND");
}

#[test]
fn test_service_logs_and_metrics() {
    let app = test_app();
    let svc = create_service(&app.db, "API");
    record_check(&app.db, &svc, ProbeOutcome::Online { response_time_ms: 12, detail: "Connected".into() });
    let svc = app.db.get_service(&svc.id).unwrap().unwrap();
    record_check(&app.db, &svc, ProbeOutcome::Offline { response_time_ms: 1, detail: "Connection failed".into() });

    let resp = app.client.get(format!("/api/v1/services/{}/logs?limit=1", svc.id)).dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let logs: serde_json::Value = resp.into_json().unwrap();
    let logs = logs.as_array().unwrap();
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0]["status"], "offline");
    assert_eq!(logs[0]["message"], "Connection failed");

    let resp = app.client.get(format!("/api/v1/services/{}/metrics?hours=1", svc.id)).dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let metrics: serde_json::Value = resp.into_json().unwrap();
    assert_eq!(metrics.as_array().unwrap().len(), 2);

    let resp = app.client.get("/api/v1/services/missing/logs").dispatch();
    assert_eq!(resp.status(), Status::NotFound);
}

#[test]
fn test_channel_test_records_history() {
    let app = test_app();
    let channel = app
        .db
        .create_channel(&NewChannel {
            name: "ops hook".into(),
            channel_type: "webhook".into(),
            config: serde_json::json!({"url": "http://127.0.0.1:1/hook"}),
            is_default: false,
        })
        .unwrap();

    let resp = app.client.post(format!("/api/v1/channels/{}/test", channel.id)).dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let body: serde_json::Value = resp.into_json().unwrap();
    assert_eq!(body["event"], "test");
    assert_eq!(body["status"], "sent");
    assert!(body.get("service_id").is_none());
    assert_eq!(app.sender.count(), 1);

    let resp = app.client.get("/api/v1/notifications/history").dispatch();
    let history: serde_json::Value = resp.into_json().unwrap();
    assert_eq!(history.as_array().unwrap().len(), 1);
    assert_eq!(history[0]["channel_id"], channel.id.as_str());

    let resp = app.client.post("/api/v1/channels/missing/test").dispatch();
    assert_eq!(resp.status(), Status::NotFound);
}

#[test]
fn test_channel_test_with_bad_config_is_recorded_failed() {
    let app = test_app();
    let channel = app
        .db
        .create_channel(&NewChannel {
            name: "broken".into(),
            channel_type: "telegram".into(),
            config: serde_json::json!({"chat_id": 42}),
            is_default: false,
        })
        .unwrap();

    let resp = app.client.post(format!("/api/v1/channels/{}/test", channel.id)).dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let body: serde_json::Value = resp.into_json().unwrap();
    assert_eq!(body["status"], "failed");
    assert!(body["error_message"].as_str().unwrap().contains("invalid channel config"));
    assert_eq!(app.sender.count(), 0);
}

#[test]
fn test_channel_test_delivery_failure() {
    let app = test_app_with(RecordingSender::failing("HTTP 500"));
    let channel = app
        .db
        .create_channel(&NewChannel {
            name: "slack".into(),
            channel_type: "slack".into(),
            config: serde_json::json!({"webhook_url": "http://127.0.0.1:1/slack"}),
            is_default: false,
        })
        .unwrap();
    let resp = app.client.post(format!("/api/v1/channels/{}/test", channel.id)).dispatch();
    let body: serde_json::Value = resp.into_json().unwrap();
    assert_eq!(body["status"], "failed");
    assert_eq!(body["error_message"], "HTTP 500");
}

#[test]
fn test_maintenance_endpoints() {
    let app = test_app();
    let a = create_service(&app.db, "A");
    let b = create_service(&app.db, "B");
    let now = Utc::now();
    app.db
        .create_maintenance_window(&NewMaintenanceWindow {
            service_id: Some(a.id.clone()),
            title: "db upgrade".into(),
            starts_at: now - Duration::minutes(10),
            ends_at: now + Duration::minutes(50),
            recurrence: None,
        })
        .unwrap();

    let resp = app.client.get(format!("/api/v1/services/{}/maintenance", a.id)).dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let body: serde_json::Value = resp.into_json().unwrap();
    assert_eq!(body["suppressed"], true);
    assert_eq!(body["windows"][0]["title"], "db upgrade");

    let resp = app.client.get(format!("/api/v1/services/{}/maintenance", b.id)).dispatch();
    let body: serde_json::Value = resp.into_json().unwrap();
    assert_eq!(body["suppressed"], false);

    let resp = app.client.get("/api/v1/maintenance/active").dispatch();
    let body: serde_json::Value = resp.into_json().unwrap();
    assert_eq!(body.as_array().unwrap().len(), 1);
}

#[test]
fn test_engine_reload_reconciles_timers() {
    let app = test_app();
    let svc = create_service(&app.db, "API");

    let resp = app.client.post("/api/v1/engine/reload").dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let body: serde_json::Value = resp.into_json().unwrap();
    assert_eq!(body["started"], 1);
    assert_eq!(body["running"], 1);

    let health: serde_json::Value = app.client.get("/api/v1/health").dispatch().into_json().unwrap();
    assert_eq!(health["scheduled_services"], 1);

    app.db.set_service_active(&svc.id, false).unwrap();
    let body: serde_json::Value = app.client.post("/api/v1/engine/reload").dispatch().into_json().unwrap();
    assert_eq!(body["stopped"], 1);
    assert_eq!(body["running"], 0);
}

#[test]
fn test_history_filter_by_service() {
    let app = test_app();
    let resp = app.client.get("/api/v1/notifications/history?service_id=nothing&limit=5").dispatch();
    assert_eq!(resp.status(), Status::Ok);
    let body: serde_json::Value = resp.into_json().unwrap();
    assert!(body.as_array().unwrap().is_empty());
}
