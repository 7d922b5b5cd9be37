//! HTTP API tests: spec CRUD wired to the scheduler over a tempdir store.

mod common;

use cairn::server::{build_router, AppState};
use common::test_stack;
use serde_json::{json, Value};

struct TestServer {
    base_url: String,
    client: reqwest::Client,
    _handle: tokio::task::JoinHandle<()>,
}

async fn start_server(state: AppState) -> TestServer {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    TestServer {
        base_url: format!("http://{addr}"),
        client: reqwest::Client::new(),
        _handle: handle,
    }
}

fn spec_body(name: &str) -> Value {
    json!({
        "name": name,
        "backup_cron_string": "0 3 * * *",
        "retention_daily": "7@L",
    })
}

#[tokio::test]
async fn test_health() {
    let tmp = tempfile::tempdir().unwrap();
    let (engine, _store, _workflows, scheduler) = test_stack(tmp.path());
    let srv = start_server(AppState { engine, scheduler }).await;

    let resp = srv
        .client
        .get(format!("{}/health", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_spec_crud_reconciles_scheduler() {
    let tmp = tempfile::tempdir().unwrap();
    let (engine, _store, _workflows, scheduler) = test_stack(tmp.path());
    let srv = start_server(AppState {
        engine,
        scheduler: scheduler.clone(),
    })
    .await;

    // create
    let resp = srv
        .client
        .post(format!("{}/backup", srv.base_url))
        .json(&spec_body("db"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let created: Value = resp.json().await.unwrap();
    assert_eq!(created["name"], "db");
    assert_eq!(created["enabled"], true);
    assert_eq!(created["retention_daily"], "7@L");
    // defaults fill the unspecified levels
    assert_eq!(created["retention_monthly"], "3@L");
    assert_eq!(scheduler.routine_keys(), vec!["db|0 3 * * *".to_string()]);

    // duplicate
    let resp = srv
        .client
        .post(format!("{}/backup", srv.base_url))
        .json(&spec_body("db"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);

    // fetch + list
    let resp = srv
        .client
        .get(format!("{}/backup/db", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = srv
        .client
        .get(format!("{}/backup?enabled=true", srv.base_url))
        .send()
        .await
        .unwrap();
    let listed: Vec<Value> = resp.json().await.unwrap();
    assert_eq!(listed.len(), 1);

    // a cron edit restarts the timer under its new key
    let resp = srv
        .client
        .put(format!("{}/backup/db", srv.base_url))
        .json(&json!({ "backup_cron_string": "@every 2h" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(scheduler.routine_keys(), vec!["db|@every 2h".to_string()]);

    // disabling stops the timer
    let resp = srv
        .client
        .put(format!("{}/backup/db", srv.base_url))
        .json(&json!({ "enabled": false }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert!(scheduler.routine_keys().is_empty());

    // delete
    let resp = srv
        .client
        .delete(format!("{}/backup/db", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 204);

    let resp = srv
        .client
        .get(format!("{}/backup/db", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
}

#[tokio::test]
async fn test_create_spec_validation() {
    let tmp = tempfile::tempdir().unwrap();
    let (engine, _store, _workflows, scheduler) = test_stack(tmp.path());
    let srv = start_server(AppState { engine, scheduler }).await;

    let resp = srv
        .client
        .post(format!("{}/backup", srv.base_url))
        .json(&json!({ "name": "bad", "backup_cron_string": "not a cron" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let resp = srv
        .client
        .post(format!("{}/backup", srv.base_url))
        .json(&json!({
            "name": "bad",
            "backup_cron_string": "0 3 * * *",
            "retention_daily": "many@L",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn test_list_materialized() {
    let tmp = tempfile::tempdir().unwrap();
    let (engine, store, _workflows, scheduler) = test_stack(tmp.path());
    let srv = start_server(AppState { engine, scheduler }).await;

    srv.client
        .post(format!("{}/backup", srv.base_url))
        .json(&spec_body("db"))
        .send()
        .await
        .unwrap();

    let resp = srv
        .client
        .get(format!("{}/backup/db/materialized", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let listed: Vec<Value> = resp.json().await.unwrap();
    assert!(listed.is_empty());

    store
        .create_materialized(
            "wf-1",
            "db",
            "data-1",
            cairn::model::MaterializedStatus::Completed,
            chrono::Utc::now(),
            chrono::Utc::now(),
            12.5,
        )
        .await
        .unwrap();

    let resp = srv
        .client
        .get(format!("{}/backup/db/materialized?status=COMPLETED", srv.base_url))
        .send()
        .await
        .unwrap();
    let listed: Vec<Value> = resp.json().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0]["id"], "wf-1");
    assert_eq!(listed[0]["status"], "COMPLETED");

    // unknown status filters are rejected
    let resp = srv
        .client
        .get(format!("{}/backup/db/materialized?status=bogus", srv.base_url))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}
