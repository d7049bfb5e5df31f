mod common;

use common::{as_adapters, stubs, StubEngine};
use query_router::api::handle_request;
use query_router::config::DuckDbConfig;
use query_router::error::EngineErrorKind;
use query_router::execution::duckdb_engine::DuckDbEngine;
use query_router::execution::{
    EngineAdapter, ExecutionRouter, FallbackController, FallbackState, RewriteTarget,
    StorageLayout, TableRewriter,
};
use query_router::{Classifier, EngineId};
use serde_json::{json, Value};
use std::sync::Arc;

fn post_query(body: &Value) -> String {
    let body = body.to_string();
    format!(
        "POST /query HTTP/1.1\r\nHost: router\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    )
}

fn embedded_router() -> ExecutionRouter {
    let fallback = Arc::new(FallbackState::default());
    let duckdb = DuckDbEngine::new(
        DuckDbConfig {
            install_extensions: false,
            ..DuckDbConfig::default()
        },
        TableRewriter::new(StorageLayout::default(), RewriteTarget::ParquetScan)
            .with_lake_tables(["events"]),
        fallback.clone(),
    );
    let controller: Arc<dyn EngineAdapter> =
        Arc::new(FallbackController::new(Arc::new(duckdb), fallback));
    ExecutionRouter::new(Classifier::default(), vec![controller])
}

#[tokio::test]
async fn test_health() {
    let router = ExecutionRouter::new(Classifier::default(), Vec::new());
    let response = handle_request(&router, "GET /health HTTP/1.1\r\nHost: router\r\n\r\n").await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body, json!({ "status": "alive" }));
}

#[tokio::test]
async fn test_query_success_envelope() {
    let stubs = stubs();
    let router = ExecutionRouter::new(Classifier::default(), as_adapters(&stubs));

    let response = handle_request(
        &router,
        &post_query(&json!({ "sql": "SELECT * FROM users WHERE id = 1" })),
    )
    .await;

    assert_eq!(response.status, 200);
    assert_eq!(response.body["engine"], "postgres");
    assert_eq!(response.body["columns"], json!(["id", "name"]));
    assert_eq!(response.body["data"], json!([{ "id": 1, "name": "Alice" }]));
    assert!(response.body["duration"].as_f64().unwrap() >= 0.0);
    assert!(response.body.get("error").is_none());
    assert!(response.body.get("degraded").is_none());
}

#[tokio::test]
async fn test_engine_error_envelope() {
    let stubs = vec![StubEngine::failing(EngineId::ColumnStore, EngineErrorKind::Timeout)];
    let router = ExecutionRouter::new(Classifier::default(), as_adapters(&stubs));

    let response = handle_request(
        &router,
        &post_query(&json!({ "sql": "SELECT role, COUNT(*) FROM users GROUP BY role" })),
    )
    .await;

    assert_eq!(response.status, 200);
    assert_eq!(response.body["engine"], "clickhouse");
    assert_eq!(response.body["error_kind"], "timeout");
    assert!(response.body["error"].as_str().unwrap().contains("clickhouse"));
    assert!(response.body["duration"].is_number());
    assert!(response.body.get("data").is_none());
    assert_eq!(stubs[0].calls(), 1);
}

#[tokio::test]
async fn test_invalid_force_engine_invokes_no_adapter() {
    let stubs = stubs();
    let router = ExecutionRouter::new(Classifier::default(), as_adapters(&stubs));

    let response = handle_request(
        &router,
        &post_query(&json!({ "sql": "SELECT * FROM users", "force_engine": "mysql" })),
    )
    .await;

    assert_eq!(response.status, 400);
    assert_eq!(response.body["engine"], "mysql");
    assert_eq!(response.body["duration"], json!(0.0));
    assert!(response.body["error"].as_str().unwrap().contains("mysql"));
    assert!(stubs.iter().all(|s| s.calls() == 0));
}

#[tokio::test]
async fn test_force_engine_is_honoured() {
    let stubs = stubs();
    let router = ExecutionRouter::new(Classifier::default(), as_adapters(&stubs));

    let response = handle_request(
        &router,
        &post_query(&json!({ "sql": "SELECT COUNT(*) FROM users", "force_engine": "duckdb" })),
    )
    .await;

    assert_eq!(response.body["engine"], "duckdb");
    assert_eq!(stubs[3].engine(), EngineId::EmbeddedStore);
    assert_eq!(stubs[3].seen(), vec!["SELECT COUNT(*) FROM users".to_string()]);
}

#[tokio::test]
async fn test_bad_requests() {
    let router = ExecutionRouter::new(Classifier::default(), Vec::new());

    let missing_sql = handle_request(&router, &post_query(&json!({ "query": "SELECT 1" }))).await;
    assert_eq!(missing_sql.status, 400);
    assert!(missing_sql.body["error"].as_str().unwrap().contains("sql"));

    let not_json = handle_request(
        &router,
        "POST /query HTTP/1.1\r\nContent-Length: 8\r\n\r\nnot json",
    )
    .await;
    assert_eq!(not_json.status, 400);

    let unknown = handle_request(&router, "GET /tables HTTP/1.1\r\n\r\n").await;
    assert_eq!(unknown.status, 404);

    let preflight = handle_request(&router, "OPTIONS /query HTTP/1.1\r\n\r\n").await;
    assert_eq!(preflight.status, 200);
}

#[tokio::test]
async fn test_engines_endpoint() {
    let stubs = stubs();
    let router = ExecutionRouter::new(Classifier::default(), as_adapters(&stubs));

    let response = handle_request(&router, "GET /engines HTTP/1.1\r\n\r\n").await;
    assert_eq!(response.status, 200);
    assert_eq!(
        response.body["engines"],
        json!([
            { "engine": "postgres", "healthy": true },
            { "engine": "clickhouse", "healthy": true },
            { "engine": "trino", "healthy": true },
            { "engine": "duckdb", "healthy": true },
        ])
    );
}

#[tokio::test]
async fn test_malformed_sql_reports_duckdb_syntax_error() {
    let router = embedded_router();

    let request = post_query(&json!({ "sql": "SELECT * FORM users" }));
    let response = handle_request(&router, &request).await;

    assert_eq!(response.status, 200);
    assert_eq!(response.body["engine"], "duckdb");
    assert_eq!(response.body["error_kind"], "syntax_error");
    assert!(!response.body["error"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn test_embedded_engine_end_to_end() {
    let router = embedded_router();

    for sql in [
        "CREATE TABLE users (id INTEGER, name VARCHAR, role VARCHAR)",
        "INSERT INTO users VALUES (1, 'Alice', 'Admin'), (2, 'Bob', 'User')",
    ] {
        let response = router.execute(sql, Some("duckdb")).await.unwrap();
        assert!(response.is_success(), "{:?}", response.error());
    }

    let response = handle_request(
        &router,
        &post_query(&json!({ "sql": "SELECT name FROM users WHERE role = 'Admin'" })),
    )
    .await;
    assert_eq!(response.body["engine"], "duckdb");
    assert_eq!(response.body["data"], json!([{ "name": "Alice" }]));
}
