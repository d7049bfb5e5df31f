mod common;

use common::{as_adapters, stubs};
use query_router::execution::{plan, EngineAdapter, ExecutionRouter, RoutingRule};
use query_router::{Classifier, EngineId};

fn engine_for(sql: &str) -> EngineId {
    plan(&Classifier::default(), sql, None).unwrap().decision.engine
}

#[test]
fn test_documented_routes() {
    assert_eq!(engine_for("SELECT * FROM users WHERE id = 1"), EngineId::PointStore);
    assert_eq!(engine_for("SELECT COUNT(*) FROM users"), EngineId::ColumnStore);
    assert_eq!(
        engine_for("SELECT a.name, b.role FROM users a JOIN users b ON a.id = b.id"),
        EngineId::FederatedStore
    );
    assert_eq!(engine_for("SELECT * FROM users"), EngineId::EmbeddedStore);
    assert_eq!(engine_for("SELECT * FORM users"), EngineId::EmbeddedStore);
}

#[test]
fn test_writes_always_go_to_point_store() {
    let writes = [
        "INSERT INTO users (id, name) VALUES (1, 'Alice')",
        "INSERT INTO totals SELECT role, COUNT(*) FROM users GROUP BY role",
        "UPDATE users SET role = 'Admin' WHERE name = 'Alice'",
        "DELETE FROM users WHERE id IN \
         (SELECT user_id FROM orders o JOIN users u ON o.user_id = u.id)",
        "CREATE TABLE audit (id INT, note TEXT)",
        "ALTER TABLE users ADD COLUMN email TEXT",
        "DROP TABLE audit",
        "DROP TABLE audit, staging",
        "CREATE SEQUENCE order_seq",
        "CREATE ROLE analyst",
        "CREATE VIEW admins AS SELECT * FROM users WHERE role = 'Admin'",
        "DROP FUNCTION add",
        "WITH src AS (SELECT * FROM staging) INSERT INTO users SELECT * FROM src",
        "WITH totals AS (SELECT COUNT(*) AS n FROM users) \
         INSERT INTO audit SELECT n, 'count' FROM totals",
    ];
    for sql in writes {
        let dispatch = plan(&Classifier::default(), sql, None).unwrap();
        assert_eq!(dispatch.decision.engine, EngineId::PointStore, "{}", sql);
        assert_eq!(dispatch.decision.rule, RoutingRule::Write, "{}", sql);
    }
}

#[test]
fn test_selection_is_deterministic() {
    let statements = [
        "SELECT * FROM users WHERE id = 1",
        "SELECT role, COUNT(*) FROM users GROUP BY role",
        "SELECT u.name FROM users u, orders o WHERE u.id = o.user_id",
        "SELECT name FROM users WHERE role = 'Admin'",
        "SELECT * FORM users",
        "",
    ];
    let classifier = Classifier::default();
    for sql in statements {
        let first = plan(&classifier, sql, None).unwrap().decision;
        for _ in 0..5 {
            assert_eq!(plan(&classifier, sql, None).unwrap().decision, first, "{}", sql);
            assert_eq!(plan(&Classifier::default(), sql, None).unwrap().decision, first);
        }
    }
}

#[test]
fn test_configured_key_column() {
    let classifier = Classifier::default().with_key_column("orders", "order_id");
    let lookup = plan(&classifier, "SELECT * FROM orders WHERE order_id = 'A-1'", None).unwrap();
    assert_eq!(lookup.decision.engine, EngineId::PointStore);

    let scan = plan(&classifier, "SELECT * FROM orders WHERE id = 7", None).unwrap();
    assert_eq!(scan.decision.engine, EngineId::EmbeddedStore);
}

#[tokio::test]
async fn test_dispatch_reaches_only_the_selected_adapter() {
    let stubs = stubs();
    let router = ExecutionRouter::new(Classifier::default(), as_adapters(&stubs));

    let result = router.execute("SELECT COUNT(*) FROM users", None).await.unwrap();
    assert!(result.is_success());
    assert_eq!(result.engine(), EngineId::ColumnStore);

    for stub in &stubs {
        let expected = usize::from(stub.engine() == EngineId::ColumnStore);
        assert_eq!(stub.calls(), expected);
    }
}

#[tokio::test]
async fn test_force_engine_bypasses_selector() {
    let stubs = stubs();
    let router = ExecutionRouter::new(Classifier::default(), as_adapters(&stubs));

    let result = router
        .execute("SELECT * FROM users WHERE id = 1", Some("trino"))
        .await
        .unwrap();
    assert_eq!(result.engine(), EngineId::FederatedStore);

    let rejected = router.execute("SELECT 1", Some("oracle")).await;
    assert!(rejected.is_err());
    assert_eq!(stubs.iter().map(|s| s.calls()).sum::<usize>(), 1);
}

#[tokio::test]
async fn test_columns_match_every_row() {
    let stubs = stubs();
    let router = ExecutionRouter::new(Classifier::default(), as_adapters(&stubs));
    let result = router.execute("SELECT * FROM users", None).await.unwrap();

    assert_eq!(result.columns(), ["id", "name"]);
    for row in result.rows() {
        assert_eq!(row.len(), result.columns().len());
    }
}

