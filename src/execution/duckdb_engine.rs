//! DuckDB Execution Engine
//!
//! In-process engine that reads lake tables straight from object storage
//! with `read_parquet`. It is the default for plain scans and for anything
//! the classifier could not parse. Successful local writes refresh the
//! fallback copy of the written table.

use crate::config::DuckDbConfig;
use crate::error::{EngineError, EngineErrorKind};
use crate::execution::connection::{call_with_reconnect, ClientHandle};
use crate::execution::engine::{
    EngineAdapter, EngineId, NativePayload, NativeResult, NativeValue, QueryInput,
};
use crate::execution::fallback::FallbackState;
use crate::execution::result::coerce_value;
use crate::execution::rewrite::{StorageLayout, TableRewriter};
use async_trait::async_trait;
use duckdb::types::{TimeUnit, Value};
use duckdb::{Connection, InterruptHandle};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

const ENGINE: EngineId = EngineId::EmbeddedStore;

pub struct DuckDbEngine {
    config: DuckDbConfig,
    rewriter: TableRewriter,
    handle: ClientHandle<DuckDbClient>,
    fallback: Arc<FallbackState>,
}

/// The single connection plus a handle that can cancel whatever it is
/// running without taking the lock.
struct DuckDbClient {
    conn: Mutex<Connection>,
    interrupt: Arc<InterruptHandle>,
}

impl DuckDbClient {
    fn new(conn: Connection) -> Self {
        Self {
            interrupt: conn.interrupt_handle(),
            conn: Mutex::new(conn),
        }
    }
}

/// Interrupts the running statement if dropped before `disarm`, which is
/// what happens when the call times out.
struct InterruptOnDrop {
    handle: Option<Arc<InterruptHandle>>,
}

impl InterruptOnDrop {
    fn disarm(mut self) {
        self.handle = None;
    }
}

impl Drop for InterruptOnDrop {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            warn!("Interrupting DuckDB statement after timeout");
            handle.interrupt();
        }
    }
}

/// How the fallback copy should change after a write.
#[derive(Debug, Clone)]
enum SnapshotPlan {
    Refresh(String),
    Evict(Vec<String>),
}

/// What a write did to its tables, captured under the connection lock.
enum TableSnapshot {
    Rows {
        table: String,
        columns: Vec<String>,
        rows: Vec<Vec<NativeValue>>,
    },
    Dropped(Vec<String>),
}

impl DuckDbEngine {
    pub fn new(
        config: DuckDbConfig,
        rewriter: TableRewriter,
        fallback: Arc<FallbackState>,
    ) -> Self {
        Self {
            config,
            rewriter,
            handle: ClientHandle::new(ENGINE),
            fallback,
        }
    }

    async fn connect(&self) -> Result<DuckDbClient, EngineError> {
        let config = self.config.clone();
        let layout = self.rewriter.layout().clone();
        tokio::task::spawn_blocking(move || open(&config, &layout).map(DuckDbClient::new))
            .await
            .map_err(|e| EngineError::connection_failed(ENGINE, e.to_string()))?
    }

    fn apply_snapshot(&self, snapshot: TableSnapshot) {
        match snapshot {
            TableSnapshot::Dropped(tables) => {
                for table in tables {
                    if self.fallback.evict(&table) {
                        info!("Dropped local copy of '{}'", table);
                    }
                }
            }
            TableSnapshot::Rows {
                table,
                columns,
                rows,
            } => {
                let rows = rows
                    .iter()
                    .map(|row| {
                        row.iter()
                            .map(|v| coerce_value(v).unwrap_or(serde_json::Value::Null))
                            .collect()
                    })
                    .collect();
                if let Err(e) = self.fallback.materialize_rows(&table, &columns, rows) {
                    warn!("Could not refresh local copy of '{}': {}", table, e);
                }
            }
        }
    }
}

fn open(config: &DuckDbConfig, layout: &StorageLayout) -> Result<Connection, EngineError> {
    let conn = if config.path == ":memory:" {
        Connection::open_in_memory()
    } else {
        Connection::open(&config.path)
    }
    .map_err(|e| EngineError::connection_failed(ENGINE, e.to_string()))?;

    if config.install_extensions {
        if let Err(e) = conn.execute_batch("INSTALL httpfs; LOAD httpfs;") {
            warn!("DuckDB httpfs setup failed, remote reads will fail: {}", e);
        }
        let secret = format!(
            "CREATE OR REPLACE SECRET lake (TYPE S3, KEY_ID '{}', SECRET '{}', ENDPOINT '{}', \
             REGION '{}', URL_STYLE 'path', USE_SSL {})",
            layout.access_key,
            layout.secret_key,
            layout.endpoint_authority(),
            layout.region,
            layout.uses_ssl()
        );
        if let Err(e) = conn.execute_batch(&secret) {
            warn!("DuckDB S3 secret setup failed: {}", e);
        }
    } else if let Err(e) = conn.execute_batch(
        "SET autoinstall_known_extensions = false; SET autoload_known_extensions = false;",
    ) {
        warn!("Could not disable DuckDB extension autoloading: {}", e);
    }

    info!("DuckDB connection opened ({})", config.path);
    Ok(conn)
}

fn run_statement(
    client: &DuckDbClient,
    sql: &str,
    write: bool,
    plan: Option<SnapshotPlan>,
    max_rows: usize,
) -> Result<(NativeResult, Option<TableSnapshot>), EngineError> {
    let conn = client
        .conn
        .lock()
        .map_err(|_| EngineError::connection_failed(ENGINE, "connection lock poisoned"))?;

    let result = if write {
        let count = conn.execute(sql, []).map_err(map_duckdb_error)?;
        NativeResult::affected(count as u64)
    } else {
        query_values(&conn, sql)?
    };

    let snapshot = match plan {
        Some(SnapshotPlan::Evict(tables)) => Some(TableSnapshot::Dropped(tables)),
        Some(SnapshotPlan::Refresh(table)) => {
            let select = format!("SELECT * FROM {} LIMIT {}", table, max_rows);
            match query_values(&conn, &select) {
                Ok(NativeResult {
                    payload: NativePayload::Values { columns, rows },
                    ..
                }) => Some(TableSnapshot::Rows {
                    table,
                    columns,
                    rows,
                }),
                Ok(_) => None,
                Err(e) => {
                    warn!("Could not snapshot '{}' after write: {}", table, e.message);
                    None
                }
            }
        }
        None => None,
    };

    Ok((result, snapshot))
}

fn query_values(conn: &Connection, sql: &str) -> Result<NativeResult, EngineError> {
    let mut stmt = conn.prepare(sql).map_err(map_duckdb_error)?;
    let mut rows = stmt.query([]).map_err(map_duckdb_error)?;

    let mut out = Vec::new();
    while let Some(row) = rows.next().map_err(map_duckdb_error)? {
        let width = row.as_ref().column_count();
        let mut values = Vec::with_capacity(width);
        for i in 0..width {
            values.push(match row.get::<_, Value>(i) {
                Ok(value) => native_value(value),
                Err(e) => NativeValue::Unsupported(e.to_string()),
            });
        }
        out.push(values);
    }
    drop(rows);

    Ok(NativeResult::values(stmt.column_names(), out))
}

/// `None` when the value does not fit in microseconds (`infinity`, far
/// future timestamps at second precision).
fn micros(unit: TimeUnit, value: i64) -> Option<i64> {
    match unit {
        TimeUnit::Second => value.checked_mul(1_000_000),
        TimeUnit::Millisecond => value.checked_mul(1_000),
        TimeUnit::Microsecond => Some(value),
        TimeUnit::Nanosecond => Some(value / 1_000),
    }
}

fn native_value(value: Value) -> NativeValue {
    match value {
        Value::Null => NativeValue::Null,
        Value::Boolean(b) => NativeValue::Bool(b),
        Value::TinyInt(i) => NativeValue::Int(i as i64),
        Value::SmallInt(i) => NativeValue::Int(i as i64),
        Value::Int(i) => NativeValue::Int(i as i64),
        Value::BigInt(i) => NativeValue::Int(i),
        Value::HugeInt(i) => i64::try_from(i)
            .map(NativeValue::Int)
            .unwrap_or_else(|_| NativeValue::Decimal(i.to_string())),
        Value::UTinyInt(u) => NativeValue::Int(u as i64),
        Value::USmallInt(u) => NativeValue::Int(u as i64),
        Value::UInt(u) => NativeValue::Int(u as i64),
        Value::UBigInt(u) => NativeValue::UInt(u),
        Value::Float(f) => NativeValue::Float(f as f64),
        Value::Double(f) => NativeValue::Float(f),
        Value::Decimal(d) => NativeValue::Decimal(d.to_string()),
        Value::Text(s) => NativeValue::Text(s),
        Value::Blob(b) => NativeValue::Bytes(b),
        Value::Date32(days) => chrono::NaiveDate::from_ymd_opt(1970, 1, 1)
            .and_then(|epoch| epoch.checked_add_signed(chrono::Duration::days(days as i64)))
            .map(NativeValue::Date)
            .unwrap_or_else(|| NativeValue::Unsupported(format!("DATE {}", days))),
        Value::Timestamp(unit, v) => micros(unit, v)
            .and_then(chrono::DateTime::from_timestamp_micros)
            .map(|ts| NativeValue::Timestamp(ts.naive_utc()))
            .unwrap_or_else(|| NativeValue::Unsupported(format!("TIMESTAMP {}", v))),
        Value::Time64(unit, v) => micros(unit, v)
            .filter(|us| *us >= 0)
            .and_then(|us| {
                chrono::NaiveTime::from_num_seconds_from_midnight_opt(
                    u32::try_from(us / 1_000_000).ok()?,
                    u32::try_from((us % 1_000_000) * 1_000).ok()?,
                )
            })
            .map(NativeValue::Time)
            .unwrap_or_else(|| NativeValue::Unsupported(format!("TIME {}", v))),
        Value::List(items) => NativeValue::List(items.into_iter().map(native_value).collect()),
        other => NativeValue::Unsupported(format!("{:?}", other)),
    }
}

fn map_duckdb_error(err: duckdb::Error) -> EngineError {
    let message = err.to_string();
    EngineError::new(ENGINE, duckdb_error_kind(&message), message)
}

/// DuckDB reports failures as `<Kind> Error: ...` strings.
pub(crate) fn duckdb_error_kind(message: &str) -> EngineErrorKind {
    let storage_markers = ["IO Error", "HTTP", "httpfs", "Missing Extension", "s3://"];
    if storage_markers.iter().any(|m| message.contains(m)) {
        EngineErrorKind::StorageUnavailable
    } else if message.contains("Catalog Error") {
        EngineErrorKind::ObjectNotFound
    } else if message.contains("INTERRUPT") || message.contains("Interrupted") {
        EngineErrorKind::Timeout
    } else if message.contains("Connection Error") {
        EngineErrorKind::ConnectionFailed
    } else {
        EngineErrorKind::SyntaxError
    }
}

#[async_trait]
impl EngineAdapter for DuckDbEngine {
    fn engine(&self) -> EngineId {
        ENGINE
    }

    async fn execute(&self, input: &QueryInput) -> Result<NativeResult, EngineError> {
        let sql = match &input.statement {
            Some(statement) => self.rewriter.rewrite(statement),
            None => input.sql.clone(),
        };
        let write = input.is_write();
        let plan = match &input.statement {
            Some(statement) if write => {
                let dropped = statement.dropped_tables();
                if dropped.is_empty() {
                    statement.write_target().map(SnapshotPlan::Refresh)
                } else {
                    Some(SnapshotPlan::Evict(dropped))
                }
            }
            _ => None,
        };
        let max_rows = self.fallback.max_rows();

        let (result, snapshot) = call_with_reconnect(
            &self.handle,
            self.config.timeout,
            || self.connect(),
            |client| {
                let sql = sql.clone();
                let plan = plan.clone();
                async move {
                    let guard = InterruptOnDrop {
                        handle: Some(Arc::clone(&client.interrupt)),
                    };
                    let outcome = tokio::task::spawn_blocking(move || {
                        run_statement(&client, &sql, write, plan, max_rows)
                    })
                    .await;
                    guard.disarm();
                    outcome.map_err(|e| EngineError::connection_failed(ENGINE, e.to_string()))?
                }
            },
        )
        .await?;

        if let Some(snapshot) = snapshot {
            self.apply_snapshot(snapshot);
        }
        Ok(result)
    }

    async fn health_check(&self) -> Result<bool, EngineError> {
        let client = self.handle.get_or_create(|| self.connect()).await?;
        tokio::task::spawn_blocking(move || {
            let conn = client
                .conn
                .lock()
                .map_err(|_| EngineError::connection_failed(ENGINE, "connection lock poisoned"))?;
            conn.execute_batch("SELECT 1").map_err(map_duckdb_error)?;
            Ok(true)
        })
        .await
        .map_err(|e| EngineError::connection_failed(ENGINE, e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::Classifier;
    use crate::execution::rewrite::RewriteTarget;
    use std::time::Duration;

    fn engine(fallback: Arc<FallbackState>) -> DuckDbEngine {
        engine_with_timeout(fallback, Duration::from_secs(30))
    }

    fn engine_with_timeout(fallback: Arc<FallbackState>, timeout: Duration) -> DuckDbEngine {
        let config = DuckDbConfig {
            path: ":memory:".to_string(),
            timeout,
            install_extensions: false,
        };
        let rewriter = TableRewriter::new(StorageLayout::default(), RewriteTarget::ParquetScan)
            .with_lake_tables(["events"]);
        DuckDbEngine::new(config, rewriter, fallback)
    }

    fn input(sql: &str) -> QueryInput {
        let classifier = Classifier::default();
        match classifier.parse(sql) {
            Ok(statement) => {
                let features = classifier.features(&statement);
                QueryInput::parsed(statement, features)
            }
            Err(_) => QueryInput::new(sql),
        }
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            duckdb_error_kind("Parser Error: syntax error at or near \"users\""),
            EngineErrorKind::SyntaxError
        );
        assert_eq!(
            duckdb_error_kind("Catalog Error: Table with name users does not exist!"),
            EngineErrorKind::ObjectNotFound
        );
        assert_eq!(
            duckdb_error_kind(
                "IO Error: No files found that match the pattern \"s3://lake-data/data/users/*\""
            ),
            EngineErrorKind::StorageUnavailable
        );
        assert_eq!(
            duckdb_error_kind(
                "HTTP Error: Unable to connect to URL \"http://minio:9000/lake-data\""
            ),
            EngineErrorKind::StorageUnavailable
        );
        assert_eq!(duckdb_error_kind("INTERRUPT Error: Interrupted!"), EngineErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_malformed_sql_is_syntax_error() {
        let engine = engine(Arc::new(FallbackState::default()));
        let err = engine.execute(&input("SELECT * FORM users")).await.unwrap_err();
        assert_eq!(err.kind, EngineErrorKind::SyntaxError);
        assert_eq!(err.engine, EngineId::EmbeddedStore);
    }

    #[tokio::test]
    async fn test_local_writes_refresh_fallback_copy() {
        let fallback = Arc::new(FallbackState::default());
        let engine = engine(Arc::clone(&fallback));

        engine
            .execute(&input("CREATE TABLE users (id INTEGER, name VARCHAR, role VARCHAR)"))
            .await
            .unwrap();
        assert_eq!(fallback.get("users").unwrap().height(), 0);

        let result = engine
            .execute(&input(
                "INSERT INTO users VALUES (1, 'Local Alice', 'Admin'), (2, 'Local Bob', 'User')",
            ))
            .await
            .unwrap();
        assert!(matches!(result.payload, NativePayload::Affected(2)));
        assert_eq!(fallback.get("users").unwrap().height(), 2);

        engine.execute(&input("DROP TABLE users")).await.unwrap();
        assert!(!fallback.contains("users"));
    }

    #[tokio::test]
    async fn test_drop_of_several_tables_evicts_each_copy() {
        let fallback = Arc::new(FallbackState::default());
        let engine = engine(Arc::clone(&fallback));

        for table in ["users", "orders"] {
            engine
                .execute(&input(&format!("CREATE TABLE {} (id INTEGER)", table)))
                .await
                .unwrap();
            engine
                .execute(&input(&format!("INSERT INTO {} VALUES (1)", table)))
                .await
                .unwrap();
        }
        assert!(fallback.contains("users") && fallback.contains("orders"));

        engine.execute(&input("DROP TABLE users, orders")).await.unwrap();
        assert!(!fallback.contains("users"));
        assert!(!fallback.contains("orders"));
    }

    #[test]
    fn test_out_of_range_timestamps_are_unsupported() {
        assert_eq!(micros(TimeUnit::Second, i64::MAX), None);
        assert_eq!(micros(TimeUnit::Millisecond, i64::MIN), None);
        assert_eq!(micros(TimeUnit::Second, 2), Some(2_000_000));

        assert!(matches!(
            native_value(Value::Timestamp(TimeUnit::Second, i64::MAX)),
            NativeValue::Unsupported(_)
        ));
        assert!(matches!(
            native_value(Value::Timestamp(TimeUnit::Second, 86_400)),
            NativeValue::Timestamp(_)
        ));
    }

    #[tokio::test]
    async fn test_timeout_interrupts_running_statement() {
        let engine = engine_with_timeout(
            Arc::new(FallbackState::default()),
            Duration::from_millis(500),
        );

        let err = engine
            .execute(&input(
                "SELECT count(*) FROM range(1000000) a, range(1000000) b \
                 WHERE (a.range * b.range) % 7 = 13",
            ))
            .await
            .unwrap_err();
        assert_eq!(err.kind, EngineErrorKind::Timeout);

        // the interrupted statement releases the connection for the next call
        let result = engine.execute(&input("SELECT 42 AS answer")).await.unwrap();
        match result.payload {
            NativePayload::Values { rows, .. } => {
                assert_eq!(rows, vec![vec![NativeValue::Int(42)]])
            }
            other => panic!("expected rows, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reads_local_tables_outside_the_lake() {
        let engine = engine(Arc::new(FallbackState::default()));
        engine
            .execute(&input("CREATE TABLE roles (name VARCHAR, level INTEGER)"))
            .await
            .unwrap();
        engine
            .execute(&input("INSERT INTO roles VALUES ('Admin', 1)"))
            .await
            .unwrap();

        let result = engine
            .execute(&input("SELECT name, level FROM roles"))
            .await
            .unwrap();
        match result.payload {
            NativePayload::Values { columns, rows } => {
                assert_eq!(columns, vec!["name".to_string(), "level".to_string()]);
                assert_eq!(
                    rows,
                    vec![vec![NativeValue::Text("Admin".to_string()), NativeValue::Int(1)]]
                );
            }
            other => panic!("expected rows, got {:?}", other),
        }
        assert!(engine.health_check().await.unwrap());
    }
}
