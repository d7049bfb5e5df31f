//! PostgreSQL Execution Engine
//!
//! Transactional store for writes and key lookups. Statements run as-is,
//! with no table rewrite.

use crate::config::PostgresConfig;
use crate::error::{EngineError, EngineErrorKind};
use crate::execution::connection::{call_with_reconnect, ClientHandle};
use crate::execution::engine::{EngineAdapter, EngineId, NativeResult, NativeValue, QueryInput};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use sqlx::types::{Decimal, JsonValue, Uuid};
use sqlx::{Column, Executor, Row, Statement as _, TypeInfo, ValueRef};
use std::time::Duration;
use tracing::info;

const ENGINE: EngineId = EngineId::PointStore;

pub struct PostgresEngine {
    config: PostgresConfig,
    handle: ClientHandle<PgPool>,
}

impl PostgresEngine {
    pub fn new(config: PostgresConfig) -> Self {
        Self {
            config,
            handle: ClientHandle::new(ENGINE),
        }
    }

    async fn connect(&self) -> Result<PgPool, EngineError> {
        let pool = PgPoolOptions::new()
            .max_connections(self.config.max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(&self.config.url())
            .await
            .map_err(map_sqlx_error)?;
        info!(
            "Connected to PostgreSQL at {}:{}/{}",
            self.config.host, self.config.port, self.config.database
        );
        Ok(pool)
    }
}

async fn run(pool: &PgPool, sql: &str, write: bool) -> Result<NativeResult, EngineError> {
    if write {
        let done = sqlx::query(sql).execute(pool).await.map_err(map_sqlx_error)?;
        return Ok(NativeResult::affected(done.rows_affected()));
    }

    let rows = sqlx::query(sql).fetch_all(pool).await.map_err(map_sqlx_error)?;
    let columns: Vec<String> = match rows.first() {
        Some(row) => row.columns().iter().map(|c| c.name().to_string()).collect(),
        // no rows to read names from, describe the statement instead
        None => pool
            .prepare(sql)
            .await
            .map_err(map_sqlx_error)?
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect(),
    };

    let values = rows
        .iter()
        .map(|row| (0..row.len()).map(|idx| decode(row, idx)).collect())
        .collect();
    Ok(NativeResult::values(columns, values))
}

fn decode(row: &PgRow, idx: usize) -> NativeValue {
    let type_name = match row.try_get_raw(idx) {
        Ok(raw) if raw.is_null() => return NativeValue::Null,
        Ok(raw) => raw.type_info().name().to_string(),
        Err(e) => return NativeValue::Unsupported(e.to_string()),
    };

    let decoded = match type_name.as_str() {
        "BOOL" => row.try_get::<bool, _>(idx).map(NativeValue::Bool),
        "INT2" => row.try_get::<i16, _>(idx).map(|v| NativeValue::Int(v as i64)),
        "INT4" => row.try_get::<i32, _>(idx).map(|v| NativeValue::Int(v as i64)),
        "INT8" => row.try_get::<i64, _>(idx).map(NativeValue::Int),
        "OID" => row
            .try_get::<sqlx::postgres::types::Oid, _>(idx)
            .map(|v| NativeValue::UInt(v.0 as u64)),
        "FLOAT4" => row.try_get::<f32, _>(idx).map(|v| NativeValue::Float(v as f64)),
        "FLOAT8" => row.try_get::<f64, _>(idx).map(NativeValue::Float),
        "NUMERIC" => row
            .try_get::<Decimal, _>(idx)
            .map(|v| NativeValue::Decimal(v.to_string())),
        "TEXT" | "VARCHAR" | "BPCHAR" | "NAME" | "CITEXT" => {
            row.try_get::<String, _>(idx).map(NativeValue::Text)
        }
        "BYTEA" => row.try_get::<Vec<u8>, _>(idx).map(NativeValue::Bytes),
        "DATE" => row.try_get::<NaiveDate, _>(idx).map(NativeValue::Date),
        "TIME" => row.try_get::<NaiveTime, _>(idx).map(NativeValue::Time),
        "TIMESTAMP" => row.try_get::<NaiveDateTime, _>(idx).map(NativeValue::Timestamp),
        "TIMESTAMPTZ" => row.try_get::<DateTime<Utc>, _>(idx).map(NativeValue::TimestampTz),
        "UUID" => row.try_get::<Uuid, _>(idx).map(NativeValue::Uuid),
        "JSON" | "JSONB" => row.try_get::<JsonValue, _>(idx).map(NativeValue::Json),
        "INT4[]" => row.try_get::<Vec<i32>, _>(idx).map(|v| {
            NativeValue::List(v.into_iter().map(|i| NativeValue::Int(i as i64)).collect())
        }),
        "INT8[]" => row
            .try_get::<Vec<i64>, _>(idx)
            .map(|v| NativeValue::List(v.into_iter().map(NativeValue::Int).collect())),
        "TEXT[]" | "VARCHAR[]" => row
            .try_get::<Vec<String>, _>(idx)
            .map(|v| NativeValue::List(v.into_iter().map(NativeValue::Text).collect())),
        other => return NativeValue::Unsupported(other.to_string()),
    };

    decoded.unwrap_or_else(|e| NativeValue::Unsupported(format!("{}: {}", type_name, e)))
}

/// SQLSTATE classes decide the kind; anything below the protocol layer is
/// a dead connection.
pub(crate) fn map_sqlx_error(err: sqlx::Error) -> EngineError {
    let kind = match &err {
        sqlx::Error::Database(db) => sqlstate_kind(db.code().as_deref()),
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Configuration(_) => EngineErrorKind::ConnectionFailed,
        sqlx::Error::RowNotFound | sqlx::Error::ColumnNotFound(_) => {
            EngineErrorKind::ObjectNotFound
        }
        _ => EngineErrorKind::SyntaxError,
    };
    EngineError::new(ENGINE, kind, err.to_string())
}

fn sqlstate_kind(code: Option<&str>) -> EngineErrorKind {
    match code {
        Some("42601") => EngineErrorKind::SyntaxError,
        Some("42P01") | Some("42703") | Some("3F000") | Some("3D000") => {
            EngineErrorKind::ObjectNotFound
        }
        Some("57014") => EngineErrorKind::Timeout,
        Some(code) if code.starts_with("08") || code.starts_with("57P") => {
            EngineErrorKind::ConnectionFailed
        }
        _ => EngineErrorKind::SyntaxError,
    }
}

#[async_trait]
impl EngineAdapter for PostgresEngine {
    fn engine(&self) -> EngineId {
        ENGINE
    }

    async fn execute(&self, input: &QueryInput) -> Result<NativeResult, EngineError> {
        let write = input.is_write();
        call_with_reconnect(
            &self.handle,
            self.config.timeout,
            || self.connect(),
            |pool| {
                let sql = input.sql.clone();
                async move { run(&pool, &sql, write).await }
            },
        )
        .await
    }

    async fn health_check(&self) -> Result<bool, EngineError> {
        let pool = self.handle.get_or_create(|| self.connect()).await?;
        sqlx::query("SELECT 1")
            .execute(&*pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(true)
    }
}
