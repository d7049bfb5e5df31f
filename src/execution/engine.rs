//! Engine Adapter Trait - Uniform contract for every backend
//!
//! Each adapter owns its client lifecycle and returns its rows in a native
//! shape. The normalizer turns that shape into the response envelope.

use crate::classifier::{FeatureSet, Statement};
use crate::error::{ConfigurationError, EngineError};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use polars::prelude::DataFrame;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The four backends a statement can be routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EngineId {
    /// Transactional store for writes and key lookups (Postgres)
    #[serde(rename = "postgres")]
    PointStore,
    /// Columnar store for single-table aggregation (ClickHouse)
    #[serde(rename = "clickhouse")]
    ColumnStore,
    /// Distributed engine for joins (Trino)
    #[serde(rename = "trino")]
    FederatedStore,
    /// In-process engine, default and fallback (DuckDB)
    #[serde(rename = "duckdb")]
    EmbeddedStore,
}

impl EngineId {
    pub const ALL: [EngineId; 4] = [
        EngineId::PointStore,
        EngineId::ColumnStore,
        EngineId::FederatedStore,
        EngineId::EmbeddedStore,
    ];

    /// Wire name used in requests and responses
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineId::PointStore => "postgres",
            EngineId::ColumnStore => "clickhouse",
            EngineId::FederatedStore => "trino",
            EngineId::EmbeddedStore => "duckdb",
        }
    }
}

impl fmt::Display for EngineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineId {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" => Ok(EngineId::PointStore),
            "clickhouse" => Ok(EngineId::ColumnStore),
            "trino" => Ok(EngineId::FederatedStore),
            "duckdb" => Ok(EngineId::EmbeddedStore),
            _ => Err(ConfigurationError::UnknownEngine(s.to_string())),
        }
    }
}

/// What an adapter receives: the raw text plus, when it parsed, the tree
/// and the features the router already computed.
#[derive(Debug, Clone)]
pub struct QueryInput {
    pub sql: String,
    pub statement: Option<Statement>,
    pub features: Option<FeatureSet>,
}

impl QueryInput {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            statement: None,
            features: None,
        }
    }

    pub fn parsed(statement: Statement, features: FeatureSet) -> Self {
        Self {
            sql: statement.sql().to_string(),
            statement: Some(statement),
            features: Some(features),
        }
    }

    pub fn is_write(&self) -> bool {
        self.features.as_ref().map(|f| f.is_write).unwrap_or(false)
    }

    pub fn referenced_tables(&self) -> &[String] {
        self.features
            .as_ref()
            .map(|f| f.referenced_tables.as_slice())
            .unwrap_or(&[])
    }
}

/// A single value as the native client handed it over.
#[derive(Debug, Clone, PartialEq)]
pub enum NativeValue {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    /// Arbitrary precision number kept as text
    Decimal(String),
    Text(String),
    Bytes(Vec<u8>),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
    Uuid(uuid::Uuid),
    Json(serde_json::Value),
    List(Vec<NativeValue>),
    Map(Vec<(String, NativeValue)>),
    /// Type the adapter has no decoding for; carries the type name
    Unsupported(String),
}

impl NativeValue {
    /// Decode a value from an engine that speaks JSON on the wire
    /// (ClickHouse JSONCompact, Trino REST). `type_name` is the engine's
    /// column type and only matters for decimals sent as strings.
    pub fn from_json(value: serde_json::Value, type_name: &str) -> Self {
        use serde_json::Value;

        match value {
            Value::Null => NativeValue::Null,
            Value::Bool(b) => NativeValue::Bool(b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    NativeValue::Int(i)
                } else if let Some(u) = n.as_u64() {
                    NativeValue::UInt(u)
                } else {
                    n.as_f64().map(NativeValue::Float).unwrap_or(NativeValue::Null)
                }
            }
            Value::String(s) => {
                if type_name.to_ascii_lowercase().starts_with("decimal") {
                    NativeValue::Decimal(s)
                } else {
                    NativeValue::Text(s)
                }
            }
            Value::Array(items) => NativeValue::List(
                items
                    .into_iter()
                    .map(|v| NativeValue::from_json(v, ""))
                    .collect(),
            ),
            Value::Object(map) => NativeValue::Map(
                map.into_iter()
                    .map(|(k, v)| (k, NativeValue::from_json(v, "")))
                    .collect(),
            ),
        }
    }
}

/// Native result shapes the adapters produce.
#[derive(Debug, Clone)]
pub enum NativePayload {
    /// Column names plus row-major values
    Values {
        columns: Vec<String>,
        rows: Vec<Vec<NativeValue>>,
    },
    /// A polars frame (degraded local execution)
    Frame(DataFrame),
    /// A statement that returned no rows, with its affected-row count
    Affected(u64),
}

#[derive(Debug, Clone)]
pub struct NativeResult {
    pub payload: NativePayload,
    /// Served from a local materialized copy instead of remote storage
    pub degraded: bool,
    pub warnings: Vec<String>,
}

impl NativeResult {
    pub fn values(columns: Vec<String>, rows: Vec<Vec<NativeValue>>) -> Self {
        Self {
            payload: NativePayload::Values { columns, rows },
            degraded: false,
            warnings: Vec::new(),
        }
    }

    pub fn affected(count: u64) -> Self {
        Self {
            payload: NativePayload::Affected(count),
            degraded: false,
            warnings: Vec::new(),
        }
    }

    pub fn frame(df: DataFrame) -> Self {
        Self {
            payload: NativePayload::Frame(df),
            degraded: false,
            warnings: Vec::new(),
        }
    }
}

/// Engine adapter trait - all backends implement this
///
/// Implementations must tolerate concurrent calls. Either the native
/// client is safe to share, or access is serialized for the duration of
/// the native call only.
#[async_trait]
pub trait EngineAdapter: Send + Sync {
    /// Which backend this adapter talks to
    fn engine(&self) -> EngineId;

    /// Execute one statement. Native client errors are always wrapped.
    async fn execute(&self, input: &QueryInput) -> Result<NativeResult, EngineError>;

    /// Cheap liveness probe against the backend
    async fn health_check(&self) -> Result<bool, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_id_parses_case_insensitively() {
        assert_eq!("DuckDB".parse::<EngineId>().unwrap(), EngineId::EmbeddedStore);
        assert_eq!(" trino ".parse::<EngineId>().unwrap(), EngineId::FederatedStore);
        assert_eq!(
            "mysql".parse::<EngineId>(),
            Err(ConfigurationError::UnknownEngine("mysql".to_string()))
        );
    }

    #[test]
    fn test_engine_id_round_trips_wire_name() {
        for engine in EngineId::ALL {
            assert_eq!(engine.as_str().parse::<EngineId>().unwrap(), engine);
            let json = serde_json::to_string(&engine).unwrap();
            assert_eq!(json, format!("\"{}\"", engine.as_str()));
        }
    }

    #[test]
    fn test_from_json_keeps_decimal_text() {
        let value = NativeValue::from_json(serde_json::json!("12.50"), "decimal(10,2)");
        assert_eq!(value, NativeValue::Decimal("12.50".to_string()));

        let value = NativeValue::from_json(serde_json::json!("12.50"), "varchar");
        assert_eq!(value, NativeValue::Text("12.50".to_string()));
    }

    #[test]
    fn test_from_json_nested() {
        let value = NativeValue::from_json(serde_json::json!({"a": [1, null]}), "JSON");
        assert_eq!(
            value,
            NativeValue::Map(vec![(
                "a".to_string(),
                NativeValue::List(vec![NativeValue::Int(1), NativeValue::Null])
            )])
        );
    }
}
