//! Result Normalizer - uniform envelope for every engine's native result
//!
//! Normalization never fails. A value that cannot be coerced to a wire-safe
//! JSON type becomes `null` and is logged.

use crate::error::{EngineError, EngineErrorKind};
use crate::execution::engine::{EngineId, NativePayload, NativeResult, NativeValue};
use polars::prelude::*;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorInfo {
    pub kind: EngineErrorKind,
    pub message: String,
}

/// Outcome of one request. Built once, read-only afterwards.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    rows: Vec<Map<String, Value>>,
    columns: Vec<String>,
    engine: EngineId,
    elapsed: Duration,
    error: Option<ErrorInfo>,
    degraded: bool,
    warnings: Vec<String>,
    rows_affected: Option<u64>,
}

impl ExecutionResult {
    /// Result for a request whose engine call failed.
    pub fn failed(err: EngineError, elapsed: Duration) -> Self {
        Self {
            rows: Vec::new(),
            columns: Vec::new(),
            engine: err.engine,
            elapsed,
            error: Some(ErrorInfo {
                kind: err.kind,
                message: err.message,
            }),
            degraded: false,
            warnings: Vec::new(),
            rows_affected: None,
        }
    }

    pub fn rows(&self) -> &[Map<String, Value>] {
        &self.rows
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn engine(&self) -> EngineId {
        self.engine
    }

    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    pub fn error(&self) -> Option<&ErrorInfo> {
        self.error.as_ref()
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn degraded(&self) -> bool {
        self.degraded
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn rows_affected(&self) -> Option<u64> {
        self.rows_affected
    }

    /// JSON body returned to HTTP and CLI callers.
    pub fn to_response(&self) -> Value {
        let mut body = Map::new();
        match &self.error {
            Some(error) => {
                body.insert("error".to_string(), Value::String(error.message.clone()));
                body.insert("error_kind".to_string(), Value::String(error.kind.to_string()));
            }
            None => {
                body.insert(
                    "data".to_string(),
                    Value::Array(self.rows.iter().cloned().map(Value::Object).collect()),
                );
                body.insert(
                    "columns".to_string(),
                    Value::Array(self.columns.iter().cloned().map(Value::String).collect()),
                );
            }
        }
        body.insert("engine".to_string(), Value::String(self.engine.to_string()));
        body.insert("duration".to_string(), seconds(self.elapsed));
        if self.degraded {
            body.insert("degraded".to_string(), Value::Bool(true));
        }
        if !self.warnings.is_empty() {
            body.insert(
                "warnings".to_string(),
                Value::Array(self.warnings.iter().cloned().map(Value::String).collect()),
            );
        }
        if let Some(count) = self.rows_affected {
            body.insert("rows_affected".to_string(), Value::from(count));
        }
        Value::Object(body)
    }
}

fn seconds(elapsed: Duration) -> Value {
    serde_json::Number::from_f64(elapsed.as_secs_f64())
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// Convert an adapter's native result into the response envelope.
pub fn normalize(native: NativeResult, engine: EngineId, elapsed: Duration) -> ExecutionResult {
    let (columns, rows, rows_affected) = match native.payload {
        NativePayload::Values { columns, rows } => {
            let columns = unique_column_names(columns);
            let rows = rows
                .into_iter()
                .map(|row| values_to_row(&columns, row, engine))
                .collect();
            (columns, rows, None)
        }
        NativePayload::Frame(df) => {
            let columns = unique_column_names(
                df.get_column_names().iter().map(|s| s.to_string()).collect(),
            );
            let rows = dataframe_rows(&df, &columns, engine);
            (columns, rows, None)
        }
        NativePayload::Affected(count) => (Vec::new(), Vec::new(), Some(count)),
    };

    ExecutionResult {
        rows,
        columns,
        engine,
        elapsed,
        error: None,
        degraded: native.degraded,
        warnings: native.warnings,
        rows_affected,
    }
}

/// Disambiguate repeated names (`id`, `id_2`, `id_3`) so every row
/// mapping carries exactly one entry per column.
pub fn unique_column_names(names: Vec<String>) -> Vec<String> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut unique = Vec::with_capacity(names.len());

    for name in names {
        let mut candidate = name.clone();
        let mut n = 2;
        while seen.contains(&candidate) {
            candidate = format!("{}_{}", name, n);
            n += 1;
        }
        seen.insert(candidate.clone());
        unique.push(candidate);
    }
    unique
}

fn values_to_row(
    columns: &[String],
    row: Vec<NativeValue>,
    engine: EngineId,
) -> Map<String, Value> {
    if row.len() != columns.len() {
        warn!(
            "{} returned a row with {} values for {} columns",
            engine,
            row.len(),
            columns.len()
        );
    }

    let mut values = row.into_iter();
    let mut out = Map::new();
    for column in columns {
        let value = match values.next() {
            Some(v) => coerce_or_null(&v, column, engine),
            None => Value::Null,
        };
        out.insert(column.clone(), value);
    }
    out
}

fn coerce_or_null(value: &NativeValue, column: &str, engine: EngineId) -> Value {
    match coerce_value(value) {
        Ok(v) => v,
        Err(reason) => {
            warn!("{}: column '{}' value replaced with null: {}", engine, column, reason);
            Value::Null
        }
    }
}

/// Coerce one native value into string, number, boolean, null or a nested
/// array/object.
pub fn coerce_value(value: &NativeValue) -> Result<Value, String> {
    Ok(match value {
        NativeValue::Null => Value::Null,
        NativeValue::Bool(b) => Value::Bool(*b),
        NativeValue::Int(i) => Value::from(*i),
        NativeValue::UInt(u) => Value::from(*u),
        NativeValue::Float(f) => float(*f)?,
        NativeValue::Decimal(s) | NativeValue::Text(s) => Value::String(s.clone()),
        NativeValue::Bytes(bytes) => match std::str::from_utf8(bytes) {
            Ok(s) => Value::String(s.to_string()),
            Err(_) => return Err(format!("{} bytes of non-UTF-8 binary", bytes.len())),
        },
        NativeValue::Date(d) => Value::String(d.format("%Y-%m-%d").to_string()),
        NativeValue::Time(t) => Value::String(t.format("%H:%M:%S%.f").to_string()),
        NativeValue::Timestamp(ts) => Value::String(ts.format("%Y-%m-%dT%H:%M:%S%.f").to_string()),
        NativeValue::TimestampTz(ts) => Value::String(ts.to_rfc3339()),
        NativeValue::Uuid(u) => Value::String(u.to_string()),
        NativeValue::Json(v) => v.clone(),
        NativeValue::List(items) => Value::Array(
            items
                .iter()
                .map(|item| coerce_value(item).unwrap_or(Value::Null))
                .collect(),
        ),
        NativeValue::Map(entries) => Value::Object(
            entries
                .iter()
                .map(|(k, v)| (k.clone(), coerce_value(v).unwrap_or(Value::Null)))
                .collect(),
        ),
        NativeValue::Unsupported(type_name) => {
            return Err(format!("unsupported type {}", type_name));
        }
    })
}

fn float(f: f64) -> Result<Value, String> {
    serde_json::Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| format!("non-finite float {}", f))
}

fn dataframe_rows(df: &DataFrame, columns: &[String], engine: EngineId) -> Vec<Map<String, Value>> {
    let series: Vec<&Series> = df.get_columns().iter().collect();
    let mut rows = Vec::with_capacity(df.height());

    for row_idx in 0..df.height() {
        let mut row = Map::new();
        for (column, s) in columns.iter().zip(series.iter()) {
            let value = match s.get(row_idx) {
                Ok(any) => any_value_to_json(&any).unwrap_or_else(|reason| {
                    warn!("{}: column '{}' value replaced with null: {}", engine, column, reason);
                    Value::Null
                }),
                Err(e) => {
                    warn!("{}: column '{}' row {} unreadable: {}", engine, column, row_idx, e);
                    Value::Null
                }
            };
            row.insert(column.clone(), value);
        }
        rows.push(row);
    }
    rows
}

fn any_value_to_json(value: &AnyValue) -> Result<Value, String> {
    Ok(match value {
        AnyValue::Null => Value::Null,
        AnyValue::Boolean(b) => Value::Bool(*b),
        AnyValue::String(s) => Value::String(s.to_string()),
        AnyValue::StringOwned(s) => Value::String(s.to_string()),
        AnyValue::Int8(i) => Value::from(*i),
        AnyValue::Int16(i) => Value::from(*i),
        AnyValue::Int32(i) => Value::from(*i),
        AnyValue::Int64(i) => Value::from(*i),
        AnyValue::UInt8(u) => Value::from(*u),
        AnyValue::UInt16(u) => Value::from(*u),
        AnyValue::UInt32(u) => Value::from(*u),
        AnyValue::UInt64(u) => Value::from(*u),
        AnyValue::Float32(f) => float(*f as f64)?,
        AnyValue::Float64(f) => float(*f)?,
        AnyValue::Date(days) => {
            let date = chrono::NaiveDate::from_ymd_opt(1970, 1, 1)
                .and_then(|epoch| epoch.checked_add_signed(chrono::Duration::days(*days as i64)))
                .ok_or_else(|| format!("date out of range: {}", days))?;
            Value::String(date.format("%Y-%m-%d").to_string())
        }
        AnyValue::Datetime(v, unit, _) => {
            let micros = match unit {
                TimeUnit::Nanoseconds => v / 1_000,
                TimeUnit::Microseconds => *v,
                TimeUnit::Milliseconds => v * 1_000,
            };
            let ts = chrono::DateTime::from_timestamp_micros(micros)
                .ok_or_else(|| format!("timestamp out of range: {}", v))?;
            Value::String(ts.naive_utc().format("%Y-%m-%dT%H:%M:%S%.f").to_string())
        }
        AnyValue::List(inner) => {
            let mut items = Vec::with_capacity(inner.len());
            for idx in 0..inner.len() {
                let item = inner
                    .get(idx)
                    .map_err(|e| e.to_string())
                    .and_then(|any| any_value_to_json(&any))
                    .unwrap_or(Value::Null);
                items.push(item);
            }
            Value::Array(items)
        }
        AnyValue::Binary(bytes) => std::str::from_utf8(bytes)
            .map(|s| Value::String(s.to_string()))
            .map_err(|_| format!("{} bytes of non-UTF-8 binary", bytes.len()))?,
        other => return Err(format!("unsupported value {}", other.dtype())),
    })
}
