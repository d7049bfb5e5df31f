//! Fallback Controller - local materialized copies for the embedded engine
//!
//! When the embedded engine cannot reach object storage, the statement is
//! re-run once against a local copy of the failing table, if one exists.
//! The degraded state lasts for a single request; the next request goes to
//! remote storage first again.

use crate::classifier::base_table_name;
use crate::error::{EngineError, EngineErrorKind, Result, RouterError};
use crate::execution::engine::{EngineAdapter, EngineId, NativeResult, QueryInput};
use async_trait::async_trait;
use dashmap::DashMap;
use polars::prelude::*;
use polars::sql::SQLContext;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

pub const DEFAULT_MAX_ROWS: usize = 100_000;

/// Advisory table name -> rows cache. May be stale, never authoritative,
/// only read after a storage failure.
pub struct FallbackState {
    tables: DashMap<String, DataFrame>,
    max_rows: usize,
}

impl Default for FallbackState {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ROWS)
    }
}

impl FallbackState {
    pub fn new(max_rows: usize) -> Self {
        Self {
            tables: DashMap::new(),
            max_rows,
        }
    }

    pub fn max_rows(&self) -> usize {
        self.max_rows
    }

    /// Store a copy of `table`, truncated to the row bound.
    pub fn materialize(&self, table: &str, df: DataFrame) {
        let df = if df.height() > self.max_rows {
            df.head(Some(self.max_rows))
        } else {
            df
        };
        info!("Materialized local copy of '{}' ({} rows)", table, df.height());
        self.tables.insert(base_table_name(table), df);
    }

    /// Store rows given as JSON values, one inner vector per row.
    pub fn materialize_rows(
        &self,
        table: &str,
        columns: &[String],
        rows: Vec<Vec<serde_json::Value>>,
    ) -> Result<()> {
        let df = if rows.is_empty() {
            let series: Vec<Series> = columns
                .iter()
                .map(|name| Series::new_empty(name, &DataType::String))
                .collect();
            DataFrame::new(series)?
        } else {
            let records: Vec<serde_json::Value> = rows
                .into_iter()
                .map(|row| {
                    serde_json::Value::Object(columns.iter().cloned().zip(row).collect())
                })
                .collect();
            let bytes = serde_json::to_vec(&records)?;
            JsonReader::new(Cursor::new(bytes)).finish()?
        };
        self.materialize(table, df);
        Ok(())
    }

    pub fn get(&self, table: &str) -> Option<DataFrame> {
        self.tables
            .get(&base_table_name(table))
            .map(|entry| entry.value().clone())
    }

    pub fn contains(&self, table: &str) -> bool {
        self.tables.contains_key(&base_table_name(table))
    }

    pub fn evict(&self, table: &str) -> bool {
        self.tables.remove(&base_table_name(table)).is_some()
    }

    /// Names of every materialized table, sorted.
    pub fn tables(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Seed copies from `<table>.csv` and `<table>.parquet` files in `dir`.
    /// Returns how many tables were loaded.
    pub fn load_dir(&self, dir: &Path) -> Result<usize> {
        let mut loaded = 0;
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let Some(table) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string)
            else {
                continue;
            };
            let limit = self.max_rows as IdxSize;

            let df = match path.extension().and_then(|e| e.to_str()) {
                Some("csv") => LazyCsvReader::new(&path)
                    .with_has_header(true)
                    .finish()?
                    .limit(limit)
                    .collect(),
                Some("parquet") => LazyFrame::scan_parquet(&path, ScanArgsParquet::default())?
                    .limit(limit)
                    .collect(),
                _ => continue,
            };

            match df {
                Ok(df) => {
                    self.materialize(&table, df);
                    loaded += 1;
                }
                Err(e) => warn!("Skipping fallback file {}: {}", path.display(), e),
            }
        }
        Ok(loaded)
    }
}

/// Per-request state of the embedded path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackMode {
    Normal,
    /// Remote read of this table failed
    Degraded(String),
}

/// Wraps the embedded adapter. Only `StorageUnavailable` is recovered;
/// every other outcome passes through untouched.
pub struct FallbackController {
    inner: Arc<dyn EngineAdapter>,
    state: Arc<FallbackState>,
}

impl FallbackController {
    pub fn new(inner: Arc<dyn EngineAdapter>, state: Arc<FallbackState>) -> Self {
        Self { inner, state }
    }

    pub fn state(&self) -> &Arc<FallbackState> {
        &self.state
    }

    /// Mode the request enters after `err`.
    pub fn transition(err: &EngineError, input: &QueryInput) -> FallbackMode {
        if err.kind != EngineErrorKind::StorageUnavailable || input.is_write() {
            return FallbackMode::Normal;
        }
        match failing_table(&err.message, input.referenced_tables()) {
            Some(table) => FallbackMode::Degraded(table),
            None => FallbackMode::Normal,
        }
    }

    async fn degrade(
        &self,
        input: &QueryInput,
        table: String,
        err: EngineError,
    ) -> std::result::Result<NativeResult, EngineError> {
        if !self.state.contains(&table) {
            warn!("Storage unavailable for '{}' and no local copy exists", table);
            return Err(err);
        }
        warn!("Storage unavailable for '{}', serving local copy: {}", table, err.message);

        let frames: Vec<(String, DataFrame)> = input
            .referenced_tables()
            .iter()
            .filter_map(|name| self.state.get(name).map(|df| (name.clone(), df)))
            .collect();
        let sql = input.sql.clone();

        let local = tokio::task::spawn_blocking(move || run_local(&sql, frames)).await;
        match local {
            Ok(Ok(df)) => {
                let mut result = NativeResult::frame(df);
                result.degraded = true;
                result.warnings.push(format!(
                    "remote storage unavailable for '{}'; served from local copy",
                    table
                ));
                Ok(result)
            }
            Ok(Err(local_err)) => {
                warn!("Local re-execution for '{}' failed: {}", table, local_err);
                Err(err)
            }
            Err(join_err) => {
                warn!("Local re-execution for '{}' panicked: {}", table, join_err);
                Err(err)
            }
        }
    }
}

/// The referenced table whose storage path shows up in the error, else the
/// first referenced table.
fn failing_table(message: &str, tables: &[String]) -> Option<String> {
    tables
        .iter()
        .find(|t| message.contains(&format!("/{}/", base_table_name(t))))
        .or_else(|| tables.first())
        .cloned()
}

fn run_local(sql: &str, frames: Vec<(String, DataFrame)>) -> Result<DataFrame> {
    let mut ctx = SQLContext::new();
    for (name, df) in frames {
        let base = base_table_name(&name);
        if base != name {
            ctx.register(&name, df.clone().lazy());
        }
        ctx.register(&base, df.lazy());
    }
    ctx.execute(sql)?.collect().map_err(RouterError::from)
}

#[async_trait]
impl EngineAdapter for FallbackController {
    fn engine(&self) -> EngineId {
        self.inner.engine()
    }

    async fn execute(&self, input: &QueryInput) -> std::result::Result<NativeResult, EngineError> {
        match self.inner.execute(input).await {
            Err(err) => match Self::transition(&err, input) {
                FallbackMode::Degraded(table) => self.degrade(input, table, err).await,
                FallbackMode::Normal => Err(err),
            },
            ok => ok,
        }
    }

    async fn health_check(&self) -> std::result::Result<bool, EngineError> {
        self.inner.health_check().await
    }
}
