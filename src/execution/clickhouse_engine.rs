//! ClickHouse Execution Engine
//!
//! Columnar store for single-table aggregation. Talks to the HTTP
//! interface and reads lake tables through the `s3()` table function.

use crate::config::ClickHouseConfig;
use crate::error::{EngineError, EngineErrorKind};
use crate::execution::connection::{call_with_reconnect, ClientHandle};
use crate::execution::engine::{EngineAdapter, EngineId, NativeResult, NativeValue, QueryInput};
use crate::execution::rewrite::TableRewriter;
use async_trait::async_trait;
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::debug;

const ENGINE: EngineId = EngineId::ColumnStore;

pub struct ClickHouseEngine {
    config: ClickHouseConfig,
    rewriter: TableRewriter,
    handle: ClientHandle<Client>,
}

// JSONCompact: {"meta": [{"name", "type"}], "data": [[...]], "rows": n, ...}
#[derive(Debug, Deserialize)]
struct ClickHouseResponse {
    meta: Vec<ClickHouseColumn>,
    data: Vec<Vec<serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
struct ClickHouseColumn {
    name: String,
    #[serde(rename = "type")]
    column_type: String,
}

impl ClickHouseEngine {
    pub fn new(config: ClickHouseConfig, rewriter: TableRewriter) -> Self {
        Self {
            config,
            rewriter,
            handle: ClientHandle::new(ENGINE),
        }
    }

    async fn connect(&self) -> Result<Client, EngineError> {
        Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .map_err(|e| EngineError::connection_failed(ENGINE, e.to_string()))
    }

    async fn post(&self, client: &Client, sql: String) -> Result<NativeResult, EngineError> {
        let url = format!("{}/", self.config.url.trim_end_matches('/'));
        let response = client
            .post(&url)
            .query(&[
                ("database", self.config.database.as_str()),
                ("default_format", "JSONCompact"),
                ("output_format_json_quote_64bit_integers", "0"),
            ])
            .header("X-ClickHouse-User", &self.config.user)
            .header("X-ClickHouse-Key", &self.config.password)
            .body(sql)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        let summary = response
            .headers()
            .get("X-ClickHouse-Summary")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let exception_code = response
            .headers()
            .get("X-ClickHouse-Exception-Code")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u32>().ok());
        let body = response.text().await.map_err(map_reqwest_error)?;

        if !status.is_success() {
            let code = exception_code.or_else(|| exception_code_from_body(&body));
            return Err(EngineError::new(
                ENGINE,
                code.map(clickhouse_error_kind)
                    .unwrap_or(EngineErrorKind::SyntaxError),
                body.trim().to_string(),
            ));
        }

        if body.trim().is_empty() {
            return Ok(NativeResult::affected(
                summary.as_deref().map(written_rows).unwrap_or(0),
            ));
        }

        let parsed: ClickHouseResponse = serde_json::from_str(&body).map_err(|e| {
            EngineError::syntax(ENGINE, format!("unexpected ClickHouse response: {}", e))
        })?;
        let types: Vec<String> = parsed.meta.iter().map(|c| c.column_type.clone()).collect();
        let columns = parsed.meta.into_iter().map(|c| c.name).collect();
        let rows = parsed
            .data
            .into_iter()
            .map(|row| {
                row.into_iter()
                    .zip(types.iter())
                    .map(|(value, ty)| NativeValue::from_json(value, ty))
                    .collect()
            })
            .collect();
        Ok(NativeResult::values(columns, rows))
    }
}

fn exception_code_from_body(body: &str) -> Option<u32> {
    static CODE: OnceLock<Option<Regex>> = OnceLock::new();
    let re = CODE
        .get_or_init(|| Regex::new(r"Code:\s*(\d+)").ok())
        .as_ref()?;
    re.captures(body)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// ClickHouse server error codes.
fn clickhouse_error_kind(code: u32) -> EngineErrorKind {
    match code {
        62 => EngineErrorKind::SyntaxError,
        // UNKNOWN_TABLE, UNKNOWN_DATABASE, CANNOT_EXTRACT_TABLE_STRUCTURE
        60 | 81 | 636 => EngineErrorKind::ObjectNotFound,
        // TIMEOUT_EXCEEDED, SOCKET_TIMEOUT
        159 | 209 => EngineErrorKind::Timeout,
        // S3_ERROR, NETWORK_ERROR, ALL_CONNECTION_TRIES_FAILED, POCO_EXCEPTION
        499 | 210 | 198 | 1000 => EngineErrorKind::StorageUnavailable,
        516 => EngineErrorKind::ConnectionFailed,
        _ => EngineErrorKind::SyntaxError,
    }
}

/// `written_rows` from the X-ClickHouse-Summary header. Counts are sent as
/// strings.
fn written_rows(summary: &str) -> u64 {
    serde_json::from_str::<serde_json::Value>(summary)
        .ok()
        .and_then(|v| {
            let rows = v.get("written_rows")?;
            rows.as_u64()
                .or_else(|| rows.as_str().and_then(|s| s.parse().ok()))
        })
        .unwrap_or(0)
}

pub(crate) fn map_reqwest_error_for(engine: EngineId, err: reqwest::Error) -> EngineError {
    let kind = if err.is_timeout() {
        EngineErrorKind::Timeout
    } else if err.is_connect() || err.is_request() {
        EngineErrorKind::ConnectionFailed
    } else if err.is_decode() || err.is_body() {
        EngineErrorKind::SyntaxError
    } else {
        EngineErrorKind::ConnectionFailed
    };
    EngineError::new(engine, kind, err.to_string())
}

fn map_reqwest_error(err: reqwest::Error) -> EngineError {
    map_reqwest_error_for(ENGINE, err)
}

#[async_trait]
impl EngineAdapter for ClickHouseEngine {
    fn engine(&self) -> EngineId {
        ENGINE
    }

    async fn execute(&self, input: &QueryInput) -> Result<NativeResult, EngineError> {
        let sql = match &input.statement {
            Some(statement) => self.rewriter.rewrite(statement),
            None => input.sql.clone(),
        };
        debug!("ClickHouse SQL: {}", sql);

        call_with_reconnect(
            &self.handle,
            self.config.timeout,
            || self.connect(),
            |client| {
                let sql = sql.clone();
                async move { self.post(&client, sql).await }
            },
        )
        .await
    }

    async fn health_check(&self) -> Result<bool, EngineError> {
        let client = self.handle.get_or_create(|| self.connect()).await?;
        let url = format!("{}/ping", self.config.url.trim_end_matches('/'));
        let response = client
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(map_reqwest_error)?;
        Ok(response.status().is_success())
    }
}
