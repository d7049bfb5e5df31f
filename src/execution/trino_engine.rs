//! Trino Execution Engine
//!
//! Trino is used for joins and other federated reads. Table names are
//! qualified with the lakehouse catalog, which resolves them to storage.

use crate::config::TrinoConfig;
use crate::error::{EngineError, EngineErrorKind};
use crate::execution::clickhouse_engine::map_reqwest_error_for;
use crate::execution::connection::{call_with_reconnect, ClientHandle};
use crate::execution::engine::{EngineAdapter, EngineId, NativeResult, NativeValue, QueryInput};
use crate::execution::rewrite::TableRewriter;
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info};

const ENGINE: EngineId = EngineId::FederatedStore;
const MAX_POLLS: usize = 10_000;

pub struct TrinoEngine {
    config: TrinoConfig,
    rewriter: TableRewriter,
    handle: ClientHandle<Client>,
}

// Trino REST API: POST /v1/statement with SQL as the plain-text body, then
// GET each nextUri until it is absent. Every page has the same shape.
#[derive(Debug, Deserialize)]
struct TrinoResponse {
    id: Option<String>,
    #[serde(rename = "nextUri")]
    next_uri: Option<String>,
    columns: Option<Vec<TrinoColumn>>,
    data: Option<Vec<Vec<serde_json::Value>>>,
    #[serde(rename = "updateCount")]
    update_count: Option<u64>,
    error: Option<TrinoError>,
}

#[derive(Debug, Deserialize)]
struct TrinoColumn {
    name: String,
    #[serde(rename = "type")]
    column_type: String,
}

#[derive(Debug, Deserialize)]
struct TrinoError {
    message: String,
    #[serde(rename = "errorName")]
    error_name: Option<String>,
    #[serde(rename = "errorType")]
    error_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TrinoInfo {
    #[serde(default)]
    starting: bool,
}

impl TrinoEngine {
    pub fn new(config: TrinoConfig, rewriter: TableRewriter) -> Self {
        Self {
            config: TrinoConfig {
                url: config.url.trim_end_matches('/').to_string(),
                ..config
            },
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

    async fn submit(&self, client: &Client, sql: String) -> Result<TrinoResponse, EngineError> {
        let url = format!("{}/v1/statement", self.config.url);
        let response = client
            .post(&url)
            .header("X-Trino-User", &self.config.user)
            .header("X-Trino-Catalog", &self.config.catalog)
            .header("X-Trino-Schema", &self.config.schema)
            .header("Content-Type", "text/plain")
            .body(sql)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        read_page(response).await
    }

    async fn fetch(&self, client: &Client, next_uri: &str) -> Result<TrinoResponse, EngineError> {
        let url = if next_uri.starts_with("http") {
            next_uri.to_string()
        } else {
            format!("{}{}", self.config.url, next_uri)
        };
        let response = client
            .get(&url)
            .header("X-Trino-User", &self.config.user)
            .send()
            .await
            .map_err(map_reqwest_error)?;
        read_page(response).await
    }

    async fn run(&self, client: &Client, sql: String) -> Result<NativeResult, EngineError> {
        let first = self.submit(client, sql).await?;
        if let Some(id) = &first.id {
            info!("Trino query submitted: {}", id);
        }

        let mut columns: Option<Vec<TrinoColumn>> = None;
        let mut data: Vec<Vec<serde_json::Value>> = Vec::new();
        let mut update_count = None;
        let mut page = first;
        let mut polls = 0;

        loop {
            if let Some(error) = page.error {
                return Err(trino_error(error));
            }
            if columns.is_none() {
                columns = page.columns;
            }
            if let Some(rows) = page.data {
                data.extend(rows);
            }
            if page.update_count.is_some() {
                update_count = page.update_count;
            }

            let Some(next_uri) = page.next_uri else {
                break;
            };
            polls += 1;
            if polls > MAX_POLLS {
                return Err(EngineError::timeout(
                    ENGINE,
                    format!("gave up after {} result pages", MAX_POLLS),
                ));
            }
            page = self.fetch(client, &next_uri).await?;
        }

        debug!("Trino query finished after {} polls, {} rows", polls, data.len());

        if let Some(count) = update_count {
            return Ok(NativeResult::affected(count));
        }

        let columns = columns.unwrap_or_default();
        let names = columns.iter().map(|c| c.name.clone()).collect();
        let rows = data
            .into_iter()
            .map(|row| {
                row.into_iter()
                    .zip(columns.iter())
                    .map(|(value, col)| NativeValue::from_json(value, &col.column_type))
                    .collect()
            })
            .collect();
        Ok(NativeResult::values(names, rows))
    }
}

async fn read_page(response: reqwest::Response) -> Result<TrinoResponse, EngineError> {
    let status = response.status();
    let text = response.text().await.map_err(map_reqwest_error)?;
    if status.is_server_error() {
        return Err(EngineError::connection_failed(
            ENGINE,
            format!("Trino returned {}: {}", status, text.trim()),
        ));
    }
    if !status.is_success() {
        return Err(EngineError::syntax(
            ENGINE,
            format!("Trino returned {}: {}", status, text.trim()),
        ));
    }
    serde_json::from_str(&text)
        .map_err(|e| EngineError::syntax(ENGINE, format!("unexpected Trino response: {}", e)))
}

fn trino_error(error: TrinoError) -> EngineError {
    let kind = trino_error_kind(error.error_name.as_deref(), error.error_type.as_deref());
    let message = match error.error_name {
        Some(name) => format!("{} ({})", error.message, name),
        None => error.message,
    };
    EngineError::new(ENGINE, kind, message)
}

fn trino_error_kind(name: Option<&str>, error_type: Option<&str>) -> EngineErrorKind {
    match name.unwrap_or_default() {
        "SYNTAX_ERROR" => EngineErrorKind::SyntaxError,
        "EXCEEDED_TIME_LIMIT" | "EXCEEDED_CPU_LIMIT" => EngineErrorKind::Timeout,
        n if n.ends_with("_NOT_FOUND") || n.starts_with("MISSING_") => {
            EngineErrorKind::ObjectNotFound
        }
        _ if error_type == Some("EXTERNAL") => EngineErrorKind::StorageUnavailable,
        _ if error_type == Some("INSUFFICIENT_RESOURCES") => EngineErrorKind::Timeout,
        _ => EngineErrorKind::SyntaxError,
    }
}

fn map_reqwest_error(err: reqwest::Error) -> EngineError {
    map_reqwest_error_for(ENGINE, err)
}

#[async_trait]
impl EngineAdapter for TrinoEngine {
    fn engine(&self) -> EngineId {
        ENGINE
    }

    async fn execute(&self, input: &QueryInput) -> Result<NativeResult, EngineError> {
        let sql = match &input.statement {
            Some(statement) => self.rewriter.rewrite(statement),
            None => input.sql.clone(),
        };
        // Trino rejects a trailing semicolon
        let sql = sql.trim().trim_end_matches(';').to_string();
        debug!("Trino SQL: {}", sql);

        call_with_reconnect(
            &self.handle,
            self.config.timeout,
            || self.connect(),
            |client| {
                let sql = sql.clone();
                async move { self.run(&client, sql).await }
            },
        )
        .await
    }

    async fn health_check(&self) -> Result<bool, EngineError> {
        let client = self.handle.get_or_create(|| self.connect()).await?;
        let url = format!("{}/v1/info", self.config.url);
        let response = client
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(map_reqwest_error)?;
        if !response.status().is_success() {
            return Ok(false);
        }
        let info: TrinoInfo = response.json().await.map_err(map_reqwest_error)?;
        Ok(!info.starting)
    }
}
