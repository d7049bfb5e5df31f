use crate::execution::engine::EngineId;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Why a statement could not be classified. Never fatal: the selector
/// routes unparseable input to the embedded engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("statement is {size} bytes, above the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },

    #[error("empty statement")]
    Empty,

    #[error("expected a single statement, found {0}")]
    MultipleStatements(usize),

    #[error("SQL parse error: {0}")]
    Syntax(String),
}

/// Rejected before dispatch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("Unknown engine '{0}', expected one of: postgres, clickhouse, trino, duckdb")]
    UnknownEngine(String),

    #[error("Invalid setting {name}: {message}")]
    InvalidSetting { name: String, message: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineErrorKind {
    ConnectionFailed,
    SyntaxError,
    ObjectNotFound,
    StorageUnavailable,
    Timeout,
}

impl EngineErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineErrorKind::ConnectionFailed => "connection_failed",
            EngineErrorKind::SyntaxError => "syntax_error",
            EngineErrorKind::ObjectNotFound => "object_not_found",
            EngineErrorKind::StorageUnavailable => "storage_unavailable",
            EngineErrorKind::Timeout => "timeout",
        }
    }
}

impl fmt::Display for EngineErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Uniform failure of a single engine call. Native client errors never
/// leave an adapter in any other shape.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{engine} {kind}: {message}")]
pub struct EngineError {
    pub kind: EngineErrorKind,
    pub message: String,
    pub engine: EngineId,
}

impl EngineError {
    pub fn new(engine: EngineId, kind: EngineErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            engine,
        }
    }

    pub fn connection_failed(engine: EngineId, message: impl Into<String>) -> Self {
        Self::new(engine, EngineErrorKind::ConnectionFailed, message)
    }

    pub fn syntax(engine: EngineId, message: impl Into<String>) -> Self {
        Self::new(engine, EngineErrorKind::SyntaxError, message)
    }

    pub fn timeout(engine: EngineId, message: impl Into<String>) -> Self {
        Self::new(engine, EngineErrorKind::Timeout, message)
    }
}

#[derive(Error, Debug)]
pub enum RouterError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Polars error: {0}")]
    Polars(String),
}

impl From<polars::prelude::PolarsError> for RouterError {
    fn from(err: polars::prelude::PolarsError) -> Self {
        RouterError::Polars(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RouterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_error_display_names_engine_and_kind() {
        let err = EngineError::syntax(
            EngineId::EmbeddedStore,
            "Parser Error: syntax error at or near \"FORM\"",
        );
        assert_eq!(
            err.to_string(),
            "duckdb syntax_error: Parser Error: syntax error at or near \"FORM\""
        );
    }

    #[test]
    fn test_kind_serializes_snake_case() {
        let json = serde_json::to_string(&EngineErrorKind::StorageUnavailable).unwrap();
        assert_eq!(json, "\"storage_unavailable\"");
    }
}
