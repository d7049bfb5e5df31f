//! Execution Module - routing, engine adapters and result normalization
//!
//! - EngineAdapter trait for the four backends
//! - ExecutionRouter for rule-based engine selection
//! - FallbackController for local copies when object storage is down
//! - Result normalizer for the response envelope

pub mod connection;
pub mod engine;
pub mod fallback;
pub mod result;
pub mod rewrite;
pub mod router;

// Engine implementations
pub mod clickhouse_engine;
pub mod duckdb_engine;
pub mod postgres_engine;
pub mod trino_engine;

pub use engine::{EngineAdapter, EngineId, NativePayload, NativeResult, NativeValue, QueryInput};
pub use fallback::{FallbackController, FallbackMode, FallbackState};
pub use result::{normalize, ErrorInfo, ExecutionResult};
pub use rewrite::{RewriteTarget, StorageLayout, TableRewriter};
pub use router::{plan, select_engine, Dispatch, ExecutionRouter, RoutingDecision, RoutingRule};
