pub mod api;
pub mod classifier;
pub mod config;
pub mod error;
pub mod execution;

pub use classifier::{Classifier, FeatureSet, Statement};
pub use config::RouterConfig;
pub use error::{ConfigurationError, EngineError, EngineErrorKind, ParseError, Result, RouterError};
pub use execution::{EngineId, ExecutionResult, ExecutionRouter};
