//! Execution Router - picks the engine for each statement and runs it
//!
//! Selection is a pure function of the statement's features. Rule order is
//! the routing policy: the first matching rule wins.

use crate::classifier::{Classifier, FeatureSet};
use crate::config::RouterConfig;
use crate::error::{ConfigurationError, EngineError, ParseError, Result};
use crate::execution::clickhouse_engine::ClickHouseEngine;
use crate::execution::duckdb_engine::DuckDbEngine;
use crate::execution::engine::{EngineAdapter, EngineId, QueryInput};
use crate::execution::fallback::{FallbackController, FallbackState};
use crate::execution::postgres_engine::PostgresEngine;
use crate::execution::result::{normalize, ExecutionResult};
use crate::execution::rewrite::{RewriteTarget, TableRewriter};
use crate::execution::trino_engine::TrinoEngine;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

/// Which rule picked the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingRule {
    Write,
    KeyLookup,
    Aggregate,
    Join,
    Default,
    Unparseable,
    Forced,
}

impl fmt::Display for RoutingRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RoutingRule::Write => "write",
            RoutingRule::KeyLookup => "key_lookup",
            RoutingRule::Aggregate => "aggregate",
            RoutingRule::Join => "join",
            RoutingRule::Default => "default",
            RoutingRule::Unparseable => "unparseable",
            RoutingRule::Forced => "forced",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RoutingDecision {
    pub engine: EngineId,
    pub rule: RoutingRule,
}

impl RoutingDecision {
    fn new(engine: EngineId, rule: RoutingRule) -> Self {
        Self { engine, rule }
    }
}

/// Engine Selector.
///
/// 1. writes go to the point store
/// 2. key equality against a literal goes to the point store
/// 3. aggregation or grouping without a join goes to the column store
/// 4. joins go to the federated store
/// 5. everything else, unparseable input included, goes to the embedded store
pub fn select_engine(features: std::result::Result<&FeatureSet, &ParseError>) -> RoutingDecision {
    let features = match features {
        Ok(features) => features,
        Err(_) => return RoutingDecision::new(EngineId::EmbeddedStore, RoutingRule::Unparseable),
    };

    if features.is_write {
        RoutingDecision::new(EngineId::PointStore, RoutingRule::Write)
    } else if features.has_key_equality {
        RoutingDecision::new(EngineId::PointStore, RoutingRule::KeyLookup)
    } else if (features.has_aggregate || features.has_group_by) && !features.has_join {
        RoutingDecision::new(EngineId::ColumnStore, RoutingRule::Aggregate)
    } else if features.has_join {
        RoutingDecision::new(EngineId::FederatedStore, RoutingRule::Join)
    } else {
        RoutingDecision::new(EngineId::EmbeddedStore, RoutingRule::Default)
    }
}

/// A statement ready to hand to an adapter.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub decision: RoutingDecision,
    pub input: QueryInput,
    /// Present when the statement did not parse
    pub parse_error: Option<ParseError>,
}

/// Classify `sql` and choose its engine. A `force_engine` override is
/// validated first and, when valid, bypasses the selector.
pub fn plan(
    classifier: &Classifier,
    sql: &str,
    force_engine: Option<&str>,
) -> std::result::Result<Dispatch, ConfigurationError> {
    let forced = force_engine.map(str::parse::<EngineId>).transpose()?;

    let (input, parse_error) = match classifier.parse(sql) {
        Ok(statement) => {
            let features = classifier.features(&statement);
            (QueryInput::parsed(statement, features), None)
        }
        Err(e) => (QueryInput::new(sql), Some(e)),
    };

    let decision = match forced {
        Some(engine) => RoutingDecision::new(engine, RoutingRule::Forced),
        None => match (&input.features, &parse_error) {
            (Some(features), _) => select_engine(Ok(features)),
            (None, Some(e)) => select_engine(Err(e)),
            (None, None) => RoutingDecision::new(EngineId::EmbeddedStore, RoutingRule::Unparseable),
        },
    };

    Ok(Dispatch {
        decision,
        input,
        parse_error,
    })
}

/// Owns one adapter per engine and runs statements through them.
pub struct ExecutionRouter {
    classifier: Classifier,
    engines: HashMap<EngineId, Arc<dyn EngineAdapter>>,
}

impl ExecutionRouter {
    pub fn new(classifier: Classifier, engines: Vec<Arc<dyn EngineAdapter>>) -> Self {
        let engines = engines.into_iter().map(|e| (e.engine(), e)).collect();
        Self {
            classifier,
            engines,
        }
    }

    /// Build every adapter from configuration. Clients connect lazily, so
    /// this does no network I/O; it only reads the fallback seed directory.
    pub fn from_config(config: &RouterConfig) -> Result<Self> {
        let rewriter = |target: RewriteTarget| {
            let rewriter = TableRewriter::new(config.storage.clone(), target);
            match &config.lake_tables {
                Some(tables) => rewriter.with_lake_tables(tables),
                None => rewriter,
            }
        };

        let fallback = Arc::new(FallbackState::new(config.fallback.max_rows));
        if let Some(dir) = &config.fallback.dir {
            match fallback.load_dir(dir) {
                Ok(count) => info!("Loaded {} fallback table(s) from {}", count, dir.display()),
                Err(e) => warn!("Could not load fallback tables from {}: {}", dir.display(), e),
            }
        }

        let duckdb: Arc<dyn EngineAdapter> = Arc::new(DuckDbEngine::new(
            config.duckdb.clone(),
            rewriter(RewriteTarget::ParquetScan),
            fallback.clone(),
        ));

        let engines: Vec<Arc<dyn EngineAdapter>> = vec![
            Arc::new(PostgresEngine::new(config.postgres.clone())),
            Arc::new(ClickHouseEngine::new(
                config.clickhouse.clone(),
                rewriter(RewriteTarget::S3Function),
            )),
            Arc::new(TrinoEngine::new(
                config.trino.clone(),
                rewriter(RewriteTarget::Catalog {
                    catalog: config.trino.catalog.clone(),
                    schema: config.trino.schema.clone(),
                }),
            )),
            Arc::new(FallbackController::new(duckdb, fallback)),
        ];

        Ok(Self::new(config.classifier.build(), engines))
    }

    pub fn classifier(&self) -> &Classifier {
        &self.classifier
    }

    pub fn decide(
        &self,
        sql: &str,
        force_engine: Option<&str>,
    ) -> std::result::Result<Dispatch, ConfigurationError> {
        plan(&self.classifier, sql, force_engine)
    }

    /// Classify, select, execute and normalize one statement. Only an
    /// invalid override fails; every engine outcome is an `ExecutionResult`.
    pub async fn execute(
        &self,
        sql: &str,
        force_engine: Option<&str>,
    ) -> std::result::Result<ExecutionResult, ConfigurationError> {
        let start = Instant::now();
        let dispatch = self.decide(sql, force_engine)?;
        let engine = dispatch.decision.engine;

        match &dispatch.parse_error {
            Some(e) => info!("Routing to {} ({}): {}", engine, dispatch.decision.rule, e),
            None => info!("Routing to {} ({})", engine, dispatch.decision.rule),
        }

        let Some(adapter) = self.engines.get(&engine) else {
            let err =
                EngineError::connection_failed(engine, format!("{} is not configured", engine));
            error!("{}", err);
            return Ok(ExecutionResult::failed(err, start.elapsed()));
        };

        let result = match adapter.execute(&dispatch.input).await {
            Ok(native) => normalize(native, engine, start.elapsed()),
            Err(err) => {
                error!("{}", err);
                ExecutionResult::failed(err, start.elapsed())
            }
        };

        info!(
            "{} finished in {:.3}s ({} rows{})",
            engine,
            result.elapsed().as_secs_f64(),
            result.rows().len(),
            if result.degraded() { ", degraded" } else { "" }
        );
        Ok(result)
    }

    /// Configured engines, in identifier order.
    pub fn available_engines(&self) -> Vec<EngineId> {
        let mut engines: Vec<EngineId> = self.engines.keys().copied().collect();
        engines.sort();
        engines
    }

    /// Health of every configured engine. An adapter error counts as down.
    pub async fn health(&self) -> Vec<(EngineId, bool)> {
        let mut health = Vec::new();
        for engine in self.available_engines() {
            let Some(adapter) = self.engines.get(&engine) else {
                continue;
            };
            let healthy = match adapter.health_check().await {
                Ok(healthy) => healthy,
                Err(e) => {
                    warn!("Health check failed: {}", e);
                    false
                }
            };
            health.push((engine, healthy));
        }
        health
    }
}
