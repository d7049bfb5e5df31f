#![allow(dead_code)]

use async_trait::async_trait;
use query_router::error::{EngineError, EngineErrorKind};
use query_router::execution::{EngineAdapter, EngineId, NativeResult, NativeValue, QueryInput};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// In-process adapter that records what it was asked to run.
pub struct StubEngine {
    engine: EngineId,
    outcome: Result<NativeResult, EngineErrorKind>,
    calls: AtomicUsize,
    seen: Mutex<Vec<String>>,
}

impl StubEngine {
    pub fn ok(engine: EngineId) -> Arc<Self> {
        Self::returning(
            engine,
            Ok(NativeResult::values(
                vec!["id".to_string(), "name".to_string()],
                vec![vec![NativeValue::Int(1), NativeValue::Text("Alice".to_string())]],
            )),
        )
    }

    pub fn failing(engine: EngineId, kind: EngineErrorKind) -> Arc<Self> {
        Self::returning(engine, Err(kind))
    }

    pub fn returning(
        engine: EngineId,
        outcome: Result<NativeResult, EngineErrorKind>,
    ) -> Arc<Self> {
        Arc::new(Self {
            engine,
            outcome,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl EngineAdapter for StubEngine {
    fn engine(&self) -> EngineId {
        self.engine
    }

    async fn execute(&self, input: &QueryInput) -> Result<NativeResult, EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(input.sql.clone());
        match &self.outcome {
            Ok(result) => Ok(result.clone()),
            Err(kind) => Err(EngineError::new(
                self.engine,
                *kind,
                format!("IO Error: {} unavailable for s3://lake-data/data/users/", self.engine),
            )),
        }
    }

    async fn health_check(&self) -> Result<bool, EngineError> {
        Ok(true)
    }
}

/// One healthy stub per engine.
pub fn stubs() -> Vec<Arc<StubEngine>> {
    EngineId::ALL.iter().map(|e| StubEngine::ok(*e)).collect()
}

pub fn as_adapters(stubs: &[Arc<StubEngine>]) -> Vec<Arc<dyn EngineAdapter>> {
    stubs
        .iter()
        .map(|s| s.clone() as Arc<dyn EngineAdapter>)
        .collect()
}
