//! Lazily created, process-wide client handles
//!
//! One handle per engine. The client is built on first use and only
//! rebuilt when a call reports the connection as dead, at most once per
//! failed call.

use crate::error::{EngineError, EngineErrorKind};
use crate::execution::engine::EngineId;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::warn;

pub struct ClientHandle<C> {
    engine: EngineId,
    slot: Mutex<Option<Arc<C>>>,
}

impl<C> ClientHandle<C> {
    pub fn new(engine: EngineId) -> Self {
        Self {
            engine,
            slot: Mutex::new(None),
        }
    }

    pub fn engine(&self) -> EngineId {
        self.engine
    }

    /// Return the live client, building it first if there is none.
    /// The lock is held while connecting so concurrent first calls build
    /// a single client.
    pub async fn get_or_create<F, Fut>(&self, connect: F) -> Result<Arc<C>, EngineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<C, EngineError>>,
    {
        let mut slot = self.slot.lock().await;
        if let Some(client) = slot.as_ref() {
            return Ok(Arc::clone(client));
        }
        let client = Arc::new(connect().await?);
        *slot = Some(Arc::clone(&client));
        Ok(client)
    }

    /// Drop the current client so the next call reconnects.
    pub async fn invalidate(&self) {
        *self.slot.lock().await = None;
    }

    /// Drop `stale` only if it is still the current client. Another call may
    /// already have replaced it.
    pub async fn invalidate_if(&self, stale: &Arc<C>) {
        let mut slot = self.slot.lock().await;
        if slot.as_ref().map(|c| Arc::ptr_eq(c, stale)).unwrap_or(false) {
            *slot = None;
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.slot.lock().await.is_some()
    }
}

/// Bound a native call by the engine's per-call timeout.
pub async fn with_timeout<T, Fut>(
    engine: EngineId,
    limit: Duration,
    call: Fut,
) -> Result<T, EngineError>
where
    Fut: Future<Output = Result<T, EngineError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(EngineError::timeout(
            engine,
            format!("query exceeded {:.1}s timeout", limit.as_secs_f64()),
        )),
    }
}

/// Run `call` against the handle's client. If the call fails with
/// `ConnectionFailed`, the client is rebuilt once and the call retried
/// once. Every other error is returned as is.
pub async fn call_with_reconnect<C, T, Conn, ConnFut, Call, CallFut>(
    handle: &ClientHandle<C>,
    limit: Duration,
    connect: Conn,
    call: Call,
) -> Result<T, EngineError>
where
    Conn: Fn() -> ConnFut,
    ConnFut: Future<Output = Result<C, EngineError>>,
    Call: Fn(Arc<C>) -> CallFut,
    CallFut: Future<Output = Result<T, EngineError>>,
{
    let engine = handle.engine();
    let client = handle.get_or_create(&connect).await?;

    match with_timeout(engine, limit, call(Arc::clone(&client))).await {
        Err(err) if err.kind == EngineErrorKind::ConnectionFailed => {
            warn!("{} connection reported dead, reconnecting once: {}", engine, err.message);
            handle.invalidate_if(&client).await;
            let client = handle.get_or_create(&connect).await?;
            with_timeout(engine, limit, call(client)).await
        }
        other => other,
    }
}
