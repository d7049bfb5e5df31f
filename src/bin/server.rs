//! HTTP server for the query router

use anyhow::{Context, Result};
use clap::Parser;
use query_router::api::serve;
use query_router::config::RouterConfig;
use query_router::execution::ExecutionRouter;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "server")]
#[command(about = "Routes SQL statements to Postgres, ClickHouse, Trino or DuckDB")]
struct Args {
    /// Listen address (overrides ROUTER_BIND)
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = RouterConfig::from_env()?;
    let bind = args.bind.unwrap_or_else(|| config.bind.clone());

    let router = Arc::new(ExecutionRouter::from_config(&config)?);
    info!(
        "Engines: {}",
        router
            .available_engines()
            .iter()
            .map(|e| e.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );

    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("binding {}", bind))?;
    info!("Query router listening on {}", bind);

    serve(listener, router).await?;
    Ok(())
}
