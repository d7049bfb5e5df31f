use anyhow::Result;
use clap::{Parser, Subcommand};
use query_router::config::RouterConfig;
use query_router::execution::ExecutionRouter;
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "query-router")]
#[command(about = "Classify, route and run SQL statements from the command line")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the features of a statement and the engine it routes to
    Route {
        sql: String,

        #[arg(long)]
        force_engine: Option<String>,
    },
    /// Execute a statement and print the response envelope
    Query {
        sql: String,

        #[arg(long)]
        force_engine: Option<String>,
    },
    /// Check every engine
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = RouterConfig::from_env()?;
    let router = ExecutionRouter::from_config(&config)?;

    let output = match args.command {
        Commands::Route { sql, force_engine } => {
            let dispatch = router.decide(&sql, force_engine.as_deref())?;
            json!({
                "engine": dispatch.decision.engine,
                "rule": dispatch.decision.rule,
                "features": dispatch.input.features,
                "parse_error": dispatch.parse_error.map(|e| e.to_string()),
            })
        }
        Commands::Query { sql, force_engine } => router
            .execute(&sql, force_engine.as_deref())
            .await?
            .to_response(),
        Commands::Health => {
            let engines = router.health().await;
            json!(engines
                .into_iter()
                .map(|(engine, healthy)| (engine.to_string(), json!(healthy)))
                .collect::<serde_json::Map<_, _>>())
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
