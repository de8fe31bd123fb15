use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use jobpoll_storage::PgMetadataStore;
use jobpoll_sync::{engine_from_env, run_sweep_once_from_env, SyncConfig};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "jobpoll")]
#[command(about = "Adaptive polling for job listing sources")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Poll every due source once and print a summary.
    Sweep,
    /// Keep polling until Ctrl-C.
    Run,
    /// Print polling stats as JSON.
    Stats {
        #[arg(long)]
        source: Option<String>,
    },
    /// Run the polling loop and the status HTTP server together.
    Serve {
        #[arg(long, env = "JOBPOLL_WEB_PORT", default_value_t = 8000)]
        port: u16,
    },
    /// Create the Postgres metadata table.
    Migrate,
}

fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "could not listen for Ctrl-C");
            return;
        }
        info!("shutdown requested");
        trigger.cancel();
    });
    token
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "jobpoll=info".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sweep) {
        Commands::Sweep => {
            let summary = run_sweep_once_from_env().await?;
            println!(
                "sweep complete: sources={} polled={} changed={} not_modified={} not_due={} failed={}",
                summary.sources,
                summary.polled,
                summary.changed,
                summary.not_modified,
                summary.not_due,
                summary.failed
            );
        }
        Commands::Run => {
            let engine = engine_from_env().await?;
            let sweeps = engine.run_until_cancelled(shutdown_on_ctrl_c()).await;
            println!("stopped after {sweeps} sweeps");
        }
        Commands::Stats { source } => {
            let engine = engine_from_env().await?;
            let out = match source {
                Some(id) => {
                    let stats = engine
                        .stats(&id)
                        .await
                        .with_context(|| format!("unknown source '{id}'"))?;
                    serde_json::to_value(stats)?
                }
                None => {
                    let mut all = serde_json::Map::new();
                    for (source, stats) in engine.all_stats().await {
                        all.insert(source.config.source_id.clone(), serde_json::to_value(stats)?);
                    }
                    serde_json::Value::Object(all)
                }
            };
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        Commands::Serve { port } => {
            let engine = Arc::new(engine_from_env().await?);
            let shutdown = shutdown_on_ctrl_c();
            let poller = {
                let engine = engine.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { engine.run_until_cancelled(shutdown).await })
            };
            jobpoll_web::serve(engine, port, shutdown.clone()).await?;
            shutdown.cancel();
            poller.await.context("polling loop panicked")?;
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env()?;
            let Some(url) = config.database_url else {
                bail!("DATABASE_URL is not set");
            };
            let store = PgMetadataStore::connect(&url)
                .await
                .context("connecting to metadata database")?;
            store.ensure_schema().await?;
            println!("source_polling_metadata is ready");
        }
    }

    Ok(())
}
