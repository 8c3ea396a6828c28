use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::signal;
use tracing::{debug, info};

use quota_guard::config::QuotaConfig;
use quota_guard::ratelimit::RateLimiterService;
use quota_guard::store::{CounterStore, MemoryStore, RedisStore};
use quota_guard::sweeper::Sweeper;
use quota_guard::telemetry;

/// Inspect and drive per-identity rate limits in the shared counter store.
#[derive(Debug, Parser)]
#[command(name = "quota-guard", version, about)]
struct Cli {
    /// Configuration file (YAML, TOML or JSON); QUOTA__* variables override it
    #[arg(short, long, env = "QUOTA_CONFIG")]
    config: Option<PathBuf>,

    /// Use an in-process store instead of Redis
    #[arg(long)]
    memory: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Record a request and report whether it is allowed
    Check {
        identity: String,
        /// Limit to apply when no override exists (defaults to rate_limit.default_limit)
        #[arg(short, long)]
        limit: Option<u64>,
    },
    /// Report how many requests remain in the current window
    Remaining {
        identity: String,
        #[arg(short, long)]
        limit: Option<u64>,
    },
    /// Store a limit override for an identity
    SetLimit { identity: String, limit: u64 },
    /// Show the stored limit override for an identity
    GetLimit { identity: String },
    /// Remove the limit override for an identity
    ClearLimit { identity: String },
    /// Forget recorded traffic for an identity
    Reset { identity: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = QuotaConfig::load(cli.config.as_deref())?;
    telemetry::init(&config.logging)?;

    debug!(version = env!("CARGO_PKG_VERSION"), "Starting quota-guard");

    let (store, purger): (Arc<dyn CounterStore>, Option<Sweeper>) = if cli.memory {
        info!("Using in-process counter store");
        let memory = Arc::new(MemoryStore::new());
        let purger = memory.spawn_purger(config.rate_limit.window());
        (memory as Arc<dyn CounterStore>, Some(purger))
    } else {
        (Arc::new(RedisStore::connect(&config.redis).await?), None)
    };

    let service = RateLimiterService::new(store, &config.rate_limit);
    let default_limit = config.rate_limit.default_limit;

    let outcome = tokio::select! {
        result = run(&service, cli.command, default_limit) => result,
        _ = shutdown_signal() => Err(anyhow::anyhow!("interrupted")),
    };

    service.shutdown().await;
    if let Some(purger) = purger {
        purger.stop().await;
    }

    let output = outcome?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn run(
    service: &RateLimiterService,
    command: Command,
    default_limit: u64,
) -> anyhow::Result<serde_json::Value> {
    let output = match command {
        Command::Check { identity, limit } => {
            let limit = limit.unwrap_or(default_limit);
            let allowed = service.rate_limit(&identity, limit).await?;
            let remaining = service.remaining(&identity, limit).await?;
            json!({
                "identity": identity,
                "allowed": allowed,
                "limit": service.effective_limit(&identity, limit).await,
                "remaining": remaining,
                "algorithm": service.algorithm(),
            })
        }
        Command::Remaining { identity, limit } => {
            let limit = limit.unwrap_or(default_limit);
            let remaining = service.remaining(&identity, limit).await?;
            json!({
                "identity": identity,
                "limit": service.effective_limit(&identity, limit).await,
                "remaining": remaining,
            })
        }
        Command::SetLimit { identity, limit } => {
            service.set_user_limit(&identity, limit).await?;
            json!({ "identity": identity, "limit": limit })
        }
        Command::GetLimit { identity } => {
            let limit = service.user_limit(&identity).await?;
            json!({ "identity": identity, "limit": limit })
        }
        Command::ClearLimit { identity } => {
            service.clear_user_limit(&identity).await?;
            json!({ "identity": identity, "cleared": true })
        }
        Command::Reset { identity } => {
            service.reset(&identity).await?;
            json!({ "identity": identity, "reset": true })
        }
    };

    Ok(output)
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, cancelling");
        }
        _ = terminate => {
            info!("Received SIGTERM, cancelling");
        }
    }
}
