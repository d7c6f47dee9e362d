mod config;
mod echo;
mod replay;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::Parser;
use tokio::io::BufReader;
use tracing::{info, warn, Level};

use nexus_broker::Broker;
use nexus_store::{Database, SessionRepo};

use crate::config::{default_db_path, AppConfig};
use crate::echo::EchoFactory;
use crate::replay::{print_events, replay, wait_idle, ReplayStats};

/// Replay newline-delimited JSON messages through the agent broker.
#[derive(Debug, Parser)]
#[command(name = "nexus", version)]
struct Cli {
    /// JSON config with optional `broker`, `telemetry` and `db_path` sections.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Message file, one JSON message per line. Reads stdin when absent.
    #[arg(long)]
    input: Option<PathBuf>,

    /// Organizational unit served by the built-in echo agent.
    #[arg(long, default_value = "nexus")]
    unit: String,

    /// Session database. Defaults to `~/.nexus/state/sessions.db`.
    #[arg(long)]
    db: Option<PathBuf>,

    /// Simulated think time for each echo run.
    #[arg(long, default_value_t = 0)]
    echo_delay_ms: u64,

    /// How long to wait for queues to drain after the input ends.
    #[arg(long, default_value_t = 30)]
    drain_timeout_secs: u64,

    /// Per-module log level applied after startup, e.g. `nexus_broker=debug`.
    #[arg(long = "log-module", value_name = "MODULE=LEVEL")]
    log_modules: Vec<String>,
}

fn parse_module_level(raw: &str) -> anyhow::Result<(String, Level)> {
    let (module, level) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("expected MODULE=LEVEL, got {raw:?}"))?;
    let level = level
        .parse::<Level>()
        .map_err(|_| anyhow!("invalid log level {level:?} for {module}"))?;
    Ok((module.to_string(), level))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref())?;
    let telemetry = nexus_telemetry::init_telemetry(&config.telemetry)?;
    for raw in &cli.log_modules {
        let (module, level) = parse_module_level(raw)?;
        telemetry.set_module_level(&module, level)?;
    }

    let db_path = cli
        .db
        .clone()
        .or_else(|| config.db_path.clone())
        .unwrap_or_else(default_db_path);
    let db = Database::open(&db_path)
        .with_context(|| format!("opening session database {}", db_path.display()))?;

    let broker = Broker::new(config.broker);
    broker.register_unit(
        cli.unit.clone(),
        Arc::new(SessionRepo::new(db)),
        Arc::new(EchoFactory::new(Duration::from_millis(cli.echo_delay_ms))),
    );
    let printer = tokio::spawn(print_events(broker.subscribe()));
    info!(
        unit = %cli.unit,
        db = %db_path.display(),
        log_overrides = ?telemetry.module_levels(),
        "nexus broker ready"
    );

    let stats = tokio::select! {
        stats = run_input(&broker, &cli) => stats?,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, shutting down");
            ReplayStats::default()
        }
    };

    if !wait_idle(&broker, Duration::from_secs(cli.drain_timeout_secs)).await {
        warn!(timeout_secs = cli.drain_timeout_secs, "queues did not drain");
    }

    let cancelled = broker.shutdown();
    printer.abort();
    info!(
        sent = stats.sent,
        rejected = stats.rejected,
        malformed = stats.malformed,
        cancelled,
        "nexus stopped"
    );
    Ok(())
}

async fn run_input(broker: &Broker, cli: &Cli) -> anyhow::Result<ReplayStats> {
    let stats = match &cli.input {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("opening input {}", path.display()))?;
            replay(broker, BufReader::new(file)).await?
        }
        None => replay(broker, BufReader::new(tokio::io::stdin())).await?,
    };
    Ok(stats)
}
