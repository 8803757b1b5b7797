//! berthd — the berth daemon.
//!
//! Assembles the state store, lifecycle manager, scheduler and remote
//! execution into one coordinator and feeds it cluster events.
//!
//! # Usage
//!
//! ```text
//! berthd run --config berth.toml --events events.jsonl
//! berthd run --events - --no-realize < events.jsonl
//! berthd check-config --config berth.toml
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::io::BufReader;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use berth_core::{BerthConfig, TaskRecordSink, epoch_millis};
use berth_executor::DockerConnector;
use berth_lifecycle::LifecycleManager;
use berth_state::StateStore;
use berthd::{ClusterEvent, Coordinator, Envelope, JsonLinesDriver, forward_lines};

const DEFAULT_FILTER: &str = "info,berthd=debug,berth=debug";

#[derive(Parser)]
#[command(name = "berthd", about = "Berth scheduler daemon")]
struct Cli {
    /// Log output format (logs go to stderr).
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Process cluster events; decisions are written to stdout as JSON lines.
    Run {
        /// Path to berth.toml. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Newline-delimited JSON events, or `-` for stdin.
        #[arg(long, default_value = "-")]
        events: String,

        /// Overrides `state.data_dir`.
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Confirm placements without contacting container runtimes.
        #[arg(long)]
        no_realize: bool,

        /// Close a health interval every `lifecycle.health_check_interval`.
        #[arg(long)]
        health_ticks: bool,
    },
    /// Validate a config file and print the effective settings.
    CheckConfig {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Run {
            config,
            events,
            data_dir,
            no_realize,
            health_ticks,
        } => {
            let mut config = load_config(config.as_deref())?;
            if let Some(dir) = data_dir {
                config.state.data_dir = dir;
            }
            run(config, events, no_realize, health_ticks).await
        }
        Command::CheckConfig { config } => {
            let config = load_config(config.as_deref())?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<BerthConfig> {
    let config = match path {
        Some(path) => BerthConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => BerthConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

async fn run(
    config: BerthConfig,
    events: String,
    no_realize: bool,
    health_ticks: bool,
) -> anyhow::Result<()> {
    info!("berth daemon starting");

    // ── State and lifecycle ────────────────────────────────────

    let data_dir = &config.state.data_dir;
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("creating {}", data_dir.display()))?;
    let db_path = data_dir.join("berth.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let lifecycle = LifecycleManager::recover(config.lifecycle.clone(), store.clone(), epoch_millis())?;

    // ── Coordinator ────────────────────────────────────────────

    let driver = Arc::new(JsonLinesDriver::new(std::io::stdout()));
    let store_sink: Arc<dyn TaskRecordSink> = Arc::new(store);
    let stdout_sink: Arc<dyn TaskRecordSink> = driver.clone();
    let mut coordinator = Coordinator::new(
        config.scheduler.clone(),
        lifecycle,
        driver,
        vec![store_sink, stdout_sink],
    );
    if no_realize {
        info!("remote execution disabled, placements are confirmed directly");
    } else {
        let connector = DockerConnector::new(
            config.executor.docker_port,
            config.executor.attempt_timeout.get(),
        );
        coordinator = coordinator.with_realizer(Arc::new(connector), config.executor.clone());
        info!(docker_port = config.executor.docker_port, "remote execution enabled");
    }

    // ── Event sources ──────────────────────────────────────────

    let (tx, rx) = mpsc::channel::<Envelope>(1024);

    let reader_tx = tx.clone();
    let source = events.clone();
    let reader = tokio::spawn(async move {
        if source == "-" {
            forward_lines(BufReader::new(tokio::io::stdin()), reader_tx).await
        } else {
            let file = tokio::fs::File::open(&source)
                .await
                .with_context(|| format!("opening events file {source}"))?;
            forward_lines(BufReader::new(file), reader_tx).await
        }
    });

    let ticker = health_ticks.then(|| {
        let tx = tx.clone();
        let period = config.lifecycle.health_check_interval.get();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                if tx.send(Envelope::now(ClusterEvent::HealthTick)).await.is_err() {
                    break;
                }
            }
        })
    });
    drop(tx);

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    coordinator.run(rx, shutdown_rx).await?;

    if let Some(ticker) = ticker {
        ticker.abort();
    }
    if reader.is_finished() {
        match reader.await {
            Ok(Ok(count)) => info!(events = count, "event source drained"),
            Ok(Err(e)) => return Err(e),
            Err(e) => warn!(error = %e, "event reader task failed"),
        }
    } else {
        reader.abort();
    }

    info!(
        pending = coordinator.scheduler().pending_len(),
        placed = coordinator.scheduler().placed_len(),
        "berth daemon stopped"
    );
    Ok(())
}
