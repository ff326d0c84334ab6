//! `tg`: run the tracegraph pipeline or inspect stored runs.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};

use tracegraph_core::config::{Config, LogFormat};
use tracegraph_core::export::{ExportFormat, LlmExecutionTrace};
use tracegraph_core::hub::{Hub, run_forwarder};
use tracegraph_core::logging::init_logging;
use tracegraph_core::persistence::{DEFAULT_RUN_LIMIT, GraphStore};
use tracegraph_core::pubsub::{Bus, UPDATES_PATTERN};
use tracegraph_core::stream_log::StreamLog;
use tracegraph_core::web::{AppState, WebServerConfig, start_web_server, wait_for_shutdown_signal};
use tracegraph_core::worker::Worker;

#[derive(Parser, Debug)]
#[command(name = "tg")]
#[command(about = "Turn telemetry feeds into live causal call graphs")]
#[command(version = tracegraph_core::VERSION)]
struct Cli {
    /// TOML config file; defaults and environment overrides apply without one
    #[arg(short, long, global = true, env = "TRACEGRAPH_CONFIG")]
    config: Option<PathBuf>,

    /// Log level filter (overrides config and LOG_LEVEL)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log output format
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Web server, delta forwarder and one worker in a single process
    Serve,
    /// Web server and delta forwarder only
    Web,
    /// Graph worker only
    Worker {
        /// Consumer name within the group (overrides config)
        #[arg(long)]
        consumer: Option<String>,
    },
    /// List recent runs as JSON
    Runs {
        #[arg(long, default_value_t = DEFAULT_RUN_LIMIT)]
        limit: usize,
    },
    /// Render a stored run for an LLM
    Export {
        run_id: String,
        /// json, prompt or jsonld
        #[arg(long, default_value = "json")]
        format: ExportFormat,
    },
    /// Print the effective configuration as JSON
    Config,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            if let Some(core) = err.downcast_ref::<tracegraph_core::Error>() {
                eprintln!();
                eprint!("{}", core.remediation().render_plain());
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    init_logging(&config.logging).context("initializing logging")?;

    match cli.command {
        Command::Serve => serve(&config, true, true).await,
        Command::Web => serve(&config, true, false).await,
        Command::Worker { consumer } => {
            if consumer.is_some() {
                config.worker.consumer = consumer;
            }
            serve(&config, false, true).await
        }
        Command::Runs { limit } => {
            let store = GraphStore::open(&config.storage.database_path)?;
            let runs = store.list_runs(limit.max(1)).await?;
            println!("{}", serde_json::to_string_pretty(&runs)?);
            Ok(())
        }
        Command::Export { run_id, format } => {
            let store = GraphStore::open(&config.storage.database_path)?;
            let graph = store
                .load_graph(&run_id)
                .await?
                .with_context(|| format!("run '{run_id}' not found"))?;
            let timestamp = graph.run.ended_at.unwrap_or(graph.run.created_at);
            let trace = LlmExecutionTrace::build(&run_id, timestamp, &graph.nodes, &graph.edges);
            println!("{}", trace.render(format)?);
            Ok(())
        }
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

/// Run the long-lived roles until Ctrl+C or SIGTERM.
async fn serve(config: &Config, with_web: bool, with_worker: bool) -> Result<()> {
    let path = &config.storage.database_path;
    let log = StreamLog::open(path)?;
    let store = GraphStore::open(path)?;
    let bus = Bus::open(path)?;
    let (stop_tx, stop_rx) = watch::channel(false);

    let mut tasks = Vec::new();
    if with_worker {
        let mut worker = Worker::new(log.clone(), store.clone(), bus.clone(), config);
        info!(consumer = worker.consumer(), "starting worker");
        let shutdown = stop_rx.clone();
        tasks.push(tokio::spawn(async move { worker.run(shutdown).await }));
    }

    let mut web = None;
    if with_web {
        let hub = Hub::new(config.web.viewer_queue, config.web.max_consecutive_drops);
        let forwarder = tokio::spawn(run_forwarder(
            hub.clone(),
            bus.clone(),
            UPDATES_PATTERN,
            stop_rx.clone(),
        ));
        tasks.push(forwarder);
        let state = AppState::new(log, store, hub, config);
        web = Some(start_web_server(WebServerConfig::from_config(config), state).await?);
    }

    wait_for_shutdown_signal().await?;
    info!("shutdown signal received");
    let _ = stop_tx.send(true);

    if let Some(handle) = web {
        handle.shutdown().await?;
    }
    for task in tasks {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "task exited with error"),
            Err(e) => warn!(error = %e, "task panicked"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn export_arguments_parse() {
        let cli = Cli::parse_from(["tg", "--log-format", "json", "export", "r1", "--format", "prompt"]);
        assert_eq!(cli.log_format, Some(LogFormat::Json));
        match cli.command {
            Command::Export { run_id, format } => {
                assert_eq!(run_id, "r1");
                assert_eq!(format, ExportFormat::Prompt);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn worker_consumer_flag() {
        let cli = Cli::parse_from(["tg", "worker", "--consumer", "w-1"]);
        assert!(matches!(cli.command, Command::Worker { consumer: Some(ref c) } if c == "w-1"));
    }
}
