//! Structured logging for tracegraph.
//!
//! One formatter on stderr (pretty or JSON lines), the same formatter
//! without colour on an optional append-only file. Field names used across
//! the crate: `run_id`, `seq`, `stream`, `entry_id`, `viewer_id`.
//!
//! Targets are `tracegraph.ingest`, `tracegraph.worker`, `tracegraph.hub`,
//! `tracegraph.web` and `tracegraph.store`.

pub use crate::config::LogFormat;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use tracing::Subscriber;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::fmt::time::SystemTime;
use tracing_subscriber::layer::Layered;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

type Filtered = Layered<EnvFilter, Registry>;
type BoxedLayer<S> = Box<dyn Layer<S> + Send + Sync>;

/// Appended to the configured level so HTTP plumbing stays quiet.
const DEPENDENCY_DIRECTIVES: &[&str] = &["hyper=warn", "h2=warn", "tower=warn"];

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Level or filter directives; `RUST_LOG` wins when set
    pub level: String,
    pub format: LogFormat,
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("invalid log filter '{directives}': {source}")]
    Filter {
        directives: String,
        source: tracing_subscriber::filter::ParseError,
    },

    #[error("failed to open log file: {0}")]
    FileCreate(#[from] io::Error),

    #[error("failed to set global subscriber: {0}")]
    SetSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Install the global subscriber. Errors if one is already installed.
pub fn init_logging(config: &LogConfig) -> Result<(), LogError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => level_filter(&config.level)?,
    };

    let mut layers: Vec<BoxedLayer<Filtered>> =
        vec![format_layer(config.format, io::stderr, true)];
    if let Some(path) = &config.file {
        layers.push(format_layer(config.format, open_log_file(path)?, false));
    }
    tracing::subscriber::set_global_default(
        tracing_subscriber::registry().with(filter).with(layers),
    )?;

    tracing::info!(
        target: "tracegraph.web",
        log_level = %config.level,
        log_format = %config.format,
        log_file = ?config.file,
        "logging initialized"
    );
    Ok(())
}

fn level_filter(level: &str) -> Result<EnvFilter, LogError> {
    let directives = std::iter::once(level.trim())
        .chain(DEPENDENCY_DIRECTIVES.iter().copied())
        .collect::<Vec<_>>()
        .join(",");
    EnvFilter::try_new(&directives).map_err(|source| LogError::Filter { directives, source })
}

fn format_layer<S, W>(format: LogFormat, writer: W, ansi: bool) -> BoxedLayer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    match format {
        LogFormat::Pretty => fmt::layer()
            .with_writer(writer)
            .with_target(true)
            .with_ansi(ansi)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_timer(SystemTime)
            .with_writer(writer)
            .with_target(true)
            .with_current_span(true)
            .with_span_list(false)
            .flatten_event(true)
            .boxed(),
    }
}

fn open_log_file(path: &Path) -> io::Result<std::fs::File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::OpenOptions::new().create(true).append(true).open(path)
}
