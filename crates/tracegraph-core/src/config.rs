//! Configuration for tracegraph.
//!
//! Every section is `#[serde(default)]`, so an empty TOML file (or none at
//! all) yields the defaults. Environment variables are applied on top of the
//! file, which keeps container deployments file-free.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};
use crate::logging::LogConfig;

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-friendly output for interactive use
    #[default]
    Pretty,
    /// JSON lines for machines
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected one of: pretty, json")),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub stream: StreamConfig,
    pub worker: WorkerConfig,
    pub ingest: IngestConfig,
    pub web: WebConfig,
    pub storage: StorageConfig,
    pub logging: LogConfig,
}

/// Durable log and consumer-group settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Namespace prefix; a run's log is `<prefix>:<runId>`.
    pub prefix: String,
    /// Consumer group shared by every worker process.
    pub group: String,
    /// Maximum entries claimed per stream per read.
    pub batch_count: usize,
    /// How long a group read blocks when no entries are available.
    pub block_ms: u64,
    /// Entries pending longer than this on another consumer are reclaimed.
    pub claim_idle_ms: u64,
    /// Interval between scans for newly created run logs.
    pub rescan_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            prefix: "tal".to_string(),
            group: "graph-worker".to_string(),
            batch_count: 2000,
            block_ms: 20,
            claim_idle_ms: 30_000,
            rescan_ms: 1_000,
        }
    }
}

impl StreamConfig {
    #[must_use]
    pub fn block(&self) -> Duration {
        Duration::from_millis(self.block_ms)
    }

    #[must_use]
    pub fn claim_idle(&self) -> Duration {
        Duration::from_millis(self.claim_idle_ms)
    }

    #[must_use]
    pub fn rescan_interval(&self) -> Duration {
        Duration::from_millis(self.rescan_ms)
    }
}

/// Stream-consumer worker settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Delta emissions per second.
    pub fps: u32,
    /// Minimum time between incremental persists of one run.
    pub persist_interval_ms: u64,
    /// Minimum time between full snapshots of one run.
    pub snapshot_interval_ms: u64,
    /// Disable to run the worker as a pure broadcaster.
    pub persist_enabled: bool,
    /// Consumer name inside the group. Defaults to `w-<pid>`.
    pub consumer: Option<String>,
    /// Worker identities sharing the group, for sticky run routing.
    /// Empty means this worker owns every run.
    pub members: Vec<String>,
    /// Virtual nodes per member on the routing ring.
    pub vnodes: u32,
    /// Resident GraphState bound; see the eviction rules in `worker`.
    pub max_resident_runs: usize,
    /// Notifications older than this are trimmed from the bus.
    pub bus_retention_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            fps: 5,
            persist_interval_ms: 1_000,
            snapshot_interval_ms: 30_000,
            persist_enabled: true,
            consumer: None,
            members: Vec::new(),
            vnodes: 128,
            max_resident_runs: 256,
            bus_retention_ms: 60_000,
        }
    }
}

impl WorkerConfig {
    /// Emission cadence derived from `fps`.
    #[must_use]
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(1000 / u64::from(self.fps.max(1)))
    }

    #[must_use]
    pub fn persist_interval(&self) -> Duration {
        Duration::from_millis(self.persist_interval_ms)
    }

    #[must_use]
    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot_interval_ms)
    }

    #[must_use]
    pub fn bus_retention(&self) -> Duration {
        Duration::from_millis(self.bus_retention_ms)
    }

    /// Effective consumer name.
    #[must_use]
    pub fn consumer_name(&self) -> String {
        self.consumer
            .clone()
            .unwrap_or_else(|| format!("w-{}", std::process::id()))
    }
}

/// Ingest endpoint settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Parsed lines buffered before one batched append.
    pub flush_every: usize,
    /// Lines longer than this are rejected without buffering them.
    pub max_line_bytes: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            flush_every: 512,
            max_line_bytes: 1024 * 1024,
        }
    }
}

/// HTTP surface settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub host: String,
    pub port: u16,
    /// Must be `true` to bind on a non-localhost address.
    pub allow_public_bind: bool,
    /// Outbound deltas buffered per viewer.
    pub viewer_queue: usize,
    /// A viewer missing this many deltas in a row is disconnected.
    pub max_consecutive_drops: u64,
    /// Upper bound on one WebSocket send.
    pub send_timeout_ms: u64,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            allow_public_bind: false,
            viewer_queue: 256,
            max_consecutive_drops: 64,
            send_timeout_ms: 5_000,
        }
    }
}

impl WebConfig {
    #[must_use]
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

/// Database location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("tracegraph.db"),
        }
    }
}

impl Config {
    /// Load from an optional TOML file, then apply process environment
    /// overrides and validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML file without environment overrides.
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()).into());
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(format!("{}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| ConfigError::ParseError(e.to_string()).into())
    }

    /// Apply environment-style overrides through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("STREAM_PREFIX") {
            self.stream.prefix = v;
        }
        if let Some(v) = lookup("GROUP") {
            self.stream.group = v;
        }
        if let Some(v) = lookup("BATCH_COUNT") {
            self.stream.batch_count = parse_env("BATCH_COUNT", &v)?;
        }
        if let Some(v) = lookup("BLOCK_MS") {
            self.stream.block_ms = parse_env("BLOCK_MS", &v)?;
        }
        if let Some(v) = lookup("FPS") {
            self.worker.fps = parse_env("FPS", &v)?;
        }
        if let Some(v) = lookup("PERSIST_INTERVAL_MS") {
            self.worker.persist_interval_ms = parse_env("PERSIST_INTERVAL_MS", &v)?;
        }
        if let Some(v) = lookup("SNAPSHOT_INTERVAL_MS") {
            self.worker.snapshot_interval_ms = parse_env("SNAPSHOT_INTERVAL_MS", &v)?;
        }
        if let Some(v) = lookup("PERSIST_ENABLED") {
            self.worker.persist_enabled = parse_bool("PERSIST_ENABLED", &v)?;
        }
        if let Some(v) = lookup("CONSUMER_NAME") {
            self.worker.consumer = Some(v);
        }
        if let Some(v) = lookup("WORKER_MEMBERS") {
            self.worker.members = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(v) = lookup("HTTP_HOST") {
            self.web.host = v;
        }
        if let Some(v) = lookup("HTTP_PORT") {
            self.web.port = parse_env("HTTP_PORT", &v)?;
        }
        if let Some(v) = lookup("DATABASE_PATH") {
            self.storage.database_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = lookup("LOG_FORMAT") {
            self.logging.format = v
                .parse()
                .map_err(|e: String| ConfigError::ValidationError(format!("LOG_FORMAT: {e}")))?;
        }
        Ok(())
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| -> Result<()> { Err(ConfigError::ValidationError(msg).into()) };
        if self.stream.prefix.is_empty() || self.stream.prefix.contains(':') {
            return fail(format!(
                "stream.prefix must be non-empty and contain no ':' (got {:?})",
                self.stream.prefix
            ));
        }
        if self.stream.group.is_empty() {
            return fail("stream.group must be non-empty".to_string());
        }
        if self.stream.batch_count == 0 {
            return fail("stream.batch_count must be at least 1".to_string());
        }
        if self.worker.fps == 0 || self.worker.fps > 1000 {
            return fail(format!("worker.fps must be 1..=1000 (got {})", self.worker.fps));
        }
        if self.worker.vnodes == 0 {
            return fail("worker.vnodes must be at least 1".to_string());
        }
        if self.worker.max_resident_runs == 0 {
            return fail("worker.max_resident_runs must be at least 1".to_string());
        }
        if !self.worker.members.is_empty() {
            let me = self.worker.consumer_name();
            if !self.worker.members.contains(&me) {
                return fail(format!(
                    "consumer {me:?} is not listed in worker.members {:?}",
                    self.worker.members
                ));
            }
        }
        if self.ingest.flush_every == 0 {
            return fail("ingest.flush_every must be at least 1".to_string());
        }
        if self.web.viewer_queue == 0 {
            return fail("web.viewer_queue must be at least 1".to_string());
        }
        Ok(())
    }
}

fn parse_env<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| ConfigError::ValidationError(format!("{key}={value:?}: {e}")).into())
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::ValidationError(format!("{key}={value:?}: expected a boolean")).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn overrides(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_pipeline_constants() {
        let config = Config::default();
        assert_eq!(config.stream.prefix, "tal");
        assert_eq!(config.stream.group, "graph-worker");
        assert_eq!(config.stream.batch_count, 2000);
        assert_eq!(config.stream.block_ms, 20);
        assert_eq!(config.worker.fps, 5);
        assert_eq!(config.worker.frame_interval(), Duration::from_millis(200));
        assert_eq!(config.worker.persist_interval_ms, 1_000);
        assert_eq!(config.worker.snapshot_interval_ms, 30_000);
        assert!(config.worker.persist_enabled);
        assert_eq!(config.ingest.flush_every, 512);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn empty_toml_yields_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let config = Config::from_toml(
            r#"
            [stream]
            prefix = "feed"

            [worker]
            fps = 10
            "#,
        )
        .unwrap();
        assert_eq!(config.stream.prefix, "feed");
        assert_eq!(config.stream.group, "graph-worker");
        assert_eq!(config.worker.fps, 10);
        assert_eq!(config.worker.frame_interval(), Duration::from_millis(100));
    }

    #[test]
    fn malformed_toml_is_parse_error() {
        let err = Config::from_toml("[stream\nprefix=").unwrap_err();
        assert!(matches!(err, crate::Error::Config(ConfigError::ParseError(_))));
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = Config::default();
        config
            .apply_overrides(overrides(&[
                ("STREAM_PREFIX", "t2"),
                ("GROUP", "g"),
                ("BATCH_COUNT", "10"),
                ("BLOCK_MS", "5"),
                ("FPS", "20"),
                ("PERSIST_INTERVAL_MS", "250"),
                ("SNAPSHOT_INTERVAL_MS", "500"),
                ("PERSIST_ENABLED", "false"),
                ("CONSUMER_NAME", "w-a"),
                ("WORKER_MEMBERS", "w-a, w-b,,"),
                ("HTTP_PORT", "9090"),
                ("LOG_FORMAT", "json"),
            ]))
            .unwrap();
        assert_eq!(config.stream.prefix, "t2");
        assert_eq!(config.stream.group, "g");
        assert_eq!(config.stream.batch_count, 10);
        assert_eq!(config.stream.block_ms, 5);
        assert_eq!(config.worker.fps, 20);
        assert_eq!(config.worker.persist_interval_ms, 250);
        assert_eq!(config.worker.snapshot_interval_ms, 500);
        assert!(!config.worker.persist_enabled);
        assert_eq!(config.worker.consumer_name(), "w-a");
        assert_eq!(config.worker.members, vec!["w-a", "w-b"]);
        assert_eq!(config.web.port, 9090);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn unparseable_env_value_is_rejected() {
        let mut config = Config::default();
        let err = config
            .apply_overrides(overrides(&[("FPS", "fast")]))
            .unwrap_err();
        assert!(err.to_string().contains("FPS"));
    }

    #[test]
    fn validation_rejects_zero_fps_and_bad_prefix() {
        let mut config = Config::default();
        config.worker.fps = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.stream.prefix = "a:b".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_requires_consumer_in_member_list() {
        let mut config = Config::default();
        config.worker.consumer = Some("w-c".to_string());
        config.worker.members = vec!["w-a".to_string(), "w-b".to_string()];
        assert!(config.validate().is_err());

        config.worker.consumer = Some("w-b".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn default_consumer_name_uses_pid() {
        let name = WorkerConfig::default().consumer_name();
        assert_eq!(name, format!("w-{}", std::process::id()));
    }

    #[test]
    fn load_missing_file_fails() {
        let err = Config::from_file(Path::new("/nonexistent/tracegraph.toml")).unwrap_err();
        assert!(matches!(err, crate::Error::Config(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn log_format_from_str() {
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("xml".parse::<LogFormat>().is_err());
        assert_eq!(LogFormat::Json.to_string(), "json");
    }
}
