//! Error types for tracegraph-core

use std::fmt::Write;
use thiserror::Error;

/// Remediation command for resolving an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RemediationCommand {
    /// Short label describing the command purpose
    pub label: String,
    /// Command to run
    pub command: String,
}

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Suggested commands to resolve or diagnose the issue
    pub commands: Vec<RemediationCommand>,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    /// Create a new remediation with a summary
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            commands: Vec::new(),
            alternatives: Vec::new(),
        }
    }

    /// Add a suggested command
    #[must_use]
    pub fn command(mut self, label: impl Into<String>, command: impl Into<String>) -> Self {
        self.commands.push(RemediationCommand {
            label: label.into(),
            command: command.into(),
        });
        self
    }

    /// Add an alternative suggestion
    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);

        if !self.commands.is_empty() {
            let _ = writeln!(output, "  Commands:");
            for cmd in &self.commands {
                let _ = writeln!(output, "    - {}: {}", cmd.label, cmd.command);
            }
        }

        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }

        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for tracegraph-core
#[derive(Error, Debug)]
pub enum Error {
    /// Storage errors (stream log, graph store, notification bus)
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Telemetry event validation errors
    #[error("Event error: {0}")]
    Event(#[from] EventError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Runtime errors (task joins, bind failures, channel failures)
    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl Error {
    /// Return remediation guidance for this error.
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Storage(err) => err.remediation(),
            Self::Config(err) => err.remediation(),
            Self::Event(err) => err.remediation(),
            Self::Io(_) => Remediation::new("Check filesystem permissions and paths, then retry.")
                .alternative("Verify the database directory exists and is writable."),
            Self::Json(_) => Remediation::new("Validate the JSON input and retry.")
                .command("Validate JSON", "python -m json.tool < input.json"),
            Self::Runtime(_) => Remediation::new("Retry the command; check logs if it persists.")
                .command("Verbose logs", "RUST_LOG=tracegraph_core=debug tg serve"),
        }
    }

    /// Whether retrying the failed operation may succeed.
    ///
    /// Busy/locked databases and I/O hiccups are transient; validation,
    /// missing records and corrupt data are not.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Storage(err) => err.is_transient(),
            Self::Io(_) => true,
            _ => false,
        }
    }
}

/// Storage-specific errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Database busy: {0}")]
    Busy(String),

    #[error("Corrupt snapshot for run {run_id}: {details}")]
    CorruptSnapshot { run_id: String, details: String },

    #[error("Not found: {0}")]
    NotFound(String),
}

impl StorageError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::Database(_) => {
                Remediation::new("Database operation failed. Check permissions and retry.")
                    .alternative("Ensure the database directory is writable.")
            }
            Self::Busy(_) => Remediation::new(
                "Another process holds the database lock. Retry after it finishes.",
            )
            .alternative("Run ingest, worker and web against the same database path."),
            Self::CorruptSnapshot { run_id, .. } => Remediation::new(format!(
                "The latest snapshot for run {run_id} cannot be decoded."
            ))
            .alternative("Delete the snapshot row; the run rebuilds from its log on replay."),
            Self::NotFound(_) => Remediation::new("The requested resource was not found.")
                .command("List runs", "curl -s localhost:8080/api/runs")
                .alternative("Verify the run id before accessing it."),
        }
    }

    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Busy(_))
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked) => {
                Self::Busy(err.to_string())
            }
            _ => Self::Database(err.to_string()),
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(StorageError::from(err))
    }
}

/// Configuration-specific errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config: {0}")]
    ReadFailed(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Invalid config: {0}")]
    ValidationError(String),
}

impl ConfigError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::FileNotFound(path) => {
                Remediation::new(format!("Create the config file or point --config elsewhere: {path}"))
                    .alternative("Omit --config to run with defaults and environment overrides.")
            }
            Self::ReadFailed(_) => Remediation::new("Check that the config file is readable."),
            Self::ParseError(_) => Remediation::new("Fix the TOML syntax in the config file.")
                .alternative("Compare against the documented [stream]/[worker]/[web] sections."),
            Self::ValidationError(_) => {
                Remediation::new("Correct the offending setting or environment variable.")
                    .command("Show effective env", "env | grep -E 'STREAM_|GROUP|FPS|PERSIST'")
            }
        }
    }
}

/// Telemetry line validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    #[error("line is not valid JSON: {0}")]
    NotJson(String),

    #[error("line is not a JSON object")]
    NotObject,

    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("invalid field `{field}`: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("line of {len} bytes exceeds the {max} byte limit")]
    LineTooLong { len: usize, max: usize },

    #[error("line is not valid UTF-8")]
    InvalidUtf8,

    #[error("request body interrupted: {0}")]
    BodyInterrupted(String),
}

impl EventError {
    #[must_use]
    pub fn remediation(&self) -> Remediation {
        match self {
            Self::BodyInterrupted(_) => {
                Remediation::new("The client stopped sending mid-body. Resend the feed.")
                    .alternative("Lines flushed before the interruption were kept.")
            }
            _ => Remediation::new(
                "Emit one JSON object per line with runId, seq, ts and kind.",
            )
            .command(
                "Example line",
                r#"{"runId":"r1","seq":0,"ts":1000,"kind":"call_start","span":"main"}"#,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remediation_available_for_error_variants() {
        let json_err = serde_json::from_str::<serde_json::Value>("").unwrap_err();
        let errors = vec![
            Error::Storage(StorageError::Database("db error".to_string())),
            Error::Storage(StorageError::Busy("locked".to_string())),
            Error::Storage(StorageError::CorruptSnapshot {
                run_id: "r1".to_string(),
                details: "eof".to_string(),
            }),
            Error::Storage(StorageError::NotFound("run r1".to_string())),
            Error::Config(ConfigError::FileNotFound("tg.toml".to_string())),
            Error::Config(ConfigError::ValidationError("fps".to_string())),
            Error::Event(EventError::MissingField("runId")),
            Error::Event(EventError::BodyInterrupted("reset".to_string())),
            Error::Io(std::io::Error::other("io")),
            Error::Json(json_err),
            Error::Runtime("join".to_string()),
        ];

        for err in errors {
            let rendered = err.remediation().render_plain();
            assert!(rendered.starts_with("To fix:"), "{err}: {rendered}");
        }
    }

    #[test]
    fn error_display_includes_context() {
        let err = Error::Event(EventError::InvalidField {
            field: "seq",
            reason: "must be a non-negative integer".to_string(),
        });
        assert_eq!(
            err.to_string(),
            "Event error: invalid field `seq`: must be a non-negative integer"
        );
    }

    #[test]
    fn busy_sqlite_errors_are_transient() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".to_string()),
        );
        let err = Error::from(busy);
        assert!(err.is_transient());

        let constraint = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CONSTRAINT),
            None,
        );
        assert!(!Error::from(constraint).is_transient());
    }

    #[test]
    fn event_errors_are_permanent() {
        assert!(!Error::Event(EventError::NotObject).is_transient());
        assert!(Error::Io(std::io::Error::other("pipe")).is_transient());
    }

    #[test]
    fn render_plain_lists_commands_and_alternatives() {
        let text = Remediation::new("do the thing")
            .command("Check", "tg worker --help")
            .alternative("or not")
            .render_plain();
        assert!(text.contains("  do the thing"));
        assert!(text.contains("    - Check: tg worker --help"));
        assert!(text.contains("    - or not"));
    }
}
