//! tracegraph-core: streaming telemetry events into causal call graphs.
//!
//! The pipeline, leaves first:
//!
//! - [`event`]: wire shape and validation of one telemetry line
//! - [`ingest`]: newline-delimited feed splitting and batched log appends
//! - [`stream_log`]: durable per-run log with consumer groups
//! - [`correlator`]: per-run graph state machine and deltas
//! - [`worker`]: the claim/apply/emit/persist/ack loop
//! - [`persistence`]: run, node, edge, cursor and snapshot storage
//! - [`pubsub`] and [`hub`]: delta fan-out to live viewers
//! - [`export`]: LLM-oriented renderings of a run
//! - [`web`]: HTTP and WebSocket surface

#![forbid(unsafe_code)]

pub mod classify;
pub mod config;
pub mod correlator;
mod db;
pub mod error;
pub mod event;
pub mod export;
pub mod hub;
pub mod ingest;
pub mod logging;
pub mod persistence;
pub mod pubsub;
pub mod retry;
pub mod routing;
pub mod stream_log;
pub mod web;
pub mod worker;

pub use error::{Error, Result};

/// Crate version, reported by `/health` and the CLI.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
