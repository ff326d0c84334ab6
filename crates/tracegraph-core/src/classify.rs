//! Node and edge typing.
//!
//! Producers that know what they emit set an explicit discriminator in the
//! payload (`data.nodeType`, `data.edgeKind`); everything else, including
//! OTLP-derived input, falls back to field-shape heuristics. The variant sets
//! are closed: unknown discriminator values fall through to the heuristics.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::event::TelemetryEvent;

/// Payload key carrying an explicit node type.
pub const NODE_TYPE_KEY: &str = "nodeType";
/// Payload key carrying an explicit edge kind.
pub const EDGE_KIND_KEY: &str = "edgeKind";

/// Semantic type of a graph node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NodeType {
    Function,
    External,
    #[serde(rename = "IO")]
    Io,
    Service,
    #[serde(rename = "DB")]
    Db,
    Event,
    Error,
}

impl NodeType {
    pub const ALL: [Self; 7] = [
        Self::Function,
        Self::External,
        Self::Io,
        Self::Service,
        Self::Db,
        Self::Event,
        Self::Error,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Function => "Function",
            Self::External => "External",
            Self::Io => "IO",
            Self::Service => "Service",
            Self::Db => "DB",
            Self::Event => "Event",
            Self::Error => "Error",
        }
    }

    /// Case-insensitive parse of a discriminator value.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(value))
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Causal relationship carried by an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeKind {
    Calls,
    Returns,
    Emits,
    Reads,
    Writes,
    Queries,
    Requests,
}

impl EdgeKind {
    pub const ALL: [Self; 7] = [
        Self::Calls,
        Self::Returns,
        Self::Emits,
        Self::Reads,
        Self::Writes,
        Self::Queries,
        Self::Requests,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Calls => "calls",
            Self::Returns => "returns",
            Self::Emits => "emits",
            Self::Reads => "reads",
            Self::Writes => "writes",
            Self::Queries => "queries",
            Self::Requests => "requests",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str().eq_ignore_ascii_case(value))
    }
}

impl fmt::Display for EdgeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether an event kind itself denotes an exception.
#[must_use]
pub fn is_error_kind(kind: &str) -> bool {
    let kind = kind.to_ascii_lowercase();
    matches!(kind.as_str(), "error" | "exception" | "panic")
        || kind.ends_with("_error")
        || kind.ends_with(".error")
}

/// Infer the node type for an event.
#[must_use]
pub fn classify_node(event: &TelemetryEvent) -> NodeType {
    let data = event.data_object();
    if let Some(explicit) = data
        .and_then(|d| d.get(NODE_TYPE_KEY))
        .and_then(Value::as_str)
        .and_then(NodeType::parse)
    {
        return explicit;
    }

    if is_error_kind(&event.kind) {
        return NodeType::Error;
    }

    let kind = event.kind.to_ascii_lowercase();
    let declared = data
        .and_then(|d| d.get("type"))
        .and_then(Value::as_str)
        .map(str::to_ascii_lowercase);
    let declared = declared.as_deref().unwrap_or("");

    if matches!(declared, "db" | "database" | "sql")
        || kind.starts_with("db")
        || has_key(data, &["sql", "query", "statement", "db"], &["db."])
    {
        return NodeType::Db;
    }
    if matches!(declared, "http" | "client" | "fetch")
        || kind.starts_with("http")
        || kind.starts_with("fetch")
        || has_key(data, &["url", "statusCode", "http"], &["http.", "url."])
    {
        return NodeType::External;
    }
    if matches!(declared, "io" | "fs" | "file")
        || kind.starts_with("fs")
        || kind.starts_with("io")
        || has_key(data, &["file", "path", "fd"], &["fs.", "file."])
    {
        return NodeType::Io;
    }
    if matches!(declared, "rpc" | "server" | "grpc")
        || kind.starts_with("rpc")
        || kind.starts_with("server")
        || has_key(data, &["rpc", "service"], &["rpc.", "server."])
    {
        return NodeType::Service;
    }
    if kind.starts_with("call") || kind == "function" || matches!(declared, "function" | "call") {
        return NodeType::Function;
    }
    NodeType::Event
}

/// Infer the kind of the edge into `child` created by `event`.
#[must_use]
pub fn classify_edge(event: &TelemetryEvent, child: NodeType) -> EdgeKind {
    if let Some(explicit) = event
        .data_object()
        .and_then(|d| d.get(EDGE_KIND_KEY))
        .and_then(Value::as_str)
        .and_then(EdgeKind::parse)
    {
        return explicit;
    }
    match child {
        NodeType::Db => EdgeKind::Queries,
        NodeType::External => EdgeKind::Requests,
        NodeType::Io => {
            if is_write(event) {
                EdgeKind::Writes
            } else {
                EdgeKind::Reads
            }
        }
        NodeType::Event => EdgeKind::Emits,
        NodeType::Function | NodeType::Service | NodeType::Error => EdgeKind::Calls,
    }
}

fn is_write(event: &TelemetryEvent) -> bool {
    const WRITE_WORDS: [&str; 6] = ["write", "append", "put", "create", "delete", "w"];
    let mode = event
        .data_str("mode")
        .or_else(|| event.data_str("operation"))
        .or_else(|| event.data_str("op"))
        .map(str::to_ascii_lowercase);
    if let Some(mode) = mode {
        return WRITE_WORDS
            .iter()
            .any(|w| mode == *w || (w.len() > 1 && mode.starts_with(w)));
    }
    let kind = event.kind.to_ascii_lowercase();
    kind.contains("write") || kind.contains("append")
}

fn has_key(data: Option<&Map<String, Value>>, exact: &[&str], prefixes: &[&str]) -> bool {
    data.is_some_and(|d| {
        d.keys().any(|k| {
            exact.iter().any(|e| k.as_str() == *e) || prefixes.iter().any(|p| k.starts_with(p))
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ev(kind: &str, data: Value) -> TelemetryEvent {
        TelemetryEvent::new("r", 0, 0, kind).with_data(data)
    }

    #[test]
    fn explicit_discriminator_wins() {
        let e = ev("call_start", json!({"nodeType": "db", "url": "http://x"}));
        assert_eq!(classify_node(&e), NodeType::Db);
        let e = ev("error", json!({"nodeType": "Service"}));
        assert_eq!(classify_node(&e), NodeType::Service);
    }

    #[test]
    fn unknown_discriminator_falls_back_to_heuristics() {
        let e = ev("call_start", json!({"nodeType": "quantum"}));
        assert_eq!(classify_node(&e), NodeType::Function);
    }

    #[test]
    fn heuristics_in_priority_order() {
        assert_eq!(classify_node(&ev("error", json!({}))), NodeType::Error);
        assert_eq!(
            classify_node(&ev("event", json!({"db.system": "postgres"}))),
            NodeType::Db
        );
        assert_eq!(
            classify_node(&ev("call_start", json!({"sql": "select 1"}))),
            NodeType::Db
        );
        assert_eq!(
            classify_node(&ev("call_start", json!({"http.method": "GET"}))),
            NodeType::External
        );
        assert_eq!(
            classify_node(&ev("event", json!({"type": "client"}))),
            NodeType::External
        );
        assert_eq!(
            classify_node(&ev("call_start", json!({"path": "/tmp/x"}))),
            NodeType::Io
        );
        assert_eq!(
            classify_node(&ev("event", json!({"rpc.method": "Get"}))),
            NodeType::Service
        );
        assert_eq!(classify_node(&ev("call", json!({}))), NodeType::Function);
        assert_eq!(classify_node(&ev("log", json!({}))), NodeType::Event);
    }

    #[test]
    fn error_kind_variants() {
        assert!(is_error_kind("error"));
        assert!(is_error_kind("Exception"));
        assert!(is_error_kind("db_error"));
        assert!(!is_error_kind("call_end"));
        assert!(!is_error_kind("errors_seen"));
    }

    #[test]
    fn edge_kind_follows_child_type() {
        let e = ev("call_start", json!({}));
        assert_eq!(classify_edge(&e, NodeType::Db), EdgeKind::Queries);
        assert_eq!(classify_edge(&e, NodeType::External), EdgeKind::Requests);
        assert_eq!(classify_edge(&e, NodeType::Event), EdgeKind::Emits);
        assert_eq!(classify_edge(&e, NodeType::Function), EdgeKind::Calls);
        assert_eq!(classify_edge(&e, NodeType::Io), EdgeKind::Reads);
        let w = ev("call_start", json!({"mode": "write"}));
        assert_eq!(classify_edge(&w, NodeType::Io), EdgeKind::Writes);
    }

    #[test]
    fn explicit_edge_kind_wins() {
        let e = ev("call_end", json!({"edgeKind": "returns"}));
        assert_eq!(classify_edge(&e, NodeType::Db), EdgeKind::Returns);
    }

    #[test]
    fn serde_names_are_stable() {
        assert_eq!(serde_json::to_string(&NodeType::Io).unwrap(), "\"IO\"");
        assert_eq!(serde_json::to_string(&NodeType::Db).unwrap(), "\"DB\"");
        assert_eq!(
            serde_json::to_string(&NodeType::Function).unwrap(),
            "\"Function\""
        );
        assert_eq!(
            serde_json::to_string(&EdgeKind::Queries).unwrap(),
            "\"queries\""
        );
        for t in NodeType::ALL {
            assert_eq!(NodeType::parse(t.as_str()), Some(t));
        }
    }
}
