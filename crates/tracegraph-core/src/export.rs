//! LLM-oriented renderings of a run's graph.
//!
//! [`LlmExecutionTrace`] reorganises a flat node/edge set into what a model
//! reads well: a call tree, a flat error list, a chronological timeline and
//! a duration ranking. It renders as pretty JSON, a markdown prompt, or
//! JSON-LD.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Write as _;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat};
use serde::Serialize;
use serde_json::{Map, Value, json};

use crate::correlator::{Edge, GraphDelta, Node, NodeStatus};
use crate::classify::NodeType;
use crate::error::{Error, Result};

/// Hotspots listed in the summary.
pub const HOTSPOT_LIMIT: usize = 10;
/// Timeline entries rendered in the prompt form.
pub const PROMPT_TIMELINE_LIMIT: usize = 50;
/// Vocabulary that unprefixed JSON-LD terms expand against.
pub const JSONLD_VOCAB: &str = "https://tracegraph.dev/schema/";
/// Prefix of a run's JSON-LD `@id`.
pub const RUN_URN_PREFIX: &str = "urn:tracegraph:run:";

/// Output rendering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ExportFormat {
    #[default]
    Json,
    Prompt,
    Jsonld,
}

impl ExportFormat {
    #[must_use]
    pub fn content_type(self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::Prompt => "text/markdown; charset=utf-8",
            Self::Jsonld => "application/ld+json",
        }
    }
}

impl FromStr for ExportFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "prompt" | "markdown" | "md" => Ok(Self::Prompt),
            "jsonld" | "json-ld" => Ok(Self::Jsonld),
            other => Err(Error::Runtime(format!(
                "unknown export format {other:?} (expected json, prompt or jsonld)"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceMeta {
    pub run_id: String,
    pub timestamp: i64,
    pub total_duration: Option<i64>,
    pub status: NodeStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Hotspot {
    pub label: String,
    pub duration: i64,
    pub percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceSummary {
    pub total_calls: usize,
    pub completed_calls: usize,
    pub error_calls: usize,
    pub pending_calls: usize,
    pub calls_by_type: BTreeMap<String, u64>,
    pub hotspots: Vec<Hotspot>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallNode {
    pub id: String,
    pub num: u64,
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub status: NodeStatus,
    pub duration: Option<i64>,
    pub started_at: Option<i64>,
    pub ended_at: Option<i64>,
    pub children: Vec<CallNode>,
    pub data: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceError {
    pub node_id: String,
    pub node_name: String,
    pub timestamp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    pub context: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineEvent {
    CallStart,
    CallEnd,
    Error,
}

impl TimelineEvent {
    fn as_str(self) -> &'static str {
        match self {
            Self::CallStart => "call_start",
            Self::CallEnd => "call_end",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineEntry {
    pub timestamp: i64,
    pub event: TimelineEvent,
    pub node_id: String,
    pub node_name: String,
    pub details: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceTiming {
    pub started_at: Option<i64>,
    pub ended_at: Option<i64>,
    pub duration: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceNode {
    pub id: String,
    pub num: u64,
    pub name: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub status: NodeStatus,
    pub timing: TraceTiming,
    pub context: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceEdge {
    pub caller: String,
    pub callee: String,
    #[serde(rename = "type")]
    pub edge_type: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceGraph {
    pub nodes: Vec<TraceNode>,
    pub edges: Vec<TraceEdge>,
}

/// Whole-run trace arranged for model consumption.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmExecutionTrace {
    pub meta: TraceMeta,
    pub summary: TraceSummary,
    pub call_tree: Vec<CallNode>,
    pub errors: Vec<TraceError>,
    pub timeline: Vec<TimelineEntry>,
    pub graph: TraceGraph,
}

impl LlmExecutionTrace {
    #[must_use]
    pub fn from_delta(delta: &GraphDelta) -> Self {
        Self::build(&delta.run_id, delta.timestamp, &delta.nodes, &delta.edges)
    }

    /// `nodes` are expected in numbering order.
    #[must_use]
    pub fn build(run_id: &str, timestamp: i64, nodes: &[Node], edges: &[Edge]) -> Self {
        let total_duration = total_duration(nodes);
        Self {
            meta: TraceMeta {
                run_id: run_id.to_string(),
                timestamp,
                total_duration,
                status: overall_status(nodes),
            },
            summary: summarize(nodes, total_duration),
            call_tree: call_tree(nodes, edges),
            errors: collect_errors(nodes),
            timeline: timeline(nodes),
            graph: TraceGraph {
                nodes: nodes
                    .iter()
                    .map(|n| TraceNode {
                        id: n.id.clone(),
                        num: n.num,
                        name: n.label.clone(),
                        node_type: n.node_type,
                        status: n.status,
                        timing: TraceTiming {
                            started_at: n.started_at,
                            ended_at: n.ended_at,
                            duration: n.duration,
                        },
                        context: n.data.clone(),
                    })
                    .collect(),
                edges: edges
                    .iter()
                    .map(|e| TraceEdge {
                        caller: e.from.clone(),
                        callee: e.to.clone(),
                        edge_type: e.kind.as_str().to_string(),
                        timestamp: e.created_at,
                    })
                    .collect(),
            },
        }
    }

    /// Render in `format`.
    pub fn render(&self, format: ExportFormat) -> Result<String> {
        match format {
            ExportFormat::Json => Ok(serde_json::to_string_pretty(self)?),
            ExportFormat::Prompt => Ok(self.to_prompt()),
            ExportFormat::Jsonld => Ok(serde_json::to_string_pretty(&JsonLd {
                context: json!({
                    "@vocab": JSONLD_VOCAB,
                    "xsd": "http://www.w3.org/2001/XMLSchema#",
                    "startedAt": { "@type": "xsd:dateTime" },
                    "endedAt": { "@type": "xsd:dateTime" },
                    "duration": { "@type": "xsd:integer" },
                }),
                kind: "ExecutionTrace",
                id: format!("{RUN_URN_PREFIX}{}", self.meta.run_id),
                trace: self,
            })?),
        }
    }

    /// Markdown rendering.
    #[must_use]
    pub fn to_prompt(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# Execution Trace\n");
        let _ = writeln!(out, "Run ID: {}", self.meta.run_id);
        let _ = writeln!(out, "Status: {}", self.meta.status.as_str());
        if let Some(total) = self.meta.total_duration.filter(|d| *d > 0) {
            let _ = writeln!(out, "Total Duration: {total}ms");
        }
        out.push('\n');

        let s = &self.summary;
        let _ = writeln!(out, "## Summary");
        let _ = writeln!(out, "- Total Calls: {}", s.total_calls);
        let _ = writeln!(out, "- Completed: {}", s.completed_calls);
        let _ = writeln!(out, "- Errors: {}", s.error_calls);
        let _ = writeln!(out, "- Running: {}\n", s.pending_calls);

        let _ = writeln!(out, "### Call Types");
        for (node_type, count) in &s.calls_by_type {
            let _ = writeln!(out, "- {node_type}: {count}");
        }
        out.push('\n');

        if !s.hotspots.is_empty() {
            let _ = writeln!(out, "### Performance Hotspots");
            for h in &s.hotspots {
                let _ = writeln!(out, "- {}: {}ms ({}%)", h.label, h.duration, h.percentage);
            }
            out.push('\n');
        }

        if !self.errors.is_empty() {
            let _ = writeln!(out, "## Errors");
            for e in &self.errors {
                let _ = writeln!(out, "### Error in {}", e.node_name);
                if let Some(message) = &e.message {
                    let _ = writeln!(out, "Message: {message}");
                }
                if let Some(stack) = &e.stack {
                    let _ = writeln!(out, "Stack trace:\n```\n{stack}\n```");
                }
                out.push('\n');
            }
        }

        let _ = writeln!(out, "## Call Tree");
        for root in &self.call_tree {
            render_tree(&mut out, root, 0);
        }
        out.push('\n');

        let _ = writeln!(out, "## Timeline (first {PROMPT_TIMELINE_LIMIT} events)");
        for entry in self.timeline.iter().take(PROMPT_TIMELINE_LIMIT) {
            let _ = writeln!(
                out,
                "- {} | {} | {} | {}",
                iso_time(entry.timestamp),
                entry.event.as_str(),
                entry.node_name,
                entry.details
            );
        }
        if self.timeline.len() > PROMPT_TIMELINE_LIMIT {
            let _ = writeln!(
                out,
                "... and {} more events",
                self.timeline.len() - PROMPT_TIMELINE_LIMIT
            );
        }
        while out.ends_with('\n') {
            out.pop();
        }
        out
    }
}

#[derive(Serialize)]
struct JsonLd<'a> {
    #[serde(rename = "@context")]
    context: Value,
    #[serde(rename = "@type")]
    kind: &'static str,
    #[serde(rename = "@id")]
    id: String,
    #[serde(flatten)]
    trace: &'a LlmExecutionTrace,
}

fn render_tree(out: &mut String, node: &CallNode, depth: usize) {
    let prefix = "  ".repeat(depth);
    let status = match node.status {
        NodeStatus::Error => " [ERROR]",
        NodeStatus::Running => " [RUNNING]",
        NodeStatus::Completed => "",
    };
    let duration = node
        .duration
        .map(|d| format!(" ({d}ms)"))
        .unwrap_or_default();
    let _ = writeln!(out, "{prefix}- [{}] {}{duration}{status}", node.num, node.name);
    if let Some(message) = &node.error_message {
        let _ = writeln!(out, "{prefix}  Error: {message}");
    }
    for child in &node.children {
        render_tree(out, child, depth + 1);
    }
}

fn iso_time(ts: i64) -> String {
    DateTime::from_timestamp_millis(ts).map_or_else(
        || ts.to_string(),
        |t| t.to_rfc3339_opts(SecondsFormat::Millis, true),
    )
}

fn total_duration(nodes: &[Node]) -> Option<i64> {
    let min_start = nodes.iter().filter_map(|n| n.started_at).min()?;
    let max_end = nodes.iter().filter_map(|n| n.ended_at).max()?;
    max_end.checked_sub(min_start).filter(|d| *d > 0)
}

fn overall_status(nodes: &[Node]) -> NodeStatus {
    if nodes.iter().any(|n| n.status == NodeStatus::Error) {
        NodeStatus::Error
    } else if nodes.iter().any(|n| n.status == NodeStatus::Running) {
        NodeStatus::Running
    } else {
        NodeStatus::Completed
    }
}

fn summarize(nodes: &[Node], total_duration: Option<i64>) -> TraceSummary {
    let count = |status: NodeStatus| nodes.iter().filter(|n| n.status == status).count();
    let mut calls_by_type = BTreeMap::new();
    for node in nodes {
        *calls_by_type
            .entry(node.node_type.as_str().to_string())
            .or_insert(0) += 1;
    }

    let mut timed: Vec<&Node> = nodes
        .iter()
        .filter(|n| n.duration.is_some_and(|d| d > 0))
        .collect();
    timed.sort_by(|a, b| b.duration.cmp(&a.duration).then(a.num.cmp(&b.num)));
    let hotspots = timed
        .into_iter()
        .take(HOTSPOT_LIMIT)
        .map(|n| {
            let duration = n.duration.unwrap_or(0);
            let percentage = total_duration.filter(|t| *t > 0).map_or(0.0, |total| {
                (duration as f64 / total as f64 * 1000.0).round() / 10.0
            });
            Hotspot {
                label: n.label.clone(),
                duration,
                percentage,
            }
        })
        .collect();

    TraceSummary {
        total_calls: nodes.len(),
        completed_calls: count(NodeStatus::Completed),
        error_calls: count(NodeStatus::Error),
        pending_calls: count(NodeStatus::Running),
        calls_by_type,
        hotspots,
    }
}

fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::Null | Value::Bool(false) => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn error_message(data: &Map<String, Value>) -> Option<String> {
    ["exception.message", "error", "statusMessage"]
        .iter()
        .find_map(|key| data.get(*key).and_then(value_text))
}

/// Roots are nodes with no incoming edge; children follow edge ordinals.
/// Each node appears once, under the first parent that reaches it; nodes only
/// reachable through a cycle are appended as extra roots.
fn call_tree(nodes: &[Node], edges: &[Edge]) -> Vec<CallNode> {
    let by_id: HashMap<&str, &Node> = nodes.iter().map(|n| (n.id.as_str(), n)).collect();
    let mut children: HashMap<&str, Vec<&Edge>> = HashMap::new();
    let mut has_parent: HashSet<&str> = HashSet::new();
    for edge in edges {
        children.entry(edge.from.as_str()).or_default().push(edge);
        has_parent.insert(edge.to.as_str());
    }
    for list in children.values_mut() {
        list.sort_by_key(|e| e.ordinal);
    }

    let mut visited = HashSet::new();
    let mut roots = Vec::new();
    for node in nodes.iter().filter(|n| !has_parent.contains(n.id.as_str())) {
        if let Some(tree) = build_call_node(node, &by_id, &children, &mut visited) {
            roots.push(tree);
        }
    }
    for node in nodes {
        if let Some(tree) = build_call_node(node, &by_id, &children, &mut visited) {
            roots.push(tree);
        }
    }
    roots
}

fn build_call_node<'a>(
    node: &'a Node,
    by_id: &HashMap<&'a str, &'a Node>,
    children: &HashMap<&'a str, Vec<&'a Edge>>,
    visited: &mut HashSet<&'a str>,
) -> Option<CallNode> {
    if !visited.insert(node.id.as_str()) {
        return None;
    }
    let kids = children
        .get(node.id.as_str())
        .map(|edges| {
            edges
                .iter()
                .filter_map(|e| by_id.get(e.to.as_str()))
                .filter_map(|child| build_call_node(child, by_id, children, visited))
                .collect()
        })
        .unwrap_or_default();
    Some(CallNode {
        id: node.id.clone(),
        num: node.num,
        name: node.label.clone(),
        node_type: node.node_type,
        status: node.status,
        duration: node.duration,
        started_at: node.started_at,
        ended_at: node.ended_at,
        children: kids,
        data: node.data.clone(),
        error_message: if node.status == NodeStatus::Error {
            error_message(&node.data)
        } else {
            None
        },
    })
}

fn collect_errors(nodes: &[Node]) -> Vec<TraceError> {
    nodes
        .iter()
        .filter(|n| n.status == NodeStatus::Error || n.node_type == NodeType::Error)
        .map(|n| TraceError {
            node_id: n.id.clone(),
            node_name: n.label.clone(),
            timestamp: n.started_at,
            message: error_message(&n.data),
            stack: n.data.get("exception.stacktrace").and_then(value_text),
            context: n.data.clone(),
        })
        .collect()
}

fn timeline(nodes: &[Node]) -> Vec<TimelineEntry> {
    let mut entries = Vec::new();
    for node in nodes {
        if let Some(started_at) = node.started_at {
            entries.push(TimelineEntry {
                timestamp: started_at,
                event: TimelineEvent::CallStart,
                node_id: node.id.clone(),
                node_name: node.label.clone(),
                details: format!("{} started", node.node_type),
            });
        }
        if let Some(ended_at) = node.ended_at {
            let event = if node.status == NodeStatus::Error {
                TimelineEvent::Error
            } else {
                TimelineEvent::CallEnd
            };
            let details = match node.duration.filter(|d| *d > 0) {
                Some(d) => format!("{} {} ({d}ms)", node.node_type, node.status.as_str()),
                None => format!("{} {}", node.node_type, node.status.as_str()),
            };
            entries.push(TimelineEntry {
                timestamp: ended_at,
                event,
                node_id: node.id.clone(),
                node_name: node.label.clone(),
                details,
            });
        }
    }
    entries.sort_by_key(|e| e.timestamp);
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlator::GraphState;
    use crate::event::{CALL_END, CALL_START, TelemetryEvent};

    fn sample() -> GraphDelta {
        let mut state = GraphState::new("r1");
        let events = [
            TelemetryEvent::new("r1", 0, 1_000, CALL_START)
                .with_span("main")
                .with_node_key("main"),
            TelemetryEvent::new("r1", 1, 1_010, CALL_START)
                .with_span("load")
                .with_parent("main")
                .with_node_key("loadData"),
            TelemetryEvent::new("r1", 2, 1_020, CALL_START)
                .with_span("q")
                .with_parent("load")
                .with_data(json!({"sql": "select 1", "name": "query"})),
            TelemetryEvent::new("r1", 3, 1_050, CALL_END)
                .with_span("q")
                .with_data(json!({
                    "status": "error",
                    "exception.message": "timeout",
                    "exception.stacktrace": "at db.rs:1"
                })),
            TelemetryEvent::new("r1", 4, 1_060, CALL_END)
                .with_span("load")
                .with_data(json!({"status": "OK"})),
            TelemetryEvent::new("r1", 5, 1_100, CALL_END)
                .with_span("main")
                .with_data(json!({"status": "OK"})),
        ];
        for e in &events {
            state.apply(e);
        }
        state.build_delta(5_000)
    }

    #[test]
    fn trace_structure() {
        let trace = LlmExecutionTrace::from_delta(&sample());
        assert_eq!(trace.meta.run_id, "r1");
        assert_eq!(trace.meta.total_duration, Some(100));
        assert_eq!(trace.meta.status, NodeStatus::Error);
        assert_eq!(trace.summary.total_calls, 3);
        assert_eq!(trace.summary.error_calls, 1);
        assert_eq!(trace.summary.calls_by_type.get("DB"), Some(&1));

        assert_eq!(trace.call_tree.len(), 1);
        let main = &trace.call_tree[0];
        assert_eq!(main.name, "main");
        assert_eq!(main.children[0].name, "loadData");
        let query = &main.children[0].children[0];
        assert_eq!(query.name, "query");
        assert_eq!(query.error_message.as_deref(), Some("timeout"));

        assert_eq!(trace.errors.len(), 1);
        assert_eq!(trace.errors[0].stack.as_deref(), Some("at db.rs:1"));

        let h = &trace.summary.hotspots;
        assert_eq!(h[0].label, "main");
        assert!((h[0].percentage - 100.0).abs() < f64::EPSILON);
        assert_eq!(h[1].label, "loadData");
        assert!((h[1].percentage - 50.0).abs() < f64::EPSILON);

        let stamps: Vec<i64> = trace.timeline.iter().map(|e| e.timestamp).collect();
        let mut sorted = stamps.clone();
        sorted.sort_unstable();
        assert_eq!(stamps, sorted);
        assert_eq!(trace.timeline.len(), 6);
        assert!(trace.timeline.iter().any(|e| e.event == TimelineEvent::Error));
    }

    #[test]
    fn prompt_rendering() {
        let prompt = LlmExecutionTrace::from_delta(&sample()).to_prompt();
        assert!(prompt.starts_with("# Execution Trace\n\nRun ID: r1\nStatus: error"));
        assert!(prompt.contains("Total Duration: 100ms"));
        assert!(prompt.contains("### Performance Hotspots\n- main: 100ms (100%)"));
        assert!(prompt.contains("### Error in query\nMessage: timeout\nStack trace:\n```\nat db.rs:1\n```"));
        assert!(prompt.contains("- [1] main (100ms)\n  - [2] loadData (50ms)\n    - [3] query (30ms) [ERROR]\n      Error: timeout"));
        assert!(prompt.contains("## Timeline (first 50 events)\n- 1970-01-01T00:00:01.000Z | call_start | main | Function started"));
        assert!(!prompt.ends_with('\n'));
    }

    #[test]
    fn long_timelines_are_abbreviated() {
        let mut state = GraphState::new("r");
        for i in 0..60u64 {
            state.apply(&TelemetryEvent::new("r", i, i as i64, CALL_START).with_span(format!("s{i}")));
        }
        let prompt = LlmExecutionTrace::from_delta(&state.build_delta(0)).to_prompt();
        assert!(prompt.ends_with("... and 10 more events"));
        assert!(prompt.contains("- [60] s59 [RUNNING]"));
    }

    #[test]
    fn jsonld_wraps_trace() {
        let rendered = LlmExecutionTrace::from_delta(&sample())
            .render(ExportFormat::Jsonld)
            .unwrap();
        let value: Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(value["@type"], "ExecutionTrace");
        assert_eq!(value["@id"], "urn:tracegraph:run:r1");
        assert_eq!(value["@context"]["@vocab"], JSONLD_VOCAB);
        assert_eq!(value["@context"]["duration"]["@type"], "xsd:integer");
        assert_eq!(value["meta"]["runId"], "r1");
        assert!(value["callTree"].is_array());
        assert!(rendered.find("@context").unwrap() < rendered.find("\"meta\"").unwrap());
    }

    #[test]
    fn json_rendering_uses_wire_names() {
        let rendered = LlmExecutionTrace::from_delta(&sample())
            .render(ExportFormat::Json)
            .unwrap();
        let value: Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(value["graph"]["edges"][0]["caller"], "main");
        assert_eq!(value["graph"]["edges"][0]["type"], "calls");
        assert_eq!(value["graph"]["nodes"][2]["type"], "DB");
        assert_eq!(value["timeline"][0]["event"], "call_start");
        assert_eq!(value["summary"]["pendingCalls"], 0);
    }

    #[test]
    fn cycles_do_not_recurse_forever() {
        let mut state = GraphState::new("r");
        state.apply(&TelemetryEvent::new("r", 0, 0, CALL_START).with_span("a").with_parent("b"));
        state.apply(&TelemetryEvent::new("r", 1, 0, CALL_START).with_span("b").with_parent("a"));
        let trace = LlmExecutionTrace::from_delta(&state.build_delta(0));
        let count = trace.call_tree.len()
            + trace.call_tree.iter().map(|c| c.children.len()).sum::<usize>();
        assert_eq!(count, 2);
    }

    #[test]
    fn format_parsing() {
        assert_eq!("json".parse::<ExportFormat>().unwrap(), ExportFormat::Json);
        assert_eq!("PROMPT".parse::<ExportFormat>().unwrap(), ExportFormat::Prompt);
        assert_eq!("jsonld".parse::<ExportFormat>().unwrap(), ExportFormat::Jsonld);
        assert!("xml".parse::<ExportFormat>().is_err());
    }

    #[test]
    fn extreme_timestamps_export_without_total_duration() {
        let mut state = GraphState::new("r");
        state.apply(&TelemetryEvent::new("r", 0, i64::MIN, CALL_START).with_span("a"));
        state.apply(&TelemetryEvent::new("r", 1, i64::MAX, CALL_END).with_span("a"));
        let trace = LlmExecutionTrace::from_delta(&state.build_delta(0));
        assert_eq!(trace.meta.total_duration, None);
        assert!(!trace.to_prompt().contains("Total Duration"));
    }

    #[test]
    fn empty_graph_exports() {
        let state = GraphState::new("empty");
        let trace = LlmExecutionTrace::from_delta(&state.build_delta(0));
        assert!(trace.call_tree.is_empty());
        assert_eq!(trace.meta.total_duration, None);
        assert!(trace.to_prompt().contains("## Call Tree"));
    }
}
