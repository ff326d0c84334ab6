//! Per-run graph state machine.
//!
//! [`GraphState::apply`] folds one telemetry event into a run's call graph.
//! The fold tolerates the feed's delivery model:
//!
//! - duplicates and stale redeliveries are dropped by a per-run sequence
//!   gate (`seq <= last_seq`), so re-applying a batch is a no-op
//! - a child may arrive before its parent; the parent is materialised as a
//!   placeholder node and upgraded when its own event shows up, taking the
//!   event's `nodeKey` as its id if it has one
//! - edges are keyed by the ordered `(from, to)` pair and recorded once
//!
//! The gate is global to the run, not per span: an emitter whose sequence
//! numbers are not one total order will have later-but-lower events dropped.
//!
//! Node status moves `running -> completed` or `running -> error` once;
//! later events for a terminal node only merge context data into it.

use std::collections::{BTreeMap, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::classify::{self, EdgeKind, NodeType};
use crate::event::{CALL_END, RUN_END, TelemetryEvent};

/// Label prefix of a synthesised parent.
pub const PLACEHOLDER_LABEL_PREFIX: &str = "pending:";

/// Node lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Running,
    Completed,
    Error,
}

impl NodeStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// How a run ended, recorded from a `run_end` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Completed,
    Error,
}

impl RunOutcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

/// Counters derived from the graph around a node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeProps {
    pub error_count: u64,
    pub child_count: u64,
}

/// One execution unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    pub id: String,
    /// Assignment order within the run, starting at 1.
    pub num: u64,
    pub label: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    /// Kind of the event that created (or upgraded) the node.
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span: Option<String>,
    pub started_seq: Option<u64>,
    pub ended_seq: Option<u64>,
    pub started_at: Option<i64>,
    pub ended_at: Option<i64>,
    pub duration: Option<i64>,
    pub status: NodeStatus,
    /// Synthesised for a parent span that has not reported yet.
    #[serde(default)]
    pub placeholder: bool,
    pub props: NodeProps,
    #[serde(default)]
    pub data: Map<String, Value>,
}

/// Causal relationship between two nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub from: String,
    pub to: String,
    pub kind: EdgeKind,
    /// Position among the source node's outgoing edges, starting at 0.
    pub ordinal: u32,
    pub created_seq: u64,
    pub created_at: i64,
}

impl Edge {
    /// Dedup key, also used by persistence tracking.
    #[must_use]
    pub fn key(&self) -> String {
        edge_key(&self.from, &self.to)
    }
}

#[must_use]
pub fn edge_key(from: &str, to: &str) -> String {
    format!("{from}->{to}")
}

/// Result of [`GraphState::apply`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The event advanced the state.
    Applied,
    /// `seq` was at or below the cursor; state unchanged.
    Duplicate,
}

impl ApplyOutcome {
    #[must_use]
    pub fn is_applied(self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// Totals carried by every delta.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphSummary {
    pub total_nodes: u64,
    pub total_edges: u64,
    pub running: u64,
    pub completed: u64,
    pub errors: u64,
    pub by_type: BTreeMap<String, u64>,
}

/// Point-in-time materialisation of a run's graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphDelta {
    #[serde(rename = "type")]
    pub message_type: String,
    pub run_id: String,
    pub at_seq: Option<u64>,
    pub revision: u64,
    pub timestamp: i64,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    pub counter: BTreeMap<String, u64>,
    pub summary: GraphSummary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<RunOutcome>,
}

/// Message type tag of [`GraphDelta`].
pub const GRAPH_DELTA_TYPE: &str = "GraphDelta";

/// Cursor section of a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotCursor {
    pub last_seq: Option<u64>,
    /// Highest node number handed out.
    pub node_num: u64,
    #[serde(default)]
    pub revision: u64,
}

/// Full checkpoint from which a [`GraphState`] can be rebuilt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphSnapshot {
    pub run_id: String,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
    pub cursor: SnapshotCursor,
    #[serde(default)]
    pub counter: BTreeMap<String, u64>,
    /// Span to node id, including spans folded into a shared `nodeKey` node.
    #[serde(default)]
    pub spans: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<RunOutcome>,
}

/// In-memory graph of one run. Owned by exactly one worker.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphState {
    run_id: String,
    last_seq: Option<u64>,
    nodes: HashMap<String, Node>,
    span_index: HashMap<String, String>,
    edges: Vec<Edge>,
    edge_set: HashSet<(String, String)>,
    next_ordinal: HashMap<String, u32>,
    counters: BTreeMap<String, u64>,
    node_num: u64,
    revision: u64,
    outcome: Option<RunOutcome>,
}

impl GraphState {
    #[must_use]
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            last_seq: None,
            nodes: HashMap::new(),
            span_index: HashMap::new(),
            edges: Vec::new(),
            edge_set: HashSet::new(),
            next_ordinal: HashMap::new(),
            counters: BTreeMap::new(),
            node_num: 0,
            revision: 0,
            outcome: None,
        }
    }

    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Highest applied sequence number.
    #[must_use]
    pub fn last_seq(&self) -> Option<u64> {
        self.last_seq
    }

    /// Bumped once per applied event.
    #[must_use]
    pub fn revision(&self) -> u64 {
        self.revision
    }

    #[must_use]
    pub fn outcome(&self) -> Option<RunOutcome> {
        self.outcome
    }

    #[must_use]
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Node currently bound to `span`.
    #[must_use]
    pub fn node_for_span(&self, span: &str) -> Option<&Node> {
        self.span_index.get(span).and_then(|id| self.nodes.get(id))
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    #[must_use]
    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    #[must_use]
    pub fn counters(&self) -> &BTreeMap<String, u64> {
        &self.counters
    }

    #[must_use]
    pub fn has_edge(&self, from: &str, to: &str) -> bool {
        self.edge_set
            .contains(&(from.to_string(), to.to_string()))
    }

    /// Fold one event into the graph.
    pub fn apply(&mut self, event: &TelemetryEvent) -> ApplyOutcome {
        if self.last_seq.is_some_and(|last| event.seq <= last) {
            return ApplyOutcome::Duplicate;
        }
        self.last_seq = Some(event.seq);
        self.revision += 1;
        *self.counters.entry(event.kind.clone()).or_insert(0) += 1;

        if event.kind == RUN_END {
            self.outcome = Some(run_outcome(event));
            return ApplyOutcome::Applied;
        }

        if event.kind == CALL_END {
            if let Some(id) = event
                .span
                .as_ref()
                .and_then(|span| self.span_index.get(span))
                .filter(|id| self.nodes.get(*id).is_some_and(|n| !n.placeholder))
                .cloned()
            {
                self.close_node(&id, event);
                return ApplyOutcome::Applied;
            }
        }

        if let (Some(key), Some(span)) = (&event.node_key, &event.span) {
            self.adopt_placeholder(span, key);
        }
        let id = self.resolve_identity(event);
        let existed = match self.nodes.get(&id) {
            None => {
                self.create_node(&id, event);
                false
            }
            Some(node) if node.placeholder => {
                self.upgrade_placeholder(&id, event);
                false
            }
            Some(_) => true,
        };
        if let Some(span) = &event.span {
            self.span_index
                .entry(span.clone())
                .or_insert_with(|| id.clone());
        }

        if event.kind == CALL_END {
            self.close_node(&id, event);
        } else if classify::is_error_kind(&event.kind) {
            self.record_error(&id, event, existed);
        } else if existed {
            self.merge_data(&id, event);
        }

        if let Some(parent_span) = &event.parent_span {
            let parent_id = match self.span_index.get(parent_span) {
                Some(parent_id) => parent_id.clone(),
                None => self.create_placeholder(parent_span),
            };
            if classify::is_error_kind(&event.kind) && parent_id != id {
                if let Some(parent) = self.nodes.get_mut(&parent_id) {
                    parent.props.error_count += 1;
                }
            }
            self.add_edge(&parent_id, &id, event);
        }

        ApplyOutcome::Applied
    }

    /// `nodeKey` first, then the span's binding (a placeholder or an earlier
    /// keyed node), then the span itself, then a synthetic per-event id.
    fn resolve_identity(&self, event: &TelemetryEvent) -> String {
        if let Some(key) = &event.node_key {
            return key.clone();
        }
        if let Some(id) = event.span.as_ref().and_then(|s| self.span_index.get(s)) {
            return id.clone();
        }
        if let Some(span) = &event.span {
            return span_node_id(span);
        }
        format!("event:{}:{}", event.kind, event.seq)
    }

    fn next_num(&mut self) -> u64 {
        self.node_num += 1;
        self.node_num
    }

    fn create_node(&mut self, id: &str, event: &TelemetryEvent) {
        let num = self.next_num();
        let node_type = classify::classify_node(event);
        let is_error = classify::is_error_kind(&event.kind);
        // A call_end with no prior start still carries its duration.
        let started_at = start_time(event);
        let node = Node {
            id: id.to_string(),
            num,
            label: label_for(event),
            node_type,
            kind: event.kind.clone(),
            key: event.node_key.clone(),
            span: event.span.clone(),
            parent_span: event.parent_span.clone(),
            started_seq: Some(event.seq),
            ended_seq: None,
            started_at,
            ended_at: None,
            duration: None,
            status: if is_error {
                NodeStatus::Error
            } else {
                NodeStatus::Running
            },
            placeholder: false,
            props: NodeProps::default(),
            data: payload_map(event),
        };
        self.nodes.insert(id.to_string(), node);
    }

    fn create_placeholder(&mut self, span: &str) -> String {
        let id = span_node_id(span);
        if !self.nodes.contains_key(&id) {
            let num = self.next_num();
            self.nodes.insert(
                id.clone(),
                Node {
                    id: id.clone(),
                    num,
                    label: format!("{PLACEHOLDER_LABEL_PREFIX}{span}"),
                    node_type: NodeType::Function,
                    kind: String::new(),
                    key: None,
                    span: Some(span.to_string()),
                    parent_span: None,
                    started_seq: None,
                    ended_seq: None,
                    started_at: None,
                    ended_at: None,
                    duration: None,
                    status: NodeStatus::Running,
                    placeholder: true,
                    props: NodeProps::default(),
                    data: Map::new(),
                },
            );
        }
        self.span_index.insert(span.to_string(), id.clone());
        id
    }

    /// A keyed event arrived for a span still held by a placeholder under a
    /// different id. The placeholder takes the key as its id, or folds into
    /// the node already holding it, so the graph ends up with the ids it
    /// would have had if the parent had reported before its children.
    fn adopt_placeholder(&mut self, span: &str, key: &str) {
        let Some(from) = self
            .span_index
            .get(span)
            .filter(|id| id.as_str() != key)
            .filter(|id| self.nodes.get(*id).is_some_and(|n| n.placeholder))
            .cloned()
        else {
            return;
        };
        let Some(mut placeholder) = self.nodes.remove(&from) else {
            return;
        };
        if let Some(target) = self.nodes.get_mut(key) {
            target.props.error_count += placeholder.props.error_count;
        } else {
            placeholder.id = key.to_string();
            placeholder.props.child_count = 0;
            self.nodes.insert(key.to_string(), placeholder);
        }
        for bound in self.span_index.values_mut() {
            if *bound == from {
                *bound = key.to_string();
            }
        }
        self.retarget_edges(&from, key);
    }

    /// Move every edge touching `from` onto `to`. Edges that would become
    /// self loops or duplicates are dropped; moved outgoing edges take the
    /// next ordinals of `to`.
    fn retarget_edges(&mut self, from: &str, to: &str) {
        self.next_ordinal.remove(from);
        let mut kept = Vec::with_capacity(self.edges.len());
        for mut edge in std::mem::take(&mut self.edges) {
            if edge.from != from && edge.to != from {
                kept.push(edge);
                continue;
            }
            self.edge_set.remove(&(edge.from.clone(), edge.to.clone()));
            let outgoing = edge.from == from;
            if outgoing {
                edge.from = to.to_string();
            } else {
                edge.to = to.to_string();
            }
            if edge.from == edge.to
                || !self.edge_set.insert((edge.from.clone(), edge.to.clone()))
            {
                if !outgoing {
                    if let Some(parent) = self.nodes.get_mut(&edge.from) {
                        parent.props.child_count = parent.props.child_count.saturating_sub(1);
                    }
                }
                continue;
            }
            if outgoing {
                let ordinal = self.next_ordinal.entry(to.to_string()).or_insert(0);
                edge.ordinal = *ordinal;
                *ordinal += 1;
                if let Some(target) = self.nodes.get_mut(to) {
                    target.props.child_count += 1;
                }
            }
            kept.push(edge);
        }
        self.edges = kept;
    }

    /// The real event for a placeholder's span arrived: keep id, number and
    /// edges, take everything else from the event.
    fn upgrade_placeholder(&mut self, id: &str, event: &TelemetryEvent) {
        let Some(node) = self.nodes.get_mut(id) else {
            return;
        };
        node.placeholder = false;
        node.label = label_for(event);
        node.node_type = classify::classify_node(event);
        node.kind = event.kind.clone();
        node.key = event.node_key.clone();
        node.parent_span = event.parent_span.clone();
        node.started_seq = Some(event.seq);
        node.started_at = start_time(event);
        if classify::is_error_kind(&event.kind) {
            node.status = NodeStatus::Error;
        }
        merge_into(&mut node.data, event);
    }

    fn close_node(&mut self, id: &str, event: &TelemetryEvent) {
        let Some(node) = self.nodes.get_mut(id) else {
            return;
        };
        merge_into(&mut node.data, event);
        if node.status.is_terminal() {
            return;
        }
        node.ended_at = Some(event.ts);
        node.ended_seq = Some(event.seq);
        node.duration = elapsed(node.started_at, event.ts);
        node.status = declared_status(event);
        if node.status == NodeStatus::Error {
            node.props.error_count += 1;
        }
    }

    fn record_error(&mut self, id: &str, event: &TelemetryEvent, existed: bool) {
        let Some(node) = self.nodes.get_mut(id) else {
            return;
        };
        node.props.error_count += 1;
        if existed {
            merge_into(&mut node.data, event);
        }
        if node.status == NodeStatus::Running {
            node.status = NodeStatus::Error;
            node.ended_at = Some(event.ts);
            node.ended_seq = Some(event.seq);
            node.duration = elapsed(node.started_at, event.ts);
        }
    }

    fn merge_data(&mut self, id: &str, event: &TelemetryEvent) {
        if let Some(node) = self.nodes.get_mut(id) {
            merge_into(&mut node.data, event);
        }
    }

    fn add_edge(&mut self, from: &str, to: &str, event: &TelemetryEvent) {
        if from == to {
            return;
        }
        if !self.edge_set.insert((from.to_string(), to.to_string())) {
            return;
        }
        let child_type = self
            .nodes
            .get(to)
            .map_or(NodeType::Function, |n| n.node_type);
        let ordinal = self.next_ordinal.entry(from.to_string()).or_insert(0);
        let edge = Edge {
            from: from.to_string(),
            to: to.to_string(),
            kind: classify::classify_edge(event, child_type),
            ordinal: *ordinal,
            created_seq: event.seq,
            created_at: event.ts,
        };
        *ordinal += 1;
        self.edges.push(edge);
        if let Some(parent) = self.nodes.get_mut(from) {
            parent.props.child_count += 1;
        }
    }

    /// Nodes ordered by assignment number.
    #[must_use]
    pub fn sorted_nodes(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.nodes.values().cloned().collect();
        nodes.sort_by_key(|n| n.num);
        nodes
    }

    #[must_use]
    pub fn summary(&self) -> GraphSummary {
        let mut summary = GraphSummary {
            total_nodes: self.nodes.len() as u64,
            total_edges: self.edges.len() as u64,
            ..GraphSummary::default()
        };
        for node in self.nodes.values() {
            match node.status {
                NodeStatus::Running => summary.running += 1,
                NodeStatus::Completed => summary.completed += 1,
                NodeStatus::Error => summary.errors += 1,
            }
            *summary
                .by_type
                .entry(node.node_type.as_str().to_string())
                .or_insert(0) += 1;
        }
        summary
    }

    /// Materialise the whole graph as of the current cursor.
    #[must_use]
    pub fn build_delta(&self, timestamp: i64) -> GraphDelta {
        GraphDelta {
            message_type: GRAPH_DELTA_TYPE.to_string(),
            run_id: self.run_id.clone(),
            at_seq: self.last_seq,
            revision: self.revision,
            timestamp,
            nodes: self.sorted_nodes(),
            edges: self.edges.clone(),
            counter: self.counters.clone(),
            summary: self.summary(),
            outcome: self.outcome,
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            run_id: self.run_id.clone(),
            nodes: self.sorted_nodes(),
            edges: self.edges.clone(),
            cursor: SnapshotCursor {
                last_seq: self.last_seq,
                node_num: self.node_num,
                revision: self.revision,
            },
            counter: self.counters.clone(),
            spans: self
                .span_index
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            outcome: self.outcome,
        }
    }

    /// Rebuild from a checkpoint. Derived indexes (edge set, ordinals) are
    /// recomputed; spans missing from older checkpoints fall back to the
    /// nodes' own `span` fields.
    #[must_use]
    pub fn from_snapshot(snapshot: GraphSnapshot) -> Self {
        let mut state = Self::new(snapshot.run_id);
        state.last_seq = snapshot.cursor.last_seq;
        state.revision = snapshot.cursor.revision;
        state.counters = snapshot.counter;
        state.outcome = snapshot.outcome;

        let mut max_num = snapshot.cursor.node_num;
        for node in snapshot.nodes {
            max_num = max_num.max(node.num);
            if let Some(span) = &node.span {
                state
                    .span_index
                    .entry(span.clone())
                    .or_insert_with(|| node.id.clone());
            }
            state.nodes.insert(node.id.clone(), node);
        }
        state.node_num = max_num;
        for (span, id) in snapshot.spans {
            state.span_index.insert(span, id);
        }

        for edge in snapshot.edges {
            state
                .edge_set
                .insert((edge.from.clone(), edge.to.clone()));
            let next = state.next_ordinal.entry(edge.from.clone()).or_insert(0);
            *next = (*next).max(edge.ordinal + 1);
            state.edges.push(edge);
        }
        state
    }
}

#[must_use]
pub fn span_node_id(span: &str) -> String {
    format!("span:{span}")
}

/// When the event's unit of work began. A `call_end` seen first reaches
/// back by its `durationMs`; `None` if that point is not representable.
fn start_time(event: &TelemetryEvent) -> Option<i64> {
    if event.kind != CALL_END {
        return Some(event.ts);
    }
    match event.data_millis("durationMs") {
        Some(d) => event.ts.checked_sub(d),
        None => Some(event.ts),
    }
}

fn elapsed(started_at: Option<i64>, ended_at: i64) -> Option<i64> {
    started_at.and_then(|start| ended_at.checked_sub(start))
}

fn label_for(event: &TelemetryEvent) -> String {
    event
        .node_key
        .clone()
        .or_else(|| event.data_str("name").map(str::to_string))
        .or_else(|| event.data_str("label").map(str::to_string))
        .or_else(|| event.span.clone())
        .unwrap_or_else(|| event.kind.clone())
}

fn payload_map(event: &TelemetryEvent) -> Map<String, Value> {
    let mut map = Map::new();
    merge_into(&mut map, event);
    map
}

fn merge_into(target: &mut Map<String, Value>, event: &TelemetryEvent) {
    match &event.data {
        Some(Value::Object(obj)) => {
            for (k, v) in obj {
                target.insert(k.clone(), v.clone());
            }
        }
        Some(other) => {
            target.insert("value".to_string(), other.clone());
        }
        None => {}
    }
    if let Some(code) = &event.code {
        target.insert("code".to_string(), Value::String(code.clone()));
    }
}

/// Status declared by a closing payload. Anything but an explicit failure
/// completes the node.
fn declared_status(event: &TelemetryEvent) -> NodeStatus {
    let failed = event.data_str("status").is_some_and(|s| {
        matches!(
            s.to_ascii_lowercase().as_str(),
            "error" | "failed" | "failure" | "status_code_error" | "exception"
        )
    }) || event
        .data_object()
        .is_some_and(|d| d.get("error").is_some_and(|e| !e.is_null() && e != &Value::Bool(false)));
    if failed {
        NodeStatus::Error
    } else {
        NodeStatus::Completed
    }
}

fn run_outcome(event: &TelemetryEvent) -> RunOutcome {
    if declared_status(event) == NodeStatus::Error {
        RunOutcome::Error
    } else {
        RunOutcome::Completed
    }
}
