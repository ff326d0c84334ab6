//! Durable storage of run graphs.
//!
//! Tables:
//!
//! - `runs`: one row per run, `running` until completed (one-way)
//! - `nodes` / `edges`: keyed by `(run_id, id)` and `(run_id, from, to)`, so
//!   reusing a span name across runs never collides
//! - `cursors`: highest applied `seq` per run, only ever raised
//! - `snapshots`: full [`GraphSnapshot`] checkpoints, newest few kept per run
//!
//! Writes are incremental. A [`PersistenceState`] remembers what has already
//! been written so a persist pass only touches new or changed rows.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use tracing::debug;

use crate::correlator::{Edge, GraphSnapshot, GraphState, Node, RunOutcome, edge_key};
use crate::db::{Db, now_ms};
use crate::error::{Result, StorageError};
use crate::retry::{RetryPolicy, with_retry};
use crate::routing::fnv1a_hash;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS runs (
    id TEXT PRIMARY KEY,
    status TEXT NOT NULL DEFAULT 'running',
    created_at INTEGER NOT NULL,
    ended_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_runs_created ON runs(created_at DESC);
CREATE TABLE IF NOT EXISTS nodes (
    run_id TEXT NOT NULL,
    id TEXT NOT NULL,
    num INTEGER NOT NULL,
    node_type TEXT NOT NULL,
    label TEXT NOT NULL,
    status TEXT NOT NULL,
    placeholder INTEGER NOT NULL,
    started_seq INTEGER,
    ended_seq INTEGER,
    started_at INTEGER,
    ended_at INTEGER,
    body TEXT NOT NULL,
    PRIMARY KEY (run_id, id)
);
CREATE TABLE IF NOT EXISTS edges (
    run_id TEXT NOT NULL,
    from_id TEXT NOT NULL,
    to_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    ordinal INTEGER NOT NULL,
    created_seq INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (run_id, from_id, to_id)
);
CREATE TABLE IF NOT EXISTS cursors (
    run_id TEXT PRIMARY KEY,
    applied_seq INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS snapshots (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    at_seq INTEGER,
    body TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_snapshots_run ON snapshots(run_id, id DESC);
";

/// Snapshots kept per run.
pub const SNAPSHOT_RETENTION: usize = 5;

/// Default page size of [`GraphStore::list_runs`].
pub const DEFAULT_RUN_LIMIT: usize = 20;

/// What has already been written for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistenceState {
    /// Node id → fingerprint of the stored body.
    pub persisted_nodes: HashMap<String, u64>,
    /// `from->to` keys.
    pub persisted_edges: HashSet<String>,
    pub last_persisted_seq: Option<u64>,
}

/// Row counts of one persist pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistReport {
    pub nodes_created: usize,
    pub nodes_updated: usize,
    pub edges_created: usize,
    /// Rows of placeholders that were folded into a keyed node.
    pub nodes_removed: usize,
    pub edges_removed: usize,
}

impl PersistReport {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes_created == 0
            && self.nodes_updated == 0
            && self.edges_created == 0
            && self.nodes_removed == 0
            && self.edges_removed == 0
    }
}

/// One row of `runs`, with graph sizes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub id: String,
    pub status: String,
    pub created_at: i64,
    pub ended_at: Option<i64>,
    pub node_count: u64,
    pub edge_count: u64,
    pub applied_seq: Option<u64>,
}

/// A run's persisted graph.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredGraph {
    pub run: RunRecord,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

struct NodeRow {
    id: String,
    num: i64,
    node_type: &'static str,
    label: String,
    status: &'static str,
    placeholder: bool,
    started_seq: Option<i64>,
    ended_seq: Option<i64>,
    started_at: Option<i64>,
    ended_at: Option<i64>,
    body: String,
}

struct GraphWrite {
    run_id: String,
    nodes: Vec<NodeRow>,
    edges: Vec<Edge>,
    removed_nodes: Vec<String>,
    removed_edges: Vec<String>,
    cursor: Option<i64>,
}

/// Handle to graph storage. Cheap to clone.
#[derive(Debug, Clone)]
pub struct GraphStore {
    db: Db,
    write_policy: RetryPolicy,
}

impl GraphStore {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::from_db(Db::open(path, SCHEMA)?))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::from_db(Db::open_in_memory(SCHEMA)?))
    }

    fn from_db(db: Db) -> Self {
        Self {
            db,
            write_policy: RetryPolicy::db_write(),
        }
    }

    /// Insert the run as `running` unless it exists.
    pub async fn ensure_run(&self, run_id: &str) -> Result<()> {
        let run_id = run_id.to_string();
        with_retry(&self.write_policy, || {
            let run_id = run_id.clone();
            self.db.call(move |conn| ensure_run_sync(conn, &run_id, now_ms()))
        })
        .await
    }

    /// Write every node, edge and cursor change since the last pass.
    ///
    /// `tracking` is only advanced once the transaction commits, so a failed
    /// pass is fully retried by the next one.
    pub async fn persist_graph(
        &self,
        state: &GraphState,
        tracking: &mut PersistenceState,
    ) -> Result<PersistReport> {
        let mut report = PersistReport::default();
        let mut node_rows = Vec::new();
        let mut fingerprints = Vec::new();
        for node in state.sorted_nodes() {
            let body = serde_json::to_string(&node)?;
            let fp = fingerprint(&body);
            match tracking.persisted_nodes.get(&node.id) {
                Some(prev) if *prev == fp => continue,
                Some(_) => report.nodes_updated += 1,
                None => report.nodes_created += 1,
            }
            fingerprints.push((node.id.clone(), fp));
            node_rows.push(node_row(&node, body));
        }
        let new_edges: Vec<Edge> = state
            .edges()
            .iter()
            .filter(|e| !tracking.persisted_edges.contains(&e.key()))
            .cloned()
            .collect();
        report.edges_created = new_edges.len();

        let mut removed_nodes: Vec<String> = tracking
            .persisted_nodes
            .keys()
            .filter(|id| state.node(id).is_none())
            .cloned()
            .collect();
        removed_nodes.sort();
        let live_edges: HashSet<String> = state.edges().iter().map(Edge::key).collect();
        let mut removed_edges: Vec<String> = tracking
            .persisted_edges
            .difference(&live_edges)
            .cloned()
            .collect();
        removed_edges.sort();
        report.nodes_removed = removed_nodes.len();
        report.edges_removed = removed_edges.len();
        let cursor = state
            .last_seq()
            .filter(|seq| tracking.last_persisted_seq.is_none_or(|last| *seq > last));

        if report.is_empty() && cursor.is_none() {
            return Ok(report);
        }

        let write = Arc::new(GraphWrite {
            run_id: state.run_id().to_string(),
            nodes: node_rows,
            edges: new_edges,
            removed_nodes,
            removed_edges,
            cursor: cursor.map(seq_to_sql),
        });
        with_retry(&self.write_policy, || {
            let write = Arc::clone(&write);
            self.db.call(move |conn| write_graph_sync(conn, &write, now_ms()))
        })
        .await?;

        tracking.persisted_nodes.extend(fingerprints);
        tracking
            .persisted_edges
            .extend(write.edges.iter().map(Edge::key));
        for id in &write.removed_nodes {
            tracking.persisted_nodes.remove(id);
        }
        for key in &write.removed_edges {
            tracking.persisted_edges.remove(key);
        }
        if cursor.is_some() {
            tracking.last_persisted_seq = cursor;
        }
        debug!(
            target: "tracegraph.store",
            run_id = state.run_id(),
            nodes_created = report.nodes_created,
            nodes_updated = report.nodes_updated,
            edges_created = report.edges_created,
            nodes_removed = report.nodes_removed,
            edges_removed = report.edges_removed,
            "persisted graph"
        );
        Ok(report)
    }

    /// Store a checkpoint and prune older ones. Returns the snapshot id.
    pub async fn save_snapshot(&self, state: &GraphState) -> Result<i64> {
        let body = Arc::new(serde_json::to_string(&state.snapshot())?);
        let run_id = state.run_id().to_string();
        let at_seq = state.last_seq().map(seq_to_sql);
        with_retry(&self.write_policy, || {
            let body = Arc::clone(&body);
            let run_id = run_id.clone();
            self.db.call(move |conn| {
                let now = now_ms();
                let tx = conn.unchecked_transaction()?;
                ensure_run_sync(&tx, &run_id, now)?;
                tx.execute(
                    "INSERT INTO snapshots (run_id, created_at, at_seq, body) VALUES (?1, ?2, ?3, ?4)",
                    params![run_id, now, at_seq, body.as_str()],
                )?;
                let id = tx.last_insert_rowid();
                tx.execute(
                    "DELETE FROM snapshots WHERE run_id = ?1 AND id NOT IN (
                         SELECT id FROM snapshots WHERE run_id = ?1 ORDER BY id DESC LIMIT ?2
                     )",
                    params![run_id, SNAPSHOT_RETENTION as i64],
                )?;
                tx.commit()?;
                Ok(id)
            })
        })
        .await
    }

    /// Newest checkpoint of a run.
    pub async fn load_latest_snapshot(&self, run_id: &str) -> Result<Option<GraphSnapshot>> {
        let id = run_id.to_string();
        let body: Option<String> = self
            .db
            .call(move |conn| {
                conn.query_row(
                    "SELECT body FROM snapshots WHERE run_id = ?1 ORDER BY id DESC LIMIT 1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()
            })
            .await?;
        body.map(|body| {
            serde_json::from_str::<GraphSnapshot>(&body).map_err(|e| {
                crate::Error::from(StorageError::CorruptSnapshot {
                    run_id: run_id.to_string(),
                    details: e.to_string(),
                })
            })
        })
        .transpose()
    }

    /// Rebuild write tracking for a run from what is stored.
    pub async fn load_persistence_state(&self, run_id: &str) -> Result<PersistenceState> {
        let run_id = run_id.to_string();
        self.db
            .call(move |conn| {
                let mut state = PersistenceState::default();
                {
                    let mut stmt =
                        conn.prepare_cached("SELECT id, body FROM nodes WHERE run_id = ?1")?;
                    let rows = stmt.query_map(params![run_id], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                    })?;
                    for row in rows {
                        let (id, body) = row?;
                        state.persisted_nodes.insert(id, fingerprint(&body));
                    }
                }
                {
                    let mut stmt = conn
                        .prepare_cached("SELECT from_id, to_id FROM edges WHERE run_id = ?1")?;
                    let rows = stmt.query_map(params![run_id], |row| {
                        Ok(edge_key(&row.get::<_, String>(0)?, &row.get::<_, String>(1)?))
                    })?;
                    for key in rows {
                        state.persisted_edges.insert(key?);
                    }
                }
                state.last_persisted_seq = conn
                    .query_row(
                        "SELECT applied_seq FROM cursors WHERE run_id = ?1",
                        params![run_id],
                        |row| row.get::<_, i64>(0),
                    )
                    .optional()?
                    .map(seq_from_sql);
                Ok(state)
            })
            .await
    }

    /// Mark a running run as finished. Returns false if it was not running.
    pub async fn complete_run(&self, run_id: &str, outcome: RunOutcome) -> Result<bool> {
        let run_id = run_id.to_string();
        with_retry(&self.write_policy, || {
            let run_id = run_id.clone();
            self.db.call(move |conn| {
                let now = now_ms();
                ensure_run_sync(conn, &run_id, now)?;
                let changed = conn.execute(
                    "UPDATE runs SET status = ?2, ended_at = ?3 WHERE id = ?1 AND status = 'running'",
                    params![run_id, outcome.as_str(), now],
                )?;
                Ok(changed == 1)
            })
        })
        .await
    }

    pub async fn run(&self, run_id: &str) -> Result<Option<RunRecord>> {
        let run_id = run_id.to_string();
        self.db
            .call(move |conn| {
                conn.query_row(
                    &format!("{RUN_SELECT} WHERE r.id = ?1"),
                    params![run_id],
                    map_run,
                )
                .optional()
            })
            .await
    }

    /// Most recent runs first.
    pub async fn list_runs(&self, limit: usize) -> Result<Vec<RunRecord>> {
        self.db
            .call(move |conn| {
                let mut stmt = conn.prepare_cached(&format!(
                    "{RUN_SELECT} ORDER BY r.created_at DESC, r.rowid DESC LIMIT ?1"
                ))?;
                let rows = stmt.query_map(params![limit as i64], map_run)?;
                rows.collect()
            })
            .await
    }

    /// The persisted graph of a run, nodes in numbering order.
    pub async fn load_graph(&self, run_id: &str) -> Result<Option<StoredGraph>> {
        let Some(run) = self.run(run_id).await? else {
            return Ok(None);
        };
        let id = run_id.to_string();
        let (bodies, edges) = self
            .db
            .call(move |conn| {
                let bodies = {
                    let mut stmt = conn
                        .prepare_cached("SELECT body FROM nodes WHERE run_id = ?1 ORDER BY num")?;
                    let rows = stmt.query_map(params![id], |row| row.get::<_, String>(0))?;
                    rows.collect::<rusqlite::Result<Vec<_>>>()?
                };
                let edges = {
                    let mut stmt = conn.prepare_cached(
                        "SELECT from_id, to_id, kind, ordinal, created_seq, created_at
                         FROM edges WHERE run_id = ?1 ORDER BY created_seq, from_id, ordinal",
                    )?;
                    let rows = stmt.query_map(params![id], |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, i64>(3)?,
                            row.get::<_, i64>(4)?,
                            row.get::<_, i64>(5)?,
                        ))
                    })?;
                    rows.collect::<rusqlite::Result<Vec<_>>>()?
                };
                Ok((bodies, edges))
            })
            .await?;

        let nodes = bodies
            .iter()
            .map(|body| serde_json::from_str::<Node>(body))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let edges = edges
            .into_iter()
            .map(|(from, to, kind, ordinal, created_seq, created_at)| -> Result<Edge> {
                let kind = crate::classify::EdgeKind::parse(&kind).ok_or_else(|| {
                    StorageError::Database(format!("unknown edge kind {kind:?} in run {run_id}"))
                })?;
                Ok(Edge {
                    from,
                    to,
                    kind,
                    ordinal: u32::try_from(ordinal).unwrap_or(u32::MAX),
                    created_seq: seq_from_sql(created_seq),
                    created_at,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Some(StoredGraph { run, nodes, edges }))
    }
}

const RUN_SELECT: &str = "SELECT r.id, r.status, r.created_at, r.ended_at,
        (SELECT COUNT(*) FROM nodes n WHERE n.run_id = r.id),
        (SELECT COUNT(*) FROM edges e WHERE e.run_id = r.id),
        (SELECT c.applied_seq FROM cursors c WHERE c.run_id = r.id)
    FROM runs r";

fn map_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRecord> {
    Ok(RunRecord {
        id: row.get(0)?,
        status: row.get(1)?,
        created_at: row.get(2)?,
        ended_at: row.get(3)?,
        node_count: row.get::<_, i64>(4)?.max(0) as u64,
        edge_count: row.get::<_, i64>(5)?.max(0) as u64,
        applied_seq: row.get::<_, Option<i64>>(6)?.map(seq_from_sql),
    })
}

fn node_row(node: &Node, body: String) -> NodeRow {
    NodeRow {
        id: node.id.clone(),
        num: i64::try_from(node.num).unwrap_or(i64::MAX),
        node_type: node.node_type.as_str(),
        label: node.label.clone(),
        status: node.status.as_str(),
        placeholder: node.placeholder,
        started_seq: node.started_seq.map(seq_to_sql),
        ended_seq: node.ended_seq.map(seq_to_sql),
        started_at: node.started_at,
        ended_at: node.ended_at,
        body,
    }
}

/// Stable across builds, so a stored body matches what a new process would
/// serialize for the same node.
fn fingerprint(body: &str) -> u64 {
    fnv1a_hash(body.as_bytes())
}

fn seq_to_sql(seq: u64) -> i64 {
    i64::try_from(seq).unwrap_or(i64::MAX)
}

fn seq_from_sql(seq: i64) -> u64 {
    u64::try_from(seq).unwrap_or(0)
}

// =============================================================================
// SQLite operations (sync, run inside spawn_blocking)
// =============================================================================

fn ensure_run_sync(conn: &Connection, run_id: &str, now: i64) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO runs (id, status, created_at) VALUES (?1, 'running', ?2)",
        params![run_id, now],
    )?;
    Ok(())
}

fn write_graph_sync(conn: &mut Connection, write: &GraphWrite, now: i64) -> rusqlite::Result<()> {
    let tx = conn.unchecked_transaction()?;
    ensure_run_sync(&tx, &write.run_id, now)?;
    {
        let mut upsert = tx.prepare_cached(
            "INSERT INTO nodes
             (run_id, id, num, node_type, label, status, placeholder,
              started_seq, ended_seq, started_at, ended_at, body)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(run_id, id) DO UPDATE SET
                num = excluded.num,
                node_type = excluded.node_type,
                label = excluded.label,
                status = excluded.status,
                placeholder = excluded.placeholder,
                started_seq = excluded.started_seq,
                ended_seq = excluded.ended_seq,
                started_at = excluded.started_at,
                ended_at = excluded.ended_at,
                body = excluded.body",
        )?;
        for n in &write.nodes {
            upsert.execute(params![
                write.run_id,
                n.id,
                n.num,
                n.node_type,
                n.label,
                n.status,
                n.placeholder,
                n.started_seq,
                n.ended_seq,
                n.started_at,
                n.ended_at,
                n.body,
            ])?;
        }
    }
    {
        let mut delete = tx.prepare_cached(
            "DELETE FROM edges WHERE run_id = ?1 AND from_id || '->' || to_id = ?2",
        )?;
        for key in &write.removed_edges {
            delete.execute(params![write.run_id, key])?;
        }
        let mut delete = tx.prepare_cached("DELETE FROM nodes WHERE run_id = ?1 AND id = ?2")?;
        for id in &write.removed_nodes {
            delete.execute(params![write.run_id, id])?;
        }
    }
    {
        let mut insert = tx.prepare_cached(
            "INSERT OR IGNORE INTO edges
             (run_id, from_id, to_id, kind, ordinal, created_seq, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )?;
        for e in &write.edges {
            insert.execute(params![
                write.run_id,
                e.from,
                e.to,
                e.kind.as_str(),
                i64::from(e.ordinal),
                seq_to_sql(e.created_seq),
                e.created_at,
            ])?;
        }
    }
    if let Some(seq) = write.cursor {
        tx.execute(
            "INSERT INTO cursors (run_id, applied_seq, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(run_id) DO UPDATE SET
                applied_seq = MAX(applied_seq, excluded.applied_seq),
                updated_at = excluded.updated_at",
            params![write.run_id, seq, now],
        )?;
    }
    tx.commit()
}
