//! Durable per-run log with consumer groups.
//!
//! Semantics follow append-only streams with competing consumers:
//!
//! - every run appends to its own stream (`<prefix>:<runId>`), created lazily
//! - a consumer group keeps one last-delivered cursor per stream
//! - entries handed to a consumer stay *pending* until acknowledged, so a
//!   crashed consumer's batch can be re-read by itself on restart or claimed
//!   by another consumer once idle
//!
//! Entry ids are global and strictly increasing, which makes them monotonic
//! within each stream as well.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rusqlite::{Connection, OptionalExtension, params};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::db::{Db, now_ms};
use crate::error::Result;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS streams (
    key TEXT PRIMARY KEY,
    created_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS stream_entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    stream TEXT NOT NULL,
    payload TEXT NOT NULL,
    appended_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_stream_entries_stream ON stream_entries(stream, id);
CREATE TABLE IF NOT EXISTS consumer_groups (
    stream TEXT NOT NULL,
    grp TEXT NOT NULL,
    last_delivered INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    PRIMARY KEY (stream, grp)
);
CREATE TABLE IF NOT EXISTS pending_entries (
    grp TEXT NOT NULL,
    entry_id INTEGER NOT NULL,
    stream TEXT NOT NULL,
    consumer TEXT NOT NULL,
    delivered_at INTEGER NOT NULL,
    delivery_count INTEGER NOT NULL,
    PRIMARY KEY (grp, entry_id)
);
CREATE INDEX IF NOT EXISTS idx_pending_consumer ON pending_entries(grp, consumer, entry_id);
";

/// Log entry id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId(pub i64);

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One delivered entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: EntryId,
    pub stream: String,
    pub payload: String,
    /// How many times this entry has been handed out, including this time.
    pub delivery_count: u32,
}

/// Where a newly created group starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStart {
    /// Deliver everything already in the stream.
    Beginning,
    /// Deliver only entries appended after the group is created.
    Latest,
}

/// Outcome of [`StreamLog::ensure_group`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureGroup {
    Created,
    AlreadyExists,
}

/// Handle to the durable log. Cheap to clone.
#[derive(Debug, Clone)]
pub struct StreamLog {
    db: Db,
    appended: Arc<Notify>,
}

impl StreamLog {
    /// Open the log in a database file.
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::from_db(Db::open(path, SCHEMA)?))
    }

    /// Private in-memory log.
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::from_db(Db::open_in_memory(SCHEMA)?))
    }

    fn from_db(db: Db) -> Self {
        Self {
            db,
            appended: Arc::new(Notify::new()),
        }
    }

    /// Append `(stream, payload)` pairs in one transaction, creating streams
    /// as needed. Returns the assigned ids in input order.
    pub async fn append_batch(&self, entries: Vec<(String, String)>) -> Result<Vec<EntryId>> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        let ids = self
            .db
            .call(move |conn| append_batch_sync(conn, &entries))
            .await?;
        self.appended.notify_waiters();
        Ok(ids)
    }

    /// Stream keys starting with `<prefix>:`.
    pub async fn scan_streams(&self, prefix: &str) -> Result<Vec<String>> {
        let needle = format!("{prefix}:");
        self.db
            .call(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT key FROM streams WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
                )?;
                let rows = stmt.query_map(params![needle], |row| row.get::<_, String>(0))?;
                rows.collect()
            })
            .await
    }

    /// Create `group` on `stream` unless it exists. Creates the stream too.
    pub async fn ensure_group(
        &self,
        stream: &str,
        group: &str,
        start: GroupStart,
    ) -> Result<EnsureGroup> {
        let stream = stream.to_string();
        let group = group.to_string();
        self.db
            .call(move |conn| {
                let now = now_ms();
                let tx = conn.unchecked_transaction()?;
                tx.execute(
                    "INSERT OR IGNORE INTO streams (key, created_at) VALUES (?1, ?2)",
                    params![stream, now],
                )?;
                let start_id: i64 = match start {
                    GroupStart::Beginning => 0,
                    GroupStart::Latest => tx.query_row(
                        "SELECT COALESCE(MAX(id), 0) FROM stream_entries WHERE stream = ?1",
                        params![stream],
                        |row| row.get(0),
                    )?,
                };
                let inserted = tx.execute(
                    "INSERT OR IGNORE INTO consumer_groups (stream, grp, last_delivered, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![stream, group, start_id, now],
                )?;
                tx.commit()?;
                Ok(if inserted == 1 {
                    EnsureGroup::Created
                } else {
                    EnsureGroup::AlreadyExists
                })
            })
            .await
    }

    /// Deliver up to `count` new entries per stream to `consumer`, blocking up
    /// to `block` when none are available.
    ///
    /// Streams without `group` are skipped. Delivered entries are pending
    /// until [`Self::ack`]. Appends by other processes are seen when the
    /// block timeout elapses.
    pub async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        streams: &[String],
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>> {
        let deadline = Instant::now() + block;
        loop {
            let notified = self.appended.notified();
            let group_owned = group.to_string();
            let consumer_owned = consumer.to_string();
            let streams_owned = streams.to_vec();
            let batch = self
                .db
                .call(move |conn| {
                    deliver_new_sync(conn, &group_owned, &consumer_owned, &streams_owned, count)
                })
                .await?;
            if !batch.is_empty() {
                debug!(
                    target: "tracegraph.worker",
                    group,
                    consumer,
                    entries = batch.len(),
                    "claimed new entries"
                );
                return Ok(batch);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(batch);
            }
            let _ = tokio::time::timeout(deadline - now, notified).await;
        }
    }

    /// Entries already delivered to `consumer` but not acknowledged, oldest
    /// first. Used to resume after a restart under the same consumer name.
    pub async fn read_pending(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let group = group.to_string();
        let consumer = consumer.to_string();
        self.db
            .call(move |conn| {
                let tx = conn.unchecked_transaction()?;
                let entries = {
                    let mut stmt = tx.prepare_cached(
                        "SELECT p.entry_id, p.stream, e.payload, p.delivery_count
                         FROM pending_entries p
                         JOIN stream_entries e ON e.id = p.entry_id
                         WHERE p.grp = ?1 AND p.consumer = ?2
                         ORDER BY p.entry_id
                         LIMIT ?3",
                    )?;
                    let rows = stmt.query_map(params![group, consumer, count as i64], map_entry)?;
                    rows.collect::<rusqlite::Result<Vec<_>>>()?
                };
                redeliver_sync(&tx, &group, &consumer, &entries)?;
                tx.commit()?;
                Ok(bump(entries))
            })
            .await
    }

    /// Take over entries pending on *other* consumers for at least
    /// `min_idle`, restricted to `streams`. Pending rows whose entry was
    /// trimmed away are dropped.
    pub async fn claim_stale(
        &self,
        group: &str,
        consumer: &str,
        streams: &[String],
        min_idle: Duration,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        if streams.is_empty() {
            return Ok(Vec::new());
        }
        let group = group.to_string();
        let consumer = consumer.to_string();
        let wanted: HashSet<String> = streams.iter().cloned().collect();
        let cutoff = now_ms() - i64::try_from(min_idle.as_millis()).unwrap_or(i64::MAX);
        self.db
            .call(move |conn| {
                let tx = conn.unchecked_transaction()?;
                tx.execute(
                    "DELETE FROM pending_entries
                     WHERE grp = ?1 AND NOT EXISTS (
                         SELECT 1 FROM stream_entries e WHERE e.id = pending_entries.entry_id
                     )",
                    params![group],
                )?;
                let candidates = {
                    let mut stmt = tx.prepare_cached(
                        "SELECT p.entry_id, p.stream, e.payload, p.delivery_count
                         FROM pending_entries p
                         JOIN stream_entries e ON e.id = p.entry_id
                         WHERE p.grp = ?1 AND p.consumer != ?2 AND p.delivered_at <= ?3
                         ORDER BY p.entry_id",
                    )?;
                    let rows = stmt.query_map(params![group, consumer, cutoff], map_entry)?;
                    rows.collect::<rusqlite::Result<Vec<_>>>()?
                };
                let entries: Vec<StreamEntry> = candidates
                    .into_iter()
                    .filter(|e| wanted.contains(&e.stream))
                    .take(count)
                    .collect();
                redeliver_sync(&tx, &group, &consumer, &entries)?;
                tx.commit()?;
                Ok(bump(entries))
            })
            .await
    }

    /// Acknowledge entries. Returns how many were pending.
    pub async fn ack(&self, group: &str, ids: &[EntryId]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let group = group.to_string();
        let ids = ids.to_vec();
        self.db
            .call(move |conn| {
                let tx = conn.unchecked_transaction()?;
                let mut removed = 0;
                {
                    let mut stmt = tx.prepare_cached(
                        "DELETE FROM pending_entries WHERE grp = ?1 AND entry_id = ?2",
                    )?;
                    for id in &ids {
                        removed += stmt.execute(params![group, id.0])?;
                    }
                }
                tx.commit()?;
                Ok(removed)
            })
            .await
    }

    /// Unacknowledged entries across all consumers of `group`.
    pub async fn pending_count(&self, group: &str) -> Result<u64> {
        let group = group.to_string();
        self.db
            .call(move |conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM pending_entries WHERE grp = ?1",
                    params![group],
                    |row| row.get::<_, i64>(0),
                )
                .map(|n| n as u64)
            })
            .await
    }

    /// Number of entries currently stored for `stream`.
    pub async fn stream_len(&self, stream: &str) -> Result<u64> {
        let stream = stream.to_string();
        self.db
            .call(move |conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM stream_entries WHERE stream = ?1",
                    params![stream],
                    |row| row.get::<_, i64>(0),
                )
                .map(|n| n as u64)
            })
            .await
    }

    /// Keep only the newest `max_len` entries of `stream`.
    pub async fn trim(&self, stream: &str, max_len: u64) -> Result<usize> {
        let stream = stream.to_string();
        self.db
            .call(move |conn| {
                conn.execute(
                    "DELETE FROM stream_entries
                     WHERE stream = ?1 AND id NOT IN (
                         SELECT id FROM stream_entries WHERE stream = ?1 ORDER BY id DESC LIMIT ?2
                     )",
                    params![stream, max_len as i64],
                )
            })
            .await
    }

    /// Last-delivered cursor of `group` on `stream`, if the group exists.
    pub async fn group_cursor(&self, stream: &str, group: &str) -> Result<Option<EntryId>> {
        let stream = stream.to_string();
        let group = group.to_string();
        self.db
            .call(move |conn| {
                conn.query_row(
                    "SELECT last_delivered FROM consumer_groups WHERE stream = ?1 AND grp = ?2",
                    params![stream, group],
                    |row| row.get::<_, i64>(0),
                )
                .optional()
                .map(|v| v.map(EntryId))
            })
            .await
    }
}

// =============================================================================
// SQLite operations (sync, run inside spawn_blocking)
// =============================================================================

fn append_batch_sync(
    conn: &mut Connection,
    entries: &[(String, String)],
) -> rusqlite::Result<Vec<EntryId>> {
    let now = now_ms();
    let tx = conn.unchecked_transaction()?;
    let mut ids = Vec::with_capacity(entries.len());
    {
        let mut ensure = tx.prepare_cached(
            "INSERT OR IGNORE INTO streams (key, created_at) VALUES (?1, ?2)",
        )?;
        let mut insert = tx.prepare_cached(
            "INSERT INTO stream_entries (stream, payload, appended_at) VALUES (?1, ?2, ?3)",
        )?;
        let mut seen: HashSet<&str> = HashSet::new();
        for (stream, payload) in entries {
            if seen.insert(stream.as_str()) {
                ensure.execute(params![stream, now])?;
            }
            insert.execute(params![stream, payload, now])?;
            ids.push(EntryId(tx.last_insert_rowid()));
        }
    }
    tx.commit()?;
    Ok(ids)
}

fn deliver_new_sync(
    conn: &mut Connection,
    group: &str,
    consumer: &str,
    streams: &[String],
    count: usize,
) -> rusqlite::Result<Vec<StreamEntry>> {
    let now = now_ms();
    let tx = conn.unchecked_transaction()?;
    let mut delivered = Vec::new();
    {
        let mut cursor_stmt = tx.prepare_cached(
            "SELECT last_delivered FROM consumer_groups WHERE stream = ?1 AND grp = ?2",
        )?;
        let mut entries_stmt = tx.prepare_cached(
            "SELECT id, stream, payload FROM stream_entries
             WHERE stream = ?1 AND id > ?2 ORDER BY id LIMIT ?3",
        )?;
        let mut pending_stmt = tx.prepare_cached(
            "INSERT OR REPLACE INTO pending_entries
             (grp, entry_id, stream, consumer, delivered_at, delivery_count)
             VALUES (?1, ?2, ?3, ?4, ?5, 1)",
        )?;
        let mut advance_stmt = tx.prepare_cached(
            "UPDATE consumer_groups SET last_delivered = ?3 WHERE stream = ?1 AND grp = ?2",
        )?;

        for stream in streams {
            let Some(last) = cursor_stmt
                .query_row(params![stream, group], |row| row.get::<_, i64>(0))
                .optional()?
            else {
                continue;
            };
            let rows = entries_stmt.query_map(params![stream, last, count as i64], |row| {
                Ok(StreamEntry {
                    id: EntryId(row.get(0)?),
                    stream: row.get(1)?,
                    payload: row.get(2)?,
                    delivery_count: 1,
                })
            })?;
            let batch = rows.collect::<rusqlite::Result<Vec<_>>>()?;
            let Some(max_id) = batch.last().map(|e| e.id.0) else {
                continue;
            };
            for entry in &batch {
                pending_stmt.execute(params![group, entry.id.0, entry.stream, consumer, now])?;
            }
            advance_stmt.execute(params![stream, group, max_id])?;
            delivered.extend(batch);
        }
    }
    tx.commit()?;
    Ok(delivered)
}

fn map_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<StreamEntry> {
    Ok(StreamEntry {
        id: EntryId(row.get(0)?),
        stream: row.get(1)?,
        payload: row.get(2)?,
        delivery_count: row.get::<_, i64>(3)? as u32,
    })
}

fn redeliver_sync(
    tx: &rusqlite::Transaction<'_>,
    group: &str,
    consumer: &str,
    entries: &[StreamEntry],
) -> rusqlite::Result<()> {
    let now = now_ms();
    let mut stmt = tx.prepare_cached(
        "UPDATE pending_entries
         SET consumer = ?3, delivered_at = ?4, delivery_count = delivery_count + 1
         WHERE grp = ?1 AND entry_id = ?2",
    )?;
    for entry in entries {
        stmt.execute(params![group, entry.id.0, consumer, now])?;
    }
    Ok(())
}

/// Reflect the increment made by [`redeliver_sync`] in the returned rows.
fn bump(entries: Vec<StreamEntry>) -> Vec<StreamEntry> {
    entries
        .into_iter()
        .map(|mut e| {
            e.delivery_count += 1;
            e
        })
        .collect()
}
