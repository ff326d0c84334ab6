//! Notification channels between the worker and the web tier.
//!
//! A [`Bus`] is a fire-and-forget publish/subscribe layer over a SQLite
//! `notifications` table, so a worker and a web server in separate
//! processes sharing one database file still see each other's messages.
//! Publishers in the same process wake subscribers immediately; cross-process
//! messages are picked up on the next poll.
//!
//! Subscribers start at the tail: nothing published before
//! [`Bus::psubscribe`] is replayed.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rusqlite::params;
use tokio::sync::Notify;

use crate::db::{Db, now_ms};
use crate::error::Result;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS notifications (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    channel TEXT NOT NULL,
    payload TEXT NOT NULL,
    published_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_notifications_published ON notifications(published_at);
";

/// Channel prefix for graph deltas.
pub const UPDATES_PREFIX: &str = "updates";

/// Pattern matching every delta channel.
pub const UPDATES_PATTERN: &str = "updates:*";

const DEFAULT_POLL: Duration = Duration::from_millis(50);
const FETCH_LIMIT: i64 = 512;

/// Delta channel for a run.
#[must_use]
pub fn updates_channel(run_id: &str) -> String {
    format!("{UPDATES_PREFIX}:{run_id}")
}

/// Run id embedded in a channel name: everything after the first `:`.
#[must_use]
pub fn channel_run_id(channel: &str) -> Option<&str> {
    channel
        .split_once(':')
        .map(|(_, run)| run)
        .filter(|run| !run.is_empty())
}

/// Channel pattern: exact name, or `prefix*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pattern {
    Exact(String),
    Prefix(String),
}

impl Pattern {
    #[must_use]
    pub fn parse(pattern: &str) -> Self {
        pattern.strip_suffix('*').map_or_else(
            || Self::Exact(pattern.to_string()),
            |prefix| Self::Prefix(prefix.to_string()),
        )
    }

    #[must_use]
    pub fn matches(&self, channel: &str) -> bool {
        match self {
            Self::Exact(name) => name == channel,
            Self::Prefix(prefix) => channel.starts_with(prefix.as_str()),
        }
    }
}

/// One received notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub channel: String,
    pub payload: String,
}

/// Publish/subscribe handle. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Bus {
    db: Db,
    published: Arc<Notify>,
    poll: Duration,
}

impl Bus {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::from_db(Db::open(path, SCHEMA)?))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::from_db(Db::open_in_memory(SCHEMA)?))
    }

    fn from_db(db: Db) -> Self {
        Self {
            db,
            published: Arc::new(Notify::new()),
            poll: DEFAULT_POLL,
        }
    }

    /// Interval at which subscribers look for cross-process messages.
    #[must_use]
    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    pub async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let channel = channel.to_string();
        let payload = payload.to_string();
        self.db
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO notifications (channel, payload, published_at) VALUES (?1, ?2, ?3)",
                    params![channel, payload, now_ms()],
                )
            })
            .await?;
        self.published.notify_waiters();
        Ok(())
    }

    /// Subscribe to every channel matching `pattern`.
    pub async fn psubscribe(&self, pattern: &str) -> Result<Subscription> {
        let cursor: i64 = self
            .db
            .call(|conn| {
                conn.query_row("SELECT COALESCE(MAX(id), 0) FROM notifications", [], |row| {
                    row.get(0)
                })
            })
            .await?;
        Ok(Subscription {
            bus: self.clone(),
            pattern: Pattern::parse(pattern),
            cursor,
            buffered: VecDeque::new(),
        })
    }

    /// Drop notifications older than `max_age`.
    pub async fn trim_older_than(&self, max_age: Duration) -> Result<usize> {
        let cutoff = now_ms() - i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);
        self.db
            .call(move |conn| {
                conn.execute(
                    "DELETE FROM notifications WHERE published_at < ?1",
                    params![cutoff],
                )
            })
            .await
    }
}

/// Stream of messages for one pattern.
#[derive(Debug)]
pub struct Subscription {
    bus: Bus,
    pattern: Pattern,
    cursor: i64,
    buffered: VecDeque<Message>,
}

impl Subscription {
    #[must_use]
    pub fn pattern(&self) -> &Pattern {
        &self.pattern
    }

    /// Wait for the next matching message.
    pub async fn next(&mut self) -> Result<Message> {
        loop {
            if let Some(message) = self.buffered.pop_front() {
                return Ok(message);
            }
            let published = Arc::clone(&self.bus.published);
            let notified = published.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            self.fetch().await?;
            if !self.buffered.is_empty() {
                continue;
            }
            let _ = tokio::time::timeout(self.bus.poll, notified).await;
        }
    }

    /// Pull everything published since the cursor.
    async fn fetch(&mut self) -> Result<()> {
        let after = self.cursor;
        let rows: Vec<(i64, String, String)> = self
            .bus
            .db
            .call(move |conn| {
                let mut stmt = conn.prepare_cached(
                    "SELECT id, channel, payload FROM notifications
                     WHERE id > ?1 ORDER BY id LIMIT ?2",
                )?;
                let rows = stmt.query_map(params![after, FETCH_LIMIT], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })?;
                rows.collect()
            })
            .await?;
        for (id, channel, payload) in rows {
            self.cursor = id;
            if self.pattern.matches(&channel) {
                self.buffered.push_back(Message { channel, payload });
            }
        }
        Ok(())
    }
}
