//! The claim/apply/emit/persist/ack loop.
//!
//! A [`Worker`] owns the in-memory [`GraphState`] of every run routed to it.
//! It claims log entries through the shared consumer group, folds them into
//! their run's state, and on a fixed frame cadence:
//!
//! 1. publishes a [`GraphDelta`](crate::correlator::GraphDelta) for each run
//!    that changed since its last emission
//! 2. persists the run when its persist interval has elapsed
//! 3. snapshots the run when its snapshot interval has elapsed
//! 4. acknowledges the entries consumed since the last emission
//!
//! Entries are acknowledged only after their run's delta went out. A run whose
//! publish failed keeps its entries pending and is retried on the next frame;
//! a crash before the ack redelivers them, which the correlator's sequence
//! gate absorbs.
//!
//! Resident runs are bounded by `max_resident_runs`. Once over the bound, the
//! least recently touched runs that are emitted and acked are persisted,
//! snapshotted and dropped; their next event rehydrates them from the latest
//! snapshot.

use std::collections::HashSet;
use std::time::Duration;

use lru::LruCache;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{Config, StreamConfig, WorkerConfig};
use crate::correlator::{ApplyOutcome, GraphState};
use crate::db::now_ms;
use crate::error::{Error, Result, StorageError};
use crate::event::{parse_line, run_id_from_stream};
use crate::persistence::{GraphStore, PersistenceState};
use crate::pubsub::{Bus, updates_channel};
use crate::retry::{RetryPolicy, with_retry};
use crate::routing::RunRouter;
use crate::stream_log::{EntryId, GroupStart, StreamEntry, StreamLog};

/// Upper bound on own pending entries replayed at startup.
pub const RECOVERY_LIMIT: usize = 100_000;

/// Running totals since the worker started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStats {
    pub entries_read: u64,
    pub events_applied: u64,
    pub duplicates: u64,
    pub rejected: u64,
    pub deltas_published: u64,
    pub publish_failures: u64,
    pub persist_failures: u64,
    pub snapshots: u64,
    pub acked: u64,
    pub rehydrated: u64,
    pub evicted: u64,
}

/// What one [`Worker::tick`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub published: usize,
    pub publish_failed: usize,
    pub persisted: usize,
    pub snapshots: usize,
    pub completed: usize,
    pub acked: usize,
    pub evicted: usize,
}

struct RunSlot {
    state: GraphState,
    persistence: PersistenceState,
    unacked: Vec<EntryId>,
    emitted_revision: u64,
    persisted_revision: u64,
    snapshot_revision: u64,
    last_persist: Option<Instant>,
    last_snapshot: Instant,
    completed: bool,
}

impl RunSlot {
    fn new(state: GraphState, persistence: PersistenceState) -> Self {
        let revision = state.revision();
        Self {
            state,
            persistence,
            unacked: Vec::new(),
            emitted_revision: revision,
            persisted_revision: revision,
            snapshot_revision: revision,
            last_persist: None,
            last_snapshot: Instant::now(),
            completed: false,
        }
    }

    fn is_emitted(&self) -> bool {
        self.emitted_revision == self.state.revision()
    }
}

fn due(last: Option<Instant>, interval: Duration) -> bool {
    last.is_none_or(|at| at.elapsed() >= interval)
}

/// Stream consumer for one process.
pub struct Worker {
    log: StreamLog,
    store: GraphStore,
    bus: Bus,
    router: RunRouter,
    stream: StreamConfig,
    config: WorkerConfig,
    consumer: String,
    owned: Vec<String>,
    owned_set: HashSet<String>,
    runs: LruCache<String, RunSlot>,
    deferred: Vec<StreamEntry>,
    orphan_acks: Vec<EntryId>,
    last_bus_trim: Instant,
    stats: WorkerStats,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("consumer", &self.consumer)
            .field("streams", &self.owned.len())
            .field("resident_runs", &self.runs.len())
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl Worker {
    #[must_use]
    pub fn new(log: StreamLog, store: GraphStore, bus: Bus, config: &Config) -> Self {
        let consumer = config.worker.consumer_name();
        let router = if config.worker.members.is_empty() {
            RunRouter::solo(consumer.clone())
        } else {
            RunRouter::new(
                consumer.clone(),
                config.worker.members.iter().cloned(),
                config.worker.vnodes,
            )
        };
        Self {
            log,
            store,
            bus,
            router,
            stream: config.stream.clone(),
            config: config.worker.clone(),
            consumer,
            owned: Vec::new(),
            owned_set: HashSet::new(),
            runs: LruCache::unbounded(),
            deferred: Vec::new(),
            orphan_acks: Vec::new(),
            last_bus_trim: Instant::now(),
            stats: WorkerStats::default(),
        }
    }

    #[must_use]
    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    #[must_use]
    pub fn stats(&self) -> WorkerStats {
        self.stats
    }

    /// Streams this worker reads from.
    #[must_use]
    pub fn streams(&self) -> &[String] {
        &self.owned
    }

    #[must_use]
    pub fn resident_runs(&self) -> usize {
        self.runs.len()
    }

    /// Resident state of a run, without touching its recency.
    #[must_use]
    pub fn state(&self, run_id: &str) -> Option<&GraphState> {
        self.runs.peek(run_id).map(|slot| &slot.state)
    }

    /// Pick up streams created since the last scan and join the group on
    /// those routed here. Returns how many were added.
    pub async fn rescan(&mut self) -> Result<usize> {
        let mut added = 0;
        for stream in self.log.scan_streams(&self.stream.prefix).await? {
            if self.owned_set.contains(&stream) {
                continue;
            }
            let Some(run_id) = run_id_from_stream(&self.stream.prefix, &stream) else {
                continue;
            };
            if !self.router.owns(run_id) {
                continue;
            }
            let created = self
                .log
                .ensure_group(&stream, &self.stream.group, GroupStart::Beginning)
                .await?;
            debug!(
                target: "tracegraph.worker",
                stream = %stream,
                group = %self.stream.group,
                ?created,
                "joined stream"
            );
            self.owned_set.insert(stream.clone());
            self.owned.push(stream);
            added += 1;
        }
        if added > 0 {
            info!(
                target: "tracegraph.worker",
                added,
                total = self.owned.len(),
                "streams discovered"
            );
        }
        Ok(added)
    }

    /// Replay this consumer's own unacknowledged entries, then take over
    /// entries idle on other consumers. Returns how many were replayed.
    pub async fn recover(&mut self) -> Result<usize> {
        let own = self
            .log
            .read_pending(&self.stream.group, &self.consumer, RECOVERY_LIMIT)
            .await?;
        let own_count = own.len();
        self.accept(own).await;
        let claimed = self.claim_stale().await?;
        if own_count + claimed > 0 {
            info!(
                target: "tracegraph.worker",
                consumer = %self.consumer,
                own = own_count,
                claimed,
                "recovered pending entries"
            );
        }
        Ok(own_count + claimed)
    }

    async fn claim_stale(&mut self) -> Result<usize> {
        let entries = self
            .log
            .claim_stale(
                &self.stream.group,
                &self.consumer,
                &self.owned,
                self.stream.claim_idle(),
                self.stream.batch_count,
            )
            .await?;
        let count = entries.len();
        self.accept(entries).await;
        Ok(count)
    }

    /// One blocking group read plus apply. Returns entries read.
    pub async fn poll_once(&mut self) -> Result<usize> {
        let entries = self.read_new().await?;
        let count = entries.len();
        self.accept(entries).await;
        Ok(count)
    }

    async fn read_new(&self) -> Result<Vec<StreamEntry>> {
        self.log
            .read_group(
                &self.stream.group,
                &self.consumer,
                &self.owned,
                self.stream.batch_count,
                self.stream.block(),
            )
            .await
    }

    /// Fold entries into their runs. Entries for a run that cannot be loaded
    /// are deferred, together with everything after them for that run.
    async fn accept(&mut self, entries: Vec<StreamEntry>) {
        self.stats.entries_read += entries.len() as u64;
        let mut batch = std::mem::take(&mut self.deferred);
        batch.extend(entries);
        let mut blocked: HashSet<String> = HashSet::new();

        for entry in batch {
            let event = match parse_line(&entry.payload) {
                Ok(event) => event,
                Err(e) => {
                    warn!(
                        target: "tracegraph.worker",
                        stream = %entry.stream,
                        entry_id = %entry.id,
                        error = %e,
                        "dropping malformed entry"
                    );
                    self.stats.rejected += 1;
                    self.orphan_acks.push(entry.id);
                    continue;
                }
            };
            if blocked.contains(&event.run_id) {
                self.deferred.push(entry);
                continue;
            }
            if let Err(e) = self.load_run(&event.run_id).await {
                warn!(
                    target: "tracegraph.worker",
                    run_id = %event.run_id,
                    error = %e,
                    "run state unavailable; deferring its entries"
                );
                blocked.insert(event.run_id.clone());
                self.deferred.push(entry);
                continue;
            }
            let Some(slot) = self.runs.get_mut(&event.run_id) else {
                self.deferred.push(entry);
                continue;
            };
            match slot.state.apply(&event) {
                ApplyOutcome::Applied => self.stats.events_applied += 1,
                ApplyOutcome::Duplicate => {
                    self.stats.duplicates += 1;
                    debug!(
                        target: "tracegraph.worker",
                        run_id = %event.run_id,
                        seq = event.seq,
                        "duplicate delivery"
                    );
                }
            }
            slot.unacked.push(entry.id);
        }
    }

    /// Make sure `run_id` is resident, rehydrating it if it was seen before.
    async fn load_run(&mut self, run_id: &str) -> Result<()> {
        if self.runs.contains(run_id) {
            return Ok(());
        }
        let slot = if self.config.persist_enabled {
            self.store.ensure_run(run_id).await?;
            let snapshot = match self.store.load_latest_snapshot(run_id).await {
                Ok(snapshot) => snapshot,
                Err(Error::Storage(StorageError::CorruptSnapshot { details, .. })) => {
                    warn!(
                        target: "tracegraph.worker",
                        run_id,
                        details = %details,
                        "ignoring unreadable snapshot"
                    );
                    None
                }
                Err(e) => return Err(e),
            };
            let persistence = self.store.load_persistence_state(run_id).await?;
            let state = match snapshot {
                Some(snapshot) => {
                    self.stats.rehydrated += 1;
                    info!(
                        target: "tracegraph.worker",
                        run_id,
                        seq = ?snapshot.cursor.last_seq,
                        nodes = snapshot.nodes.len(),
                        "rehydrated run from snapshot"
                    );
                    GraphState::from_snapshot(snapshot)
                }
                None => GraphState::new(run_id),
            };
            RunSlot::new(state, persistence)
        } else {
            RunSlot::new(GraphState::new(run_id), PersistenceState::default())
        };
        self.runs.push(run_id.to_string(), slot);
        Ok(())
    }

    /// Emit, persist, snapshot and ack every run with pending work. `force`
    /// ignores the persist and snapshot intervals.
    pub async fn tick(&mut self, force: bool) -> TickReport {
        let mut report = TickReport::default();
        let persist_interval = self.config.persist_interval();
        let snapshot_interval = self.config.snapshot_interval();
        let keys: Vec<String> = self.runs.iter().map(|(k, _)| k.clone()).collect();

        for run_id in keys {
            let Some(slot) = self.runs.peek_mut(&run_id) else {
                continue;
            };
            let revision = slot.state.revision();

            let mut published = true;
            if !slot.is_emitted() {
                match serde_json::to_string(&slot.state.build_delta(now_ms())) {
                    Ok(payload) => {
                        let channel = updates_channel(&run_id);
                        let outcome = with_retry(&RetryPolicy::publish(), || {
                            self.bus.publish(&channel, &payload)
                        })
                        .await;
                        match outcome {
                            Ok(()) => {
                                slot.emitted_revision = revision;
                                self.stats.deltas_published += 1;
                                report.published += 1;
                            }
                            Err(e) => {
                                published = false;
                                self.stats.publish_failures += 1;
                                report.publish_failed += 1;
                                warn!(
                                    target: "tracegraph.worker",
                                    run_id = %run_id,
                                    error = %e,
                                    "delta publish failed; holding ack"
                                );
                            }
                        }
                    }
                    Err(e) => {
                        published = false;
                        warn!(
                            target: "tracegraph.worker",
                            run_id = %run_id,
                            error = %e,
                            "delta encode failed"
                        );
                    }
                }
            }

            if self.config.persist_enabled {
                if slot.persisted_revision != revision
                    && (force || due(slot.last_persist, persist_interval))
                {
                    match self.store.persist_graph(&slot.state, &mut slot.persistence).await {
                        Ok(_) => {
                            slot.persisted_revision = revision;
                            slot.last_persist = Some(Instant::now());
                            report.persisted += 1;
                        }
                        Err(e) => {
                            self.stats.persist_failures += 1;
                            warn!(
                                target: "tracegraph.worker",
                                run_id = %run_id,
                                error = %e,
                                "persist failed"
                            );
                        }
                    }
                }
                if slot.snapshot_revision != revision
                    && (force || slot.last_snapshot.elapsed() >= snapshot_interval)
                {
                    match self.store.save_snapshot(&slot.state).await {
                        Ok(_) => {
                            slot.snapshot_revision = revision;
                            slot.last_snapshot = Instant::now();
                            self.stats.snapshots += 1;
                            report.snapshots += 1;
                        }
                        Err(e) => {
                            self.stats.persist_failures += 1;
                            warn!(
                                target: "tracegraph.worker",
                                run_id = %run_id,
                                error = %e,
                                "snapshot failed"
                            );
                        }
                    }
                }
                if let Some(outcome) = slot.state.outcome() {
                    if !slot.completed && slot.persisted_revision == revision {
                        match self.store.complete_run(&run_id, outcome).await {
                            Ok(changed) => {
                                slot.completed = true;
                                if changed {
                                    report.completed += 1;
                                    info!(
                                        target: "tracegraph.worker",
                                        run_id = %run_id,
                                        outcome = outcome.as_str(),
                                        "run completed"
                                    );
                                }
                            }
                            Err(e) => {
                                warn!(
                                    target: "tracegraph.worker",
                                    run_id = %run_id,
                                    error = %e,
                                    "run completion failed"
                                );
                            }
                        }
                    }
                }
            }

            if published && !slot.unacked.is_empty() {
                let ids = std::mem::take(&mut slot.unacked);
                match self.log.ack(&self.stream.group, &ids).await {
                    Ok(_) => {
                        self.stats.acked += ids.len() as u64;
                        report.acked += ids.len();
                    }
                    Err(e) => {
                        warn!(target: "tracegraph.worker", run_id = %run_id, error = %e, "ack failed");
                        slot.unacked = ids;
                    }
                }
            }
        }

        if !self.orphan_acks.is_empty() {
            let ids = std::mem::take(&mut self.orphan_acks);
            match self.log.ack(&self.stream.group, &ids).await {
                Ok(_) => {
                    self.stats.acked += ids.len() as u64;
                    report.acked += ids.len();
                }
                Err(e) => {
                    warn!(target: "tracegraph.worker", error = %e, "ack of malformed entries failed");
                    self.orphan_acks = ids;
                }
            }
        }

        report.evicted = self.evict_overflow().await;
        report
    }

    /// Drop least recently touched runs beyond `max_resident_runs`, writing
    /// what they still need first. Runs with unemitted or unacked work stay.
    async fn evict_overflow(&mut self) -> usize {
        let max = self.config.max_resident_runs.max(1);
        if self.runs.len() <= max || !self.config.persist_enabled {
            return 0;
        }
        let candidates: Vec<String> = self
            .runs
            .iter()
            .rev()
            .filter(|(_, slot)| slot.is_emitted() && slot.unacked.is_empty())
            .map(|(k, _)| k.clone())
            .collect();

        let mut evicted = 0;
        for run_id in candidates {
            if self.runs.len() <= max {
                break;
            }
            let Some(slot) = self.runs.peek_mut(&run_id) else {
                continue;
            };
            let revision = slot.state.revision();
            if slot.persisted_revision != revision {
                if let Err(e) = self
                    .store
                    .persist_graph(&slot.state, &mut slot.persistence)
                    .await
                {
                    warn!(
                        target: "tracegraph.worker",
                        run_id = %run_id,
                        error = %e,
                        "persist before eviction failed"
                    );
                    continue;
                }
                slot.persisted_revision = revision;
            }
            if slot.snapshot_revision != revision {
                if let Err(e) = self.store.save_snapshot(&slot.state).await {
                    warn!(
                        target: "tracegraph.worker",
                        run_id = %run_id,
                        error = %e,
                        "snapshot before eviction failed"
                    );
                    continue;
                }
                slot.snapshot_revision = revision;
                self.stats.snapshots += 1;
            }
            self.runs.pop(&run_id);
            self.stats.evicted += 1;
            evicted += 1;
            debug!(target: "tracegraph.worker", run_id = %run_id, "evicted run state");
        }
        evicted
    }

    async fn housekeeping(&mut self) {
        if let Err(e) = self.rescan().await {
            warn!(target: "tracegraph.worker", error = %e, "stream rescan failed");
        }
        match self.claim_stale().await {
            Ok(0) => {}
            Ok(claimed) => info!(target: "tracegraph.worker", claimed, "claimed idle entries"),
            Err(e) => warn!(target: "tracegraph.worker", error = %e, "stale claim failed"),
        }
        let retention = self.config.bus_retention();
        if self.last_bus_trim.elapsed() >= retention {
            self.last_bus_trim = Instant::now();
            match self.bus.trim_older_than(retention).await {
                Ok(0) => {}
                Ok(trimmed) => debug!(target: "tracegraph.worker", trimmed, "trimmed notifications"),
                Err(e) => warn!(target: "tracegraph.worker", error = %e, "notification trim failed"),
            }
        }
    }

    /// Run until `shutdown` flips to `true`, then emit and persist once more.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.rescan().await?;
        self.recover().await?;
        info!(
            target: "tracegraph.worker",
            consumer = %self.consumer,
            group = %self.stream.group,
            streams = self.owned.len(),
            fps = self.config.fps,
            "worker started"
        );

        let frame = self.config.frame_interval();
        let rescan = self.stream.rescan_interval();
        let mut last_frame = Instant::now();
        let mut last_rescan = Instant::now();

        loop {
            if *shutdown.borrow() {
                break;
            }
            let read = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                read = self.read_new() => read,
            };
            match read {
                Ok(entries) => self.accept(entries).await,
                Err(e) => {
                    warn!(target: "tracegraph.worker", error = %e, "group read failed");
                    tokio::time::sleep(self.stream.block().max(Duration::from_millis(50))).await;
                }
            }
            if last_frame.elapsed() >= frame {
                last_frame = Instant::now();
                self.tick(false).await;
            }
            if last_rescan.elapsed() >= rescan {
                last_rescan = Instant::now();
                self.housekeeping().await;
            }
        }

        let report = self.tick(true).await;
        info!(
            target: "tracegraph.worker",
            published = report.published,
            acked = report.acked,
            stats = ?self.stats,
            "worker stopped"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::correlator::{NodeStatus, RunOutcome};
    use crate::event::{TelemetryEvent, stream_key};
    use crate::pubsub::UPDATES_PATTERN;

    struct Pipeline {
        log: StreamLog,
        store: GraphStore,
        bus: Bus,
    }

    impl Pipeline {
        fn new() -> Self {
            Self {
                log: StreamLog::open_in_memory().unwrap(),
                store: GraphStore::open_in_memory().unwrap(),
                bus: Bus::open_in_memory().unwrap(),
            }
        }

        fn worker(&self, config: &Config) -> Worker {
            Worker::new(self.log.clone(), self.store.clone(), self.bus.clone(), config)
        }

        async fn append(&self, lines: &[String]) {
            let entries = lines
                .iter()
                .map(|line| {
                    let run = parse_line(line).map_or_else(|_| "broken".to_string(), |e| e.run_id);
                    (stream_key("tal", &run), line.clone())
                })
                .collect();
            self.log.append_batch(entries).await.unwrap();
        }
    }

    fn config(consumer: &str) -> Config {
        let mut config = Config::default();
        config.worker.consumer = Some(consumer.to_string());
        config.worker.persist_interval_ms = 0;
        config.stream.block_ms = 0;
        config
    }

    fn line(event: &TelemetryEvent) -> String {
        serde_json::to_string(event).unwrap()
    }

    fn scenario() -> Vec<String> {
        vec![
            r#"{"runId":"r1","seq":0,"ts":1000,"kind":"call_start","span":"main","nodeKey":"main"}"#
                .to_string(),
            r#"{"runId":"r1","seq":1,"ts":1005,"kind":"call","span":"loadData","parentSpan":"main"}"#
                .to_string(),
        ]
    }

    #[tokio::test]
    async fn scenario_builds_graph_and_acks_after_emit() {
        let p = Pipeline::new();
        p.append(&scenario()).await;
        let mut sub = p.bus.psubscribe(UPDATES_PATTERN).await.unwrap();
        let mut worker = p.worker(&config("w-1"));

        assert_eq!(worker.rescan().await.unwrap(), 1);
        assert_eq!(worker.poll_once().await.unwrap(), 2);
        assert_eq!(p.log.pending_count("graph-worker").await.unwrap(), 2);

        let state = worker.state("r1").unwrap();
        assert_eq!(state.node_count(), 2);
        assert_eq!(state.edge_count(), 1);
        assert!(state.has_edge("main", "span:loadData"));
        assert_eq!(state.node("main").unwrap().status, NodeStatus::Running);

        let report = worker.tick(false).await;
        assert_eq!(report.published, 1);
        assert_eq!(report.acked, 2);
        assert_eq!(p.log.pending_count("graph-worker").await.unwrap(), 0);

        let message = sub.next().await.unwrap();
        assert_eq!(message.channel, "updates:r1");
        let delta: serde_json::Value = serde_json::from_str(&message.payload).unwrap();
        assert_eq!(delta["type"], "GraphDelta");
        assert_eq!(delta["atSeq"], 1);
        assert_eq!(delta["nodes"].as_array().unwrap().len(), 2);

        let stored = p.store.load_graph("r1").await.unwrap().unwrap();
        assert_eq!(stored.nodes.len(), 2);
        assert_eq!(stored.run.applied_seq, Some(1));
    }

    #[tokio::test]
    async fn unchanged_runs_are_not_re_emitted() {
        let p = Pipeline::new();
        p.append(&scenario()).await;
        let mut worker = p.worker(&config("w-1"));
        worker.rescan().await.unwrap();
        worker.poll_once().await.unwrap();
        assert_eq!(worker.tick(false).await.published, 1);
        assert_eq!(worker.tick(false).await.published, 0);

        // A redelivered duplicate is acked without a new delta.
        p.append(&scenario()[..1]).await;
        worker.poll_once().await.unwrap();
        let report = worker.tick(false).await;
        assert_eq!(report.published, 0);
        assert_eq!(report.acked, 1);
        assert_eq!(worker.stats().duplicates, 1);
    }

    #[tokio::test]
    async fn crash_before_ack_redelivers_identical_state() {
        let p = Pipeline::new();
        let events: Vec<TelemetryEvent> = vec![
            TelemetryEvent::new("r1", 0, 10, "call_start").with_span("a"),
            TelemetryEvent::new("r1", 1, 11, "call_start").with_span("b").with_parent("a"),
            TelemetryEvent::new("r1", 2, 15, "call_end").with_span("b"),
        ];
        p.append(&events.iter().map(line).collect::<Vec<_>>()).await;

        let mut first = p.worker(&config("w-fixed"));
        first.rescan().await.unwrap();
        first.poll_once().await.unwrap();
        let before = first.state("r1").unwrap().clone();
        drop(first);
        assert_eq!(p.log.pending_count("graph-worker").await.unwrap(), 3);

        let mut restarted = p.worker(&config("w-fixed"));
        restarted.rescan().await.unwrap();
        assert_eq!(restarted.poll_once().await.unwrap(), 0);
        assert_eq!(restarted.recover().await.unwrap(), 3);
        assert_eq!(restarted.state("r1").unwrap(), &before);

        restarted.tick(false).await;
        assert_eq!(p.log.pending_count("graph-worker").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn malformed_entries_are_acked_and_counted() {
        let p = Pipeline::new();
        p.log
            .append_batch(vec![("tal:r1".to_string(), "{not json".to_string())])
            .await
            .unwrap();
        p.append(&scenario()).await;
        let mut worker = p.worker(&config("w-1"));
        worker.rescan().await.unwrap();
        worker.poll_once().await.unwrap();
        worker.tick(false).await;
        assert_eq!(worker.stats().rejected, 1);
        assert_eq!(worker.state("r1").unwrap().node_count(), 2);
        assert_eq!(p.log.pending_count("graph-worker").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn only_routed_runs_are_claimed() {
        let p = Pipeline::new();
        let runs: Vec<String> = (0..20).map(|i| format!("run-{i}")).collect();
        let lines: Vec<String> = runs
            .iter()
            .map(|r| line(&TelemetryEvent::new(r.clone(), 0, 0, "call_start").with_span("s")))
            .collect();
        p.append(&lines).await;

        let mut cfg = config("w-a");
        cfg.worker.members = vec!["w-a".to_string(), "w-b".to_string()];
        let router = RunRouter::new("w-a", ["w-a", "w-b"], cfg.worker.vnodes);
        let mut worker = p.worker(&cfg);
        worker.rescan().await.unwrap();
        worker.poll_once().await.unwrap();

        for run in &runs {
            assert_eq!(worker.state(run).is_some(), router.owns(run), "{run}");
        }
        let owned = runs.iter().filter(|r| router.owns(r)).count();
        assert_eq!(worker.streams().len(), owned);
        assert!(owned > 0 && owned < runs.len());
    }

    #[tokio::test]
    async fn run_end_completes_the_run() {
        let p = Pipeline::new();
        let events = [
            TelemetryEvent::new("r1", 0, 0, "call_start").with_span("a"),
            TelemetryEvent::new("r1", 1, 5, "call_end").with_span("a"),
            TelemetryEvent::new("r1", 2, 6, "run_end"),
        ];
        p.append(&events.iter().map(line).collect::<Vec<_>>()).await;
        let mut worker = p.worker(&config("w-1"));
        worker.rescan().await.unwrap();
        worker.poll_once().await.unwrap();
        assert_eq!(worker.state("r1").unwrap().outcome(), Some(RunOutcome::Completed));
        assert_eq!(worker.tick(false).await.completed, 1);
        let run = p.store.run("r1").await.unwrap().unwrap();
        assert_eq!(run.status, "completed");
        assert!(run.ended_at.is_some());
    }

    #[tokio::test]
    async fn persistence_can_be_disabled() {
        let p = Pipeline::new();
        p.append(&scenario()).await;
        let mut cfg = config("w-1");
        cfg.worker.persist_enabled = false;
        let mut worker = p.worker(&cfg);
        worker.rescan().await.unwrap();
        worker.poll_once().await.unwrap();
        let report = worker.tick(true).await;
        assert_eq!(report.published, 1);
        assert_eq!(report.persisted, 0);
        assert!(p.store.run("r1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn evicted_runs_rehydrate_from_snapshot() {
        let p = Pipeline::new();
        let mut cfg = config("w-1");
        cfg.worker.max_resident_runs = 1;
        let mut worker = p.worker(&cfg);

        p.append(&[
            line(&TelemetryEvent::new("a", 0, 0, "call_start").with_span("root")),
            line(&TelemetryEvent::new("b", 0, 0, "call_start").with_span("root")),
        ])
        .await;
        worker.rescan().await.unwrap();
        worker.poll_once().await.unwrap();
        assert_eq!(worker.resident_runs(), 2);
        let report = worker.tick(false).await;
        assert_eq!(report.evicted, 1);
        assert_eq!(worker.resident_runs(), 1);

        let gone = if worker.state("a").is_some() { "b" } else { "a" };
        p.append(&[line(
            &TelemetryEvent::new(gone, 1, 1, "call_start")
                .with_span("child")
                .with_parent("root"),
        )])
        .await;
        worker.poll_once().await.unwrap();
        let state = worker.state(gone).unwrap();
        assert_eq!(state.node_count(), 2);
        assert!(state.has_edge("span:root", "span:child"));
        assert_eq!(state.node("span:root").unwrap().num, 1);
        assert_eq!(worker.stats().rehydrated, 1);
    }

    #[tokio::test]
    async fn run_loop_stops_on_shutdown_with_final_flush() {
        let p = Pipeline::new();
        p.append(&scenario()).await;
        let mut cfg = config("w-loop");
        cfg.worker.fps = 50;
        cfg.stream.block_ms = 10;
        let mut worker = p.worker(&cfg);
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            worker.run(stop_rx).await.map(|()| worker.stats())
        });

        let mut persisted = false;
        for _ in 0..200 {
            if p.store.run("r1").await.unwrap().is_some_and(|r| r.node_count == 2) {
                persisted = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(persisted);
        stop_tx.send(true).unwrap();
        let stats = task.await.unwrap().unwrap();
        assert_eq!(stats.events_applied, 2);
        assert_eq!(p.log.pending_count("graph-worker").await.unwrap(), 0);
        assert!(p.store.load_latest_snapshot("r1").await.unwrap().is_some());
    }
}
