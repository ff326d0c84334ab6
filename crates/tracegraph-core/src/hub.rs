//! Delta fan-out to live viewers.
//!
//! Every attached viewer watches one run and owns a bounded outbound queue.
//! Delivery is `try_send`: a full queue drops that delta for that viewer
//! only, and a viewer that keeps dropping past `max_consecutive_drops` is
//! disconnected. Publishers never wait on a slow viewer.
//!
//! Payloads are forwarded verbatim and shared between viewers.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::pubsub::{Bus, channel_run_id};

/// Queue depth per viewer when not configured.
pub const DEFAULT_VIEWER_QUEUE: usize = 256;
/// Consecutive drops tolerated before a viewer is cut off.
pub const DEFAULT_MAX_CONSECUTIVE_DROPS: u64 = 64;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HubError {
    #[error("runId query parameter is required")]
    MissingRunId,
}

/// Result of one [`Hub::dispatch`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub dropped: usize,
    pub disconnected: usize,
}

struct ViewerSlot {
    tx: mpsc::Sender<Arc<str>>,
    consecutive_drops: AtomicU64,
}

struct HubInner {
    /// run id → viewer id → slot
    runs: RwLock<HashMap<String, HashMap<u64, ViewerSlot>>>,
    next_id: AtomicU64,
    queue: usize,
    max_drops: u64,
}

/// Registry of attached viewers. Cheap to clone.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("viewers", &self.viewer_count())
            .field("queue", &self.inner.queue)
            .field("max_drops", &self.inner.max_drops)
            .finish()
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new(DEFAULT_VIEWER_QUEUE, DEFAULT_MAX_CONSECUTIVE_DROPS)
    }
}

impl Hub {
    #[must_use]
    pub fn new(queue: usize, max_consecutive_drops: u64) -> Self {
        Self {
            inner: Arc::new(HubInner {
                runs: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                queue: queue.max(1),
                max_drops: max_consecutive_drops.max(1),
            }),
        }
    }

    /// Register a viewer for `run_id`. A missing or empty id is rejected.
    pub fn attach(&self, run_id: Option<&str>) -> std::result::Result<Viewer, HubError> {
        let run_id = run_id
            .filter(|id| !id.is_empty())
            .ok_or(HubError::MissingRunId)?
            .to_string();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.queue);
        self.inner
            .runs
            .write()
            .entry(run_id.clone())
            .or_default()
            .insert(
                id,
                ViewerSlot {
                    tx,
                    consecutive_drops: AtomicU64::new(0),
                },
            );
        debug!(target: "tracegraph.hub", viewer_id = id, run_id = %run_id, "viewer attached");
        Ok(Viewer {
            id,
            run_id,
            rx,
            hub: self.clone(),
        })
    }

    fn detach(&self, run_id: &str, id: u64) {
        let mut runs = self.inner.runs.write();
        if let Some(viewers) = runs.get_mut(run_id) {
            if viewers.remove(&id).is_some() {
                debug!(target: "tracegraph.hub", viewer_id = id, run_id, "viewer detached");
            }
            if viewers.is_empty() {
                runs.remove(run_id);
            }
        }
    }

    #[must_use]
    pub fn viewer_count(&self) -> usize {
        self.inner.runs.read().values().map(HashMap::len).sum()
    }

    #[must_use]
    pub fn viewers_for(&self, run_id: &str) -> usize {
        self.inner.runs.read().get(run_id).map_or(0, HashMap::len)
    }

    /// Forward a payload published on `channel` to that run's viewers.
    pub fn dispatch(&self, channel: &str, payload: &str) -> DispatchReport {
        let Some(run_id) = channel_run_id(channel) else {
            warn!(target: "tracegraph.hub", channel, "channel carries no run id");
            return DispatchReport::default();
        };
        let payload: Arc<str> = Arc::from(payload);
        let mut report = DispatchReport::default();
        let mut evict = Vec::new();
        {
            let runs = self.inner.runs.read();
            let Some(viewers) = runs.get(run_id) else {
                return report;
            };
            for (id, slot) in viewers {
                match slot.tx.try_send(Arc::clone(&payload)) {
                    Ok(()) => {
                        slot.consecutive_drops.store(0, Ordering::Relaxed);
                        report.delivered += 1;
                    }
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        report.dropped += 1;
                        let drops = slot.consecutive_drops.fetch_add(1, Ordering::Relaxed) + 1;
                        if drops >= self.inner.max_drops {
                            evict.push(*id);
                        }
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => evict.push(*id),
                }
            }
        }
        for id in evict {
            info!(
                target: "tracegraph.hub",
                viewer_id = id,
                run_id,
                "disconnecting viewer that stopped draining"
            );
            self.detach(run_id, id);
            report.disconnected += 1;
        }
        report
    }
}

/// One attached viewer. Detaches itself when dropped.
pub struct Viewer {
    id: u64,
    run_id: String,
    rx: mpsc::Receiver<Arc<str>>,
    hub: Hub,
}

impl std::fmt::Debug for Viewer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Viewer")
            .field("id", &self.id)
            .field("run_id", &self.run_id)
            .finish_non_exhaustive()
    }
}

impl Viewer {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Next payload; `None` once the hub has disconnected this viewer.
    pub async fn recv(&mut self) -> Option<Arc<str>> {
        self.rx.recv().await
    }
}

impl Drop for Viewer {
    fn drop(&mut self) {
        self.hub.detach(&self.run_id, self.id);
    }
}

/// Subscribe to `pattern` on the bus and dispatch every message until
/// `shutdown` flips.
pub async fn run_forwarder(
    hub: Hub,
    bus: Bus,
    pattern: &str,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut subscription = bus.psubscribe(pattern).await?;
    info!(target: "tracegraph.hub", pattern, "forwarding deltas");
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            message = subscription.next() => match message {
                Ok(message) => {
                    let report = hub.dispatch(&message.channel, &message.payload);
                    if report.dropped > 0 {
                        debug!(
                            target: "tracegraph.hub",
                            channel = %message.channel,
                            dropped = report.dropped,
                            "viewer queues full"
                        );
                    }
                }
                Err(e) => {
                    warn!(target: "tracegraph.hub", error = %e, "notification read failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
    info!(target: "tracegraph.hub", "forwarder stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_requires_run_id() {
        let hub = Hub::default();
        assert_eq!(hub.attach(None).unwrap_err(), HubError::MissingRunId);
        assert_eq!(hub.attach(Some("")).unwrap_err(), HubError::MissingRunId);
        assert_eq!(
            HubError::MissingRunId.to_string(),
            "runId query parameter is required"
        );
    }

    #[tokio::test]
    async fn dispatch_reaches_only_matching_run() {
        let hub = Hub::default();
        let mut a1 = hub.attach(Some("a")).unwrap();
        let mut a2 = hub.attach(Some("a")).unwrap();
        let mut b = hub.attach(Some("b")).unwrap();

        let report = hub.dispatch("updates:a", r#"{"runId":"a"}"#);
        assert_eq!(report.delivered, 2);
        assert_eq!(&*a1.recv().await.unwrap(), r#"{"runId":"a"}"#);
        assert_eq!(&*a2.recv().await.unwrap(), r#"{"runId":"a"}"#);
        assert!(b.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn run_ids_with_colons_are_routed_whole() {
        let hub = Hub::default();
        let mut v = hub.attach(Some("job:7")).unwrap();
        assert_eq!(hub.dispatch("updates:job:7", "x").delivered, 1);
        assert_eq!(&*v.recv().await.unwrap(), "x");
    }

    #[test]
    fn dropping_viewer_detaches() {
        let hub = Hub::default();
        let v = hub.attach(Some("a")).unwrap();
        assert_eq!(hub.viewers_for("a"), 1);
        drop(v);
        assert_eq!(hub.viewer_count(), 0);
        assert_eq!(hub.dispatch("updates:a", "x"), DispatchReport::default());
    }

    #[tokio::test]
    async fn slow_viewer_drops_then_disconnects() {
        let hub = Hub::new(1, 3);
        let mut slow = hub.attach(Some("a")).unwrap();
        let mut fast = hub.attach(Some("a")).unwrap();

        assert_eq!(hub.dispatch("updates:a", "0").delivered, 2);
        assert_eq!(&*fast.recv().await.unwrap(), "0");

        // `slow` never drains; `fast` does.
        let mut disconnected = 0;
        for i in 1..=3 {
            let report = hub.dispatch("updates:a", &i.to_string());
            assert_eq!(report.dropped, 1);
            disconnected += report.disconnected;
            assert_eq!(&*fast.recv().await.unwrap(), i.to_string());
        }
        assert_eq!(disconnected, 1);
        assert_eq!(hub.viewers_for("a"), 1);

        // The queued payload is still readable, then the channel closes.
        assert_eq!(&*slow.recv().await.unwrap(), "0");
        assert!(slow.recv().await.is_none());
    }

    #[tokio::test]
    async fn successful_send_resets_drop_streak() {
        let hub = Hub::new(1, 2);
        let mut v = hub.attach(Some("a")).unwrap();
        for round in 0..5 {
            hub.dispatch("updates:a", "fill");
            let report = hub.dispatch("updates:a", "over");
            assert_eq!(report.dropped, 1, "round {round}");
            assert_eq!(report.disconnected, 0, "round {round}");
            assert_eq!(&*v.recv().await.unwrap(), "fill");
        }
    }

    #[tokio::test]
    async fn forwarder_bridges_bus_to_viewers() {
        let hub = Hub::default();
        let bus = Bus::open_in_memory().unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut viewer = hub.attach(Some("r1")).unwrap();

        let task = tokio::spawn(run_forwarder(
            hub.clone(),
            bus.clone(),
            crate::pubsub::UPDATES_PATTERN,
            stop_rx,
        ));
        // Wait for the subscription to be in place before publishing.
        let mut got = None;
        for _ in 0..100 {
            bus.publish("updates:r1", "delta").await.unwrap();
            if let Ok(Some(p)) =
                tokio::time::timeout(Duration::from_millis(50), viewer.recv()).await
            {
                got = Some(p);
                break;
            }
        }
        assert_eq!(got.as_deref(), Some("delta"));

        stop_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }
}
