//! converge store: watch sessions that keep a live per-kind view of the cluster and
//! fan derived change events out to a single consumer.

#![forbid(unsafe_code)]

use std::sync::Arc;

use arc_swap::ArcSwap;
use converge_core::{ConvergeError, ConvergeResult, Delta, ResourceIdentity, ResourceKind, ResourceSnapshot, WatchEvent};
use converge_kubehub::ClusterApi;
use futures::StreamExt;
use metrics::counter;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Resources known to a session at one epoch, ordered by identity.
#[derive(Debug, Clone, Default)]
pub struct SessionSnapshot {
    pub epoch: u64,
    pub items: Vec<ResourceSnapshot>,
}

impl SessionSnapshot {
    pub fn get(&self, identity: &ResourceIdentity) -> Option<&ResourceSnapshot> {
        self.items.iter().find(|s| &s.identity == identity)
    }
}

/// Identity-indexed cache that turns raw deltas into Added/Updated/Deleted events.
#[derive(Debug, Default)]
pub struct SessionCache {
    epoch: u64,
    items: FxHashMap<ResourceIdentity, ResourceSnapshot>,
}

impl SessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Apply one delta and return the events it implies, in dispatch order.
    pub fn apply(&mut self, delta: Delta) -> Vec<WatchEvent> {
        let mut out = Vec::new();
        match delta {
            Delta::Applied(new) => self.upsert(new, &mut out),
            Delta::Deleted(gone) => {
                self.items.remove(&gone.identity);
                out.push(WatchEvent::Deleted(gone));
            }
            Delta::Restarted(list) => {
                let fresh: FxHashSet<&ResourceIdentity> = list.iter().map(|s| &s.identity).collect();
                let mut stale: Vec<ResourceIdentity> =
                    self.items.keys().filter(|id| !fresh.contains(id)).cloned().collect();
                stale.sort();
                for id in stale {
                    if let Some(old) = self.items.remove(&id) {
                        out.push(WatchEvent::Deleted(old));
                    }
                }
                for s in list {
                    self.upsert(s, &mut out);
                }
            }
        }
        self.epoch = self.epoch.saturating_add(1);
        out
    }

    fn upsert(&mut self, new: ResourceSnapshot, out: &mut Vec<WatchEvent>) {
        match self.items.insert(new.identity.clone(), new.clone()) {
            None => out.push(WatchEvent::Added(new)),
            // replayed revision (relist overlap)
            Some(old) if old.same_revision(&new) => {}
            // a new generation replaced the old one and its delete was never observed
            Some(old) if old.uid != new.uid => {
                out.push(WatchEvent::Deleted(old));
                out.push(WatchEvent::Added(new));
            }
            Some(old) => out.push(WatchEvent::Updated(old, new)),
        }
    }

    pub fn freeze(&self) -> Arc<SessionSnapshot> {
        let mut items: Vec<ResourceSnapshot> = self.items.values().cloned().collect();
        items.sort_by(|a, b| a.identity.cmp(&b.identity));
        Arc::new(SessionSnapshot { epoch: self.epoch, items })
    }
}

/// One long-lived subscription to a single resource kind (optionally namespace-scoped).
///
/// Lifecycle: [`on_event`](Self::on_event) registers the consumer, [`start`](Self::start)
/// spawns the subscription, [`synced`](Self::synced) waits for the initial listing.
pub struct WatchSession {
    kind: ResourceKind,
    scope: Option<String>,
    api: Arc<dyn ClusterApi>,
    snap: Arc<ArcSwap<SessionSnapshot>>,
    epoch_tx: Option<watch::Sender<u64>>,
    epoch_rx: watch::Receiver<u64>,
    sink: Option<mpsc::Sender<WatchEvent>>,
    handler_registered: bool,
}

impl WatchSession {
    /// Session over all namespaces.
    pub fn namespaces(api: Arc<dyn ClusterApi>) -> Self {
        Self::new(ResourceKind::Namespace, None, api)
    }

    /// Session over the workloads of one namespace.
    pub fn workloads(api: Arc<dyn ClusterApi>, namespace: impl Into<String>) -> Self {
        Self::new(ResourceKind::Workload, Some(namespace.into()), api)
    }

    fn new(kind: ResourceKind, scope: Option<String>, api: Arc<dyn ClusterApi>) -> Self {
        let (epoch_tx, epoch_rx) = watch::channel(0u64);
        Self {
            kind,
            scope,
            api,
            snap: Arc::new(ArcSwap::from_pointee(SessionSnapshot::default())),
            epoch_tx: Some(epoch_tx),
            epoch_rx,
            sink: None,
            handler_registered: false,
        }
    }

    /// Register the single consumer of this session's events. Events are delivered in
    /// stream order; a slow consumer applies backpressure to the subscription.
    pub fn on_event(&mut self, sink: mpsc::Sender<WatchEvent>) -> ConvergeResult<()> {
        if self.handler_registered {
            return Err(ConvergeError::Session(format!("{} session already has an event handler", self.kind)));
        }
        self.handler_registered = true;
        self.sink = Some(sink);
        Ok(())
    }

    /// Current view of the collection.
    pub fn snapshot(&self) -> Arc<SessionSnapshot> {
        self.snap.load_full()
    }

    /// Resolve once the initial listing has been applied.
    pub async fn synced(&self) -> ConvergeResult<()> {
        let mut rx = self.epoch_rx.clone();
        rx.wait_for(|epoch| *epoch > 0)
            .await
            .map(|_| ())
            .map_err(|_| ConvergeError::Session(format!("{} session ended before initial listing", self.kind)))
    }

    /// Spawn the subscription; it runs until `cancel` fires or the stream fails.
    /// A session can be started once.
    pub fn start(&mut self, cancel: CancellationToken) -> ConvergeResult<JoinHandle<ConvergeResult<()>>> {
        let epoch_tx = self
            .epoch_tx
            .take()
            .ok_or_else(|| ConvergeError::Session(format!("{} session already started", self.kind)))?;
        let sink = self.sink.take();
        let api = Arc::clone(&self.api);
        let snap = Arc::clone(&self.snap);
        let kind = self.kind;
        let scope = self.scope.clone();
        Ok(tokio::spawn(async move { run_session(kind, scope, api, snap, epoch_tx, sink, cancel).await }))
    }
}

async fn run_session(
    kind: ResourceKind,
    scope: Option<String>,
    api: Arc<dyn ClusterApi>,
    snap: Arc<ArcSwap<SessionSnapshot>>,
    epoch_tx: watch::Sender<u64>,
    sink: Option<mpsc::Sender<WatchEvent>>,
    cancel: CancellationToken,
) -> ConvergeResult<()> {
    let stream = match (kind, scope.as_deref()) {
        (ResourceKind::Namespace, _) => api.watch_namespaces().await?,
        (ResourceKind::Workload, Some(ns)) => api.watch_workloads(ns).await?,
        (ResourceKind::Workload, None) => {
            return Err(ConvergeError::Session("workload session requires a namespace".into()))
        }
    };
    futures::pin_mut!(stream);
    info!(kind = %kind, ns = ?scope, "watch session started");
    let mut cache = SessionCache::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!(kind = %kind, "watch session cancelled");
                break Ok(());
            }
            next = stream.next() => match next {
                Some(Ok(delta)) => {
                    let events = cache.apply(delta);
                    let next = cache.freeze();
                    let epoch = next.epoch;
                    if epoch == 1 {
                        info!(kind = %kind, count = next.items.len(), "initial listing");
                        for (i, item) in next.items.iter().enumerate() {
                            debug!(kind = %kind, idx = i, name = %item.name(), "listed");
                        }
                    }
                    snap.store(next);
                    let _ = epoch_tx.send(epoch);
                    for ev in events {
                        counter!("converge_watch_events", 1u64, "kind" => kind.label());
                        debug!(kind = %kind, verb = ev.verb(), id = %ev.identity(), "watch event");
                        if let Some(tx) = &sink {
                            if tx.send(ev).await.is_err() {
                                debug!(kind = %kind, "event consumer gone; keeping view only");
                            }
                        }
                    }
                }
                Some(Err(e)) => {
                    warn!(kind = %kind, error = %e, "watch stream failed");
                    break Err(ConvergeError::Session(format!("{} watch failed: {}", kind, e)));
                }
                None => {
                    warn!(kind = %kind, "watch stream ended");
                    break Err(ConvergeError::Session(format!("{} watch stream ended", kind)));
                }
            }
        }
    }
}
