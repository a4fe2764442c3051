//! Pending-operation registry and the task that matches watch events against it.
//!
//! The matcher task is the only owner of the registry. Callers reach it through
//! [`MatcherHandle`]; watch sessions feed it through one shared event queue.

use converge_core::{ConvergeError, ConvergeResult, NamespacePhase, ResourceIdentity, WatchEvent};
use metrics::counter;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::signal::{convergence_signal, SignalReceiver, SignalSender};

/// Post-condition a pending operation waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    /// Namespace present in phase Active.
    NamespaceActive,
    /// A `Deleted` event for the identity.
    Absent,
    /// Workload with desired == ready == n.
    ReplicasReady(i32),
}

impl Condition {
    /// Evaluated against the event's own snapshot only.
    pub fn holds(&self, ev: &WatchEvent) -> bool {
        match (self, ev) {
            (Condition::Absent, WatchEvent::Deleted(_)) => true,
            (Condition::Absent, _) | (_, WatchEvent::Deleted(_)) => false,
            (Condition::NamespaceActive, ev) => {
                let s = ev.current();
                !s.deleting && s.namespace_phase() == Some(NamespacePhase::Active)
            }
            (Condition::ReplicasReady(n), ev) => {
                let s = ev.current();
                !s.deleting && s.replicas() == Some((*n, *n))
            }
        }
    }
}

/// One registered wait. At most one per identity.
#[derive(Debug)]
pub struct PendingOperation {
    pub identity: ResourceIdentity,
    pub condition: Condition,
    seq: u64,
    signal: SignalSender,
}

/// The registry itself; synchronous so it can be driven directly in tests.
#[derive(Debug, Default)]
pub struct Matcher {
    pending: FxHashMap<ResourceIdentity, PendingOperation>,
}

impl Matcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn register(&mut self, op: PendingOperation) -> ConvergeResult<()> {
        if self.pending.contains_key(&op.identity) {
            return Err(ConvergeError::Conflict(format!("operation already pending for {}", op.identity)));
        }
        debug!(id = %op.identity, condition = ?op.condition, seq = op.seq, "pending operation registered");
        self.pending.insert(op.identity.clone(), op);
        Ok(())
    }

    /// Remove the registration `seq` for `identity` if it is still pending.
    pub fn deregister(&mut self, identity: &ResourceIdentity, seq: u64) -> bool {
        match self.pending.get(identity) {
            Some(op) if op.seq == seq => {
                self.pending.remove(identity);
                true
            }
            _ => false,
        }
    }

    /// Signal and drop the pending operation the event satisfies, if any.
    pub fn dispatch(&mut self, ev: &WatchEvent) -> bool {
        let satisfied = self.pending.get(ev.identity()).map(|op| op.condition.holds(ev)).unwrap_or(false);
        if !satisfied {
            return false;
        }
        let Some(op) = self.pending.remove(ev.identity()) else { return false };
        op.signal.signal();
        counter!("converge_signals_fired", 1u64, "kind" => op.identity.kind.label());
        info!(id = %op.identity, condition = ?op.condition, verb = ev.verb(), "convergence observed");
        true
    }
}

#[derive(Debug)]
pub enum MatcherCommand {
    Register(PendingOperation, oneshot::Sender<ConvergeResult<()>>),
    Deregister(ResourceIdentity, u64),
}

/// Cloneable front door to the matcher task.
#[derive(Debug, Clone)]
pub struct MatcherHandle {
    tx: mpsc::Sender<MatcherCommand>,
    next_seq: std::sync::Arc<std::sync::atomic::AtomicU64>,
}

/// A registration accepted by the matcher.
#[derive(Debug)]
pub struct Registration {
    pub seq: u64,
    pub signal: SignalReceiver,
}

impl MatcherHandle {
    /// Register a wait and return once the matcher has accepted it.
    pub async fn register(&self, identity: ResourceIdentity, condition: Condition) -> ConvergeResult<Registration> {
        let seq = self.next_seq.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let (signal_tx, signal_rx) = convergence_signal();
        let op = PendingOperation { identity: identity.clone(), condition, seq, signal: signal_tx };
        let (ack_tx, ack_rx) = oneshot::channel();
        let gone = || ConvergeError::Abandoned(format!("matcher stopped before registering {}", identity));
        self.tx.send(MatcherCommand::Register(op, ack_tx)).await.map_err(|_| gone())?;
        ack_rx.await.map_err(|_| gone())??;
        Ok(Registration { seq, signal: signal_rx })
    }

    pub async fn deregister(&self, identity: ResourceIdentity, seq: u64) {
        let _ = self.tx.send(MatcherCommand::Deregister(identity, seq)).await;
    }
}

/// Spawn the matcher over the merged event queue. The task ends when every
/// handle is dropped or every event source has closed; pending waiters then
/// observe an abandoned signal.
pub fn spawn_matcher(mut events: mpsc::Receiver<WatchEvent>, command_cap: usize) -> (MatcherHandle, JoinHandle<()>) {
    let (tx, mut cmds) = mpsc::channel::<MatcherCommand>(command_cap.max(1));
    let handle = MatcherHandle { tx, next_seq: Default::default() };
    let task = tokio::spawn(async move {
        let mut matcher = Matcher::new();
        loop {
            tokio::select! {
                biased;
                cmd = cmds.recv() => match cmd {
                    Some(MatcherCommand::Register(op, ack)) => {
                        let _ = ack.send(matcher.register(op));
                    }
                    Some(MatcherCommand::Deregister(id, seq)) => {
                        if matcher.deregister(&id, seq) {
                            debug!(id = %id, seq, "pending operation deregistered");
                        }
                    }
                    None => break,
                },
                ev = events.recv() => match ev {
                    Some(ev) => {
                        matcher.dispatch(&ev);
                    }
                    None => {
                        info!(pending = matcher.len(), "event sources closed; matcher stopping");
                        break;
                    }
                },
            }
        }
    });
    (handle, task)
}

#[cfg(test)]
mod tests {
    use super::*;
    use converge_core::{Labels, ResourceSnapshot, ResourceStatus};
    use std::time::Duration;

    fn workload(name: &str, desired: i32, ready: i32) -> ResourceSnapshot {
        ResourceSnapshot {
            identity: ResourceIdentity::workload("demo", name),
            uid: "u1".into(),
            resource_version: Some("1".into()),
            creation_ts: 0,
            labels: Labels::new(),
            deleting: false,
            status: ResourceStatus::Workload { desired, ready },
        }
    }

    fn namespace(name: &str, phase: NamespacePhase) -> ResourceSnapshot {
        ResourceSnapshot {
            identity: ResourceIdentity::namespace(name),
            uid: "n1".into(),
            resource_version: Some("1".into()),
            creation_ts: 0,
            labels: Labels::new(),
            deleting: phase == NamespacePhase::Terminating,
            status: ResourceStatus::Namespace { phase },
        }
    }

    fn pending(identity: ResourceIdentity, condition: Condition, seq: u64) -> (PendingOperation, SignalReceiver) {
        let (signal, rx) = convergence_signal();
        (PendingOperation { identity, condition, seq, signal }, rx)
    }

    #[test]
    fn conditions_evaluate_event_snapshot() {
        let ready = WatchEvent::Updated(workload("web", 2, 1), workload("web", 2, 2));
        assert!(Condition::ReplicasReady(2).holds(&ready));
        // stale desired count from before a scale
        assert!(!Condition::ReplicasReady(2).holds(&WatchEvent::Added(workload("web", 1, 1))));
        assert!(!Condition::ReplicasReady(2).holds(&WatchEvent::Deleted(workload("web", 2, 2))));

        assert!(Condition::NamespaceActive.holds(&WatchEvent::Added(namespace("demo", NamespacePhase::Active))));
        assert!(!Condition::NamespaceActive.holds(&WatchEvent::Added(namespace("demo", NamespacePhase::Terminating))));

        assert!(Condition::Absent.holds(&WatchEvent::Deleted(namespace("demo", NamespacePhase::Terminating))));
        assert!(!Condition::Absent.holds(&WatchEvent::Added(namespace("demo", NamespacePhase::Active))));
    }

    #[test]
    fn signal_only_fires_for_matching_identity() {
        let mut m = Matcher::new();
        let (op, mut rx) = pending(ResourceIdentity::workload("demo", "web"), Condition::ReplicasReady(1), 1);
        m.register(op).expect("register");
        assert!(!m.dispatch(&WatchEvent::Added(workload("other", 1, 1))));
        assert!(rx.try_take().is_none());
        assert!(m.dispatch(&WatchEvent::Added(workload("web", 1, 1))));
        assert!(rx.try_take().is_some());
        assert!(m.is_empty());
        // fired ops are gone; later events are ignored
        assert!(!m.dispatch(&WatchEvent::Added(workload("web", 1, 1))));
    }

    #[test]
    fn second_registration_for_identity_conflicts() {
        let mut m = Matcher::new();
        let id = ResourceIdentity::namespace("demo");
        let (a, _ra) = pending(id.clone(), Condition::NamespaceActive, 1);
        let (b, _rb) = pending(id.clone(), Condition::Absent, 2);
        m.register(a).expect("first");
        assert!(matches!(m.register(b), Err(ConvergeError::Conflict(_))));
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn stale_deregister_keeps_newer_registration() {
        let mut m = Matcher::new();
        let id = ResourceIdentity::namespace("demo");
        let (a, _ra) = pending(id.clone(), Condition::Absent, 7);
        m.register(a).expect("register");
        assert!(!m.deregister(&id, 6));
        assert_eq!(m.len(), 1);
        assert!(m.deregister(&id, 7));
        assert!(m.is_empty());
    }

    #[tokio::test]
    async fn task_signals_registered_waiter() {
        let (ev_tx, ev_rx) = mpsc::channel(8);
        let (handle, task) = spawn_matcher(ev_rx, 8);
        let reg = handle.register(ResourceIdentity::namespace("demo"), Condition::Absent).await.expect("register");
        ev_tx.send(WatchEvent::Deleted(namespace("demo", NamespacePhase::Terminating))).await.expect("send");
        assert!(reg.signal.wait(Some(Duration::from_secs(1))).await.is_ok());
        drop(ev_tx);
        task.await.expect("matcher exits");
    }

    #[tokio::test]
    async fn closed_event_queue_abandons_waiters() {
        let (ev_tx, ev_rx) = mpsc::channel(8);
        let (handle, task) = spawn_matcher(ev_rx, 8);
        let reg = handle.register(ResourceIdentity::namespace("demo"), Condition::NamespaceActive).await.expect("register");
        drop(ev_tx);
        assert_eq!(reg.signal.wait(None).await, Err(crate::SignalError::Abandoned));
        task.await.expect("matcher exits");
        let late = handle.register(ResourceIdentity::namespace("x"), Condition::Absent).await;
        assert!(matches!(late, Err(ConvergeError::Abandoned(_))));
    }
}
