//! In-memory control plane implementing [`ClusterApi`].
//!
//! Mirrors the apiserver behaviors the controller depends on: namespaces enter
//! `Terminating` before they disappear, foreground deletes remove dependents first,
//! and workloads roll out one ready replica per step. Watches receive the same
//! deltas a kube watcher would yield, starting with a `Restarted` listing.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use converge_core::{
    ConvergeError, ConvergeResult, Delta, Labels, NamespacePhase, PodSnapshot, ResourceIdentity, ResourceSnapshot,
    ResourceStatus, WorkloadSpec,
};
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::StreamExt;
use tokio::sync::watch;
use tracing::debug;

use crate::{ClusterApi, DeltaStream};

/// Operations that can be made to fail via [`FakeCluster::fail_next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FakeOp {
    ListNamespaces,
    GetNamespace,
    CreateNamespace,
    DeleteNamespace,
    ListWorkloads,
    GetWorkload,
    CreateWorkload,
    DeleteWorkload,
    PatchWorkload,
    ListPods,
    WatchNamespaces,
    WatchWorkloads,
}

type Watcher = UnboundedSender<ConvergeResult<Delta>>;

#[derive(Default)]
struct State {
    namespaces: BTreeMap<String, ResourceSnapshot>,
    workloads: BTreeMap<(String, String), ResourceSnapshot>,
    specs: BTreeMap<(String, String), WorkloadSpec>,
    pods: BTreeMap<(String, String), PodSnapshot>,
    ns_watchers: Vec<Watcher>,
    wl_watchers: Vec<(String, Watcher)>,
    faults: HashMap<FakeOp, ConvergeError>,
    journal: Vec<String>,
    rv: u64,
    pod_seq: u64,
}

impl State {
    fn next_rv(&mut self) -> Option<String> {
        self.rv += 1;
        Some(self.rv.to_string())
    }

    fn take_fault(&mut self, op: FakeOp) -> ConvergeResult<()> {
        match self.faults.remove(&op) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn emit_ns(&mut self, delta: Delta) {
        self.ns_watchers.retain(|w| w.unbounded_send(Ok(delta.clone())).is_ok());
    }

    fn emit_wl(&mut self, namespace: &str, delta: Delta) {
        self.wl_watchers
            .retain(|(ns, w)| ns != namespace || w.unbounded_send(Ok(delta.clone())).is_ok());
    }

    fn add_pod(&mut self, namespace: &str, spec: &WorkloadSpec) {
        self.pod_seq += 1;
        let name = format!("{}-{:05}", spec.name, self.pod_seq);
        let pod = PodSnapshot {
            namespace: namespace.to_string(),
            name: name.clone(),
            phase: "Running".to_string(),
            reason: None,
            host_ip: Some("10.0.0.1".to_string()),
            pod_ip: Some(format!("10.244.0.{}", self.pod_seq % 250 + 1)),
            container_port: Some(spec.container_port),
            labels: spec.labels.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            terminating: false,
        };
        self.pods.insert((namespace.to_string(), name), pod);
    }

    fn remove_one_pod(&mut self, namespace: &str, spec: &WorkloadSpec) {
        let victim = self
            .pods
            .iter()
            .rev()
            .find(|((ns, _), p)| ns == namespace && p.matches_labels(&spec.labels))
            .map(|(k, _)| k.clone());
        if let Some(k) = victim {
            self.pods.remove(&k);
        }
    }

    fn remove_workload_pods(&mut self, namespace: &str, spec: &WorkloadSpec) {
        self.pods.retain(|(ns, _), p| ns != namespace || !p.matches_labels(&spec.labels));
    }
}

struct Inner {
    state: Mutex<State>,
    step: Duration,
    gate: watch::Sender<bool>,
}

/// Cheaply cloneable handle onto one fake control plane.
#[derive(Clone)]
pub struct FakeCluster {
    inner: Arc<Inner>,
}

impl Default for FakeCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::with_step(Duration::from_millis(5))
    }

    /// `step` is the simulated control-plane latency between state transitions.
    pub fn with_step(step: Duration) -> Self {
        let (gate, _) = watch::channel(true);
        Self { inner: Arc::new(Inner { state: Mutex::new(State::default()), step, gate }) }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert an Active namespace without emitting events.
    pub fn seed_namespace(&self, name: &str) -> ResourceSnapshot {
        let mut st = self.lock();
        let snap = namespace_snap(name, NamespacePhase::Active, st.next_rv());
        st.namespaces.insert(name.to_string(), snap.clone());
        snap
    }

    /// Insert a fully rolled-out workload (and its pods) without emitting events.
    pub fn seed_workload(&self, namespace: &str, spec: &WorkloadSpec) -> ResourceSnapshot {
        let mut st = self.lock();
        let rv = st.next_rv();
        let snap = workload_snap(namespace, spec, spec.replicas, spec.replicas, rv);
        for _ in 0..spec.replicas {
            st.add_pod(namespace, spec);
        }
        let key = (namespace.to_string(), spec.name.clone());
        st.workloads.insert(key.clone(), snap.clone());
        st.specs.insert(key, spec.clone());
        snap
    }

    /// Make the next call of `op` fail with `err`.
    pub fn fail_next(&self, op: FakeOp, err: ConvergeError) {
        self.lock().faults.insert(op, err);
    }

    /// Accepted deletes stay pending (object still visible) until [`release_deletions`](Self::release_deletions).
    pub fn hold_deletions(&self) {
        self.inner.gate.send_replace(false);
    }

    pub fn release_deletions(&self) {
        self.inner.gate.send_replace(true);
    }

    /// Terminate every open watch with a transport error.
    pub fn break_watches(&self) {
        let mut st = self.lock();
        let err = ConvergeError::fault("watch connection lost");
        for w in st.ns_watchers.drain(..) {
            let _ = w.unbounded_send(Err(err.clone()));
        }
        for (_, w) in st.wl_watchers.drain(..) {
            let _ = w.unbounded_send(Err(err.clone()));
        }
    }

    /// Mutating calls accepted so far, in order.
    pub fn journal(&self) -> Vec<String> {
        self.lock().journal.clone()
    }

    pub fn pod_count(&self, namespace: &str) -> usize {
        self.lock().pods.keys().filter(|(ns, _)| ns == namespace).count()
    }

    async fn wait_gate(&self) {
        let mut rx = self.inner.gate.subscribe();
        let _ = rx.wait_for(|open| *open).await;
    }

    fn spawn_namespace_finalizer(&self, name: String, uid: String) {
        let this = self.clone();
        tokio::spawn(async move {
            this.wait_gate().await;
            tokio::time::sleep(this.inner.step).await;
            {
                let mut st = this.lock();
                let doomed: Vec<(String, String)> =
                    st.workloads.keys().filter(|(ns, _)| *ns == name).cloned().collect();
                for key in doomed {
                    if let Some(mut snap) = st.workloads.remove(&key) {
                        snap.deleting = true;
                        snap.resource_version = st.next_rv();
                        st.emit_wl(&key.0, Delta::Deleted(snap));
                    }
                    st.specs.remove(&key);
                }
                st.pods.retain(|(ns, _), _| *ns != name);
            }
            tokio::time::sleep(this.inner.step).await;
            let mut st = this.lock();
            if st.namespaces.get(&name).map(|n| n.uid == uid).unwrap_or(false) {
                if let Some(mut snap) = st.namespaces.remove(&name) {
                    snap.resource_version = st.next_rv();
                    debug!(namespace = %name, "fake: namespace finalized");
                    st.emit_ns(Delta::Deleted(snap));
                }
            }
        });
    }

    fn spawn_workload_finalizer(&self, namespace: String, name: String, uid: String) {
        let this = self.clone();
        tokio::spawn(async move {
            this.wait_gate().await;
            tokio::time::sleep(this.inner.step).await;
            let mut st = this.lock();
            let key = (namespace.clone(), name);
            if !st.workloads.get(&key).map(|w| w.uid == uid).unwrap_or(false) {
                return;
            }
            if let Some(spec) = st.specs.remove(&key) {
                st.remove_workload_pods(&namespace, &spec);
            }
            if let Some(mut snap) = st.workloads.remove(&key) {
                snap.resource_version = st.next_rv();
                st.emit_wl(&namespace, Delta::Deleted(snap));
            }
        });
    }

    /// Move ready replicas one step at a time toward desired.
    fn spawn_rollout(&self, namespace: String, name: String, uid: String) {
        let this = self.clone();
        tokio::spawn(async move {
            let key = (namespace.clone(), name);
            loop {
                tokio::time::sleep(this.inner.step).await;
                let mut st = this.lock();
                let Some(current) = st.workloads.get(&key).cloned() else { break };
                if current.uid != uid || current.deleting {
                    break;
                }
                let Some(spec) = st.specs.get(&key).cloned() else { break };
                let Some((desired, ready)) = current.replicas() else { break };
                if ready == desired {
                    break;
                }
                let ready = if ready < desired {
                    st.add_pod(&namespace, &spec);
                    ready + 1
                } else {
                    st.remove_one_pod(&namespace, &spec);
                    ready - 1
                };
                let mut next = current;
                next.status = ResourceStatus::Workload { desired, ready };
                next.resource_version = st.next_rv();
                st.workloads.insert(key.clone(), next.clone());
                st.emit_wl(&namespace, Delta::Applied(next));
            }
        });
    }
}

fn namespace_snap(name: &str, phase: NamespacePhase, rv: Option<String>) -> ResourceSnapshot {
    ResourceSnapshot {
        identity: ResourceIdentity::namespace(name),
        uid: uuid::Uuid::new_v4().to_string(),
        resource_version: rv,
        creation_ts: now_ts(),
        labels: Labels::new(),
        deleting: false,
        status: ResourceStatus::Namespace { phase },
    }
}

fn workload_snap(namespace: &str, spec: &WorkloadSpec, desired: i32, ready: i32, rv: Option<String>) -> ResourceSnapshot {
    ResourceSnapshot {
        identity: ResourceIdentity::workload(namespace, spec.name.clone()),
        uid: uuid::Uuid::new_v4().to_string(),
        resource_version: rv,
        creation_ts: now_ts(),
        labels: spec.labels.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        deleting: false,
        status: ResourceStatus::Workload { desired, ready },
    }
}

fn now_ts() -> i64 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

fn parse_selector(selector: &str) -> BTreeMap<String, String> {
    selector
        .split(',')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

#[async_trait::async_trait]
impl ClusterApi for FakeCluster {
    async fn list_namespaces(&self) -> ConvergeResult<Vec<ResourceSnapshot>> {
        let mut st = self.lock();
        st.take_fault(FakeOp::ListNamespaces)?;
        Ok(st.namespaces.values().cloned().collect())
    }

    async fn get_namespace(&self, name: &str) -> ConvergeResult<Option<ResourceSnapshot>> {
        let mut st = self.lock();
        st.take_fault(FakeOp::GetNamespace)?;
        Ok(st.namespaces.get(name).cloned())
    }

    async fn create_namespace(&self, name: &str) -> ConvergeResult<ResourceSnapshot> {
        let mut st = self.lock();
        st.take_fault(FakeOp::CreateNamespace)?;
        if st.namespaces.contains_key(name) {
            return Err(ConvergeError::AlreadyExists(format!("namespace {}", name)));
        }
        let rv = st.next_rv();
        let snap = namespace_snap(name, NamespacePhase::Active, rv);
        st.namespaces.insert(name.to_string(), snap.clone());
        st.journal.push(format!("create_namespace {}", name));
        st.emit_ns(Delta::Applied(snap.clone()));
        Ok(snap)
    }

    async fn delete_namespace(&self, name: &str) -> ConvergeResult<()> {
        let uid = {
            let mut st = self.lock();
            st.take_fault(FakeOp::DeleteNamespace)?;
            let rv = st.next_rv();
            let Some(ns) = st.namespaces.get_mut(name) else {
                return Err(ConvergeError::NotFound(format!("namespace {}", name)));
            };
            if ns.deleting {
                return Ok(());
            }
            ns.deleting = true;
            ns.status = ResourceStatus::Namespace { phase: NamespacePhase::Terminating };
            ns.resource_version = rv;
            let snap = ns.clone();
            st.journal.push(format!("delete_namespace {}", name));
            st.emit_ns(Delta::Applied(snap.clone()));
            snap.uid
        };
        self.spawn_namespace_finalizer(name.to_string(), uid);
        Ok(())
    }

    async fn list_workloads(&self, namespace: &str) -> ConvergeResult<Vec<ResourceSnapshot>> {
        let mut st = self.lock();
        st.take_fault(FakeOp::ListWorkloads)?;
        Ok(st.workloads.iter().filter(|((ns, _), _)| ns == namespace).map(|(_, w)| w.clone()).collect())
    }

    async fn get_workload(&self, namespace: &str, name: &str) -> ConvergeResult<Option<ResourceSnapshot>> {
        let mut st = self.lock();
        st.take_fault(FakeOp::GetWorkload)?;
        Ok(st.workloads.get(&(namespace.to_string(), name.to_string())).cloned())
    }

    async fn create_workload(&self, namespace: &str, spec: &WorkloadSpec) -> ConvergeResult<ResourceSnapshot> {
        let snap = {
            let mut st = self.lock();
            st.take_fault(FakeOp::CreateWorkload)?;
            match st.namespaces.get(namespace) {
                None => return Err(ConvergeError::NotFound(format!("namespace {}", namespace))),
                Some(ns) if ns.deleting => {
                    return Err(ConvergeError::fault(format!(
                        "forbidden: namespace {} is being terminated",
                        namespace
                    )))
                }
                Some(_) => {}
            }
            let key = (namespace.to_string(), spec.name.clone());
            if st.workloads.contains_key(&key) {
                return Err(ConvergeError::AlreadyExists(format!("workload {}/{}", namespace, spec.name)));
            }
            let rv = st.next_rv();
            let snap = workload_snap(namespace, spec, spec.replicas, 0, rv);
            st.workloads.insert(key.clone(), snap.clone());
            st.specs.insert(key, spec.clone());
            st.journal.push(format!("create_workload {}/{}", namespace, spec.name));
            st.emit_wl(namespace, Delta::Applied(snap.clone()));
            snap
        };
        self.spawn_rollout(namespace.to_string(), spec.name.clone(), snap.uid.clone());
        Ok(snap)
    }

    async fn delete_workload(&self, namespace: &str, name: &str) -> ConvergeResult<()> {
        let uid = {
            let mut st = self.lock();
            st.take_fault(FakeOp::DeleteWorkload)?;
            let rv = st.next_rv();
            let Some(w) = st.workloads.get_mut(&(namespace.to_string(), name.to_string())) else {
                return Err(ConvergeError::NotFound(format!("workload {}/{}", namespace, name)));
            };
            if w.deleting {
                return Ok(());
            }
            w.deleting = true;
            w.resource_version = rv;
            let snap = w.clone();
            st.journal.push(format!("delete_workload {}/{}", namespace, name));
            st.emit_wl(namespace, Delta::Applied(snap.clone()));
            snap.uid
        };
        self.spawn_workload_finalizer(namespace.to_string(), name.to_string(), uid);
        Ok(())
    }

    async fn patch_workload_replicas(&self, namespace: &str, name: &str, replicas: i32) -> ConvergeResult<ResourceSnapshot> {
        let snap = {
            let mut st = self.lock();
            st.take_fault(FakeOp::PatchWorkload)?;
            let rv = st.next_rv();
            let key = (namespace.to_string(), name.to_string());
            let Some(w) = st.workloads.get_mut(&key) else {
                return Err(ConvergeError::NotFound(format!("workload {}/{}", namespace, name)));
            };
            let ready = w.replicas().map(|(_, r)| r).unwrap_or(0);
            w.status = ResourceStatus::Workload { desired: replicas, ready };
            w.resource_version = rv;
            let snap = w.clone();
            if let Some(spec) = st.specs.get_mut(&key) {
                spec.replicas = replicas;
            }
            st.journal.push(format!("patch_workload {}/{} replicas={}", namespace, name, replicas));
            st.emit_wl(namespace, Delta::Applied(snap.clone()));
            snap
        };
        self.spawn_rollout(namespace.to_string(), name.to_string(), snap.uid.clone());
        Ok(snap)
    }

    async fn list_pods(&self, namespace: &str, selector: Option<&str>) -> ConvergeResult<Vec<PodSnapshot>> {
        let mut st = self.lock();
        st.take_fault(FakeOp::ListPods)?;
        let wanted = selector.map(parse_selector).unwrap_or_default();
        Ok(st
            .pods
            .iter()
            .filter(|((ns, _), p)| ns == namespace && p.matches_labels(&wanted))
            .map(|(_, p)| p.clone())
            .collect())
    }

    async fn watch_namespaces(&self) -> ConvergeResult<DeltaStream> {
        let mut st = self.lock();
        st.take_fault(FakeOp::WatchNamespaces)?;
        let (tx, rx) = unbounded();
        let initial: Vec<ResourceSnapshot> = st.namespaces.values().cloned().collect();
        let _ = tx.unbounded_send(Ok(Delta::Restarted(initial)));
        st.ns_watchers.push(tx);
        Ok(rx.boxed())
    }

    async fn watch_workloads(&self, namespace: &str) -> ConvergeResult<DeltaStream> {
        let mut st = self.lock();
        st.take_fault(FakeOp::WatchWorkloads)?;
        let (tx, rx) = unbounded();
        let initial: Vec<ResourceSnapshot> =
            st.workloads.iter().filter(|((ns, _), _)| ns == namespace).map(|(_, w)| w.clone()).collect();
        let _ = tx.unbounded_send(Ok(Delta::Restarted(initial)));
        st.wl_watchers.push((namespace.to_string(), tx));
        Ok(rx.boxed())
    }
}
