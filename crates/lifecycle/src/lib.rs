//! converge lifecycle: the sequential workflow
//! Inspecting → Cleaning → Creating → Scaling → Enumerating → Done,
//! with every mutation confirmed through the watch sessions.

#![forbid(unsafe_code)]

use std::sync::Arc;

use converge_core::{
    ConvergeError, ConvergeResult, PodSnapshot, ResourceIdentity, ResourceKind, ResourceSnapshot, ResourceSpec,
    WorkloadSpec,
};
use converge_kubehub::ClusterApi;
use converge_ops::{spawn_matcher, Mutator};
use converge_store::WatchSession;
use metrics::counter;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

mod config;

pub use config::{LifecycleConfig, DEFAULT_IMAGE, DEFAULT_NAMESPACE, DEFAULT_TIMEOUT, DEFAULT_WORKLOAD};

const MATCHER_COMMAND_CAP: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    Idle,
    Inspecting,
    Cleaning,
    Creating,
    Scaling,
    Enumerating,
    Done,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::Inspecting => "inspecting",
            Phase::Cleaning => "cleaning",
            Phase::Creating => "creating",
            Phase::Scaling => "scaling",
            Phase::Enumerating => "enumerating",
            Phase::Done => "done",
        }
    }
}

/// Outcome of a successful run.
#[derive(Debug, Clone, Serialize)]
pub struct LifecycleReport {
    pub namespace: String,
    pub workload: String,
    pub phases: Vec<Phase>,
    /// Whether a pre-existing namespace was torn down first.
    pub cleaned: bool,
    pub pods: Vec<PodSnapshot>,
}

pub struct Orchestrator {
    api: Arc<dyn ClusterApi>,
    config: LifecycleConfig,
    phases: Vec<Phase>,
    cleaned: bool,
}

impl Orchestrator {
    pub fn new(api: Arc<dyn ClusterApi>, config: LifecycleConfig) -> ConvergeResult<Self> {
        config.validate()?;
        Ok(Self { api, config, phases: vec![Phase::Idle], cleaned: false })
    }

    pub fn phase(&self) -> Phase {
        self.phases.last().copied().unwrap_or(Phase::Idle)
    }

    /// Run the workflow once. Cancelling `cancel` stops the watch sessions and
    /// aborts the run; losing either session is fatal.
    pub async fn run(mut self, cancel: CancellationToken) -> ConvergeResult<LifecycleReport> {
        let (events_tx, events_rx) = mpsc::channel(self.config.queue_cap);
        let mut namespaces = WatchSession::namespaces(Arc::clone(&self.api));
        let mut workloads = WatchSession::workloads(Arc::clone(&self.api), self.config.namespace.clone());
        namespaces.on_event(events_tx.clone())?;
        workloads.on_event(events_tx)?;

        let sessions = cancel.child_token();
        let mut ns_task = namespaces.start(sessions.clone())?;
        let mut wl_task = workloads.start(sessions.clone())?;
        let (matcher, _matcher_task) = spawn_matcher(events_rx, MATCHER_COMMAND_CAP);
        let mutator = Mutator::new(Arc::clone(&self.api), matcher, self.config.timeout);

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ConvergeError::Abandoned("workflow cancelled".into())),
            res = &mut ns_task => Err(session_ended(ResourceKind::Namespace, res)),
            res = &mut wl_task => Err(session_ended(ResourceKind::Workload, res)),
            res = self.drive(&namespaces, &workloads, &mutator) => res,
        };
        sessions.cancel();

        match outcome {
            Ok(pods) => {
                info!(namespace = %self.config.namespace, pods = pods.len(), "workflow done");
                Ok(LifecycleReport {
                    namespace: self.config.namespace,
                    workload: self.config.workload,
                    phases: self.phases,
                    cleaned: self.cleaned,
                    pods,
                })
            }
            Err(e) => {
                warn!(phase = self.phase().as_str(), error = %e, "workflow failed");
                Err(e)
            }
        }
    }

    async fn drive(
        &mut self,
        namespaces: &WatchSession,
        workloads: &WatchSession,
        mutator: &Mutator,
    ) -> ConvergeResult<Vec<PodSnapshot>> {
        namespaces.synced().await?;
        workloads.synced().await?;
        let listed = namespaces.snapshot();
        info!(count = listed.items.len(), "namespaces at startup");
        for (i, ns) in listed.items.iter().enumerate() {
            let phase = ns.namespace_phase().map(|p| p.as_str()).unwrap_or("-");
            info!(idx = i, name = %ns.name(), phase, "namespace");
        }

        let ns_id = ResourceIdentity::namespace(self.config.namespace.clone());
        let wl_id = ResourceIdentity::workload(self.config.namespace.clone(), self.config.workload.clone());

        self.enter(Phase::Inspecting);
        if let Some(existing) = mutator.get(&ns_id).await? {
            self.enter(Phase::Cleaning);
            self.clean(mutator, &existing).await?;
            self.cleaned = true;
        }

        self.enter(Phase::Creating);
        mutator.create(&ResourceSpec::Namespace { name: self.config.namespace.clone() }).await?;
        let spec = self.config.workload_spec(self.config.replicas);
        mutator.create(&ResourceSpec::Workload { namespace: self.config.namespace.clone(), spec }).await?;

        self.enter(Phase::Scaling);
        mutator.patch_replicas(&wl_id, self.config.scale_to).await?;

        self.enter(Phase::Enumerating);
        let pods = enumerate_pods(self.api.as_ref(), &self.config.namespace, &self.config.workload_spec(self.config.scale_to)).await?;
        self.enter(Phase::Done);
        Ok(pods)
    }

    /// Tear down a pre-existing namespace. Only the configured workload's delete
    /// is confirmed; others are issued unconfirmed and reaped by the foreground
    /// namespace delete.
    async fn clean(&mut self, mutator: &Mutator, existing: &ResourceSnapshot) -> ConvergeResult<()> {
        let ns_id = existing.identity.clone();
        if existing.deleting {
            info!(id = %ns_id, "namespace already terminating; waiting for it to go");
            return mutator.await_absent(&ns_id).await;
        }
        let mut found = self.api.list_workloads(&self.config.namespace).await?;
        found.sort_by(|a, b| a.identity.cmp(&b.identity));
        for w in &found {
            let res = if w.name() != self.config.workload {
                mutator.delete_detached(&w.identity).await
            } else if w.deleting {
                mutator.await_absent(&w.identity).await
            } else {
                mutator.delete(&w.identity).await
            };
            tolerate_gone(&w.identity, res)?;
        }
        tolerate_gone(&ns_id, mutator.delete(&ns_id).await)
    }

    fn enter(&mut self, next: Phase) {
        let from = self.phase();
        counter!("converge_phase_transitions", 1u64, "phase" => next.as_str());
        info!(from = from.as_str(), to = next.as_str(), "phase");
        self.phases.push(next);
    }
}

/// Pods selected by the workload's labels, excluding those already terminating.
pub async fn enumerate_pods(api: &dyn ClusterApi, namespace: &str, spec: &WorkloadSpec) -> ConvergeResult<Vec<PodSnapshot>> {
    let selector = spec.selector();
    let pods = api.list_pods(namespace, Some(&selector)).await?;
    let total = pods.len();
    let live: Vec<PodSnapshot> = pods.into_iter().filter(|p| !p.terminating).collect();
    debug!(namespace, selector = %selector, total, live = live.len(), "pods enumerated");
    Ok(live)
}

fn tolerate_gone(id: &ResourceIdentity, res: ConvergeResult<()>) -> ConvergeResult<()> {
    match res {
        Err(e) if e.is_not_found() => {
            debug!(id = %id, "already gone");
            Ok(())
        }
        other => other,
    }
}

fn session_ended(kind: ResourceKind, res: Result<ConvergeResult<()>, JoinError>) -> ConvergeError {
    match res {
        Ok(Err(ConvergeError::Session(msg))) => ConvergeError::Session(msg),
        Ok(Err(e)) => ConvergeError::Session(format!("{} session failed: {}", kind, e)),
        Ok(Ok(())) => ConvergeError::Session(format!("{} session stopped", kind)),
        Err(e) => ConvergeError::Session(format!("{} session task failed: {}", kind, e)),
    }
}
