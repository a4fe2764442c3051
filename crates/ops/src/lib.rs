//! converge ops: mutating calls against the cluster that block until the
//! effect is observed on a watch stream.

#![forbid(unsafe_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use converge_core::{ConvergeError, ConvergeResult, ResourceIdentity, ResourceKind, ResourceSnapshot, ResourceSpec, WatchEvent};
use converge_kubehub::ClusterApi;
use metrics::histogram;
use tracing::{info, warn};

mod matcher;
mod signal;

pub use matcher::{spawn_matcher, Condition, Matcher, MatcherCommand, MatcherHandle, PendingOperation, Registration};
pub use signal::{convergence_signal, ConvergenceToken, SignalError, SignalReceiver, SignalSender};

/// Issues create/delete/patch calls and waits for each to converge.
///
/// Every confirmed call registers one pending operation with the matcher before
/// the remote call and deregisters it afterwards. No retries.
#[derive(Clone)]
pub struct Mutator {
    api: Arc<dyn ClusterApi>,
    matcher: MatcherHandle,
    timeout: Option<Duration>,
}

impl Mutator {
    /// `timeout` bounds each wait; `None` waits without bound.
    pub fn new(api: Arc<dyn ClusterApi>, matcher: MatcherHandle, timeout: Option<Duration>) -> Self {
        Self { api, matcher, timeout }
    }

    /// Direct read; `None` is a normal outcome.
    pub async fn get(&self, id: &ResourceIdentity) -> ConvergeResult<Option<ResourceSnapshot>> {
        match id.kind {
            ResourceKind::Namespace => self.api.get_namespace(&id.name).await,
            ResourceKind::Workload => self.api.get_workload(scope(id)?, &id.name).await,
        }
    }

    /// Create and wait for the namespace to be Active or the workload to be fully ready.
    pub async fn create(&self, spec: &ResourceSpec) -> ConvergeResult<ResourceSnapshot> {
        let id = spec.identity();
        info!(id = %id, "create");
        match spec {
            ResourceSpec::Namespace { name } => {
                self.converge(&id, Condition::NamespaceActive, self.api.create_namespace(name), |_| false).await
            }
            ResourceSpec::Workload { namespace, spec } => {
                let cond = Condition::ReplicasReady(spec.replicas);
                self.converge(&id, cond, self.api.create_workload(namespace, spec), |_| false).await
            }
        }
    }

    /// Foreground delete; waits until the watch reports the object gone.
    pub async fn delete(&self, id: &ResourceIdentity) -> ConvergeResult<()> {
        info!(id = %id, "delete");
        self.converge(id, Condition::Absent, self.issue_delete(id), |_| false).await
    }

    /// Delete without waiting for confirmation.
    pub async fn delete_detached(&self, id: &ResourceIdentity) -> ConvergeResult<()> {
        info!(id = %id, "delete (unconfirmed)");
        self.issue_delete(id).await
    }

    /// Merge-patch `spec.replicas` and wait for ready == desired == `replicas`.
    pub async fn patch_replicas(&self, id: &ResourceIdentity, replicas: i32) -> ConvergeResult<ResourceSnapshot> {
        if id.kind != ResourceKind::Workload {
            return Err(ConvergeError::fault(format!("cannot scale {}", id)));
        }
        info!(id = %id, replicas, "patch replicas");
        let cond = Condition::ReplicasReady(replicas);
        let call = self.api.patch_workload_replicas(scope(id)?, &id.name, replicas);
        // a patch that changes nothing yields no watch event; its reply is then authoritative
        self.converge(id, cond, call, |reply: &ResourceSnapshot| cond.holds(&WatchEvent::Added(reply.clone()))).await
    }

    /// Wait for an object whose deletion is already underway to disappear.
    pub async fn await_absent(&self, id: &ResourceIdentity) -> ConvergeResult<()> {
        self.converge(id, Condition::Absent, self.get(id), |current: &Option<ResourceSnapshot>| current.is_none()).await.map(|_| ())
    }

    async fn issue_delete(&self, id: &ResourceIdentity) -> ConvergeResult<()> {
        match id.kind {
            ResourceKind::Namespace => self.api.delete_namespace(&id.name).await,
            ResourceKind::Workload => self.api.delete_workload(scope(id)?, &id.name).await,
        }
    }

    /// Register, call, wait, deregister. `settled` lets a reply confirm the
    /// condition on its own.
    async fn converge<T, F>(
        &self,
        id: &ResourceIdentity,
        condition: Condition,
        call: F,
        settled: impl FnOnce(&T) -> bool,
    ) -> ConvergeResult<T>
    where
        F: Future<Output = ConvergeResult<T>>,
    {
        let reg = self.matcher.register(id.clone(), condition).await?;
        let out = match call.await {
            Ok(out) => out,
            Err(e) => {
                self.matcher.deregister(id.clone(), reg.seq).await;
                if e.is_fatal() {
                    warn!(id = %id, error = %e, "mutation rejected");
                }
                return Err(e);
            }
        };
        if settled(&out) {
            self.matcher.deregister(id.clone(), reg.seq).await;
            return Ok(out);
        }
        let started = Instant::now();
        let waited = reg.signal.wait(self.timeout).await;
        self.matcher.deregister(id.clone(), reg.seq).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        histogram!("converge_wait_ms", elapsed_ms as f64, "kind" => id.kind.label());
        match waited {
            Ok(_) => {
                info!(id = %id, condition = ?condition, elapsed_ms, "converged");
                Ok(out)
            }
            Err(SignalError::TimedOut(limit)) => {
                warn!(id = %id, condition = ?condition, "timed out waiting for convergence");
                Err(ConvergeError::TimedOut { what: id.to_string(), after_ms: limit.as_millis() as u64 })
            }
            Err(SignalError::Abandoned) => {
                warn!(id = %id, condition = ?condition, "convergence abandoned");
                Err(ConvergeError::Abandoned(format!("{}: event source closed", id)))
            }
        }
    }
}

fn scope(id: &ResourceIdentity) -> ConvergeResult<&str> {
    id.namespace.as_deref().ok_or_else(|| ConvergeError::fault(format!("{} has no namespace scope", id)))
}
