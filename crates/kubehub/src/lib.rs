//! converge kubehub: the cluster API surface the controller consumes, its kube-rs
//! implementation, and an in-memory fake control plane.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use converge_core::{
    ConvergeError, ConvergeResult, Delta, Labels, NamespacePhase, PodSnapshot, ResourceIdentity, ResourceSnapshot,
    ResourceStatus, WorkloadSpec,
};
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{Container, ContainerPort, Namespace, Pod, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client,
};
use tracing::{debug, info, warn};

pub mod fake;

pub use fake::{FakeCluster, FakeOp};

/// Stream of raw deltas for one resource collection. Dropping it ends the subscription.
pub type DeltaStream = BoxStream<'static, ConvergeResult<Delta>>;

/// Operations the controller needs from the control plane, keyed by kind and namespace.
/// Lookups report a missing object as `Ok(None)`; mutations report it as `NotFound`.
#[async_trait::async_trait]
pub trait ClusterApi: Send + Sync {
    async fn list_namespaces(&self) -> ConvergeResult<Vec<ResourceSnapshot>>;
    async fn get_namespace(&self, name: &str) -> ConvergeResult<Option<ResourceSnapshot>>;
    async fn create_namespace(&self, name: &str) -> ConvergeResult<ResourceSnapshot>;
    /// Delete with foreground propagation: dependents go before the namespace does.
    async fn delete_namespace(&self, name: &str) -> ConvergeResult<()>;

    async fn list_workloads(&self, namespace: &str) -> ConvergeResult<Vec<ResourceSnapshot>>;
    async fn get_workload(&self, namespace: &str, name: &str) -> ConvergeResult<Option<ResourceSnapshot>>;
    async fn create_workload(&self, namespace: &str, spec: &WorkloadSpec) -> ConvergeResult<ResourceSnapshot>;
    async fn delete_workload(&self, namespace: &str, name: &str) -> ConvergeResult<()>;
    /// Merge-patch `spec.replicas`.
    async fn patch_workload_replicas(&self, namespace: &str, name: &str, replicas: i32) -> ConvergeResult<ResourceSnapshot>;

    async fn list_pods(&self, namespace: &str, selector: Option<&str>) -> ConvergeResult<Vec<PodSnapshot>>;

    /// List+watch all namespaces. The first delta is a `Restarted` with the initial listing.
    async fn watch_namespaces(&self) -> ConvergeResult<DeltaStream>;
    /// List+watch workloads inside one namespace.
    async fn watch_workloads(&self, namespace: &str) -> ConvergeResult<DeltaStream>;
}

/// `ClusterApi` over a live cluster, using `Namespace`, `Deployment` and `Pod`.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect using the inferred kubeconfig / in-cluster config.
    pub async fn try_default() -> ConvergeResult<Self> {
        let client = Client::try_default().await.map_err(|e| ConvergeError::fault(format!("kube client: {}", e)))?;
        Ok(Self { client })
    }

    fn namespaces(&self) -> Api<Namespace> {
        Api::all(self.client.clone())
    }

    fn deployments(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait::async_trait]
impl ClusterApi for KubeCluster {
    async fn list_namespaces(&self) -> ConvergeResult<Vec<ResourceSnapshot>> {
        let list = self.namespaces().list(&ListParams::default()).await.map_err(|e| map_kube_error(e, "list namespaces"))?;
        list.items.iter().map(namespace_snapshot).collect()
    }

    async fn get_namespace(&self, name: &str) -> ConvergeResult<Option<ResourceSnapshot>> {
        let what = format!("namespace {}", name);
        match self.namespaces().get_opt(name).await.map_err(|e| map_kube_error(e, &what))? {
            Some(ns) => Ok(Some(namespace_snapshot(&ns)?)),
            None => {
                debug!(namespace = %name, "namespace not found");
                Ok(None)
            }
        }
    }

    async fn create_namespace(&self, name: &str) -> ConvergeResult<ResourceSnapshot> {
        let ns = Namespace {
            metadata: ObjectMeta { name: Some(name.to_string()), ..Default::default() },
            ..Default::default()
        };
        let created = self
            .namespaces()
            .create(&PostParams::default(), &ns)
            .await
            .map_err(|e| map_kube_error(e, &format!("namespace {}", name)))?;
        info!(namespace = %name, "namespace create accepted");
        namespace_snapshot(&created)
    }

    async fn delete_namespace(&self, name: &str) -> ConvergeResult<()> {
        self.namespaces()
            .delete(name, &DeleteParams::foreground())
            .await
            .map_err(|e| map_kube_error(e, &format!("namespace {}", name)))?;
        info!(namespace = %name, "namespace delete accepted");
        Ok(())
    }

    async fn list_workloads(&self, namespace: &str) -> ConvergeResult<Vec<ResourceSnapshot>> {
        let list = self
            .deployments(namespace)
            .list(&ListParams::default())
            .await
            .map_err(|e| map_kube_error(e, &format!("list workloads in {}", namespace)))?;
        list.items.iter().map(workload_snapshot).collect()
    }

    async fn get_workload(&self, namespace: &str, name: &str) -> ConvergeResult<Option<ResourceSnapshot>> {
        let what = format!("workload {}/{}", namespace, name);
        match self.deployments(namespace).get_opt(name).await.map_err(|e| map_kube_error(e, &what))? {
            Some(d) => Ok(Some(workload_snapshot(&d)?)),
            None => Ok(None),
        }
    }

    async fn create_workload(&self, namespace: &str, spec: &WorkloadSpec) -> ConvergeResult<ResourceSnapshot> {
        let deploy = build_deployment(namespace, spec);
        let created = self
            .deployments(namespace)
            .create(&PostParams::default(), &deploy)
            .await
            .map_err(|e| map_kube_error(e, &format!("workload {}/{}", namespace, spec.name)))?;
        info!(ns = %namespace, workload = %spec.name, replicas = spec.replicas, "workload create accepted");
        workload_snapshot(&created)
    }

    async fn delete_workload(&self, namespace: &str, name: &str) -> ConvergeResult<()> {
        self.deployments(namespace)
            .delete(name, &DeleteParams::foreground())
            .await
            .map_err(|e| map_kube_error(e, &format!("workload {}/{}", namespace, name)))?;
        info!(ns = %namespace, workload = %name, "workload delete accepted");
        Ok(())
    }

    async fn patch_workload_replicas(&self, namespace: &str, name: &str, replicas: i32) -> ConvergeResult<ResourceSnapshot> {
        let payload = serde_json::json!({"spec": {"replicas": replicas}});
        let patched = self
            .deployments(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&payload))
            .await
            .map_err(|e| map_kube_error(e, &format!("workload {}/{}", namespace, name)))?;
        info!(ns = %namespace, workload = %name, replicas, "workload patch accepted");
        workload_snapshot(&patched)
    }

    async fn list_pods(&self, namespace: &str, selector: Option<&str>) -> ConvergeResult<Vec<PodSnapshot>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let mut lp = ListParams::default();
        if let Some(sel) = selector {
            lp = lp.labels(sel);
        }
        let list = api.list(&lp).await.map_err(|e| map_kube_error(e, &format!("list pods in {}", namespace)))?;
        Ok(list.items.iter().map(|p| pod_snapshot(namespace, p)).collect())
    }

    async fn watch_namespaces(&self) -> ConvergeResult<DeltaStream> {
        let stream = watcher::watcher(self.namespaces(), watcher::Config::default());
        info!("namespace watch started");
        Ok(resuming_deltas(stream, namespace_snapshot))
    }

    async fn watch_workloads(&self, namespace: &str) -> ConvergeResult<DeltaStream> {
        let stream = watcher::watcher(self.deployments(namespace), watcher::Config::default());
        info!(ns = %namespace, "workload watch started");
        Ok(resuming_deltas(stream, workload_snapshot))
    }
}

/// Map watcher events to deltas. Transient watch errors are logged and skipped:
/// the watcher resumes (relisting if needed) on the next poll, paced by the
/// default backoff. Only snapshot conversion failures reach the consumer.
pub fn resuming_deltas<K, S>(stream: S, snap: fn(&K) -> ConvergeResult<ResourceSnapshot>) -> DeltaStream
where
    K: Send + 'static,
    S: Stream<Item = Result<Event<K>, watcher::Error>> + Send + 'static,
{
    stream
        .default_backoff()
        .filter_map(move |ev| {
            let out = match ev {
                Ok(ev) => Some(delta_from(ev, snap)),
                Err(e) => {
                    warn!(error = %e, "watch error; resuming after backoff");
                    None
                }
            };
            futures::future::ready(out)
        })
        .boxed()
}

fn delta_from<K>(ev: Event<K>, snap: fn(&K) -> ConvergeResult<ResourceSnapshot>) -> ConvergeResult<Delta> {
    match ev {
        Event::Applied(o) => Ok(Delta::Applied(snap(&o)?)),
        Event::Deleted(o) => Ok(Delta::Deleted(snap(&o)?)),
        Event::Restarted(list) => {
            debug!(count = list.len(), "watch restart");
            Ok(Delta::Restarted(list.iter().map(snap).collect::<ConvergeResult<Vec<_>>>()?))
        }
    }
}

/// Map a kube error onto the converge taxonomy. 404 is `NotFound`, 409/AlreadyExists is
/// `AlreadyExists`; anything else is a `Fault`.
pub fn map_kube_error(err: kube::Error, what: &str) -> ConvergeError {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => ConvergeError::NotFound(what.to_string()),
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
            ConvergeError::AlreadyExists(what.to_string())
        }
        other => ConvergeError::fault(format!("{}: {}", what, other)),
    }
}

fn labels_of(meta: &ObjectMeta) -> Labels {
    meta.labels.as_ref().map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect()).unwrap_or_default()
}

fn creation_ts(meta: &ObjectMeta) -> i64 {
    meta.creation_timestamp.as_ref().map(|t| t.0.timestamp()).unwrap_or(0)
}

pub fn namespace_snapshot(ns: &Namespace) -> ConvergeResult<ResourceSnapshot> {
    let meta = &ns.metadata;
    let name = meta.name.clone().ok_or_else(|| ConvergeError::fault("namespace missing metadata.name"))?;
    let phase = NamespacePhase::parse(ns.status.as_ref().and_then(|s| s.phase.as_deref()));
    Ok(ResourceSnapshot {
        identity: ResourceIdentity::namespace(name),
        uid: meta.uid.clone().unwrap_or_default(),
        resource_version: meta.resource_version.clone(),
        creation_ts: creation_ts(meta),
        labels: labels_of(meta),
        deleting: meta.deletion_timestamp.is_some(),
        status: ResourceStatus::Namespace { phase },
    })
}

pub fn workload_snapshot(d: &Deployment) -> ConvergeResult<ResourceSnapshot> {
    let meta = &d.metadata;
    let name = meta.name.clone().ok_or_else(|| ConvergeError::fault("deployment missing metadata.name"))?;
    let ns = meta
        .namespace
        .clone()
        .ok_or_else(|| ConvergeError::fault(format!("deployment {} missing metadata.namespace", name)))?;
    // apiserver defaults spec.replicas to 1 when omitted
    let desired = d.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1);
    let ready = d.status.as_ref().and_then(|s| s.ready_replicas).unwrap_or(0);
    Ok(ResourceSnapshot {
        identity: ResourceIdentity::workload(ns, name),
        uid: meta.uid.clone().unwrap_or_default(),
        resource_version: meta.resource_version.clone(),
        creation_ts: creation_ts(meta),
        labels: labels_of(meta),
        deleting: meta.deletion_timestamp.is_some(),
        status: ResourceStatus::Workload { desired, ready },
    })
}

pub fn pod_snapshot(namespace: &str, p: &Pod) -> PodSnapshot {
    let status = p.status.as_ref();
    let container_port = p
        .spec
        .as_ref()
        .and_then(|s| s.containers.first())
        .and_then(|c| c.ports.as_ref())
        .and_then(|ports| ports.first())
        .map(|port| port.container_port);
    PodSnapshot {
        namespace: p.metadata.namespace.clone().unwrap_or_else(|| namespace.to_string()),
        name: p.metadata.name.clone().unwrap_or_default(),
        phase: status.and_then(|s| s.phase.clone()).unwrap_or_else(|| "Unknown".to_string()),
        reason: status.and_then(|s| s.reason.clone()),
        host_ip: status.and_then(|s| s.host_ip.clone()),
        pod_ip: status.and_then(|s| s.pod_ip.clone()),
        container_port,
        labels: labels_of(&p.metadata),
        terminating: p.metadata.deletion_timestamp.is_some(),
    }
}

/// Single-container Deployment for `spec`, selecting pods by `spec.labels`.
pub fn build_deployment(namespace: &str, spec: &WorkloadSpec) -> Deployment {
    let labels: BTreeMap<String, String> = spec.labels.clone();
    Deployment {
        metadata: ObjectMeta {
            name: Some(spec.name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(spec.replicas),
            selector: LabelSelector { match_labels: Some(labels.clone()), ..Default::default() },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta { labels: Some(labels), ..Default::default() }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: spec.name.clone(),
                        image: Some(spec.image.clone()),
                        ports: Some(vec![ContainerPort {
                            name: Some("http".to_string()),
                            protocol: Some("TCP".to_string()),
                            container_port: spec.container_port,
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}
