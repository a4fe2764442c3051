//! converge core types: resource identities, snapshots, deltas and watch events.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

mod error;

pub use error::{ConvergeError, ConvergeResult};

/// Label pairs carried on snapshots.
pub type Labels = SmallVec<[(String, String); 4]>;

/// The two resource kinds this controller drives.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Namespace,
    Workload,
}

impl ResourceKind {
    pub fn label(&self) -> &'static str {
        match self {
            ResourceKind::Namespace => "Namespace",
            ResourceKind::Workload => "Workload",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// (kind, namespace scope, name). Namespaces themselves carry no scope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceIdentity {
    pub kind: ResourceKind,
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceIdentity {
    pub fn namespace(name: impl Into<String>) -> Self {
        Self { kind: ResourceKind::Namespace, namespace: None, name: name.into() }
    }

    pub fn workload(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { kind: ResourceKind::Workload, namespace: Some(namespace.into()), name: name.into() }
    }
}

impl fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NamespacePhase {
    Active,
    Terminating,
    Unknown,
}

impl NamespacePhase {
    pub fn parse(phase: Option<&str>) -> Self {
        match phase {
            Some("Active") => NamespacePhase::Active,
            Some("Terminating") => NamespacePhase::Terminating,
            _ => NamespacePhase::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NamespacePhase::Active => "Active",
            NamespacePhase::Terminating => "Terminating",
            NamespacePhase::Unknown => "Unknown",
        }
    }
}

/// Kind-specific status fields inspected by convergence predicates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ResourceStatus {
    Namespace { phase: NamespacePhase },
    Workload { desired: i32, ready: i32 },
}

/// Point-in-time view of one resource. Every event produces a fresh snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceSnapshot {
    pub identity: ResourceIdentity,
    pub uid: String,
    pub resource_version: Option<String>,
    /// Unix seconds; 0 when the control plane did not report it.
    pub creation_ts: i64,
    pub labels: Labels,
    /// Set once the control plane has accepted a delete for this object.
    pub deleting: bool,
    pub status: ResourceStatus,
}

impl ResourceSnapshot {
    pub fn name(&self) -> &str {
        &self.identity.name
    }

    pub fn namespace_phase(&self) -> Option<NamespacePhase> {
        match self.status {
            ResourceStatus::Namespace { phase } => Some(phase),
            ResourceStatus::Workload { .. } => None,
        }
    }

    /// `(desired, ready)` replica counts for workloads.
    pub fn replicas(&self) -> Option<(i32, i32)> {
        match self.status {
            ResourceStatus::Workload { desired, ready } => Some((desired, ready)),
            ResourceStatus::Namespace { .. } => None,
        }
    }

    /// Same object revision as `other` (both carry a resourceVersion and it matches).
    pub fn same_revision(&self, other: &ResourceSnapshot) -> bool {
        self.uid == other.uid
            && matches!((&self.resource_version, &other.resource_version), (Some(a), Some(b)) if a == b)
    }
}

/// Raw change record yielded by a cluster watch stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Delta {
    Applied(ResourceSnapshot),
    Deleted(ResourceSnapshot),
    /// Full relist; replaces everything previously known.
    Restarted(Vec<ResourceSnapshot>),
}

/// Change event dispatched by a watch session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum WatchEvent {
    Added(ResourceSnapshot),
    Deleted(ResourceSnapshot),
    Updated(ResourceSnapshot, ResourceSnapshot),
}

impl WatchEvent {
    pub fn identity(&self) -> &ResourceIdentity {
        &self.current().identity
    }

    /// The newest snapshot the event carries (the last known one for deletes).
    pub fn current(&self) -> &ResourceSnapshot {
        match self {
            WatchEvent::Added(s) | WatchEvent::Deleted(s) => s,
            WatchEvent::Updated(_, new) => new,
        }
    }

    pub fn verb(&self) -> &'static str {
        match self {
            WatchEvent::Added(_) => "added",
            WatchEvent::Deleted(_) => "deleted",
            WatchEvent::Updated(..) => "updated",
        }
    }
}

/// Pod view produced by enumeration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PodSnapshot {
    pub namespace: String,
    pub name: String,
    pub phase: String,
    pub reason: Option<String>,
    pub host_ip: Option<String>,
    pub pod_ip: Option<String>,
    pub container_port: Option<i32>,
    pub labels: Labels,
    pub terminating: bool,
}

impl PodSnapshot {
    pub fn matches_labels(&self, selector: &BTreeMap<String, String>) -> bool {
        selector.iter().all(|(k, v)| self.labels.iter().any(|(lk, lv)| lk == k && lv == v))
    }
}

/// Minimal single-container workload description.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkloadSpec {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub image: String,
    pub container_port: i32,
    pub replicas: i32,
}

impl WorkloadSpec {
    /// Spec selecting its pods by `app=<name>`.
    pub fn new(name: impl Into<String>, image: impl Into<String>, container_port: i32, replicas: i32) -> Self {
        let name = name.into();
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), name.clone());
        Self { name, labels, image: image.into(), container_port, replicas }
    }

    /// Label selector string, e.g. `app=web`.
    pub fn selector(&self) -> String {
        self.labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join(",")
    }
}

/// What to create; the identity is derived from it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ResourceSpec {
    Namespace { name: String },
    Workload { namespace: String, spec: WorkloadSpec },
}

impl ResourceSpec {
    pub fn identity(&self) -> ResourceIdentity {
        match self {
            ResourceSpec::Namespace { name } => ResourceIdentity::namespace(name.clone()),
            ResourceSpec::Workload { namespace, spec } => ResourceIdentity::workload(namespace.clone(), spec.name.clone()),
        }
    }
}

pub mod prelude {
    pub use super::{
        ConvergeError, ConvergeResult, Delta, NamespacePhase, PodSnapshot, ResourceIdentity, ResourceKind,
        ResourceSnapshot, ResourceSpec, ResourceStatus, WatchEvent, WorkloadSpec,
    };
}
