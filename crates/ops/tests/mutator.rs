#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use converge_core::{ConvergeError, NamespacePhase, ResourceIdentity, ResourceSpec, WorkloadSpec};
use converge_kubehub::{ClusterApi, FakeCluster};
use converge_ops::{spawn_matcher, Mutator};
use converge_store::WatchSession;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct Rig {
    fake: FakeCluster,
    mutator: Mutator,
    cancel: CancellationToken,
}

impl Drop for Rig {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Namespace and workload sessions feeding one matcher, as the orchestrator wires them.
async fn rig(fake: FakeCluster, namespace: &str) -> Rig {
    let api: Arc<dyn ClusterApi> = Arc::new(fake.clone());
    let (tx, rx) = mpsc::channel(256);
    let mut namespaces = WatchSession::namespaces(Arc::clone(&api));
    let mut workloads = WatchSession::workloads(Arc::clone(&api), namespace);
    namespaces.on_event(tx.clone()).expect("ns handler");
    workloads.on_event(tx).expect("wl handler");
    let cancel = CancellationToken::new();
    namespaces.start(cancel.clone()).expect("start ns");
    workloads.start(cancel.clone()).expect("start wl");
    namespaces.synced().await.expect("ns synced");
    workloads.synced().await.expect("wl synced");
    let (matcher, _task) = spawn_matcher(rx, 16);
    Rig { fake, mutator: Mutator::new(api, matcher, Some(Duration::from_secs(5))), cancel }
}

fn ns_spec(name: &str) -> ResourceSpec {
    ResourceSpec::Namespace { name: name.to_string() }
}

#[tokio::test]
async fn create_delete_create_reflects_last_generation() {
    let rig = rig(FakeCluster::new(), "demo").await;
    let id = ResourceIdentity::namespace("demo");
    let first = rig.mutator.create(&ns_spec("demo")).await.expect("create");
    assert_eq!(first.namespace_phase(), Some(NamespacePhase::Active));
    rig.mutator.delete(&id).await.expect("delete");
    assert!(rig.mutator.get(&id).await.expect("get").is_none());
    let second = rig.mutator.create(&ns_spec("demo")).await.expect("recreate");
    let now = rig.mutator.get(&id).await.expect("get").expect("present");
    assert_ne!(first.uid, second.uid);
    assert_eq!(now.uid, second.uid);
}

#[tokio::test]
async fn get_during_delete_sees_object_until_confirmed() {
    let fake = FakeCluster::new();
    fake.seed_namespace("demo");
    let rig = rig(fake, "demo").await;
    let id = ResourceIdentity::namespace("demo");
    rig.fake.hold_deletions();

    let mutator = rig.mutator.clone();
    let del_id = id.clone();
    let pending = tokio::spawn(async move { mutator.delete(&del_id).await });
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!pending.is_finished());
    let mid = rig.mutator.get(&id).await.expect("get").expect("still visible");
    assert_eq!(mid.namespace_phase(), Some(NamespacePhase::Terminating));

    rig.fake.release_deletions();
    pending.await.expect("join").expect("delete confirmed");
    assert!(rig.mutator.get(&id).await.expect("get").is_none());
}

#[tokio::test]
async fn workload_delete_resolves_only_after_it_is_gone() {
    let fake = FakeCluster::new();
    fake.seed_namespace("demo");
    fake.seed_workload("demo", &WorkloadSpec::new("web", "nginx:latest", 80, 2));
    let rig = rig(fake, "demo").await;
    let id = ResourceIdentity::workload("demo", "web");
    rig.fake.hold_deletions();

    let mutator = rig.mutator.clone();
    let del_id = id.clone();
    let pending = tokio::spawn(async move { mutator.delete(&del_id).await });
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!pending.is_finished());
    let mid = rig.fake.get_workload("demo", "web").await.expect("get").expect("still visible");
    assert!(mid.deleting);
    assert_eq!(rig.fake.pod_count("demo"), 2);

    rig.fake.release_deletions();
    pending.await.expect("join").expect("delete confirmed");
    assert!(rig.fake.get_workload("demo", "web").await.expect("get").is_none());
    assert_eq!(rig.fake.pod_count("demo"), 0);
}

#[tokio::test]
async fn namespace_recreated_after_delete_has_no_workloads() {
    let fake = FakeCluster::new();
    fake.seed_namespace("demo");
    fake.seed_workload("demo", &WorkloadSpec::new("web", "nginx:latest", 80, 2));
    let rig = rig(fake, "demo").await;
    rig.mutator.delete(&ResourceIdentity::namespace("demo")).await.expect("delete");
    rig.mutator.create(&ns_spec("demo")).await.expect("recreate");
    assert!(rig.fake.list_workloads("demo").await.expect("list").is_empty());
    assert_eq!(rig.fake.pod_count("demo"), 0);
}

#[tokio::test]
async fn workload_create_and_scale_wait_for_ready() {
    let fake = FakeCluster::new();
    fake.seed_namespace("demo");
    let rig = rig(fake, "demo").await;
    let spec = WorkloadSpec::new("web", "nginx:latest", 80, 1);
    let created = rig
        .mutator
        .create(&ResourceSpec::Workload { namespace: "demo".into(), spec })
        .await
        .expect("create workload");
    let id = created.identity.clone();
    assert_eq!(rig.fake.pod_count("demo"), 1);

    rig.mutator.patch_replicas(&id, 2).await.expect("scale");
    assert_eq!(rig.fake.pod_count("demo"), 2);
    let w = rig.mutator.get(&id).await.expect("get").expect("present");
    assert_eq!(w.replicas(), Some((2, 2)));
}

#[tokio::test]
async fn create_over_existing_is_already_exists() {
    let fake = FakeCluster::new();
    fake.seed_namespace("demo");
    let rig = rig(fake, "demo").await;
    let err = rig.mutator.create(&ns_spec("demo")).await.expect_err("exists");
    assert!(matches!(err, ConvergeError::AlreadyExists(_)));
    // registration released: the next operation on the identity is accepted
    rig.mutator.delete(&ResourceIdentity::namespace("demo")).await.expect("delete");
}

#[tokio::test]
async fn concurrent_operations_on_one_identity_conflict() {
    let fake = FakeCluster::new();
    fake.seed_namespace("demo");
    let rig = rig(fake, "demo").await;
    rig.fake.hold_deletions();
    let id = ResourceIdentity::namespace("demo");
    let mutator = rig.mutator.clone();
    let del_id = id.clone();
    let first = tokio::spawn(async move { mutator.delete(&del_id).await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(matches!(rig.mutator.await_absent(&id).await, Err(ConvergeError::Conflict(_))));
    rig.fake.release_deletions();
    first.await.expect("join").expect("first delete");
}

#[tokio::test]
async fn await_absent_resolves_for_terminating_and_missing() {
    let fake = FakeCluster::new();
    fake.seed_namespace("demo");
    let rig = rig(fake, "demo").await;
    let id = ResourceIdentity::namespace("demo");
    rig.fake.delete_namespace("demo").await.expect("out-of-band delete");
    rig.mutator.await_absent(&id).await.expect("disappears");
    rig.mutator.await_absent(&id).await.expect("already gone");
}
