//! Reconciliation passes against in-memory adapters.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::time::Instant;

use rudder_core::memory::{ClusterCall, MemoryCluster, MemorySource};
use rudder_core::types::{FailureKind, INSTANCE_LABEL};
use rudder_core::{
    AppRecord, AppStatus, Application, ApplyError, Destination, HealthStatus, LiveState,
    OperationPhase, Resource, ResourceKey, SyncStatusCode, Trigger,
};
use rudder_health::HealthEvaluator;
use rudder_sync::tree::expand;
use rudder_sync::{CancelToken, Claims, Reconciler, SyncRequest};

const REPO: &str = "mem://gitops";

fn application(prune: bool, self_heal: bool) -> Application {
    let doc = json!({
        "apiVersion": "rudder.dev/v1",
        "kind": "Application",
        "metadata": {"name": "shop"},
        "spec": {
            "source": {"repoURL": REPO, "path": "shop"},
            "destination": {"server": "memory", "namespace": "shop"},
            "syncPolicy": {"automated": {"prune": prune, "selfHeal": self_heal}}
        }
    });
    rudder_core::manifest::application_from_document(&doc).expect("application")
}

fn deployment(wave: i32) -> Value {
    json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {"name": "web", "annotations": {"rudder.dev/sync-wave": wave.to_string()}},
        "spec": {"replicas": 1}
    })
}

fn service(wave: i32) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {"name": "web", "annotations": {"rudder.dev/sync-wave": wave.to_string()}},
        "spec": {"ports": [{"port": 80}]}
    })
}

fn config_map(name: &str) -> Value {
    json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": name}, "data": {"k": "v"}})
}

fn key(kind: &str, name: &str) -> ResourceKey {
    ResourceKey::new(kind, "shop", name)
}

fn owned(manifest: Value) -> Resource {
    let mut r = Resource::from_manifest(manifest, "shop").expect("resource");
    r.set_label(INSTANCE_LABEL, "shop");
    r
}

struct Harness {
    source: MemorySource,
    reconciler: Reconciler,
    record: AppRecord,
}

impl Harness {
    fn new(app: Application, live: Arc<dyn LiveState>, max_duration: Duration) -> Self {
        let reconciler = Reconciler::new(
            live,
            HealthEvaluator::new(Duration::from_secs(600)),
            max_duration,
        );
        Self {
            source: MemorySource::new(),
            reconciler,
            record: AppRecord::new(app, None),
        }
    }

    async fn pass(&mut self, manual: Option<SyncRequest>) -> &AppStatus {
        self.pass_with(manual, &CancelToken::new()).await
    }

    async fn pass_with(&mut self, manual: Option<SyncRequest>, cancel: &CancelToken) -> &AppStatus {
        let resolved = expand(&self.source, &self.record.app).await.expect("expand");
        self.record.status = self
            .reconciler
            .reconcile(&self.record, &resolved, manual, &Claims::new(), cancel)
            .await;
        &self.record.status
    }
}

#[tokio::test]
async fn automated_sync_then_self_heal_recreates_deleted_resource() {
    let cluster = Arc::new(MemoryCluster::new());
    let mut h = Harness::new(application(false, true), cluster.clone(), Duration::from_secs(600));
    h.source.set(REPO, "shop", "r1", vec![service(1), deployment(0)]);

    let status = h.pass(None).await.clone();
    assert_eq!(
        cluster.mutations(),
        vec![
            ClusterCall::Apply(key("Deployment", "web")),
            ClusterCall::Apply(key("Service", "web")),
        ]
    );
    let op = status.operation.as_ref().expect("operation");
    assert_eq!(op.trigger, Trigger::Automated);
    assert_eq!(op.phase, OperationPhase::Succeeded);
    assert_eq!(status.sync, SyncStatusCode::Synced);
    assert_eq!(status.synced_revision.as_deref(), Some("r1"));
    assert_eq!(status.health, HealthStatus::Progressing);

    cluster.set_status(
        &key("Deployment", "web"),
        json!({"observedGeneration": 1, "replicas": 1, "updatedReplicas": 1, "availableReplicas": 1}),
    );
    cluster.clear_calls();
    let status = h.pass(None).await.clone();
    assert!(cluster.mutations().is_empty());
    assert_eq!(status.sync, SyncStatusCode::Synced);
    assert_eq!(status.health, HealthStatus::Healthy);

    cluster.remove(&key("Service", "web"));
    let status = h.pass(None).await.clone();
    assert_eq!(cluster.mutations(), vec![ClusterCall::Apply(key("Service", "web"))]);
    assert_eq!(status.operation.as_ref().map(|o| o.trigger), Some(Trigger::SelfHeal));
    assert_eq!(status.sync, SyncStatusCode::Synced);
    assert!(cluster.get(&key("Service", "web")).is_some());
}

#[tokio::test]
async fn repeated_sync_of_converged_state_is_a_no_op() {
    let cluster = Arc::new(MemoryCluster::new());
    let mut h = Harness::new(application(true, true), cluster.clone(), Duration::from_secs(600));
    h.source.set(REPO, "shop", "r1", vec![config_map("a"), service(0)]);

    h.pass(Some(SyncRequest::manual())).await;
    cluster.clear_calls();
    let status = h.pass(Some(SyncRequest::manual())).await;
    assert!(cluster.mutations().is_empty());
    assert_eq!(status.sync, SyncStatusCode::Synced);
    assert!(status.resources.iter().all(|r| r.class == rudder_core::DiffClass::Unchanged));
}

#[tokio::test]
async fn extras_survive_repeated_passes_without_prune() {
    let cluster = Arc::new(MemoryCluster::new());
    cluster.insert(owned(config_map("leftover")));
    let mut h = Harness::new(application(false, true), cluster.clone(), Duration::from_secs(600));
    h.source.set(REPO, "shop", "r1", vec![config_map("a")]);

    for _ in 0..3 {
        let status = h.pass(None).await;
        assert_eq!(status.sync, SyncStatusCode::OutOfSync);
    }
    assert!(cluster.get(&key("ConfigMap", "leftover")).is_some());
    assert!(!cluster
        .mutations()
        .contains(&ClusterCall::Delete(key("ConfigMap", "leftover"))));
    assert_eq!(
        cluster.mutations(),
        vec![ClusterCall::Apply(key("ConfigMap", "a"))],
        "only the first pass had actionable work"
    );
}

#[tokio::test]
async fn prune_removes_extras_and_converges() {
    let cluster = Arc::new(MemoryCluster::new());
    cluster.insert(owned(config_map("leftover")));
    let mut h = Harness::new(application(true, false), cluster.clone(), Duration::from_secs(600));
    h.source.set(REPO, "shop", "r1", vec![config_map("a")]);

    let status = h.pass(None).await;
    assert_eq!(status.sync, SyncStatusCode::Synced);
    assert!(cluster.get(&key("ConfigMap", "leftover")).is_none());
}

/// Records the instant of every apply call before delegating.
struct Recording {
    inner: MemoryCluster,
    applies: Mutex<Vec<Instant>>,
}

#[async_trait]
impl LiveState for Recording {
    async fn list(&self, destination: &Destination) -> Result<Vec<Resource>, ApplyError> {
        self.inner.list(destination).await
    }

    async fn apply(&self, destination: &Destination, resource: &Resource) -> Result<(), ApplyError> {
        self.applies.lock().expect("lock").push(Instant::now());
        self.inner.apply(destination, resource).await
    }

    async fn delete(&self, destination: &Destination, key: &ResourceKey) -> Result<(), ApplyError> {
        self.inner.delete(destination, key).await
    }
}

#[tokio::test(start_paused = true)]
async fn transient_failures_back_off_exponentially_then_error() {
    let recording = Arc::new(Recording {
        inner: MemoryCluster::new(),
        applies: Mutex::new(Vec::new()),
    });
    recording
        .inner
        .fail_next(&key("ConfigMap", "a"), (0..10).map(|_| ApplyError::Transient("throttled".into())));
    let mut h = Harness::new(application(false, false), recording.clone(), Duration::from_secs(600));
    h.source.set(REPO, "shop", "r1", vec![config_map("a")]);

    let status = h.pass(Some(SyncRequest::manual())).await.clone();

    let applies = recording.applies.lock().expect("lock").clone();
    assert_eq!(applies.len(), 6, "initial attempt plus five retries");
    let gaps: Vec<u64> = applies.windows(2).map(|w| (w[1] - w[0]).as_secs()).collect();
    assert_eq!(gaps, vec![5, 10, 20, 40, 80]);

    let op = status.operation.as_ref().expect("operation");
    assert_eq!(op.phase, OperationPhase::Error);
    assert!(op.message.contains("retry budget exhausted"));
    assert!(op.next_retry_at.is_some());
    let failure = status.failure.as_ref().expect("failure");
    assert_eq!(failure.kind, FailureKind::Apply);
    assert_eq!(failure.resources, vec![key("ConfigMap", "a")]);
}

#[tokio::test(start_paused = true)]
async fn operation_deadline_ends_in_timeout_error() {
    let cluster = Arc::new(MemoryCluster::new());
    cluster.fail_next(&key("ConfigMap", "a"), (0..10).map(|_| ApplyError::Transient("slow".into())));
    let mut h = Harness::new(application(false, false), cluster.clone(), Duration::from_secs(30));
    h.source.set(REPO, "shop", "r1", vec![config_map("a")]);

    let start = Instant::now();
    let status = h.pass(Some(SyncRequest::manual())).await;
    assert_eq!(start.elapsed(), Duration::from_secs(30));
    assert_eq!(status.operation.as_ref().map(|o| o.phase), Some(OperationPhase::Error));
    assert_eq!(status.failure.as_ref().map(|f| f.kind), Some(FailureKind::Timeout));
}

#[tokio::test(start_paused = true)]
async fn terminate_during_backoff_stops_and_suppresses_automation() {
    let cluster = Arc::new(MemoryCluster::new());
    cluster.fail_next(&key("ConfigMap", "a"), (0..10).map(|_| ApplyError::Transient("busy".into())));
    let mut h = Harness::new(application(false, true), cluster.clone(), Duration::from_secs(600));
    h.source.set(REPO, "shop", "r1", vec![config_map("a")]);

    let cancel = CancelToken::new();
    let stopper = cancel.clone();
    let (status, ()) = tokio::join!(h.pass_with(None, &cancel), async move {
        tokio::time::sleep(Duration::from_secs(7)).await;
        stopper.cancel();
    });
    let status = status.clone();
    let op = status.operation.as_ref().expect("operation");
    assert_eq!(op.phase, OperationPhase::Terminated);
    assert_eq!(op.resources[0].attempts, 2);
    assert!(status.failure.is_none());

    cluster.clear_calls();
    h.pass(None).await;
    assert!(cluster.mutations().is_empty(), "terminated revision is not retried automatically");
}

#[tokio::test]
async fn degraded_resource_after_sync_fails_the_operation() {
    let cluster = Arc::new(MemoryCluster::new());
    let mut live = owned(deployment(0));
    live.manifest["spec"]["replicas"] = json!(3);
    live.manifest["status"] = json!({"conditions": [
        {"type": "Progressing", "status": "False", "reason": "ProgressDeadlineExceeded"}
    ]});
    cluster.insert(live);
    let mut h = Harness::new(application(false, false), cluster.clone(), Duration::from_secs(600));
    h.source.set(REPO, "shop", "r1", vec![deployment(0)]);

    let status = h.pass(Some(SyncRequest::manual())).await;
    let op = status.operation.as_ref().expect("operation");
    assert_eq!(op.phase, OperationPhase::Failed);
    assert!(op.message.contains("degraded"));
    assert_eq!(status.health, HealthStatus::Degraded);
    assert_ne!(status.synced_revision.as_deref(), Some("r1"));
}

#[tokio::test]
async fn resource_owned_by_another_application_is_a_conflict() {
    let cluster = Arc::new(MemoryCluster::new());
    let mut foreign = Resource::from_manifest(config_map("a"), "shop").expect("resource");
    foreign.set_label(INSTANCE_LABEL, "billing");
    cluster.insert(foreign);
    let mut h = Harness::new(application(true, true), cluster.clone(), Duration::from_secs(600));
    h.source.set(REPO, "shop", "r1", vec![config_map("a")]);

    let status = h.pass(Some(SyncRequest::manual())).await;
    assert_eq!(status.sync, SyncStatusCode::Unknown);
    let failure = status.failure.as_ref().expect("failure");
    assert_eq!(failure.kind, FailureKind::Conflict);
    assert!(failure.message.contains("billing"));
    assert!(cluster.mutations().is_empty());
}

#[tokio::test]
async fn unreachable_environment_keeps_previous_resources() {
    let cluster = Arc::new(MemoryCluster::new());
    let mut h = Harness::new(application(false, false), cluster.clone(), Duration::from_secs(600));
    h.source.set(REPO, "shop", "r1", vec![config_map("a")]);
    h.pass(Some(SyncRequest::manual())).await;
    let before = h.record.status.resources.clone();

    cluster.set_unreachable(true);
    let status = h.pass(None).await;
    assert_eq!(status.sync, SyncStatusCode::Unknown);
    assert_eq!(status.failure.as_ref().map(|f| f.kind), Some(FailureKind::LiveState));
    assert_eq!(status.resources, before);
}
