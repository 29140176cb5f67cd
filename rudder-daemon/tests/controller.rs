//! Controller passes over app-of-apps trees with in-memory adapters.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::Semaphore;

use rudder_core::memory::{ClusterCall, MemoryCluster, MemorySource};
use rudder_core::types::{FailureKind, INSTANCE_LABEL};
use rudder_core::{
    store, AppName, Application, ApplyError, ControllerConfig, Destination, LiveState,
    OperationPhase, Resource, ResourceKey, SyncStatusCode,
};
use rudder_daemon::{Controller, DaemonError, PassOutcome};
use rudder_sync::SyncRequest;

const REPO: &str = "mem://gitops";

fn app_doc(name: &str, prune: bool, cascade: bool) -> Value {
    let mut doc = json!({
        "apiVersion": "rudder.dev/v1",
        "kind": "Application",
        "metadata": {"name": name},
        "spec": {
            "source": {"repoURL": REPO, "path": name},
            "destination": {"server": "memory", "namespace": name},
            "syncPolicy": {"automated": {"prune": prune}}
        }
    });
    if cascade {
        doc["metadata"]["finalizers"] = json!(["resources-finalizer.rudder.dev"]);
    }
    doc
}

fn application(name: &str, prune: bool, cascade: bool) -> Application {
    rudder_core::manifest::application_from_document(&app_doc(name, prune, cascade))
        .expect("application")
}

fn manual_application(name: &str) -> Application {
    let mut app = application(name, false, false);
    app.sync_policy.automated = false;
    app
}

fn cm(name: &str) -> Value {
    json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": name}, "data": {"k": "v"}})
}

fn cm_in_wave(name: &str, wave: i32) -> Value {
    let mut doc = cm(name);
    doc["metadata"]["annotations"] = json!({"rudder.dev/sync-wave": wave.to_string()});
    doc
}

fn cm_key(namespace: &str, name: &str) -> ResourceKey {
    ResourceKey::new("ConfigMap", namespace, name)
}

fn name(n: &str) -> AppName {
    AppName::from(n)
}

struct Fixture {
    home: TempDir,
    source: Arc<MemorySource>,
    cluster: Arc<MemoryCluster>,
}

impl Fixture {
    fn new() -> Self {
        Self {
            home: TempDir::new().expect("home"),
            source: Arc::new(MemorySource::new()),
            cluster: Arc::new(MemoryCluster::new()),
        }
    }

    fn home(&self) -> &Path {
        self.home.path()
    }

    fn define_root(&self, app: &Application) {
        store::save_root_app_at(self.home(), app).expect("save root");
    }

    fn publish(&self, path: &str, revision: &str, documents: Vec<Value>) {
        self.source.set(REPO, path, revision, documents);
    }

    fn controller(&self) -> Arc<Controller> {
        self.controller_over(self.cluster.clone())
    }

    fn controller_over(&self, live: Arc<dyn LiveState>) -> Arc<Controller> {
        Controller::new(
            self.home(),
            ControllerConfig::default(),
            self.source.clone(),
            live,
        )
        .expect("controller")
    }

    fn deletes(&self) -> Vec<ResourceKey> {
        self.cluster
            .mutations()
            .into_iter()
            .filter_map(|call| match call {
                ClusterCall::Delete(key) => Some(key),
                _ => None,
            })
            .collect()
    }
}

/// Live state whose applies block until the test lets them through.
struct Gate {
    inner: MemoryCluster,
    entered: Semaphore,
    release: Semaphore,
}

impl Gate {
    fn new() -> Self {
        Self {
            inner: MemoryCluster::new(),
            entered: Semaphore::new(0),
            release: Semaphore::new(0),
        }
    }
}

#[async_trait]
impl LiveState for Gate {
    async fn list(&self, destination: &Destination) -> Result<Vec<Resource>, ApplyError> {
        self.inner.list(destination).await
    }

    async fn apply(&self, destination: &Destination, resource: &Resource) -> Result<(), ApplyError> {
        self.entered.add_permits(1);
        self.release.acquire().await.expect("gate open").forget();
        self.inner.apply(destination, resource).await
    }

    async fn delete(&self, destination: &Destination, key: &ResourceKey) -> Result<(), ApplyError> {
        self.inner.delete(destination, key).await
    }
}

#[tokio::test]
async fn children_are_reconciled_as_independent_applications() {
    let fx = Fixture::new();
    fx.define_root(&application("platform", false, false));
    fx.publish(
        "platform",
        "r1",
        vec![
            app_doc("web", false, false),
            app_doc("db", false, false),
            cm("platform-settings"),
        ],
    );
    fx.publish("web", "r1", vec![cm("web-settings")]);
    // "db" has nothing published: its fetch fails.

    let controller = fx.controller();
    controller.reconcile_all().await.expect("pass");

    let platform = controller.get(&name("platform")).await.expect("platform");
    assert_eq!(platform.status.sync, SyncStatusCode::Synced);
    assert_eq!(platform.status.children, vec![name("web"), name("db")]);

    let web = controller.get(&name("web")).await.expect("web");
    assert_eq!(web.parent, Some(name("platform")));
    assert_eq!(web.status.sync, SyncStatusCode::Synced);
    assert!(fx.cluster.get(&cm_key("web", "web-settings")).is_some());

    let db = controller.get(&name("db")).await.expect("db");
    assert_eq!(db.status.sync, SyncStatusCode::Unknown);
    assert_eq!(db.status.failure.expect("failure").kind, FailureKind::Fetch);

    let stored = store::list_records_at(fx.home()).expect("records");
    assert_eq!(stored.len(), 3);
}

#[tokio::test]
async fn restart_resumes_from_persisted_status() {
    let fx = Fixture::new();
    fx.define_root(&application("shop", false, false));
    fx.publish("shop", "r7", vec![cm("settings")]);
    fx.controller().reconcile_all().await.expect("pass");

    let resumed = fx.controller();
    let record = resumed.get(&name("shop")).await.expect("resumed record");
    assert_eq!(record.status.synced_revision.as_deref(), Some("r7"));
    assert_eq!(record.status.sync, SyncStatusCode::Synced);
    assert_eq!(resumed.list().await.len(), 1);
}

#[tokio::test]
async fn concurrent_triggers_for_one_app_run_a_single_operation() {
    let fx = Fixture::new();
    fx.define_root(&manual_application("shop"));
    fx.publish("shop", "r1", vec![cm("settings")]);
    let gate = Arc::new(Gate::new());
    let controller = fx.controller_over(gate.clone());
    let shop = name("shop");

    let first = controller.sync(&shop, SyncRequest::manual());
    let second = async {
        let _entered = gate.entered.acquire().await.expect("first apply started");
        assert!(controller.is_running(&shop));
        let outcome = controller
            .sync(&shop, SyncRequest::manual())
            .await
            .expect("second trigger");
        gate.release.add_permits(1);
        outcome
    };
    let (first, second) = tokio::join!(first, second);

    assert_eq!(second, PassOutcome::Coalesced);
    let PassOutcome::Reconciled(status) = first.expect("first trigger") else {
        panic!("first trigger must run the pass");
    };
    assert_eq!(status.sync, SyncStatusCode::Synced);
    assert_eq!(
        status.operation.expect("operation").phase,
        OperationPhase::Succeeded
    );
    assert_eq!(
        gate.inner.mutations(),
        vec![ClusterCall::Apply(cm_key("shop", "settings"))]
    );
    assert!(!controller.is_running(&shop));
}

#[tokio::test]
async fn terminate_stops_the_operation_at_the_next_wave() {
    let fx = Fixture::new();
    fx.define_root(&manual_application("shop"));
    fx.publish("shop", "r1", vec![cm_in_wave("first", 0), cm_in_wave("second", 1)]);
    let gate = Arc::new(Gate::new());
    let controller = fx.controller_over(gate.clone());
    let shop = name("shop");

    let sync = controller.sync(&shop, SyncRequest::manual());
    let terminate = async {
        let _entered = gate.entered.acquire().await.expect("first wave started");
        let terminated = controller.terminate(&shop).await.expect("terminate");
        gate.release.add_permits(1);
        terminated
    };
    let (outcome, terminated) = tokio::join!(sync, terminate);

    assert!(terminated);
    let PassOutcome::Reconciled(status) = outcome.expect("sync") else {
        panic!("sync must run");
    };
    assert_eq!(
        status.operation.expect("operation").phase,
        OperationPhase::Terminated
    );
    assert_eq!(
        gate.inner.mutations(),
        vec![ClusterCall::Apply(cm_key("shop", "first"))]
    );

    assert!(!controller.terminate(&shop).await.expect("idle terminate"));
    assert!(matches!(
        controller.terminate(&name("ghost")).await,
        Err(DaemonError::UnknownApp { .. })
    ));
}

#[tokio::test]
async fn removed_child_is_orphaned_then_pruned_once_the_parent_prunes() {
    let fx = Fixture::new();
    fx.define_root(&application("platform", false, false));
    fx.publish(
        "platform",
        "r1",
        vec![app_doc("web", false, false), app_doc("jobs", false, true)],
    );
    fx.publish("web", "r1", vec![cm("web-settings")]);
    fx.publish("jobs", "r1", vec![cm("jobs-settings")]);
    let controller = fx.controller();
    controller.reconcile_all().await.expect("first pass");

    fx.publish("platform", "r2", vec![app_doc("web", false, false)]);
    controller.reconcile_all().await.expect("second pass");
    let jobs = controller.get(&name("jobs")).await.expect("kept");
    assert!(jobs.status.orphaned);
    assert!(fx.cluster.get(&cm_key("jobs", "jobs-settings")).is_some());
    assert!(fx.deletes().is_empty());

    fx.define_root(&application("platform", true, false));
    controller.reconcile_all().await.expect("third pass");
    assert!(controller.get(&name("jobs")).await.is_none());
    assert!(!store::record_path_at(fx.home(), &name("jobs")).exists());
    assert_eq!(fx.deletes(), vec![cm_key("jobs", "jobs-settings")]);
    assert!(controller.get(&name("web")).await.is_some());
}

#[tokio::test]
async fn cascade_delete_removes_the_subtree_deepest_first() {
    let fx = Fixture::new();
    fx.define_root(&application("platform", false, true));
    fx.publish("platform", "r1", vec![app_doc("web", false, true), cm("platform-settings")]);
    fx.publish("web", "r1", vec![cm("web-settings")]);
    let controller = fx.controller();
    controller.reconcile_all().await.expect("pass");

    let deleted = controller
        .delete(&name("platform"), true)
        .await
        .expect("delete");
    assert_eq!(deleted, vec![name("platform"), name("web")]);
    assert_eq!(
        fx.deletes(),
        vec![
            cm_key("web", "web-settings"),
            cm_key("platform", "platform-settings")
        ]
    );
    assert!(controller.list().await.is_empty());
    assert!(store::list_records_at(fx.home()).expect("records").is_empty());
    assert!(!store::root_app_path_at(fx.home(), &name("platform")).exists());
}

#[tokio::test]
async fn plain_delete_keeps_resources_and_orphans_children() {
    let fx = Fixture::new();
    fx.define_root(&application("platform", false, true));
    fx.publish("platform", "r1", vec![app_doc("web", false, false), cm("platform-settings")]);
    fx.publish("web", "r1", vec![cm("web-settings")]);
    let controller = fx.controller();
    controller.reconcile_all().await.expect("pass");

    let deleted = controller
        .delete(&name("platform"), false)
        .await
        .expect("delete");
    assert_eq!(deleted, vec![name("platform")]);
    assert!(fx.deletes().is_empty());
    assert!(fx.cluster.get(&cm_key("platform", "platform-settings")).is_some());

    let web = controller.get(&name("web")).await.expect("child kept");
    assert!(web.status.orphaned);
    assert!(matches!(
        controller.delete(&name("platform"), false).await,
        Err(DaemonError::UnknownApp { .. })
    ));
}

#[tokio::test]
async fn removed_root_definition_follows_the_cascade_finalizer() {
    let fx = Fixture::new();
    fx.define_root(&application("kept", false, false));
    fx.define_root(&application("gone", false, true));
    fx.publish("kept", "r1", vec![cm("kept-settings")]);
    fx.publish("gone", "r1", vec![cm("gone-settings")]);
    let controller = fx.controller();
    controller.reconcile_all().await.expect("pass");

    store::remove_root_app_at(fx.home(), &name("kept")).expect("remove kept");
    store::remove_root_app_at(fx.home(), &name("gone")).expect("remove gone");
    controller.reconcile_all().await.expect("second pass");

    let kept = controller.get(&name("kept")).await.expect("kept record");
    assert!(kept.status.orphaned);
    assert!(fx.cluster.get(&cm_key("kept", "kept-settings")).is_some());

    assert!(controller.get(&name("gone")).await.is_none());
    assert_eq!(fx.deletes(), vec![cm_key("gone", "gone-settings")]);
}

#[tokio::test]
async fn invalid_definition_file_does_not_stop_other_roots() {
    let fx = Fixture::new();
    fx.define_root(&application("shop", false, true));
    fx.define_root(&application("billing", false, true));
    fx.publish("shop", "r1", vec![cm("shop-settings")]);
    fx.publish("billing", "r1", vec![cm("billing-settings")]);
    fx.publish("fresh", "r1", vec![cm("fresh-settings")]);
    let controller = fx.controller();
    controller.reconcile_all().await.expect("first pass");

    let apps = store::apps_dir_at(fx.home());
    std::fs::write(apps.join("broken.yaml"), "kind: Application\nspec: {}\n").expect("write");
    std::fs::write(
        store::root_app_path_at(fx.home(), &name("billing")),
        "kind: Application\nmetadata:\n  name: billing\nspec: {}\n",
    )
    .expect("write");
    fx.define_root(&application("fresh", false, true));
    controller.reconcile_all().await.expect("second pass");

    let fresh = controller.get(&name("fresh")).await.expect("fresh reconciled");
    assert_eq!(fresh.status.sync, SyncStatusCode::Synced);
    assert!(fx.cluster.get(&cm_key("fresh", "fresh-settings")).is_some());

    let billing = controller.get(&name("billing")).await.expect("billing kept");
    assert!(!billing.status.orphaned);
    assert!(fx.cluster.get(&cm_key("billing", "billing-settings")).is_some());
    assert!(fx.deletes().is_empty());
}

#[tokio::test]
async fn deleted_root_stays_deleted_whatever_its_file_is_called() {
    let fx = Fixture::new();
    let apps = store::apps_dir_at(fx.home());
    std::fs::create_dir_all(&apps).expect("apps dir");
    let definition = |n: &str| serde_json::to_string(&app_doc(n, false, false)).expect("json");
    std::fs::write(apps.join("guestbook.yml"), definition("guestbook")).expect("write");
    std::fs::write(apps.join("frontend.yaml"), definition("web")).expect("write");
    fx.publish("guestbook", "r1", vec![cm("guestbook-settings")]);
    fx.publish("web", "r1", vec![cm("web-settings")]);
    let controller = fx.controller();

    controller
        .reconcile_definition_file(&apps.join("frontend.yaml"))
        .await
        .expect("file pass");
    assert!(controller.get(&name("web")).await.is_some());
    assert!(controller.get(&name("guestbook")).await.is_none());

    controller.reconcile_all().await.expect("pass");
    for app in ["guestbook", "web"] {
        controller.delete(&name(app), false).await.expect("delete");
    }
    assert!(!apps.join("guestbook.yml").exists());
    assert!(!apps.join("frontend.yaml").exists());

    controller.reconcile_all().await.expect("pass after delete");
    assert!(controller.get(&name("guestbook")).await.is_none());
    assert!(controller.get(&name("web")).await.is_none());
}

#[tokio::test]
async fn later_claimant_of_a_resource_is_rejected() {
    let fx = Fixture::new();
    let shared = |n: &str| {
        let mut doc = app_doc(n, false, false);
        doc["spec"]["destination"]["namespace"] = json!("shared");
        rudder_core::manifest::application_from_document(&doc).expect("application")
    };
    fx.define_root(&shared("alpha"));
    fx.define_root(&shared("beta"));
    fx.publish("alpha", "r1", vec![cm("settings")]);
    fx.publish("beta", "r1", vec![cm("settings")]);
    let controller = fx.controller();

    controller.reconcile_root(&name("alpha")).await.expect("alpha");
    let key = cm_key("shared", "settings");
    let live = fx.cluster.get(&key).expect("applied");
    assert_eq!(live["metadata"]["labels"][INSTANCE_LABEL], json!("alpha"));

    // Without the live object only alpha's recorded claim stands in the way.
    fx.cluster.remove(&key);
    fx.cluster.clear_calls();
    controller.reconcile_root(&name("beta")).await.expect("beta");

    let beta = controller.get(&name("beta")).await.expect("beta");
    assert_eq!(beta.status.sync, SyncStatusCode::Unknown);
    let failure = beta.status.failure.expect("failure");
    assert_eq!(failure.kind, FailureKind::Conflict);
    assert_eq!(failure.resources, vec![key]);
    assert!(fx.cluster.mutations().is_empty());
}

#[tokio::test]
async fn diff_renders_pending_changes_without_mutating() {
    let fx = Fixture::new();
    fx.define_root(&manual_application("shop"));
    fx.publish("shop", "r1", vec![cm("settings")]);
    let controller = fx.controller();
    controller
        .refresh(&name("shop"))
        .await
        .expect("refresh");

    let diffs = controller.diff(&name("shop")).await.expect("diff");
    assert_eq!(diffs.len(), 1);
    assert_eq!(diffs[0].key, cm_key("shop", "settings"));
    assert!(diffs[0].unified_diff.contains("+kind: ConfigMap"));
    assert!(fx.cluster.mutations().is_empty());
}
