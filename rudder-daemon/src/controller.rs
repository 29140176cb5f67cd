//! The controller: scheduling state shared by every trigger.
//!
//! A [`Controller`] keeps the status store's records in memory and runs
//! reconciliation passes over app-of-apps trees. Each node of a resolved
//! tree gets its own pass on a spawned task, bounded by the worker pool.
//! A per-Application lock keeps two passes for the same Application from
//! overlapping; a trigger that finds the lock held is coalesced into a
//! no-op ([`PassOutcome::Coalesced`]).
//!
//! Records are only written by the task holding the Application's lock;
//! everything else reads the cache.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use tokio::sync::{Mutex, RwLock, Semaphore};

use rudder_core::types::DiffClass;
use rudder_core::store::RootScan;
use rudder_core::{
    config, store, AppName, AppRecord, AppStatus, Application, ControllerConfig, LiveState,
    Resource, StateSource, StoreError,
};
use rudder_health::HealthEvaluator;
use rudder_source::DirectorySource;
use rudder_sync::orchestrator::kind_tier;
use rudder_sync::tree::expand;
use rudder_sync::{
    failed_status, render, resolve_from, CancelToken, Claims, DirectoryCluster, Reconciler,
    ResourceTextDiff, SyncError, SyncRequest, TreeNode,
};

use crate::error::DaemonError;

/// Result of asking for one Application's pass.
#[derive(Debug, Clone, PartialEq)]
pub enum PassOutcome {
    /// The pass ran; this is the Status it recorded.
    Reconciled(AppStatus),
    /// Another pass for the Application was already in flight.
    Coalesced,
}

pub struct Controller {
    home: PathBuf,
    config: ControllerConfig,
    source: Arc<dyn StateSource>,
    reconciler: Reconciler,
    workers: Arc<Semaphore>,
    locks: StdMutex<HashMap<AppName, Arc<Mutex<()>>>>,
    running: StdMutex<HashMap<AppName, CancelToken>>,
    records: RwLock<BTreeMap<AppName, AppRecord>>,
}

impl Controller {
    /// Controller over the directory-backed source and environment named by
    /// `<home>/.rudder/config.yaml`.
    pub fn open(home: &Path) -> Result<Arc<Self>, DaemonError> {
        let config = config::load_at(home)?;
        let cluster = DirectoryCluster::new(config.cluster_root_at(home));
        Self::new(
            home,
            config,
            Arc::new(DirectorySource::new()),
            Arc::new(cluster),
        )
    }

    /// Controller over explicit adapters, resuming from the records already
    /// in the status store.
    pub fn new(
        home: &Path,
        config: ControllerConfig,
        source: Arc<dyn StateSource>,
        live: Arc<dyn LiveState>,
    ) -> Result<Arc<Self>, DaemonError> {
        let records: BTreeMap<AppName, AppRecord> = store::list_records_at(home)?
            .into_iter()
            .map(|r| (r.app.name.clone(), r))
            .collect();
        tracing::info!(apps = records.len(), "resumed from status store");

        let health = HealthEvaluator::new(config.progress_deadline);
        let reconciler = Reconciler::new(live, health, config.max_operation_duration);
        Ok(Arc::new(Self {
            home: home.to_path_buf(),
            workers: Arc::new(Semaphore::new(config.workers.max(1))),
            config,
            source,
            reconciler,
            locks: StdMutex::new(HashMap::new()),
            running: StdMutex::new(HashMap::new()),
            records: RwLock::new(records),
        }))
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub async fn list(&self) -> Vec<AppRecord> {
        self.records.read().await.values().cloned().collect()
    }

    pub async fn get(&self, name: &AppName) -> Option<AppRecord> {
        self.records.read().await.get(name).cloned()
    }

    /// Applications with a pass in flight or queued for a worker.
    pub fn running(&self) -> Vec<AppName> {
        let mut names: Vec<AppName> = guard(&self.running).keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_running(&self, name: &AppName) -> bool {
        guard(&self.running).contains_key(name)
    }

    /// Rendered live-vs-desired diff of `name` against its current desired
    /// state. Read-only.
    pub async fn diff(&self, name: &AppName) -> Result<Vec<ResourceTextDiff>, DaemonError> {
        let record = match self.get(name).await {
            Some(record) => record,
            None => {
                let app = self
                    .scan_roots()
                    .await?
                    .find(name)
                    .map(|d| d.app.clone())
                    .ok_or_else(|| DaemonError::UnknownApp {
                        name: name.to_string(),
                    })?;
                AppRecord::new(app, None)
            }
        };
        let desired = expand(self.source.as_ref(), &record.app).await?;
        let claims = self.claims_for(&record).await;
        let diffs = self
            .reconciler
            .diff(&record.app, &desired.resources, &claims)
            .await?;
        Ok(render(&diffs, self.reconciler.live().server_managed_fields()))
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    /// One scheduled pass: every root tree, then retirement of roots whose
    /// definition is gone. Roots whose file failed to load are neither
    /// reconciled nor retired.
    pub async fn reconcile_all(self: &Arc<Self>) -> Result<(), DaemonError> {
        let scan = self.scan_roots().await?;
        let mut defined = scan.unreadable.clone();
        defined.extend(scan.definitions.iter().map(|d| d.app.name.clone()));
        let trees = scan
            .apps()
            .into_iter()
            .map(|root| self.reconcile_tree(root, None, false, None));
        futures::future::join_all(trees).await;
        self.retire_removed_roots(&defined).await
    }

    /// Pass over the tree of root `name`, re-reading its definition. Falls
    /// back to a full pass when the definition no longer exists.
    pub async fn reconcile_root(self: &Arc<Self>, name: &AppName) -> Result<(), DaemonError> {
        let scan = self.scan_roots().await?;
        match scan.find(name) {
            Some(root) => {
                self.reconcile_tree(root.app.clone(), None, false, None).await;
                Ok(())
            }
            None => self.reconcile_all().await,
        }
    }

    /// Pass for whichever root `path` now defines. A removed, renamed or
    /// invalid file triggers a full pass so retirement sees the change.
    pub async fn reconcile_definition_file(self: &Arc<Self>, path: &Path) -> Result<(), DaemonError> {
        let scan = self.scan_roots().await?;
        match scan.by_path(path) {
            Some(root) => {
                self.reconcile_tree(root.app.clone(), None, false, None).await;
                Ok(())
            }
            None => self.reconcile_all().await,
        }
    }

    /// Manual sync of `name`. The Application's whole tree is re-resolved
    /// so the sync sees its current definition; only `name` receives the
    /// manual request.
    pub async fn sync(
        self: &Arc<Self>,
        name: &AppName,
        request: SyncRequest,
    ) -> Result<PassOutcome, DaemonError> {
        self.pass_for(name, Some(request)).await
    }

    /// Immediate pass for `name` without a manual sync request.
    pub async fn refresh(self: &Arc<Self>, name: &AppName) -> Result<PassOutcome, DaemonError> {
        self.pass_for(name, None).await
    }

    /// Cancel the in-flight operation of `name`. `false` if nothing is
    /// running for it.
    pub async fn terminate(&self, name: &AppName) -> Result<bool, DaemonError> {
        let token = guard(&self.running).get(name).cloned();
        match token {
            Some(token) => {
                token.cancel();
                tracing::info!(app = %name, "termination requested");
                Ok(true)
            }
            None => self.require(name).await.map(|_| false),
        }
    }

    /// Delete `name`. With `cascade`, its descendants go too (deepest
    /// first) and managed resources are removed from the environment:
    /// `name`'s unconditionally, each descendant's when it carries the
    /// cascade finalizer. Without `cascade`, only the record is removed and
    /// direct children are marked orphaned.
    ///
    /// Returns the deleted Applications.
    pub async fn delete(
        self: &Arc<Self>,
        name: &AppName,
        cascade: bool,
    ) -> Result<Vec<AppName>, DaemonError> {
        self.require(name).await?;
        if cascade {
            return self.remove_subtree(name, true).await;
        }
        for child in self.children_of(name).await {
            self.mark_orphaned(&child).await?;
        }
        self.remove_one(name, false).await?;
        Ok(vec![name.clone()])
    }

    // -----------------------------------------------------------------------
    // Passes
    // -----------------------------------------------------------------------

    async fn pass_for(
        self: &Arc<Self>,
        name: &AppName,
        request: Option<SyncRequest>,
    ) -> Result<PassOutcome, DaemonError> {
        let (top, parent, detached) = self.tree_top(name).await?;
        let manual = request.map(|r| (name.clone(), r));
        let mut outcomes = self.reconcile_tree(top, parent, detached, manual).await;
        outcomes.remove(name).unwrap_or_else(|| {
            Err(DaemonError::UnknownApp {
                name: name.0.clone(),
            })
        })
    }

    /// The Application at the top of `name`'s tree: its root, or the highest
    /// ancestor still attached. `detached` is set when that top is no longer
    /// declared anywhere, so passes keep its orphaned flag.
    async fn tree_top(
        &self,
        name: &AppName,
    ) -> Result<(Application, Option<AppName>, bool), DaemonError> {
        let scan = self.scan_roots().await?;
        if let Some(root) = scan.find(name) {
            return Ok((root.app.clone(), None, false));
        }

        let records = self.records.read().await;
        let mut current = records.get(name).ok_or_else(|| DaemonError::UnknownApp {
            name: name.0.clone(),
        })?;
        let mut seen = BTreeSet::new();
        while let Some(parent) = &current.parent {
            if current.status.orphaned || !seen.insert(current.app.name.clone()) {
                break;
            }
            match records.get(parent) {
                Some(next) => current = next,
                None => break,
            }
        }

        if current.parent.is_none() {
            if let Some(root) = scan.apps().into_iter().find(|r| r.name == current.app.name) {
                return Ok((root, None, false));
            }
            return Ok((current.app.clone(), None, true));
        }
        Ok((current.app.clone(), current.parent.clone(), true))
    }

    /// Resolve the tree under `app` and run one pass per node.
    async fn reconcile_tree(
        self: &Arc<Self>,
        app: Application,
        parent: Option<AppName>,
        detached: bool,
        manual: Option<(AppName, SyncRequest)>,
    ) -> BTreeMap<AppName, Result<PassOutcome, DaemonError>> {
        let top = app.name.clone();
        let nodes = resolve_from(
            self.source.as_ref(),
            app,
            parent,
            self.config.max_tree_depth,
        )
        .await;
        let tree: BTreeSet<AppName> = nodes.iter().map(|n| n.app.name.clone()).collect();

        let mut resolved = Vec::new();
        let mut handles = Vec::with_capacity(nodes.len());
        for node in nodes {
            let name = node.app.name.clone();
            if node.outcome.is_ok() {
                resolved.push(name.clone());
            }
            let request = manual
                .as_ref()
                .filter(|(target, _)| *target == name)
                .map(|(_, r)| *r);
            let keep_orphaned = detached && name == top;
            let this = Arc::clone(self);
            let handle =
                tokio::spawn(async move { this.run_pass(node, request, keep_orphaned).await });
            handles.push((name, handle));
        }

        let mut outcomes = BTreeMap::new();
        for (name, handle) in handles {
            let outcome = handle.await.unwrap_or_else(|err| {
                Err(DaemonError::Protocol(format!(
                    "pass for '{name}' did not complete: {err}"
                )))
            });
            if let Err(err) = &outcome {
                tracing::error!(app = %name, error = %err, "reconciliation pass failed");
            }
            outcomes.insert(name, outcome);
        }

        for parent in resolved {
            if let Err(err) = self.retire_removed_children(&parent, &tree).await {
                tracing::error!(app = %parent, error = %err, "child application cleanup failed");
            }
        }
        outcomes
    }

    async fn run_pass(
        self: Arc<Self>,
        node: TreeNode,
        manual: Option<SyncRequest>,
        keep_orphaned: bool,
    ) -> Result<PassOutcome, DaemonError> {
        let name = node.app.name.clone();
        let lock = self.lock_for(&name);
        let Ok(_held) = lock.try_lock_owned() else {
            tracing::debug!(app = %name, "pass already in flight; trigger coalesced");
            return Ok(PassOutcome::Coalesced);
        };

        let cancel = CancelToken::new();
        guard(&self.running).insert(name.clone(), cancel.clone());
        let result = self.pass(node, manual, &cancel, keep_orphaned).await;
        guard(&self.running).remove(&name);
        result.map(PassOutcome::Reconciled)
    }

    async fn pass(
        &self,
        node: TreeNode,
        manual: Option<SyncRequest>,
        cancel: &CancelToken,
        keep_orphaned: bool,
    ) -> Result<AppStatus, DaemonError> {
        let _permit = Arc::clone(&self.workers)
            .acquire_owned()
            .await
            .map_err(|_| DaemonError::ChannelClosed("worker pool"))?;

        let TreeNode {
            app,
            parent,
            outcome,
            ..
        } = node;
        let mut record = {
            let mut records = self.records.write().await;
            let record = records
                .entry(app.name.clone())
                .or_insert_with(|| AppRecord::new(app.clone(), parent.clone()));
            record.app = app;
            record.parent = parent;
            if !keep_orphaned {
                record.status.orphaned = false;
            }
            record.clone()
        };

        record.status = match outcome {
            Ok(desired) => {
                let claims = self.claims_for(&record).await;
                self.reconciler
                    .reconcile(&record, &desired, manual, &claims, cancel)
                    .await
            }
            Err(err) => {
                tracing::warn!(app = %record.app.name, error = %err, "application could not be resolved");
                failed_status(&record.status, None, &err)
            }
        };
        Ok(self.persist(record).await?.status)
    }

    /// Keys declared by Applications on the same server that were created
    /// before `record`. The earlier claimant owns a contested key.
    async fn claims_for(&self, record: &AppRecord) -> Claims {
        let records = self.records.read().await;
        let mut claims = Claims::new();
        let mine = (record.created_at, &record.app.name);
        for other in records.values() {
            if other.app.name == record.app.name
                || other.app.destination.server != record.app.destination.server
                || (other.created_at, &other.app.name) > mine
            {
                continue;
            }
            for row in other
                .status
                .resources
                .iter()
                .filter(|r| r.class != DiffClass::Extra)
            {
                claims.insert(row.key.clone(), other.app.name.clone());
            }
        }
        claims
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Children recorded under `parent` that its latest desired state no
    /// longer declares: deleted when the parent prunes, orphaned otherwise.
    async fn retire_removed_children(
        self: &Arc<Self>,
        parent: &AppName,
        tree: &BTreeSet<AppName>,
    ) -> Result<(), DaemonError> {
        let (prune, stale) = {
            let records = self.records.read().await;
            let Some(record) = records.get(parent) else {
                return Ok(());
            };
            let stale: Vec<(AppName, bool, bool)> = records
                .values()
                .filter(|r| r.parent.as_ref() == Some(parent) && !tree.contains(&r.app.name))
                .map(|r| (r.app.name.clone(), r.app.cascade, r.status.orphaned))
                .collect();
            (record.app.sync_policy.prune, stale)
        };

        for (child, cascade, orphaned) in stale {
            if prune {
                tracing::info!(app = %child, parent = %parent, cascade, "pruning removed child application");
                self.remove_subtree(&child, cascade).await?;
            } else if !orphaned {
                tracing::info!(app = %child, parent = %parent, "child application no longer declared; orphaned");
                self.mark_orphaned(&child).await?;
            }
        }
        Ok(())
    }

    /// Roots with a record but no definition file: deleted with their
    /// subtree when they carry the cascade finalizer, orphaned otherwise.
    async fn retire_removed_roots(
        self: &Arc<Self>,
        defined: &BTreeSet<AppName>,
    ) -> Result<(), DaemonError> {
        let removed: Vec<(AppName, bool)> = self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.parent.is_none() && !r.status.orphaned && !defined.contains(&r.app.name))
            .map(|r| (r.app.name.clone(), r.app.cascade))
            .collect();

        for (name, cascade) in removed {
            if cascade {
                tracing::info!(app = %name, "root definition removed; deleting application");
                self.remove_subtree(&name, true).await?;
            } else {
                tracing::info!(app = %name, "root definition removed; orphaned");
                self.mark_orphaned(&name).await?;
            }
        }
        Ok(())
    }

    async fn mark_orphaned(&self, name: &AppName) -> Result<(), DaemonError> {
        let lock = self.lock_for(name);
        let _held = lock.lock_owned().await;
        let Some(mut record) = self.get(name).await else {
            return Ok(());
        };
        record.status.orphaned = true;
        self.persist(record).await?;
        Ok(())
    }

    /// `name` and every recorded descendant, parents before children.
    async fn subtree(&self, name: &AppName) -> Vec<AppName> {
        let records = self.records.read().await;
        let mut order = vec![name.clone()];
        let mut cursor = 0;
        while cursor < order.len() {
            let current = order[cursor].clone();
            cursor += 1;
            for record in records.values() {
                if record.parent.as_ref() == Some(&current) && !order.contains(&record.app.name) {
                    order.push(record.app.name.clone());
                }
            }
        }
        order
    }

    async fn children_of(&self, name: &AppName) -> Vec<AppName> {
        self.records
            .read()
            .await
            .values()
            .filter(|r| r.parent.as_ref() == Some(name))
            .map(|r| r.app.name.clone())
            .collect()
    }

    /// Delete `name`'s subtree deepest first. `name`'s resources are deleted
    /// when `cascade` is set; each descendant follows its own finalizer.
    async fn remove_subtree(
        &self,
        name: &AppName,
        cascade: bool,
    ) -> Result<Vec<AppName>, DaemonError> {
        let order = self.subtree(name).await;
        let mut removed = Vec::with_capacity(order.len());
        for app in order.iter().rev() {
            let cascade_this = if app == name {
                cascade
            } else {
                self.get(app).await.map(|r| r.app.cascade).unwrap_or(false)
            };
            if self.remove_one(app, cascade_this).await? {
                removed.push(app.clone());
            }
        }
        removed.reverse();
        Ok(removed)
    }

    /// Cancel any in-flight pass, wait for the lock, then drop the record
    /// (and root definition). `false` if `name` had no record.
    async fn remove_one(&self, name: &AppName, delete_resources: bool) -> Result<bool, DaemonError> {
        let token = guard(&self.running).get(name).cloned();
        if let Some(token) = token {
            token.cancel();
        }
        let lock = self.lock_for(name);
        let _held = lock.lock_owned().await;
        let Some(record) = self.get(name).await else {
            return Ok(false);
        };

        if delete_resources {
            self.delete_resources(&record.app).await?;
        }

        let home = self.home.clone();
        let target = name.clone();
        let is_root = record.parent.is_none();
        blocking(move || {
            store::delete_record_at(&home, &target)?;
            if is_root {
                store::remove_root_app_at(&home, &target)?;
            }
            Ok(())
        })
        .await?;
        self.records.write().await.remove(name);
        guard(&self.locks).remove(name);
        tracing::info!(app = %name, cascade = delete_resources, "application deleted");
        Ok(true)
    }

    /// Delete every live resource `app` owns, in reverse apply order.
    /// Resources carrying the keep marker stay.
    async fn delete_resources(&self, app: &Application) -> Result<(), DaemonError> {
        let live = self.reconciler.live();
        let listed = live
            .list(&app.destination)
            .await
            .map_err(|source| SyncError::LiveState {
                app: app.name.clone(),
                source,
            })?;
        let mut owned: Vec<Resource> = listed
            .into_iter()
            .filter(|r| r.owner().as_ref() == Some(&app.name) && !r.is_prune_protected())
            .collect();
        owned.sort_by(|a, b| apply_order(b).cmp(&apply_order(a)));

        for resource in owned {
            live.delete(&app.destination, &resource.key)
                .await
                .map_err(|source| SyncError::LiveState {
                    app: app.name.clone(),
                    source,
                })?;
            tracing::info!(app = %app.name, resource = %resource.key, "deleted managed resource");
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Plumbing
    // -----------------------------------------------------------------------

    async fn require(&self, name: &AppName) -> Result<AppRecord, DaemonError> {
        self.get(name).await.ok_or_else(|| DaemonError::UnknownApp {
            name: name.0.clone(),
        })
    }

    async fn scan_roots(&self) -> Result<RootScan, DaemonError> {
        let home = self.home.clone();
        let scan = blocking(move || store::scan_root_apps_at(&home)).await?;
        for err in &scan.errors {
            tracing::warn!(error = %err, "skipping root application definition");
        }
        Ok(scan)
    }

    async fn persist(&self, mut record: AppRecord) -> Result<AppRecord, DaemonError> {
        let home = self.home.clone();
        let record = blocking(move || {
            store::save_record_at(&home, &mut record)?;
            Ok(record)
        })
        .await?;
        self.records
            .write()
            .await
            .insert(record.app.name.clone(), record.clone());
        Ok(record)
    }

    fn lock_for(&self, name: &AppName) -> Arc<Mutex<()>> {
        Arc::clone(guard(&self.locks).entry(name.clone()).or_default())
    }
}

fn apply_order(resource: &Resource) -> (u8, i32, String, String) {
    (
        kind_tier(&resource.key.kind),
        resource.wave().unwrap_or(0),
        resource.key.kind.clone(),
        resource.key.name.clone(),
    )
}

fn guard<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn blocking<T: Send + 'static>(
    f: impl FnOnce() -> Result<T, StoreError> + Send + 'static,
) -> Result<T, DaemonError> {
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|err| DaemonError::Protocol(format!("store task join error: {err}")))?
        .map_err(DaemonError::from)
}
