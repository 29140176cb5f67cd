//! Domain types for the rudder controller.
//!
//! Everything here is plain data: serializable with serde so that status
//! records survive controller restarts and travel over the daemon socket.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ManifestError;

// ---------------------------------------------------------------------------
// Well-known metadata keys
// ---------------------------------------------------------------------------

/// Label stamped on every applied resource; names the owning Application.
pub const INSTANCE_LABEL: &str = "app.rudder.dev/instance";

/// Annotation holding an integer apply wave (default `0`).
pub const SYNC_WAVE_ANNOTATION: &str = "rudder.dev/sync-wave";

/// Annotation holding per-resource sync options, e.g. `Prune=false`.
pub const SYNC_OPTIONS_ANNOTATION: &str = "rudder.dev/sync-options";

/// Finalizer that makes deleting an Application cascade to its resources.
pub const CASCADE_FINALIZER: &str = "resources-finalizer.rudder.dev";

/// Kind used for embedded Application definitions.
pub const APPLICATION_KIND: &str = "Application";

/// Kinds that live outside any namespace.
pub const CLUSTER_SCOPED_KINDS: &[&str] = &[
    "Namespace",
    "CustomResourceDefinition",
    "ClusterRole",
    "ClusterRoleBinding",
    "PersistentVolume",
    "StorageClass",
];

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// A strongly-typed Application name, unique within the controller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AppName(pub String);

impl fmt::Display for AppName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for AppName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for AppName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// Identity of a resource within a destination: `(kind, namespace, name)`.
///
/// Cluster-scoped resources carry an empty namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn namespace(name: impl Into<String>) -> Self {
        Self::new("Namespace", "", name)
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}/{}", self.kind, self.name)
        } else {
            write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
        }
    }
}

// ---------------------------------------------------------------------------
// Resource
// ---------------------------------------------------------------------------

/// A single manifest addressed by its [`ResourceKey`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub key: ResourceKey,
    pub manifest: Value,
}

impl Resource {
    /// Build a resource from a raw document.
    ///
    /// Namespaced kinds without `metadata.namespace` are placed in
    /// `default_namespace`, and the namespace is written back into the
    /// manifest so desired and live documents compare field-for-field.
    pub fn from_manifest(mut manifest: Value, default_namespace: &str) -> Result<Self, ManifestError> {
        let obj = manifest.as_object().ok_or(ManifestError::NotAMapping)?;
        let kind = obj
            .get("kind")
            .and_then(Value::as_str)
            .ok_or(ManifestError::MissingField { field: "kind" })?
            .to_string();
        let metadata = obj
            .get("metadata")
            .and_then(Value::as_object)
            .ok_or(ManifestError::MissingField { field: "metadata" })?;
        let name = metadata
            .get("name")
            .and_then(Value::as_str)
            .filter(|n| !n.is_empty())
            .ok_or(ManifestError::MissingField {
                field: "metadata.name",
            })?
            .to_string();

        let namespace = if CLUSTER_SCOPED_KINDS.contains(&kind.as_str()) {
            String::new()
        } else {
            metadata
                .get("namespace")
                .and_then(Value::as_str)
                .filter(|ns| !ns.is_empty())
                .unwrap_or(default_namespace)
                .to_string()
        };

        if !namespace.is_empty() {
            if let Some(meta) = manifest
                .get_mut("metadata")
                .and_then(Value::as_object_mut)
            {
                meta.insert("namespace".to_string(), Value::String(namespace.clone()));
            }
        }

        let resource = Self {
            key: ResourceKey::new(kind, namespace, name),
            manifest,
        };
        resource.wave()?;
        Ok(resource)
    }

    /// Minimal `Namespace` manifest, used by the `CreateNamespace` option.
    pub fn namespace(name: &str) -> Self {
        let manifest = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": { "name": name },
        });
        Self {
            key: ResourceKey::namespace(name),
            manifest,
        }
    }

    pub fn annotation(&self, name: &str) -> Option<&str> {
        self.manifest
            .pointer("/metadata/annotations")
            .and_then(|a| a.get(name))
            .and_then(Value::as_str)
    }

    pub fn label(&self, name: &str) -> Option<&str> {
        self.manifest
            .pointer("/metadata/labels")
            .and_then(|l| l.get(name))
            .and_then(Value::as_str)
    }

    /// Apply wave from [`SYNC_WAVE_ANNOTATION`]; `0` when absent.
    pub fn wave(&self) -> Result<i32, ManifestError> {
        match self.annotation(SYNC_WAVE_ANNOTATION) {
            None => Ok(0),
            Some(raw) => raw.trim().parse().map_err(|_| ManifestError::InvalidWave {
                resource: self.key.to_string(),
                value: raw.to_string(),
            }),
        }
    }

    /// The Application recorded in [`INSTANCE_LABEL`], if any.
    pub fn owner(&self) -> Option<AppName> {
        self.label(INSTANCE_LABEL).map(AppName::from)
    }

    /// `true` when the resource opts out of pruning (`Prune=false`).
    pub fn is_prune_protected(&self) -> bool {
        self.annotation(SYNC_OPTIONS_ANNOTATION)
            .map(|opts| {
                opts.split(',')
                    .any(|opt| opt.trim().eq_ignore_ascii_case("prune=false"))
            })
            .unwrap_or(false)
    }

    /// Stamp `key=value` into `metadata.labels`, creating maps as needed.
    pub fn set_label(&mut self, key: &str, value: &str) {
        let Some(obj) = self.manifest.as_object_mut() else {
            return;
        };
        let metadata = obj
            .entry("metadata")
            .or_insert_with(|| Value::Object(Default::default()));
        let Some(metadata) = metadata.as_object_mut() else {
            return;
        };
        let labels = metadata
            .entry("labels")
            .or_insert_with(|| Value::Object(Default::default()));
        if let Some(labels) = labels.as_object_mut() {
            labels.insert(key.to_string(), Value::String(value.to_string()));
        }
    }
}

// ---------------------------------------------------------------------------
// Application
// ---------------------------------------------------------------------------

/// Where desired state comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub repo_url: String,
    pub target_revision: String,
    pub path: String,
}

/// Where desired state is converged to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Destination {
    pub server: String,
    pub namespace: String,
}

/// Options that alter how a sync is carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SyncOption {
    CreateNamespace,
    PruneLast,
    ApplyOutOfSyncOnly,
}

impl FromStr for SyncOption {
    type Err = ManifestError;

    /// Accepts `Name=true`; a bare `Name` is treated as `Name=true`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ManifestError::InvalidSyncOption {
            value: s.to_string(),
        };
        let (name, value) = match s.split_once('=') {
            Some((name, value)) => (name.trim(), value.trim()),
            None => (s.trim(), "true"),
        };
        if !value.eq_ignore_ascii_case("true") {
            return Err(invalid());
        }
        match name {
            "CreateNamespace" => Ok(Self::CreateNamespace),
            "PruneLast" => Ok(Self::PruneLast),
            "ApplyOutOfSyncOnly" => Ok(Self::ApplyOutOfSyncOnly),
            _ => Err(invalid()),
        }
    }
}

/// Backoff schedule shared by per-resource apply retries and by
/// operation-level retries between passes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries allowed after the initial attempt.
    pub limit: u32,
    #[serde(with = "crate::duration::serde_str")]
    pub initial_delay: Duration,
    pub factor: u32,
    #[serde(with = "crate::duration::serde_str")]
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            limit: 5,
            initial_delay: Duration::from_secs(5),
            factor: 2,
            max_delay: Duration::from_secs(180),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based), capped at `max_delay`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1);
        let multiplier = self.factor.max(1).saturating_pow(exponent);
        self.initial_delay
            .saturating_mul(multiplier)
            .min(self.max_delay)
    }

    /// The full schedule of delays, one per allowed retry.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (1..=self.limit).map(|retry| self.delay_for(retry))
    }
}

/// Convergence policy for an Application.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncPolicy {
    pub automated: bool,
    pub prune: bool,
    pub self_heal: bool,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub sync_options: BTreeSet<SyncOption>,
}

impl SyncPolicy {
    pub fn has_option(&self, option: SyncOption) -> bool {
        self.sync_options.contains(&option)
    }
}

/// The central entity: desired-state source, destination and policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Application {
    pub name: AppName,
    pub source: Source,
    pub destination: Destination,
    #[serde(default)]
    pub sync_policy: SyncPolicy,
    /// Deleting this Application also deletes its managed resources.
    #[serde(default)]
    pub cascade: bool,
}

// ---------------------------------------------------------------------------
// Classification enums
// ---------------------------------------------------------------------------

/// Aggregate sync state of an Application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SyncStatusCode {
    Synced,
    OutOfSync,
    #[default]
    Unknown,
}

impl fmt::Display for SyncStatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncStatusCode::Synced => write!(f, "Synced"),
            SyncStatusCode::OutOfSync => write!(f, "OutOfSync"),
            SyncStatusCode::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Health of one resource or of a whole Application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum HealthStatus {
    Healthy,
    Progressing,
    Degraded,
    Missing,
    #[default]
    Unknown,
}

impl HealthStatus {
    /// Precedence used for aggregation: higher is worse.
    ///
    /// Degraded > Progressing > Missing > Unknown > Healthy.
    pub fn severity(self) -> u8 {
        match self {
            HealthStatus::Healthy => 0,
            HealthStatus::Unknown => 1,
            HealthStatus::Missing => 2,
            HealthStatus::Progressing => 3,
            HealthStatus::Degraded => 4,
        }
    }

    /// Worst status among `statuses`; `Healthy` when empty.
    pub fn worst(statuses: impl IntoIterator<Item = HealthStatus>) -> HealthStatus {
        statuses
            .into_iter()
            .max_by_key(|s| s.severity())
            .unwrap_or(HealthStatus::Healthy)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "Healthy"),
            HealthStatus::Progressing => write!(f, "Progressing"),
            HealthStatus::Degraded => write!(f, "Degraded"),
            HealthStatus::Missing => write!(f, "Missing"),
            HealthStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Kind of structural change needed to converge a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Change {
    Create,
    Update,
}

/// Diff classification of a single resource key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiffClass {
    Unchanged,
    OutOfSync(Change),
    /// Present live, absent from desired state.
    Extra,
}

impl fmt::Display for DiffClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiffClass::Unchanged => write!(f, "Synced"),
            DiffClass::OutOfSync(Change::Create) => write!(f, "OutOfSync(create)"),
            DiffClass::OutOfSync(Change::Update) => write!(f, "OutOfSync(update)"),
            DiffClass::Extra => write!(f, "Extra"),
        }
    }
}

// ---------------------------------------------------------------------------
// Sync operation
// ---------------------------------------------------------------------------

/// Phase of a [`SyncOperation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Error,
    /// Cancelled by an explicit terminate request.
    Terminated,
}

impl OperationPhase {
    pub fn is_terminal(self) -> bool {
        !matches!(self, OperationPhase::Pending | OperationPhase::Running)
    }

    /// Phases that consume the operation-level retry budget.
    pub fn is_failure(self) -> bool {
        matches!(self, OperationPhase::Failed | OperationPhase::Error)
    }
}

impl fmt::Display for OperationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationPhase::Pending => "Pending",
            OperationPhase::Running => "Running",
            OperationPhase::Succeeded => "Succeeded",
            OperationPhase::Failed => "Failed",
            OperationPhase::Error => "Error",
            OperationPhase::Terminated => "Terminated",
        };
        f.write_str(s)
    }
}

/// What started a sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Trigger {
    /// Automated policy reacting to a new desired revision.
    Automated,
    /// Self-heal reacting to live drift at an already-synced revision.
    SelfHeal,
    /// Operator request.
    Manual,
}

/// Mutation planned (or performed) for one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceAction {
    Create,
    Update,
    /// Delete then create (`force`).
    Recreate,
    Prune,
}

/// Result of the planned action for one resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceOutcome {
    Synced,
    Pruned,
    /// Dry run: the action would have been taken.
    WouldApply,
    WouldPrune,
    /// Extra resource left in place (prune disabled or keep marker).
    PruneSkipped { reason: String },
    /// Not attempted: the operation stopped before reaching it.
    Skipped { reason: String },
    Failed { reason: String, retryable: bool },
}

impl ResourceOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, ResourceOutcome::Failed { .. })
    }
}

/// Per-resource entry of a [`SyncOperation`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceResult {
    pub key: ResourceKey,
    pub action: ResourceAction,
    pub outcome: ResourceOutcome,
    /// Adapter calls made for this resource, retries included.
    pub attempts: u32,
}

/// A convergence attempt. Immutable once its phase is terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOperation {
    pub app: AppName,
    pub trigger: Trigger,
    pub revision: String,
    pub phase: OperationPhase,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Operation-level attempt number for this revision (1-based).
    pub attempt: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub dry_run: bool,
    pub message: String,
    pub resources: Vec<ResourceResult>,
}

impl SyncOperation {
    pub fn new(app: AppName, trigger: Trigger, revision: impl Into<String>, dry_run: bool) -> Self {
        Self {
            app,
            trigger,
            revision: revision.into(),
            phase: OperationPhase::Pending,
            started_at: Utc::now(),
            finished_at: None,
            attempt: 1,
            next_retry_at: None,
            dry_run,
            message: String::new(),
            resources: Vec::new(),
        }
    }

    /// Move to a terminal phase and stamp `finished_at`.
    pub fn finish(&mut self, phase: OperationPhase, message: impl Into<String>) {
        debug_assert!(phase.is_terminal());
        self.phase = phase;
        self.message = message.into();
        self.finished_at = Some(Utc::now());
    }

    pub fn failed_resources(&self) -> Vec<ResourceKey> {
        self.resources
            .iter()
            .filter(|r| r.outcome.is_failed())
            .map(|r| r.key.clone())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Category of a status-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    Fetch,
    LiveState,
    Manifest,
    Conflict,
    Cycle,
    Timeout,
    Apply,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Fetch => "FetchError",
            FailureKind::LiveState => "LiveStateError",
            FailureKind::Manifest => "ManifestError",
            FailureKind::Conflict => "ConflictError",
            FailureKind::Cycle => "CycleError",
            FailureKind::Timeout => "TimeoutError",
            FailureKind::Apply => "ApplyError",
        };
        f.write_str(s)
    }
}

/// Most specific failure of the last reconciliation, with implicated resources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusFailure {
    pub kind: FailureKind,
    pub message: String,
    #[serde(default)]
    pub resources: Vec<ResourceKey>,
}

/// Per-resource row of an Application's status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceStatus {
    pub key: ResourceKey,
    pub class: DiffClass,
    pub wave: i32,
    pub desired_hash: Option<String>,
    pub live_hash: Option<String>,
    pub health: HealthStatus,
    #[serde(default)]
    pub health_message: Option<String>,
    #[serde(default)]
    pub progressing_since: Option<DateTime<Utc>>,
    #[serde(default)]
    pub prune_protected: bool,
    /// Resource-level error from the last operation, if any.
    #[serde(default)]
    pub error: Option<String>,
}

/// Controller-owned status of an Application.
///
/// Only ever replaced wholesale at the end of a reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AppStatus {
    /// Last observed desired-state revision.
    pub revision: Option<String>,
    /// Revision of the last successful sync.
    pub synced_revision: Option<String>,
    pub sync: SyncStatusCode,
    pub health: HealthStatus,
    #[serde(default)]
    pub resources: Vec<ResourceStatus>,
    #[serde(default)]
    pub children: Vec<AppName>,
    /// Last terminal operation.
    #[serde(default)]
    pub operation: Option<SyncOperation>,
    #[serde(default)]
    pub failure: Option<StatusFailure>,
    #[serde(default)]
    pub orphaned: bool,
    pub reconciled_at: Option<DateTime<Utc>>,
}

impl AppStatus {
    pub fn resource(&self, key: &ResourceKey) -> Option<&ResourceStatus> {
        self.resources.iter().find(|r| &r.key == key)
    }
}

/// Persisted unit of the status store: one per Application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppRecord {
    pub app: Application,
    /// Parent in the app-of-apps tree; `None` for roots.
    #[serde(default)]
    pub parent: Option<AppName>,
    #[serde(default)]
    pub status: AppStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AppRecord {
    pub fn new(app: Application, parent: Option<AppName>) -> Self {
        let now = Utc::now();
        Self {
            app,
            parent,
            status: AppStatus::default(),
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
