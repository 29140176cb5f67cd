//! Sync orchestrator: turns a diff into an executed [`SyncOperation`].
//!
//! ## Execution protocol
//!
//! 1. `Pending → Running`.
//! 2. Plan: OutOfSync resources become create/update/recreate actions,
//!    grouped into steps ordered by (kind tier, wave); prunable Extras are
//!    queued for after the last step.
//! 3. Before every step and every retry sleep, check the cancel flag
//!    (→ `Terminated`) and the operation deadline (→ `Error`).
//! 4. Run each step's actions concurrently; each action retries transient
//!    failures with the Application's backoff. A failed step stops later
//!    steps.
//! 5. If every apply succeeded, prune in reverse order.
//! 6. Aggregate: any resource with exhausted transient retries → `Error`;
//!    any rejected resource → `Failed`; otherwise `Succeeded`.
//!
//! Dry runs walk the same plan and record would-be outcomes without
//! calling the adapter.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::time::Instant;

use rudder_core::types::{
    Change, DiffClass, FailureKind, OperationPhase, ResourceAction, ResourceOutcome,
    ResourceResult, StatusFailure, SyncOption, SyncOperation,
};
use rudder_core::{Application, LiveState, Resource, ResourceKey, Trigger};

use crate::diff::ResourceDiff;
use crate::error::SyncError;

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Shared terminate flag for one Application's in-flight operation.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Request and plan
// ---------------------------------------------------------------------------

/// How a sync was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncRequest {
    pub trigger: Trigger,
    pub dry_run: bool,
    /// Delete and recreate resources that need an update.
    pub force: bool,
    /// Prune Extras even if the Application's policy does not.
    pub prune: bool,
}

impl SyncRequest {
    pub fn automatic(trigger: Trigger) -> Self {
        Self {
            trigger,
            dry_run: false,
            force: false,
            prune: false,
        }
    }

    pub fn manual() -> Self {
        Self::automatic(Trigger::Manual)
    }
}

/// Dependency tier of a kind: prerequisites first.
pub fn kind_tier(kind: &str) -> u8 {
    match kind {
        "Namespace" | "CustomResourceDefinition" => 0,
        "ServiceAccount" | "Secret" | "ConfigMap" | "PersistentVolumeClaim" | "PersistentVolume"
        | "StorageClass" | "Role" | "RoleBinding" | "ClusterRole" | "ClusterRoleBinding" => 1,
        _ => 2,
    }
}

#[derive(Debug, Clone)]
struct PlannedApply {
    resource: Resource,
    action: ResourceAction,
}

#[derive(Debug, Clone)]
struct Step {
    tier: u8,
    wave: i32,
    actions: Vec<PlannedApply>,
}

#[derive(Debug, Default)]
struct Plan {
    steps: Vec<Step>,
    prunes: Vec<ResourceKey>,
    skipped_prunes: Vec<(ResourceKey, String)>,
}

impl Plan {
    fn build(app: &Application, diffs: &[ResourceDiff], live_has: impl Fn(&ResourceKey) -> bool, request: &SyncRequest) -> Self {
        let policy = &app.sync_policy;
        let mut applies: Vec<(u8, i32, PlannedApply)> = Vec::new();

        let ns = &app.destination.namespace;
        if policy.has_option(SyncOption::CreateNamespace)
            && !ns.is_empty()
            && !live_has(&ResourceKey::namespace(ns.as_str()))
            && !diffs.iter().any(|d| d.key == ResourceKey::namespace(ns.as_str()))
        {
            applies.push((
                0,
                i32::MIN,
                PlannedApply {
                    resource: Resource::namespace(ns),
                    action: ResourceAction::Create,
                },
            ));
        }

        for d in diffs {
            let (DiffClass::OutOfSync(change), Some(resource)) = (d.class, &d.desired) else {
                continue;
            };
            let action = match change {
                Change::Create => ResourceAction::Create,
                Change::Update if request.force => ResourceAction::Recreate,
                Change::Update => ResourceAction::Update,
            };
            applies.push((
                kind_tier(&d.key.kind),
                d.wave,
                PlannedApply {
                    resource: resource.clone(),
                    action,
                },
            ));
        }
        applies.sort_by(|a, b| {
            (a.0, a.1, &a.2.resource.key.kind, &a.2.resource.key.name)
                .cmp(&(b.0, b.1, &b.2.resource.key.kind, &b.2.resource.key.name))
        });

        let mut steps: Vec<Step> = Vec::new();
        for (tier, wave, planned) in applies {
            match steps.last_mut() {
                Some(step) if step.tier == tier && step.wave == wave => step.actions.push(planned),
                _ => steps.push(Step {
                    tier,
                    wave,
                    actions: vec![planned],
                }),
            }
        }

        let prune_enabled = policy.prune || request.prune;
        let mut extras: Vec<&ResourceDiff> = diffs.iter().filter(|d| d.class == DiffClass::Extra).collect();
        extras.sort_by(|a, b| {
            (kind_tier(&a.key.kind), a.wave, &a.key.kind, &a.key.name)
                .cmp(&(kind_tier(&b.key.kind), b.wave, &b.key.kind, &b.key.name))
        });
        extras.reverse();

        let mut prunes = Vec::new();
        let mut skipped_prunes = Vec::new();
        for extra in extras {
            if extra.prune_protected {
                skipped_prunes.push((extra.key.clone(), "Prune=false annotation".to_string()));
            } else if !prune_enabled {
                skipped_prunes.push((extra.key.clone(), "pruning disabled".to_string()));
            } else {
                prunes.push(extra.key.clone());
            }
        }

        Self {
            steps,
            prunes,
            skipped_prunes,
        }
    }

    /// Every planned action, in execution order.
    fn planned_keys(&self) -> Vec<(ResourceKey, ResourceAction)> {
        self.steps
            .iter()
            .flat_map(|s| s.actions.iter())
            .map(|a| (a.resource.key.clone(), a.action))
            .chain(self.prunes.iter().map(|k| (k.clone(), ResourceAction::Prune)))
            .collect()
    }
}

/// `true` when a sync would change anything: an OutOfSync resource, or an
/// Extra that `prune` would delete.
pub fn has_actionable_work(diffs: &[ResourceDiff], prune: bool) -> bool {
    diffs.iter().any(|d| match d.class {
        DiffClass::OutOfSync(_) => true,
        DiffClass::Extra => prune && !d.prune_protected,
        DiffClass::Unchanged => false,
    })
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// A finished operation and its Status-facing failure, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationReport {
    pub operation: SyncOperation,
    pub failure: Option<StatusFailure>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    Cancelled,
    TimedOut,
}

/// Executes sync operations against one [`LiveState`].
pub struct Orchestrator<'a> {
    live: &'a dyn LiveState,
    max_duration: Duration,
}

impl<'a> Orchestrator<'a> {
    pub fn new(live: &'a dyn LiveState, max_duration: Duration) -> Self {
        Self { live, max_duration }
    }

    /// Run one operation for `app` from its current `diffs`.
    ///
    /// `live` is the snapshot the diffs were computed from; it is only used
    /// to decide whether the destination namespace already exists.
    pub async fn run(
        &self,
        app: &Application,
        revision: &str,
        diffs: &[ResourceDiff],
        live: &[Resource],
        request: SyncRequest,
        cancel: &CancelToken,
        attempt: u32,
    ) -> OperationReport {
        let mut op = SyncOperation::new(app.name.clone(), request.trigger, revision, request.dry_run);
        op.attempt = attempt;
        let plan = Plan::build(app, diffs, |k| live.iter().any(|r| &r.key == k), &request);

        if cancel.is_cancelled() {
            op.finish(OperationPhase::Terminated, "terminated before start");
            tracing::info!(app = %app.name, "operation terminated while pending");
            return OperationReport {
                operation: op,
                failure: None,
            };
        }

        op.phase = OperationPhase::Running;
        tracing::info!(
            app = %app.name,
            revision,
            trigger = ?request.trigger,
            dry_run = request.dry_run,
            steps = plan.steps.len(),
            prunes = plan.prunes.len(),
            "sync operation running"
        );

        for (key, reason) in &plan.skipped_prunes {
            op.resources.push(ResourceResult {
                key: key.clone(),
                action: ResourceAction::Prune,
                outcome: ResourceOutcome::PruneSkipped {
                    reason: reason.clone(),
                },
                attempts: 0,
            });
        }

        if request.dry_run {
            for (key, action) in plan.planned_keys() {
                let outcome = if action == ResourceAction::Prune {
                    ResourceOutcome::WouldPrune
                } else {
                    ResourceOutcome::WouldApply
                };
                op.resources.push(ResourceResult {
                    key,
                    action,
                    outcome,
                    attempts: 0,
                });
            }
            let message = format!(
                "dry run: {} to apply, {} to prune",
                plan.steps.iter().map(|s| s.actions.len()).sum::<usize>(),
                plan.prunes.len()
            );
            op.finish(OperationPhase::Succeeded, message);
            return OperationReport {
                operation: op,
                failure: None,
            };
        }

        let deadline = Instant::now() + self.max_duration;
        let mut interrupt = None;
        let mut applies_ok = true;

        for step in &plan.steps {
            if let Some(i) = self.interrupted(cancel, deadline) {
                interrupt = Some(i);
                applies_ok = false;
                break;
            }
            tracing::debug!(app = %app.name, tier = step.tier, wave = step.wave, count = step.actions.len(), "applying step");
            let results = join_all(
                step.actions
                    .iter()
                    .map(|a| self.apply_with_retry(app, a, cancel, deadline)),
            )
            .await;
            let mut step_failed = false;
            for (result, i) in results {
                step_failed |= result.outcome.is_failed();
                op.resources.push(result);
                interrupt = interrupt.or(i);
            }
            if interrupt.is_some() || step_failed {
                applies_ok = false;
                break;
            }
        }

        if applies_ok {
            for key in &plan.prunes {
                if let Some(i) = self.interrupted(cancel, deadline) {
                    interrupt = Some(i);
                    break;
                }
                let (result, i) = self.prune_with_retry(app, key, cancel, deadline).await;
                op.resources.push(result);
                if i.is_some() {
                    interrupt = i;
                    break;
                }
            }
        }

        // Everything planned but never attempted.
        let attempted: Vec<ResourceKey> = op.resources.iter().map(|r| r.key.clone()).collect();
        let skip_reason = match interrupt {
            Some(Interrupt::Cancelled) => "operation terminated",
            Some(Interrupt::TimedOut) => "operation timed out",
            None => "earlier step failed",
        };
        for (key, action) in plan.planned_keys() {
            if !attempted.contains(&key) {
                op.resources.push(ResourceResult {
                    key,
                    action,
                    outcome: ResourceOutcome::Skipped {
                        reason: skip_reason.to_string(),
                    },
                    attempts: 0,
                });
            }
        }

        self.conclude(app, op, interrupt)
    }

    fn conclude(&self, app: &Application, mut op: SyncOperation, interrupt: Option<Interrupt>) -> OperationReport {
        let failed = op.failed_resources();
        let exhausted = op.resources.iter().any(|r| {
            matches!(
                r.outcome,
                ResourceOutcome::Failed {
                    retryable: true,
                    ..
                }
            )
        });

        let failure = match interrupt {
            Some(Interrupt::Cancelled) => {
                op.finish(OperationPhase::Terminated, "operation terminated by request");
                None
            }
            Some(Interrupt::TimedOut) => {
                let err = SyncError::Timeout {
                    app: app.name.clone(),
                    limit: self.max_duration,
                };
                op.finish(OperationPhase::Error, err.to_string());
                let mut failure = err.to_failure();
                failure.resources = failed;
                Some(failure)
            }
            None if failed.is_empty() => {
                op.finish(OperationPhase::Succeeded, "successfully synced");
                None
            }
            None => {
                let (phase, message) = if exhausted {
                    (OperationPhase::Error, "retry budget exhausted")
                } else {
                    (OperationPhase::Failed, "one or more resources failed to sync")
                };
                let detail = op
                    .resources
                    .iter()
                    .filter_map(|r| match &r.outcome {
                        ResourceOutcome::Failed { reason, .. } => Some(format!("{}: {reason}", r.key)),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .join("; ");
                let message = format!("{message}: {detail}");
                op.finish(phase, message.clone());
                Some(StatusFailure {
                    kind: FailureKind::Apply,
                    message,
                    resources: failed,
                })
            }
        };

        tracing::info!(
            app = %app.name,
            phase = %op.phase,
            message = %op.message,
            "sync operation finished"
        );
        OperationReport {
            operation: op,
            failure,
        }
    }

    fn interrupted(&self, cancel: &CancelToken, deadline: Instant) -> Option<Interrupt> {
        if cancel.is_cancelled() {
            Some(Interrupt::Cancelled)
        } else if Instant::now() >= deadline {
            Some(Interrupt::TimedOut)
        } else {
            None
        }
    }

    async fn apply_with_retry(
        &self,
        app: &Application,
        planned: &PlannedApply,
        cancel: &CancelToken,
        deadline: Instant,
    ) -> (ResourceResult, Option<Interrupt>) {
        let dest = &app.destination;
        let resource = &planned.resource;
        let (outcome, attempts, interrupt) = self
            .with_retry(app, &resource.key, cancel, deadline, || async move {
                if planned.action == ResourceAction::Recreate {
                    self.live.delete(dest, &resource.key).await?;
                }
                self.live.apply(dest, resource).await
            })
            .await;
        let outcome = outcome.unwrap_or(ResourceOutcome::Synced);
        (
            ResourceResult {
                key: resource.key.clone(),
                action: planned.action,
                outcome,
                attempts,
            },
            interrupt,
        )
    }

    async fn prune_with_retry(
        &self,
        app: &Application,
        key: &ResourceKey,
        cancel: &CancelToken,
        deadline: Instant,
    ) -> (ResourceResult, Option<Interrupt>) {
        let dest = &app.destination;
        let (outcome, attempts, interrupt) = self
            .with_retry(app, key, cancel, deadline, || self.live.delete(dest, key))
            .await;
        if outcome.is_none() {
            tracing::info!(app = %app.name, resource = %key, "pruned");
        }
        (
            ResourceResult {
                key: key.clone(),
                action: ResourceAction::Prune,
                outcome: outcome.unwrap_or(ResourceOutcome::Pruned),
                attempts,
            },
            interrupt,
        )
    }

    /// Call `op` until it succeeds, fails permanently, or the retry budget
    /// runs out. Returns `None` as the outcome on success.
    async fn with_retry<F, Fut>(
        &self,
        app: &Application,
        key: &ResourceKey,
        cancel: &CancelToken,
        deadline: Instant,
        mut call: F,
    ) -> (Option<ResourceOutcome>, u32, Option<Interrupt>)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<(), rudder_core::ApplyError>>,
    {
        let policy = &app.sync_policy.retry;
        let mut attempts = 0;
        loop {
            attempts += 1;
            let err = match call().await {
                Ok(()) => return (None, attempts, None),
                Err(err) => err,
            };
            let failed = |retryable| ResourceOutcome::Failed {
                reason: err.to_string(),
                retryable,
            };
            if !err.is_retryable() {
                tracing::warn!(app = %app.name, resource = %key, error = %err, "resource rejected");
                return (Some(failed(false)), attempts, None);
            }
            let retry = attempts;
            if retry > policy.limit {
                tracing::warn!(app = %app.name, resource = %key, attempts, error = %err, "retries exhausted");
                return (Some(failed(true)), attempts, None);
            }
            if let Some(i) = self.interrupted(cancel, deadline) {
                return (Some(failed(true)), attempts, Some(i));
            }
            let delay = policy.delay_for(retry);
            tracing::info!(app = %app.name, resource = %key, retry, ?delay, error = %err, "transient failure, backing off");
            let wake = Instant::now() + delay;
            if wake >= deadline {
                tokio::time::sleep_until(deadline).await;
                return (Some(failed(true)), attempts, Some(Interrupt::TimedOut));
            }
            tokio::time::sleep_until(wake).await;
            if let Some(i) = self.interrupted(cancel, deadline) {
                return (Some(failed(true)), attempts, Some(i));
            }
        }
    }
}
