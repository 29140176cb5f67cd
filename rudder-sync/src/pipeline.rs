//! One reconciliation pass for one Application.
//!
//! This is the canonical pass used by the daemon for scheduled, watched and
//! manual triggers alike:
//!
//! 1. list live state and diff it against the resolved desired state;
//! 2. decide whether to sync (manual request, automated policy on a new
//!    revision, or self-heal on drift), honouring operation-level backoff;
//! 3. run the operation through the [`Orchestrator`];
//! 4. re-list, re-diff and evaluate health;
//! 5. return a complete new [`AppStatus`]. The caller persists it wholesale.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use rudder_core::types::{
    DiffClass, FailureKind, OperationPhase, ResourceOutcome, ResourceStatus, StatusFailure,
    SyncStatusCode,
};
use rudder_core::{AppRecord, AppStatus, Application, HealthStatus, LiveState, Resource, Trigger};
use rudder_health::{aggregate, HealthEvaluator};

use crate::diff::{diff, Claims, ResourceDiff};
use crate::error::SyncError;
use crate::orchestrator::{has_actionable_work, CancelToken, OperationReport, Orchestrator, SyncRequest};
use crate::tree::Resolved;

/// Why an automated sync was not started this pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Hold {
    /// Nothing to do, or policy does not allow an automatic sync.
    Idle,
    /// Waiting for `next_retry_at`.
    Backoff { until: DateTime<Utc> },
    /// Retry budget for this revision is spent.
    Exhausted,
    /// The last operation for this revision was terminated by an operator.
    Terminated,
}

/// Outcome of the trigger decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Sync { request: SyncRequest, attempt: u32 },
    Hold(Hold),
}

/// Decide whether this pass syncs.
///
/// Operation attempts are counted per revision and shared between automated
/// and self-heal triggers. Manual requests are never held back.
pub fn decide(
    app: &Application,
    previous: &AppStatus,
    revision: &str,
    diffs: &[ResourceDiff],
    manual: Option<SyncRequest>,
    now: DateTime<Utc>,
) -> Decision {
    let last = previous.operation.as_ref().filter(|op| op.revision == revision && !op.dry_run);
    let next_attempt = match last {
        Some(op) if op.phase.is_failure() => op.attempt + 1,
        _ => 1,
    };

    if let Some(request) = manual {
        return Decision::Sync {
            request,
            attempt: next_attempt,
        };
    }

    let policy = &app.sync_policy;
    if !policy.automated || !has_actionable_work(diffs, policy.prune) {
        return Decision::Hold(Hold::Idle);
    }
    let trigger = if previous.synced_revision.as_deref() != Some(revision) {
        Trigger::Automated
    } else if policy.self_heal {
        Trigger::SelfHeal
    } else {
        return Decision::Hold(Hold::Idle);
    };

    if let Some(op) = last {
        if op.phase == OperationPhase::Terminated {
            return Decision::Hold(Hold::Terminated);
        }
        if op.phase.is_failure() {
            if op.attempt > policy.retry.limit {
                return Decision::Hold(Hold::Exhausted);
            }
            if let Some(until) = op.next_retry_at {
                if now < until {
                    return Decision::Hold(Hold::Backoff { until });
                }
            }
        }
    }

    Decision::Sync {
        request: SyncRequest::automatic(trigger),
        attempt: next_attempt,
    }
}

/// Runs reconciliation passes against one target environment.
#[derive(Clone)]
pub struct Reconciler {
    live: Arc<dyn LiveState>,
    health: HealthEvaluator,
    max_operation_duration: Duration,
}

impl Reconciler {
    pub fn new(live: Arc<dyn LiveState>, health: HealthEvaluator, max_operation_duration: Duration) -> Self {
        Self {
            live,
            health,
            max_operation_duration,
        }
    }

    pub fn live(&self) -> &Arc<dyn LiveState> {
        &self.live
    }

    /// Current diff of `app` against `desired`, without syncing.
    pub async fn diff(
        &self,
        app: &Application,
        desired: &[Resource],
        claims: &Claims,
    ) -> Result<Vec<ResourceDiff>, SyncError> {
        let live = self
            .live
            .list(&app.destination)
            .await
            .map_err(|source| SyncError::LiveState {
                app: app.name.clone(),
                source,
            })?;
        diff(&app.name, desired, &live, self.live.server_managed_fields(), claims)
    }

    /// Run one pass and return the Application's next Status.
    pub async fn reconcile(
        &self,
        record: &AppRecord,
        desired: &Resolved,
        manual: Option<SyncRequest>,
        claims: &Claims,
        cancel: &CancelToken,
    ) -> AppStatus {
        let app = &record.app;
        let previous = &record.status;
        let ignore = self.live.server_managed_fields();

        let live = match self.live.list(&app.destination).await {
            Ok(live) => live,
            Err(source) => {
                let err = SyncError::LiveState {
                    app: app.name.clone(),
                    source,
                };
                return failed_status(previous, Some(&desired.revision), &err);
            }
        };
        let diffs = match diff(&app.name, &desired.resources, &live, ignore, claims) {
            Ok(d) => d,
            Err(err) => {
                tracing::warn!(app = %app.name, error = %err, "diff failed");
                return failed_status(previous, Some(&desired.revision), &err);
            }
        };

        let now = Utc::now();
        let report = match decide(app, previous, &desired.revision, &diffs, manual, now) {
            Decision::Sync { request, attempt } => {
                let orchestrator = Orchestrator::new(self.live.as_ref(), self.max_operation_duration);
                Some(
                    orchestrator
                        .run(app, &desired.revision, &diffs, &live, request, cancel, attempt)
                        .await,
                )
            }
            Decision::Hold(hold) => {
                if hold != Hold::Idle {
                    tracing::debug!(app = %app.name, ?hold, "automated sync held");
                }
                None
            }
        };

        let mutated = report.as_ref().map(|r| !r.operation.dry_run).unwrap_or(false);
        let diffs = if mutated {
            match self.live.list(&app.destination).await {
                Ok(after) => match diff(&app.name, &desired.resources, &after, ignore, claims) {
                    Ok(d) => d,
                    Err(err) => return failed_status(previous, Some(&desired.revision), &err),
                },
                Err(source) => {
                    let err = SyncError::LiveState {
                        app: app.name.clone(),
                        source,
                    };
                    let mut status = failed_status(previous, Some(&desired.revision), &err);
                    status.operation = report.map(|r| r.operation);
                    return status;
                }
            }
        } else {
            diffs
        };

        let status = self.compose(record, desired, &diffs, report, now);
        tracing::info!(
            app = %app.name,
            sync = %status.sync,
            health = %status.health,
            revision = %desired.revision,
            "reconciled"
        );
        status
    }

    fn compose(
        &self,
        record: &AppRecord,
        desired: &Resolved,
        diffs: &[ResourceDiff],
        report: Option<OperationReport>,
        now: DateTime<Utc>,
    ) -> AppStatus {
        let app = &record.app;
        let previous = &record.status;

        let mut resources = Vec::with_capacity(diffs.len());
        for d in diffs {
            let prior = previous.resource(&d.key);
            let health = self.health.evaluate(
                d.live.as_ref(),
                prior.and_then(|p| p.progressing_since),
                now,
            );
            let error = report.as_ref().and_then(|r| {
                r.operation.resources.iter().find_map(|res| match &res.outcome {
                    ResourceOutcome::Failed { reason, .. } if res.key == d.key => Some(reason.clone()),
                    _ => None,
                })
            });
            resources.push(ResourceStatus {
                key: d.key.clone(),
                class: d.class,
                wave: d.wave,
                desired_hash: d.desired_hash.clone(),
                live_hash: d.live_hash.clone(),
                health: health.status,
                health_message: health.message,
                progressing_since: health.progressing_since,
                prune_protected: d.prune_protected,
                error,
            });
        }

        let health = aggregate(
            resources
                .iter()
                .filter(|r| r.class != DiffClass::Extra)
                .map(|r| r.health),
        );
        let out_of_sync = diffs
            .iter()
            .any(|d| d.is_out_of_sync() || (d.class == DiffClass::Extra && !d.prune_protected));
        let sync = if out_of_sync {
            SyncStatusCode::OutOfSync
        } else {
            SyncStatusCode::Synced
        };

        let mut failure = None;
        let mut synced_revision = previous.synced_revision.clone();
        let operation = match report {
            Some(mut report) => {
                let op = &mut report.operation;
                if op.phase == OperationPhase::Succeeded && !op.dry_run {
                    let degraded: Vec<_> = resources
                        .iter()
                        .filter(|r| r.class != DiffClass::Extra && r.health == HealthStatus::Degraded)
                        .map(|r| r.key.clone())
                        .collect();
                    if !degraded.is_empty() {
                        let names = degraded.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ");
                        op.phase = OperationPhase::Failed;
                        op.message = format!("synced but degraded: {names}");
                        report.failure = Some(StatusFailure {
                            kind: FailureKind::Apply,
                            message: op.message.clone(),
                            resources: degraded,
                        });
                    } else {
                        synced_revision = Some(op.revision.clone());
                    }
                }
                if op.phase.is_failure() {
                    op.next_retry_at = if op.attempt <= app.sync_policy.retry.limit {
                        let delay = app.sync_policy.retry.delay_for(op.attempt);
                        let finished = op.finished_at.unwrap_or(now);
                        chrono::Duration::from_std(delay).ok().map(|d| finished + d)
                    } else {
                        None
                    };
                }
                failure = report.failure;
                Some(report.operation)
            }
            None => {
                // A held retry keeps reporting why the last operation failed.
                if sync == SyncStatusCode::OutOfSync {
                    failure = previous
                        .failure
                        .clone()
                        .filter(|f| matches!(f.kind, FailureKind::Apply | FailureKind::Timeout));
                }
                previous.operation.clone()
            }
        };
        if sync == SyncStatusCode::Synced && failure.is_none() {
            synced_revision = Some(desired.revision.clone());
        }

        AppStatus {
            revision: Some(desired.revision.clone()),
            synced_revision,
            sync,
            health,
            resources,
            children: desired.child_names(),
            operation,
            failure,
            orphaned: previous.orphaned,
            reconciled_at: Some(now),
        }
    }
}

/// Status for a pass that could not diff: previous resource rows are kept,
/// sync becomes `Unknown` and the failure is recorded.
pub fn failed_status(previous: &AppStatus, revision: Option<&str>, err: &SyncError) -> AppStatus {
    let mut status = previous.clone();
    if let Some(revision) = revision {
        status.revision = Some(revision.to_string());
    }
    status.sync = SyncStatusCode::Unknown;
    status.failure = Some(err.to_failure());
    status.reconciled_at = Some(Utc::now());
    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use rudder_core::types::{Change, Destination, Source, SyncOperation, SyncPolicy};
    use rudder_core::{AppName, ResourceKey};

    fn app(automated: bool, self_heal: bool) -> Application {
        Application {
            name: AppName::from("shop"),
            source: Source {
                repo_url: "mem://repo".into(),
                target_revision: "HEAD".into(),
                path: "shop".into(),
            },
            destination: Destination {
                server: "memory".into(),
                namespace: "shop".into(),
            },
            sync_policy: SyncPolicy {
                automated,
                self_heal,
                ..SyncPolicy::default()
            },
            cascade: false,
        }
    }

    fn drift() -> Vec<ResourceDiff> {
        vec![ResourceDiff {
            key: ResourceKey::new("ConfigMap", "shop", "cfg"),
            class: DiffClass::OutOfSync(Change::Update),
            desired: None,
            live: None,
            desired_hash: None,
            live_hash: None,
            wave: 0,
            prune_protected: false,
        }]
    }

    fn failed_op(revision: &str, attempt: u32, retry_at: Option<DateTime<Utc>>) -> SyncOperation {
        let mut op = SyncOperation::new(AppName::from("shop"), Trigger::Automated, revision, false);
        op.attempt = attempt;
        op.finish(OperationPhase::Failed, "boom");
        op.next_retry_at = retry_at;
        op
    }

    #[test]
    fn new_revision_triggers_automated_sync() {
        let status = AppStatus {
            synced_revision: Some("r0".into()),
            ..AppStatus::default()
        };
        let decision = decide(&app(true, false), &status, "r1", &drift(), None, Utc::now());
        assert_eq!(
            decision,
            Decision::Sync {
                request: SyncRequest::automatic(Trigger::Automated),
                attempt: 1
            }
        );
    }

    #[test]
    fn drift_at_synced_revision_needs_self_heal() {
        let status = AppStatus {
            synced_revision: Some("r1".into()),
            ..AppStatus::default()
        };
        let now = Utc::now();
        assert_eq!(
            decide(&app(true, false), &status, "r1", &drift(), None, now),
            Decision::Hold(Hold::Idle)
        );
        assert!(matches!(
            decide(&app(true, true), &status, "r1", &drift(), None, now),
            Decision::Sync {
                request: SyncRequest {
                    trigger: Trigger::SelfHeal,
                    ..
                },
                ..
            }
        ));
    }

    #[test]
    fn manual_policy_never_syncs_on_its_own() {
        let decision = decide(&app(false, false), &AppStatus::default(), "r1", &drift(), None, Utc::now());
        assert_eq!(decision, Decision::Hold(Hold::Idle));
    }

    #[test]
    fn failed_operation_backs_off_then_retries_with_next_attempt() {
        let now = Utc::now();
        let until = now + chrono::Duration::seconds(10);
        let status = AppStatus {
            operation: Some(failed_op("r1", 2, Some(until))),
            ..AppStatus::default()
        };
        let a = app(true, false);
        assert_eq!(
            decide(&a, &status, "r1", &drift(), None, now),
            Decision::Hold(Hold::Backoff { until })
        );
        assert!(matches!(
            decide(&a, &status, "r1", &drift(), None, until),
            Decision::Sync { attempt: 3, .. }
        ));
    }

    #[test]
    fn exhausted_budget_waits_for_new_revision_but_not_manual() {
        let a = app(true, true);
        let status = AppStatus {
            operation: Some(failed_op("r1", a.sync_policy.retry.limit + 1, None)),
            ..AppStatus::default()
        };
        let now = Utc::now();
        assert_eq!(
            decide(&a, &status, "r1", &drift(), None, now),
            Decision::Hold(Hold::Exhausted)
        );
        assert!(matches!(
            decide(&a, &status, "r2", &drift(), None, now),
            Decision::Sync { attempt: 1, .. }
        ));
        assert!(matches!(
            decide(&a, &status, "r1", &drift(), Some(SyncRequest::manual()), now),
            Decision::Sync { .. }
        ));
    }

    #[test]
    fn terminated_operation_suppresses_automation_for_its_revision() {
        let mut op = SyncOperation::new(AppName::from("shop"), Trigger::Automated, "r1", false);
        op.finish(OperationPhase::Terminated, "terminated");
        let status = AppStatus {
            operation: Some(op),
            ..AppStatus::default()
        };
        assert_eq!(
            decide(&app(true, true), &status, "r1", &drift(), None, Utc::now()),
            Decision::Hold(Hold::Terminated)
        );
    }
}
