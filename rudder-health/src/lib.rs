//! Health evaluation for live resources.
//!
//! [`HealthEvaluator::evaluate`] maps one resource to a [`HealthStatus`]
//! using a per-kind [`HealthCheck`]. Kinds without a check are `Healthy`
//! once present. A resource that stays `Progressing` past the progress
//! deadline is reported `Degraded`; the start of the progressing streak is
//! carried between passes in `ResourceStatus::progressing_since`.
//!
//! Evaluation is read-only: nothing here touches the target environment.

pub mod checks;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rudder_core::{HealthStatus, Resource};
use serde_json::Value;

/// Verdict of a single check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assessment {
    pub status: HealthStatus,
    pub message: Option<String>,
}

impl Assessment {
    pub fn new(status: HealthStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: Some(message.into()),
        }
    }

    pub fn healthy() -> Self {
        Self {
            status: HealthStatus::Healthy,
            message: None,
        }
    }
}

/// `EvaluateResourceHealth` for one resource kind.
///
/// Returning `None` means the check has no opinion on this object.
pub trait HealthCheck: Send + Sync {
    fn assess(&self, live: &Value) -> Option<Assessment>;
}

impl<F> HealthCheck for F
where
    F: Fn(&Value) -> Option<Assessment> + Send + Sync,
{
    fn assess(&self, live: &Value) -> Option<Assessment> {
        self(live)
    }
}

/// Health of one resource after evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceHealth {
    pub status: HealthStatus,
    pub message: Option<String>,
    /// Start of the current progressing streak, if any.
    pub progressing_since: Option<DateTime<Utc>>,
}

/// Registry of per-kind checks plus the progress deadline.
#[derive(Clone)]
pub struct HealthEvaluator {
    checks: HashMap<String, Arc<dyn HealthCheck>>,
    progress_deadline: Duration,
}

impl std::fmt::Debug for HealthEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<_> = self.checks.keys().collect();
        kinds.sort();
        f.debug_struct("HealthEvaluator")
            .field("kinds", &kinds)
            .field("progress_deadline", &self.progress_deadline)
            .finish()
    }
}

impl HealthEvaluator {
    /// An evaluator with the built-in checks registered.
    pub fn new(progress_deadline: Duration) -> Self {
        let mut evaluator = Self::empty(progress_deadline);
        evaluator.register("Deployment", checks::deployment);
        evaluator.register("StatefulSet", checks::stateful_set);
        evaluator.register("ReplicaSet", checks::replica_set);
        evaluator.register("DaemonSet", checks::daemon_set);
        evaluator.register("Service", checks::service);
        evaluator.register("Pod", checks::pod);
        evaluator.register("Job", checks::job);
        evaluator.register("PersistentVolumeClaim", checks::persistent_volume_claim);
        evaluator
    }

    /// An evaluator with no checks: every present resource is `Healthy`.
    pub fn empty(progress_deadline: Duration) -> Self {
        Self {
            checks: HashMap::new(),
            progress_deadline,
        }
    }

    /// Install or replace the check for `kind`.
    pub fn register(&mut self, kind: impl Into<String>, check: impl HealthCheck + 'static) {
        self.checks.insert(kind.into(), Arc::new(check));
    }

    pub fn progress_deadline(&self) -> Duration {
        self.progress_deadline
    }

    /// Evaluate one resource.
    ///
    /// `live` is `None` when a desired resource is absent from the target
    /// environment (`Missing`). `progressing_since` is the streak start from
    /// the previous pass.
    pub fn evaluate(
        &self,
        live: Option<&Resource>,
        progressing_since: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> ResourceHealth {
        let Some(live) = live else {
            return ResourceHealth {
                status: HealthStatus::Missing,
                message: Some("resource does not exist".to_string()),
                progressing_since: None,
            };
        };

        let assessment = self
            .checks
            .get(&live.key.kind)
            .and_then(|check| check.assess(&live.manifest))
            .unwrap_or_else(Assessment::healthy);

        if assessment.status != HealthStatus::Progressing {
            return ResourceHealth {
                status: assessment.status,
                message: assessment.message,
                progressing_since: None,
            };
        }

        let since = progressing_since.unwrap_or(now);
        let elapsed = (now - since).to_std().unwrap_or_default();
        if elapsed > self.progress_deadline {
            tracing::debug!(resource = %live.key, ?elapsed, "progress deadline exceeded");
            return ResourceHealth {
                status: HealthStatus::Degraded,
                message: Some(format!(
                    "progressing for longer than {}: {}",
                    rudder_core::duration::format(self.progress_deadline),
                    assessment.message.unwrap_or_default()
                )),
                progressing_since: Some(since),
            };
        }
        ResourceHealth {
            status: HealthStatus::Progressing,
            message: assessment.message,
            progressing_since: Some(since),
        }
    }
}

/// Aggregate Application health: worst status by precedence.
pub fn aggregate(statuses: impl IntoIterator<Item = HealthStatus>) -> HealthStatus {
    HealthStatus::worst(statuses)
}
