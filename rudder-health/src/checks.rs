//! Built-in health checks, one per workload kind.
//!
//! Each check inspects the live object's `spec`/`status` and returns
//! `None` when it has nothing to say, letting the evaluator fall back to
//! `Healthy`. Any status field of the wrong type yields `Unknown`.

use rudder_core::HealthStatus;
use serde_json::Value;

use crate::Assessment;

/// Waiting reasons that will not resolve without intervention.
const FATAL_WAITING_REASONS: &[&str] = &[
    "CrashLoopBackOff",
    "ImagePullBackOff",
    "ErrImagePull",
    "InvalidImageName",
    "CreateContainerConfigError",
];

// ---------------------------------------------------------------------------
// Field helpers
// ---------------------------------------------------------------------------

/// Integer at `pointer`; `Ok(None)` when absent, `Err` when not an integer.
fn int_at(obj: &Value, pointer: &str) -> Result<Option<i64>, String> {
    match obj.pointer(pointer) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_i64()
            .map(Some)
            .ok_or_else(|| format!("{pointer} is not an integer")),
    }
}

fn str_at<'a>(obj: &'a Value, pointer: &str) -> Option<&'a str> {
    obj.pointer(pointer).and_then(Value::as_str)
}

/// The `status.conditions[]` entry of the given type.
fn condition<'a>(obj: &'a Value, kind: &str) -> Option<&'a Value> {
    obj.pointer("/status/conditions")
        .and_then(Value::as_array)?
        .iter()
        .find(|c| c.get("type").and_then(Value::as_str) == Some(kind))
}

fn condition_is_true(obj: &Value, kind: &str) -> bool {
    condition(obj, kind).and_then(|c| c.get("status")).and_then(Value::as_str) == Some("True")
}

fn unknown(message: String) -> Option<Assessment> {
    Some(Assessment::new(HealthStatus::Unknown, message))
}

/// A rollout not yet seen by the workload controller.
fn generation_pending(obj: &Value) -> Result<bool, String> {
    let generation = int_at(obj, "/metadata/generation")?;
    let observed = int_at(obj, "/status/observedGeneration")?;
    Ok(matches!((generation, observed), (Some(g), Some(o)) if o < g))
}

// ---------------------------------------------------------------------------
// Workloads
// ---------------------------------------------------------------------------

pub fn deployment(obj: &Value) -> Option<Assessment> {
    let result = (|| -> Result<Assessment, String> {
        if let Some(cond) = condition(obj, "Progressing") {
            if cond.get("reason").and_then(Value::as_str) == Some("ProgressDeadlineExceeded") {
                return Ok(Assessment::new(
                    HealthStatus::Degraded,
                    "deployment exceeded its progress deadline",
                ));
            }
        }
        if generation_pending(obj)? {
            return Ok(Assessment::new(
                HealthStatus::Progressing,
                "waiting for rollout to be observed",
            ));
        }
        let desired = int_at(obj, "/spec/replicas")?.unwrap_or(1);
        let current = int_at(obj, "/status/replicas")?.unwrap_or(0);
        let updated = int_at(obj, "/status/updatedReplicas")?.unwrap_or(0);
        let available = int_at(obj, "/status/availableReplicas")?.unwrap_or(0);
        Ok(if updated < desired {
            Assessment::new(
                HealthStatus::Progressing,
                format!("{updated} of {desired} replicas updated"),
            )
        } else if current > updated {
            Assessment::new(
                HealthStatus::Progressing,
                format!("{} old replicas pending termination", current - updated),
            )
        } else if available < desired {
            Assessment::new(
                HealthStatus::Progressing,
                format!("{available} of {desired} replicas available"),
            )
        } else {
            Assessment::healthy()
        })
    })();
    Some(result.unwrap_or_else(|m| Assessment::new(HealthStatus::Unknown, m)))
}

pub fn stateful_set(obj: &Value) -> Option<Assessment> {
    let result = (|| -> Result<Assessment, String> {
        if generation_pending(obj)? {
            return Ok(Assessment::new(
                HealthStatus::Progressing,
                "waiting for rollout to be observed",
            ));
        }
        let desired = int_at(obj, "/spec/replicas")?.unwrap_or(1);
        let ready = int_at(obj, "/status/readyReplicas")?.unwrap_or(0);
        let updated = int_at(obj, "/status/updatedReplicas")?.unwrap_or(0);
        Ok(if ready < desired {
            Assessment::new(
                HealthStatus::Progressing,
                format!("{ready} of {desired} replicas ready"),
            )
        } else if updated < desired {
            Assessment::new(
                HealthStatus::Progressing,
                format!("{updated} of {desired} replicas updated"),
            )
        } else {
            Assessment::healthy()
        })
    })();
    Some(result.unwrap_or_else(|m| Assessment::new(HealthStatus::Unknown, m)))
}

pub fn replica_set(obj: &Value) -> Option<Assessment> {
    if condition_is_true(obj, "ReplicaFailure") {
        return Some(Assessment::new(HealthStatus::Degraded, "replica creation failed"));
    }
    let desired = match int_at(obj, "/spec/replicas") {
        Ok(v) => v.unwrap_or(1),
        Err(m) => return unknown(m),
    };
    let available = match int_at(obj, "/status/availableReplicas") {
        Ok(v) => v.unwrap_or(0),
        Err(m) => return unknown(m),
    };
    Some(if available < desired {
        Assessment::new(
            HealthStatus::Progressing,
            format!("{available} of {desired} replicas available"),
        )
    } else {
        Assessment::healthy()
    })
}

pub fn daemon_set(obj: &Value) -> Option<Assessment> {
    let result = (|| -> Result<Assessment, String> {
        let desired = int_at(obj, "/status/desiredNumberScheduled")?.unwrap_or(0);
        let ready = int_at(obj, "/status/numberReady")?.unwrap_or(0);
        let updated = int_at(obj, "/status/updatedNumberScheduled")?.unwrap_or(0);
        Ok(if ready < desired || updated < desired {
            Assessment::new(
                HealthStatus::Progressing,
                format!("{ready} of {desired} pods ready"),
            )
        } else {
            Assessment::healthy()
        })
    })();
    Some(result.unwrap_or_else(|m| Assessment::new(HealthStatus::Unknown, m)))
}

// ---------------------------------------------------------------------------
// Other kinds
// ---------------------------------------------------------------------------

pub fn service(obj: &Value) -> Option<Assessment> {
    if str_at(obj, "/spec/type") != Some("LoadBalancer") {
        return None;
    }
    let ingress = obj
        .pointer("/status/loadBalancer/ingress")
        .and_then(Value::as_array)
        .map(|a| !a.is_empty())
        .unwrap_or(false);
    Some(if ingress {
        Assessment::healthy()
    } else {
        Assessment::new(HealthStatus::Progressing, "waiting for load balancer address")
    })
}

pub fn pod(obj: &Value) -> Option<Assessment> {
    let statuses = obj
        .pointer("/status/containerStatuses")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    for status in statuses {
        if let Some(reason) = str_at(status, "/state/waiting/reason") {
            if FATAL_WAITING_REASONS.contains(&reason) {
                return Some(Assessment::new(HealthStatus::Degraded, reason));
            }
        }
    }
    Some(match str_at(obj, "/status/phase") {
        Some("Succeeded") => Assessment::healthy(),
        Some("Running") if condition_is_true(obj, "Ready") => Assessment::healthy(),
        Some("Running") => Assessment::new(HealthStatus::Progressing, "pod is not ready"),
        Some("Failed") => Assessment::new(
            HealthStatus::Degraded,
            str_at(obj, "/status/message").unwrap_or("pod failed"),
        ),
        Some("Pending") | None => Assessment::new(HealthStatus::Progressing, "pod is pending"),
        Some(other) => Assessment::new(HealthStatus::Unknown, format!("unknown phase '{other}'")),
    })
}

pub fn job(obj: &Value) -> Option<Assessment> {
    Some(if condition_is_true(obj, "Failed") {
        let message = condition(obj, "Failed")
            .and_then(|c| c.get("message"))
            .and_then(Value::as_str)
            .unwrap_or("job failed");
        Assessment::new(HealthStatus::Degraded, message)
    } else if condition_is_true(obj, "Complete") {
        Assessment::healthy()
    } else {
        Assessment::new(HealthStatus::Progressing, "job is running")
    })
}

pub fn persistent_volume_claim(obj: &Value) -> Option<Assessment> {
    Some(match str_at(obj, "/status/phase") {
        Some("Bound") => Assessment::healthy(),
        Some("Lost") => Assessment::new(HealthStatus::Degraded, "claim lost its volume"),
        Some("Pending") | None => {
            Assessment::new(HealthStatus::Progressing, "waiting for volume binding")
        }
        Some(other) => Assessment::new(HealthStatus::Unknown, format!("unknown phase '{other}'")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn malformed_replica_count_is_unknown() {
        let obj = json!({"spec": {"replicas": "three"}, "status": {}});
        let a = deployment(&obj).expect("assessment");
        assert_eq!(a.status, HealthStatus::Unknown);
        assert!(a.message.as_deref().unwrap_or_default().contains("/spec/replicas"));
    }

    #[test]
    fn cluster_ip_service_has_no_opinion() {
        assert!(service(&json!({"spec": {"type": "ClusterIP"}})).is_none());
    }
}
