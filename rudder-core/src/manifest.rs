//! Application documents: the `kind: Application` manifest format.
//!
//! ```yaml
//! apiVersion: rudder.dev/v1
//! kind: Application
//! metadata:
//!   name: guestbook
//!   finalizers: [resources-finalizer.rudder.dev]
//! spec:
//!   source: { repoURL: /srv/gitops, targetRevision: HEAD, path: apps/guestbook }
//!   destination: { server: local, namespace: guestbook }
//!   syncPolicy:
//!     automated: { prune: true, selfHeal: true }
//!     retry: { limit: 5, backoff: { duration: 5s, factor: 2, maxDuration: 3m } }
//!     syncOptions: [CreateNamespace=true]
//! ```

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::duration;
use crate::error::ManifestError;
use crate::types::{
    AppName, Application, Destination, RetryPolicy, Source, SyncOption, SyncPolicy,
    APPLICATION_KIND, CASCADE_FINALIZER,
};

/// API version written by [`to_document`].
pub const API_VERSION: &str = "rudder.dev/v1";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApplicationDocument {
    #[serde(default)]
    api_version: Option<String>,
    kind: String,
    metadata: DocumentMetadata,
    spec: ApplicationSpec,
}

#[derive(Debug, Serialize, Deserialize)]
struct DocumentMetadata {
    name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    finalizers: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApplicationSpec {
    source: SourceSpec,
    destination: DestinationSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sync_policy: Option<SyncPolicySpec>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SourceSpec {
    #[serde(rename = "repoURL")]
    repo_url: String,
    #[serde(default = "default_revision")]
    target_revision: String,
    #[serde(default)]
    path: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct DestinationSpec {
    #[serde(default)]
    server: String,
    #[serde(default)]
    namespace: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyncPolicySpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    automated: Option<AutomatedSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    retry: Option<RetrySpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    sync_options: Vec<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AutomatedSpec {
    #[serde(default)]
    prune: bool,
    #[serde(default)]
    self_heal: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct RetrySpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    limit: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    backoff: Option<BackoffSpec>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BackoffSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    duration: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    factor: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    max_duration: Option<String>,
}

fn default_revision() -> String {
    "HEAD".to_string()
}

/// `true` when the document declares an embedded Application.
pub fn is_application_document(doc: &Value) -> bool {
    doc.get("kind").and_then(Value::as_str) == Some(APPLICATION_KIND)
}

/// Materialize an [`Application`] from its document.
pub fn application_from_document(doc: &Value) -> Result<Application, ManifestError> {
    if !doc.is_object() {
        return Err(ManifestError::NotAMapping);
    }
    let name = doc
        .pointer("/metadata/name")
        .and_then(Value::as_str)
        .filter(|n| !n.is_empty())
        .ok_or(ManifestError::MissingField {
            field: "metadata.name",
        })?
        .to_string();
    let invalid = |message: String| ManifestError::InvalidApplication {
        name: name.clone(),
        message,
    };
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_'))
    {
        return Err(invalid("name may only contain [A-Za-z0-9-._]".to_string()));
    }

    let parsed: ApplicationDocument =
        serde_json::from_value(doc.clone()).map_err(|e| invalid(e.to_string()))?;
    if parsed.kind != APPLICATION_KIND {
        return Err(invalid(format!("unexpected kind '{}'", parsed.kind)));
    }
    if parsed.spec.source.repo_url.is_empty() {
        return Err(invalid("spec.source.repoURL is empty".to_string()));
    }

    let policy = parsed.spec.sync_policy.unwrap_or_default();
    let automated = policy.automated.is_some();
    let automated_spec = policy.automated.unwrap_or_default();

    let mut retry = RetryPolicy::default();
    if let Some(spec) = policy.retry {
        if let Some(limit) = spec.limit {
            retry.limit = limit;
        }
        if let Some(backoff) = spec.backoff {
            if let Some(raw) = backoff.duration {
                retry.initial_delay = duration::parse(&raw)?;
            }
            if let Some(factor) = backoff.factor {
                retry.factor = factor;
            }
            if let Some(raw) = backoff.max_duration {
                retry.max_delay = duration::parse(&raw)?;
            }
        }
    }

    let sync_options = policy
        .sync_options
        .iter()
        .map(|raw| raw.parse::<SyncOption>())
        .collect::<Result<BTreeSet<_>, _>>()?;

    Ok(Application {
        name: AppName::from(name.clone()),
        source: Source {
            repo_url: parsed.spec.source.repo_url,
            target_revision: parsed.spec.source.target_revision,
            path: parsed.spec.source.path,
        },
        destination: Destination {
            server: parsed.spec.destination.server,
            namespace: parsed.spec.destination.namespace,
        },
        sync_policy: SyncPolicy {
            automated,
            prune: automated_spec.prune,
            self_heal: automated_spec.self_heal,
            retry,
            sync_options,
        },
        cascade: parsed
            .metadata
            .finalizers
            .iter()
            .any(|f| f == CASCADE_FINALIZER),
    })
}

/// Render an [`Application`] back into document form.
pub fn to_document(app: &Application) -> Value {
    let policy = &app.sync_policy;
    let sync_options = policy
        .sync_options
        .iter()
        .map(|opt| format!("{opt:?}=true"))
        .collect();
    let doc = ApplicationDocument {
        api_version: Some(API_VERSION.to_string()),
        kind: APPLICATION_KIND.to_string(),
        metadata: DocumentMetadata {
            name: app.name.0.clone(),
            finalizers: if app.cascade {
                vec![CASCADE_FINALIZER.to_string()]
            } else {
                vec![]
            },
        },
        spec: ApplicationSpec {
            source: SourceSpec {
                repo_url: app.source.repo_url.clone(),
                target_revision: app.source.target_revision.clone(),
                path: app.source.path.clone(),
            },
            destination: DestinationSpec {
                server: app.destination.server.clone(),
                namespace: app.destination.namespace.clone(),
            },
            sync_policy: Some(SyncPolicySpec {
                automated: policy.automated.then(|| AutomatedSpec {
                    prune: policy.prune,
                    self_heal: policy.self_heal,
                }),
                retry: Some(RetrySpec {
                    limit: Some(policy.retry.limit),
                    backoff: Some(BackoffSpec {
                        duration: Some(duration::format(policy.retry.initial_delay)),
                        factor: Some(policy.retry.factor),
                        max_duration: Some(duration::format(policy.retry.max_delay)),
                    }),
                }),
                sync_options,
            }),
        },
    };
    serde_json::to_value(doc).unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn guestbook() -> Value {
        json!({
            "apiVersion": "rudder.dev/v1",
            "kind": "Application",
            "metadata": {
                "name": "guestbook",
                "finalizers": ["resources-finalizer.rudder.dev"]
            },
            "spec": {
                "source": {"repoURL": "/srv/gitops", "targetRevision": "main", "path": "guestbook"},
                "destination": {"server": "local", "namespace": "guestbook"},
                "syncPolicy": {
                    "automated": {"prune": true, "selfHeal": true},
                    "retry": {"limit": 3, "backoff": {"duration": "10s", "factor": 3, "maxDuration": "1m"}},
                    "syncOptions": ["CreateNamespace=true"]
                }
            }
        })
    }

    #[test]
    fn parses_full_application_document() {
        let app = application_from_document(&guestbook()).expect("app");
        assert_eq!(app.name, AppName::from("guestbook"));
        assert_eq!(app.source.target_revision, "main");
        assert!(app.sync_policy.automated);
        assert!(app.sync_policy.prune);
        assert!(app.sync_policy.self_heal);
        assert!(app.cascade);
        assert_eq!(app.sync_policy.retry.limit, 3);
        assert_eq!(app.sync_policy.retry.initial_delay, Duration::from_secs(10));
        assert_eq!(app.sync_policy.retry.max_delay, Duration::from_secs(60));
        assert!(app.sync_policy.has_option(SyncOption::CreateNamespace));
    }

    #[test]
    fn missing_sync_policy_means_manual_sync_with_default_retry() {
        let doc = json!({
            "kind": "Application",
            "metadata": {"name": "plain"},
            "spec": {
                "source": {"repoURL": "/srv/gitops"},
                "destination": {"namespace": "plain"}
            }
        });
        let app = application_from_document(&doc).expect("app");
        assert!(!app.sync_policy.automated);
        assert_eq!(app.source.target_revision, "HEAD");
        assert_eq!(app.sync_policy.retry, RetryPolicy::default());
        assert!(!app.cascade);
    }

    #[test]
    fn invalid_sync_option_is_reported() {
        let mut doc = guestbook();
        doc["spec"]["syncPolicy"]["syncOptions"] = json!(["Turbo=true"]);
        assert!(matches!(
            application_from_document(&doc),
            Err(ManifestError::InvalidSyncOption { .. })
        ));
    }

    #[test]
    fn missing_source_names_the_application() {
        let doc = json!({"kind": "Application", "metadata": {"name": "broken"}, "spec": {}});
        match application_from_document(&doc) {
            Err(ManifestError::InvalidApplication { name, .. }) => assert_eq!(name, "broken"),
            other => panic!("expected invalid application, got {other:?}"),
        }
    }

    #[test]
    fn path_like_names_are_rejected() {
        let mut doc = guestbook();
        doc["metadata"]["name"] = json!("../etc");
        assert!(matches!(
            application_from_document(&doc),
            Err(ManifestError::InvalidApplication { .. })
        ));
    }

    #[test]
    fn document_roundtrip_preserves_application() {
        let app = application_from_document(&guestbook()).expect("app");
        let back = application_from_document(&to_document(&app)).expect("reparse");
        assert_eq!(back, app);
    }
}
