//! App-of-apps resolution.
//!
//! [`resolve`] fetches a root Application's desired state, splits off the
//! embedded child Applications and descends depth-first, producing a flat
//! list of [`TreeNode`]s in pre-order. The tree is rebuilt on every pass;
//! nodes refer to their parent by name only.
//!
//! A child that names one of its ancestors (or itself) is a cycle: the
//! declaring node fails with [`SyncError::Cycle`] and none of its children
//! are visited, while the rest of the tree resolves normally. Fetch and
//! manifest failures are likewise confined to the node they occur on.

use std::collections::HashMap;

use rudder_core::{AppName, Application, Resource, StateSource};
use rudder_source::partition;

use crate::error::SyncError;

/// Desired state of one resolved Application.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub revision: String,
    pub resources: Vec<Resource>,
    /// Child Applications, in declaration order.
    pub children: Vec<Application>,
}

impl Resolved {
    pub fn child_names(&self) -> Vec<AppName> {
        self.children.iter().map(|c| c.name.clone()).collect()
    }
}

/// One Application in the resolved tree.
#[derive(Debug)]
pub struct TreeNode {
    pub app: Application,
    pub parent: Option<AppName>,
    pub depth: usize,
    pub outcome: Result<Resolved, SyncError>,
}

/// Fetch and partition the desired state of a single Application.
///
/// An unreachable source is retried on the Application's retry schedule
/// before the failure is reported. Invalid revisions and manifests fail
/// at once.
pub async fn expand(source: &dyn StateSource, app: &Application) -> Result<Resolved, SyncError> {
    let mut delays = app.sync_policy.retry.delays();
    let state = loop {
        let err = match source.fetch(&app.source).await {
            Ok(state) => break state,
            Err(err) => err,
        };
        match delays.next() {
            Some(delay) if err.is_retryable() => {
                tracing::warn!(
                    app = %app.name,
                    error = %err,
                    delay_ms = delay.as_millis() as u64,
                    "fetch failed; retrying"
                );
                tokio::time::sleep(delay).await;
            }
            _ => {
                return Err(SyncError::Fetch {
                    app: app.name.clone(),
                    source: err,
                })
            }
        }
    };
    let part = partition(&state.documents, &app.destination.namespace).map_err(|source| {
        SyncError::Manifest {
            app: app.name.clone(),
            source,
        }
    })?;
    Ok(Resolved {
        revision: state.revision,
        resources: part.resources,
        children: part.applications,
    })
}

/// Resolve the tree rooted at `root`.
pub async fn resolve(source: &dyn StateSource, root: Application, max_depth: usize) -> Vec<TreeNode> {
    resolve_from(source, root, None, max_depth).await
}

/// Resolve the subtree rooted at `app`, which hangs below `parent`.
pub async fn resolve_from(
    source: &dyn StateSource,
    app: Application,
    parent: Option<AppName>,
    max_depth: usize,
) -> Vec<TreeNode> {
    // (app, parent, ancestors from the root down to the parent)
    let mut stack: Vec<(Application, Option<AppName>, Vec<AppName>)> = vec![(app, parent, vec![])];
    let mut declared_by: HashMap<AppName, AppName> = HashMap::new();
    let mut nodes = Vec::new();

    while let Some((app, parent, ancestors)) = stack.pop() {
        let depth = ancestors.len();
        if depth > max_depth {
            nodes.push(TreeNode {
                outcome: Err(SyncError::DepthExceeded {
                    app: app.name.clone(),
                    limit: max_depth,
                }),
                app,
                parent,
                depth,
            });
            continue;
        }

        let mut outcome = expand(source, &app).await;
        if let Ok(resolved) = &outcome {
            if let Some(err) = structural_error(&app, resolved, &ancestors, &declared_by) {
                tracing::warn!(app = %app.name, error = %err, "rejecting application subtree");
                outcome = Err(err);
            }
        }

        if let Ok(resolved) = &outcome {
            let mut lineage = ancestors.clone();
            lineage.push(app.name.clone());
            for child in resolved.children.iter().rev() {
                declared_by.insert(child.name.clone(), app.name.clone());
                stack.push((child.clone(), Some(app.name.clone()), lineage.clone()));
            }
        }

        nodes.push(TreeNode {
            app,
            parent,
            depth,
            outcome,
        });
    }
    nodes
}

fn structural_error(
    app: &Application,
    resolved: &Resolved,
    ancestors: &[AppName],
    declared_by: &HashMap<AppName, AppName>,
) -> Option<SyncError> {
    for child in &resolved.children {
        if child.name == app.name || ancestors.contains(&child.name) {
            let start = ancestors
                .iter()
                .position(|a| *a == child.name)
                .unwrap_or(ancestors.len());
            let mut path: Vec<AppName> = ancestors[start..].to_vec();
            path.push(app.name.clone());
            path.push(child.name.clone());
            return Some(SyncError::Cycle { path });
        }
        if let Some(owner) = declared_by.get(&child.name) {
            return Some(SyncError::DuplicateChild {
                parent: app.name.clone(),
                child: child.name.clone(),
                owner: owner.clone(),
            });
        }
    }
    None
}
