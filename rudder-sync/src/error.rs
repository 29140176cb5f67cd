//! Error types for rudder-sync.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use rudder_core::{
    duration, ApplyError, AppName, FetchError, ResourceKey, StoreError,
    types::{FailureKind, StatusFailure},
};
use rudder_source::DocumentError;

/// All errors that can arise while resolving, diffing or syncing an
/// Application.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Desired state could not be fetched.
    #[error("failed to fetch desired state for '{app}': {source}")]
    Fetch {
        app: AppName,
        #[source]
        source: FetchError,
    },

    /// Live state could not be listed.
    #[error("failed to list live state for '{app}': {source}")]
    LiveState {
        app: AppName,
        #[source]
        source: ApplyError,
    },

    /// The fetched document set is invalid.
    #[error("invalid desired state for '{app}': {source}")]
    Manifest {
        app: AppName,
        #[source]
        source: DocumentError,
    },

    /// Resources already claimed by another Application.
    #[error("'{app}' claims resources owned by {}: {}", join(owners), join(resources))]
    Conflict {
        app: AppName,
        owners: Vec<AppName>,
        resources: Vec<ResourceKey>,
    },

    /// An Application declared by two parents in the same tree.
    #[error("application '{child}' declared by '{parent}' is already declared by '{owner}'")]
    DuplicateChild {
        parent: AppName,
        child: AppName,
        owner: AppName,
    },

    /// An Application declares itself, directly or through descendants.
    #[error("application cycle detected: {}", join_path(path))]
    Cycle { path: Vec<AppName> },

    /// Resolution went deeper than the configured limit.
    #[error("application tree under '{app}' exceeds maximum depth {limit}")]
    DepthExceeded { app: AppName, limit: usize },

    /// The operation ran longer than the configured maximum.
    #[error("operation for '{app}' exceeded {}", duration::format(*limit))]
    Timeout { app: AppName, limit: Duration },

    /// Status store failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// YAML error while encoding a live object.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl SyncError {
    /// The Status-facing summary of this error.
    pub fn to_failure(&self) -> StatusFailure {
        let kind = match self {
            SyncError::Fetch { .. } => FailureKind::Fetch,
            SyncError::LiveState { .. } => FailureKind::LiveState,
            SyncError::Manifest { .. } => FailureKind::Manifest,
            SyncError::Conflict { .. } | SyncError::DuplicateChild { .. } => FailureKind::Conflict,
            SyncError::Cycle { .. } | SyncError::DepthExceeded { .. } => FailureKind::Cycle,
            SyncError::Timeout { .. } => FailureKind::Timeout,
            SyncError::Store(_) | SyncError::Io { .. } | SyncError::Yaml(_) => FailureKind::LiveState,
        };
        let resources = match self {
            SyncError::Conflict { resources, .. } => resources.clone(),
            SyncError::Manifest {
                source: DocumentError::DuplicateResource { key },
                ..
            } => vec![key.clone()],
            _ => vec![],
        };
        StatusFailure {
            kind,
            message: self.to_string(),
            resources,
        }
    }
}

fn join<T: std::fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

fn join_path(path: &[AppName]) -> String {
    path.iter()
        .map(|a| a.0.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// Convenience constructor for [`SyncError::Io`].
pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> SyncError {
    SyncError::Io {
        path: path.into(),
        source,
    }
}
