//! Capabilities the controller consumes from the outside world.
//!
//! [`StateSource`] is read-only. [`LiveState`] is the only mutation
//! boundary: every create, update and delete against a target environment
//! goes through it.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::types::{Destination, Resource, ResourceKey, Source};

/// JSON-pointer paths of fields populated by the target environment.
pub const DEFAULT_SERVER_MANAGED_FIELDS: &[&str] = &[
    "/metadata/uid",
    "/metadata/resourceVersion",
    "/metadata/generation",
    "/metadata/creationTimestamp",
    "/metadata/managedFields",
    "/status",
];

/// A versioned snapshot of desired state.
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredState {
    /// Resolved revision identifier for the snapshot.
    pub revision: String,
    /// Raw documents, in source order.
    pub documents: Vec<Value>,
}

/// Failure to fetch desired state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("source {repo} unreachable: {message}")]
    Unreachable { repo: String, message: String },

    #[error("invalid revision '{revision}' for {repo}")]
    InvalidRevision { repo: String, revision: String },

    #[error("invalid manifest at {location}: {message}")]
    InvalidManifest { location: String, message: String },
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::Unreachable { .. })
    }
}

/// Failure of a Live State Adapter call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApplyError {
    /// Temporary condition (environment unreachable, throttled, ...).
    #[error("transient failure: {0}")]
    Transient(String),

    /// The environment refused the resource; retrying cannot help.
    #[error("rejected: {0}")]
    Rejected(String),
}

impl ApplyError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ApplyError::Transient(_))
    }
}

/// `FetchDesiredState(source, revision)`.
#[async_trait]
pub trait StateSource: Send + Sync {
    async fn fetch(&self, source: &Source) -> Result<DesiredState, FetchError>;
}

/// `ListLiveResources`, `ApplyResource`, `DeleteResource`.
#[async_trait]
pub trait LiveState: Send + Sync {
    /// Every resource visible at `destination`: the destination namespace
    /// plus cluster-scoped resources.
    async fn list(&self, destination: &Destination) -> Result<Vec<Resource>, ApplyError>;

    /// Create or replace `resource`.
    async fn apply(&self, destination: &Destination, resource: &Resource) -> Result<(), ApplyError>;

    /// Delete the resource at `key`. Deleting an absent resource succeeds.
    async fn delete(&self, destination: &Destination, key: &ResourceKey) -> Result<(), ApplyError>;

    /// Fields the diff must ignore because the environment owns them.
    fn server_managed_fields(&self) -> &[&str] {
        DEFAULT_SERVER_MANAGED_FIELDS
    }
}
