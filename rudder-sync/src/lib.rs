//! # rudder-sync
//!
//! Tree resolution, diffing and sync execution.
//!
//! [`tree::resolve`] expands an app-of-apps tree, [`diff::diff`] classifies
//! desired against live state, and [`pipeline::Reconciler`] runs one
//! reconciliation pass, executing operations through the
//! [`orchestrator::Orchestrator`].

pub mod cluster;
pub mod diff;
pub mod error;
pub mod hashing;
pub mod orchestrator;
pub mod pipeline;
pub mod tree;

pub use cluster::DirectoryCluster;
pub use diff::{diff, render, Claims, ResourceDiff, ResourceTextDiff};
pub use error::SyncError;
pub use orchestrator::{CancelToken, OperationReport, Orchestrator, SyncRequest};
pub use pipeline::{decide, failed_status, Decision, Hold, Reconciler};
pub use tree::{resolve, resolve_from, Resolved, TreeNode};
