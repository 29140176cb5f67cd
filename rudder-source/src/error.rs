//! Error types for rudder-source.

use std::path::PathBuf;

use rudder_core::{AppName, FetchError, ManifestError, ResourceKey};
use thiserror::Error;

/// Errors from reading a manifest directory.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The repository root does not exist or is not a directory.
    #[error("repository not found at {path}")]
    RepoNotFound { path: PathBuf },

    /// The application path inside the repository does not exist.
    #[error("path '{path}' does not exist in repository {repo}")]
    PathNotFound { repo: PathBuf, path: String },

    /// The requested revision does not match the repository content.
    #[error("revision '{requested}' not found (repository is at {actual})")]
    RevisionMismatch { requested: String, actual: String },

    /// A manifest file could not be decoded.
    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> SourceError {
    SourceError::Io {
        path: path.into(),
        source,
    }
}

impl SourceError {
    /// Classify into the adapter-facing [`FetchError`].
    pub fn into_fetch_error(self, repo: &str) -> FetchError {
        let repo = repo.to_string();
        match self {
            SourceError::RepoNotFound { .. } | SourceError::Io { .. } => FetchError::Unreachable {
                repo,
                message: self.to_string(),
            },
            SourceError::RevisionMismatch { requested, .. } => FetchError::InvalidRevision {
                repo,
                revision: requested,
            },
            SourceError::PathNotFound { ref path, .. } => FetchError::InvalidManifest {
                location: path.clone(),
                message: self.to_string(),
            },
            SourceError::Parse { ref path, ref message } => FetchError::InvalidManifest {
                location: path.display().to_string(),
                message: message.clone(),
            },
        }
    }
}

/// A desired-state document set that cannot be partitioned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DocumentError {
    #[error("document #{index}: {source}")]
    Invalid {
        index: usize,
        #[source]
        source: ManifestError,
    },

    #[error("resource {key} is declared more than once")]
    DuplicateResource { key: ResourceKey },

    #[error("application '{name}' is declared more than once")]
    DuplicateApplication { name: AppName },
}
