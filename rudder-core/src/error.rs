//! Error types for rudder-core.

use std::path::PathBuf;

use thiserror::Error;

/// Errors from reading or writing the controller's on-disk state.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying I/O failure, annotated with the path involved.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON error while encoding a status record.
    #[error("status JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML error while encoding config or an application definition.
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// A stored file exists but could not be decoded.
    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    /// An application definition file is structurally invalid.
    #[error("invalid application definition at {path}: {source}")]
    Definition {
        path: PathBuf,
        #[source]
        source: ManifestError,
    },

    /// No status record exists for the application.
    #[error("application '{name}' not found")]
    NotFound { name: String },

    /// `dirs::home_dir()` returned `None`.
    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,
}

/// Errors raised while interpreting a manifest document.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ManifestError {
    #[error("document is not a mapping")]
    NotAMapping,

    #[error("document is missing required field `{field}`")]
    MissingField { field: &'static str },

    #[error("invalid application spec for '{name}': {message}")]
    InvalidApplication { name: String, message: String },

    #[error("invalid duration '{value}'")]
    InvalidDuration { value: String },

    #[error("invalid sync option '{value}'")]
    InvalidSyncOption { value: String },

    #[error("invalid sync wave '{value}' on {resource}")]
    InvalidWave { resource: String, value: String },
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> StoreError {
    StoreError::Io {
        path: path.into(),
        source,
    }
}
