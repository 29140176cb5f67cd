//! A [`StateSource`] over a local directory of manifests.
//!
//! `repoURL` names a directory (optionally as a `file://` URL) and `path` a
//! sub-directory inside it. Every `.yaml`, `.yml` and `.json` file below that
//! sub-directory is read in lexical path order; YAML files may hold several
//! `---`-separated documents and JSON files may hold a single object or an
//! array of objects.
//!
//! The revision of a snapshot is the first 12 hex digits of a SHA-256 over
//! the relative paths and bytes of every file read. `targetRevision` may be
//! `HEAD` (or empty) to track the current content, or a revision prefix to
//! pin it; a pin that no longer matches is an invalid revision.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use rudder_core::{DesiredState, FetchError, Source, StateSource};
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{io_err, SourceError};

/// Length of the revision identifiers produced by [`read_snapshot`].
pub const REVISION_LEN: usize = 12;

/// Directory-backed desired state.
#[derive(Debug, Clone, Default)]
pub struct DirectorySource;

impl DirectorySource {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl StateSource for DirectorySource {
    async fn fetch(&self, source: &Source) -> Result<DesiredState, FetchError> {
        let owned = source.clone();
        let result = tokio::task::spawn_blocking(move || read_snapshot(&owned)).await;
        match result {
            Ok(Ok(state)) => Ok(state),
            Ok(Err(err)) => {
                tracing::debug!(repo = %source.repo_url, error = %err, "fetch failed");
                Err(err.into_fetch_error(&source.repo_url))
            }
            Err(join) => Err(FetchError::Unreachable {
                repo: source.repo_url.clone(),
                message: join.to_string(),
            }),
        }
    }
}

/// `file:///srv/gitops` and `/srv/gitops` both name the same directory.
pub fn repo_root(repo_url: &str) -> PathBuf {
    PathBuf::from(repo_url.strip_prefix("file://").unwrap_or(repo_url))
}

/// Synchronously read the snapshot described by `source`.
pub fn read_snapshot(source: &Source) -> Result<DesiredState, SourceError> {
    let root = repo_root(&source.repo_url);
    if !root.is_dir() {
        return Err(SourceError::RepoNotFound { path: root });
    }
    let base = if source.path.is_empty() || source.path == "." {
        root.clone()
    } else {
        root.join(&source.path)
    };
    if !base.exists() {
        return Err(SourceError::PathNotFound {
            repo: root,
            path: source.path.clone(),
        });
    }

    let mut files = Vec::new();
    collect_files(&base, &mut files)?;
    files.sort();

    let mut hasher = Sha256::new();
    let mut documents = Vec::new();
    for file in &files {
        let bytes = std::fs::read(file).map_err(|e| io_err(file, e))?;
        let relative = file.strip_prefix(&root).unwrap_or(file);
        hasher.update(relative.to_string_lossy().as_bytes());
        hasher.update([0u8]);
        hasher.update(&bytes);
        hasher.update([0u8]);
        documents.extend(parse_file(file, &bytes)?);
    }
    let mut revision = hex::encode(hasher.finalize());
    revision.truncate(REVISION_LEN);

    let requested = source.target_revision.trim();
    if !(requested.is_empty() || requested == "HEAD" || revision.starts_with(requested)) {
        return Err(SourceError::RevisionMismatch {
            requested: requested.to_string(),
            actual: revision,
        });
    }

    Ok(DesiredState {
        revision,
        documents,
    })
}

fn collect_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<(), SourceError> {
    if dir.is_file() {
        out.push(dir.to_path_buf());
        return Ok(());
    }
    for entry in std::fs::read_dir(dir).map_err(|e| io_err(dir, e))? {
        let entry = entry.map_err(|e| io_err(dir, e))?;
        let path = entry.path();
        let hidden = entry.file_name().to_string_lossy().starts_with('.');
        if hidden {
            continue;
        }
        if path.is_dir() {
            collect_files(&path, out)?;
        } else if is_manifest_file(&path) {
            out.push(path);
        }
    }
    Ok(())
}

fn is_manifest_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml") | Some("json")
    )
}

/// Decode every document in one file. Empty YAML documents are dropped.
pub fn parse_file(path: &Path, bytes: &[u8]) -> Result<Vec<Value>, SourceError> {
    let parse_err = |message: String| SourceError::Parse {
        path: path.to_path_buf(),
        message,
    };

    if path.extension().and_then(|e| e.to_str()) == Some("json") {
        let value: Value = serde_json::from_slice(bytes).map_err(|e| parse_err(e.to_string()))?;
        return Ok(match value {
            Value::Array(items) => items,
            other => vec![other],
        });
    }

    let text = std::str::from_utf8(bytes).map_err(|e| parse_err(e.to_string()))?;
    let mut documents = Vec::new();
    for doc in serde_yaml::Deserializer::from_str(text) {
        let value = Value::deserialize(doc).map_err(|e| parse_err(e.to_string()))?;
        if !value.is_null() {
            documents.push(value);
        }
    }
    Ok(documents)
}
