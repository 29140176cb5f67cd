//! In-memory adapters.
//!
//! [`MemorySource`] and [`MemoryCluster`] stand in for a repository and a
//! target environment. Both support fault injection so retry, conflict and
//! failure paths can be exercised deterministically.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};

use crate::adapter::{ApplyError, DesiredState, FetchError, LiveState, StateSource};
use crate::types::{Destination, Resource, ResourceKey, Source};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// MemorySource
// ---------------------------------------------------------------------------

#[derive(Default)]
struct SourceState {
    snapshots: HashMap<String, DesiredState>,
    failures: HashMap<String, VecDeque<FetchError>>,
    fetches: usize,
}

/// Desired state keyed by `(repo_url, path)`.
#[derive(Default)]
pub struct MemorySource {
    state: Mutex<SourceState>,
}

fn source_key(repo: &str, path: &str) -> String {
    format!("{repo}#{path}")
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `documents` at `revision` for `(repo, path)`.
    pub fn set(&self, repo: &str, path: &str, revision: &str, documents: Vec<Value>) {
        lock(&self.state).snapshots.insert(
            source_key(repo, path),
            DesiredState {
                revision: revision.to_string(),
                documents,
            },
        );
    }

    /// Make the next fetch of `(repo, path)` fail with `error`.
    pub fn fail_next(&self, repo: &str, path: &str, error: FetchError) {
        lock(&self.state)
            .failures
            .entry(source_key(repo, path))
            .or_default()
            .push_back(error);
    }

    pub fn fetch_count(&self) -> usize {
        lock(&self.state).fetches
    }
}

#[async_trait]
impl StateSource for MemorySource {
    async fn fetch(&self, source: &Source) -> Result<DesiredState, FetchError> {
        let mut state = lock(&self.state);
        state.fetches += 1;
        let key = source_key(&source.repo_url, &source.path);
        if let Some(err) = state.failures.get_mut(&key).and_then(VecDeque::pop_front) {
            return Err(err);
        }
        state
            .snapshots
            .get(&key)
            .cloned()
            .ok_or_else(|| FetchError::InvalidRevision {
                repo: source.repo_url.clone(),
                revision: source.target_revision.clone(),
            })
    }
}

// ---------------------------------------------------------------------------
// MemoryCluster
// ---------------------------------------------------------------------------

/// A call observed by [`MemoryCluster`], in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterCall {
    List,
    Apply(ResourceKey),
    Delete(ResourceKey),
}

#[derive(Default)]
struct ClusterState {
    objects: BTreeMap<ResourceKey, Value>,
    scripted: HashMap<ResourceKey, VecDeque<ApplyError>>,
    rejected: HashMap<ResourceKey, String>,
    unreachable: bool,
    calls: Vec<ClusterCall>,
    next_version: u64,
}

/// A target environment held in memory.
///
/// Applied objects get server-managed metadata (`uid`, `resourceVersion`,
/// `generation`, `creationTimestamp`) and keep any `status` previously set
/// with [`MemoryCluster::set_status`].
#[derive(Default)]
pub struct MemoryCluster {
    state: Mutex<ClusterState>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue errors returned by the next apply/delete calls for `key`.
    pub fn fail_next(&self, key: &ResourceKey, errors: impl IntoIterator<Item = ApplyError>) {
        lock(&self.state)
            .scripted
            .entry(key.clone())
            .or_default()
            .extend(errors);
    }

    /// Reject every apply of `key` until cleared.
    pub fn reject(&self, key: &ResourceKey, message: &str) {
        lock(&self.state)
            .rejected
            .insert(key.clone(), message.to_string());
    }

    /// Make every call fail transiently while `unreachable` is set.
    pub fn set_unreachable(&self, unreachable: bool) {
        lock(&self.state).unreachable = unreachable;
    }

    /// Out-of-band create, bypassing the call log and faults.
    pub fn insert(&self, resource: Resource) {
        lock(&self.state)
            .objects
            .insert(resource.key, resource.manifest);
    }

    /// Out-of-band delete.
    pub fn remove(&self, key: &ResourceKey) -> Option<Value> {
        lock(&self.state).objects.remove(key)
    }

    /// Out-of-band edit of a live object.
    pub fn edit(&self, key: &ResourceKey, f: impl FnOnce(&mut Value)) {
        if let Some(obj) = lock(&self.state).objects.get_mut(key) {
            f(obj);
        }
    }

    /// Replace the `status` stanza of a live object.
    pub fn set_status(&self, key: &ResourceKey, status: Value) {
        self.edit(key, |obj| {
            if let Some(map) = obj.as_object_mut() {
                map.insert("status".to_string(), status);
            }
        });
    }

    pub fn get(&self, key: &ResourceKey) -> Option<Value> {
        lock(&self.state).objects.get(key).cloned()
    }

    pub fn keys(&self) -> Vec<ResourceKey> {
        lock(&self.state).objects.keys().cloned().collect()
    }

    pub fn calls(&self) -> Vec<ClusterCall> {
        lock(&self.state).calls.clone()
    }

    /// Mutating calls only, in order.
    pub fn mutations(&self) -> Vec<ClusterCall> {
        self.calls()
            .into_iter()
            .filter(|c| !matches!(c, ClusterCall::List))
            .collect()
    }

    pub fn clear_calls(&self) {
        lock(&self.state).calls.clear();
    }
}

fn take_fault(state: &mut ClusterState, key: &ResourceKey) -> Option<ApplyError> {
    if state.unreachable {
        return Some(ApplyError::Transient("environment unreachable".to_string()));
    }
    state.scripted.get_mut(key).and_then(VecDeque::pop_front)
}

#[async_trait]
impl LiveState for MemoryCluster {
    async fn list(&self, destination: &Destination) -> Result<Vec<Resource>, ApplyError> {
        let mut state = lock(&self.state);
        state.calls.push(ClusterCall::List);
        if state.unreachable {
            return Err(ApplyError::Transient("environment unreachable".to_string()));
        }
        Ok(state
            .objects
            .iter()
            .filter(|(key, _)| key.namespace.is_empty() || key.namespace == destination.namespace)
            .map(|(key, manifest)| Resource {
                key: key.clone(),
                manifest: manifest.clone(),
            })
            .collect())
    }

    async fn apply(&self, _destination: &Destination, resource: &Resource) -> Result<(), ApplyError> {
        let mut state = lock(&self.state);
        state.calls.push(ClusterCall::Apply(resource.key.clone()));
        if let Some(err) = take_fault(&mut state, &resource.key) {
            return Err(err);
        }
        if let Some(message) = state.rejected.get(&resource.key) {
            return Err(ApplyError::Rejected(message.clone()));
        }

        state.next_version += 1;
        let version = state.next_version;
        let previous = state.objects.get(&resource.key).cloned();

        let mut manifest = resource.manifest.clone();
        if let Some(map) = manifest.as_object_mut() {
            map.remove("status");
            if let Some(status) = previous.as_ref().and_then(|p| p.get("status")) {
                map.insert("status".to_string(), status.clone());
            }
        }
        let uid = previous
            .as_ref()
            .and_then(|p| p.pointer("/metadata/uid").cloned())
            .unwrap_or_else(|| json!(format!("uid-{version}")));
        let created = previous
            .as_ref()
            .and_then(|p| p.pointer("/metadata/creationTimestamp").cloned())
            .unwrap_or_else(|| json!(Utc::now().to_rfc3339()));
        let generation = previous
            .as_ref()
            .and_then(|p| p.pointer("/metadata/generation"))
            .and_then(Value::as_u64)
            .unwrap_or(0)
            + 1;
        if let Some(meta) = manifest
            .get_mut("metadata")
            .and_then(Value::as_object_mut)
        {
            meta.insert("uid".to_string(), uid);
            meta.insert("resourceVersion".to_string(), json!(version.to_string()));
            meta.insert("generation".to_string(), json!(generation));
            meta.insert("creationTimestamp".to_string(), created);
        }

        state.objects.insert(resource.key.clone(), manifest);
        Ok(())
    }

    async fn delete(&self, _destination: &Destination, key: &ResourceKey) -> Result<(), ApplyError> {
        let mut state = lock(&self.state);
        state.calls.push(ClusterCall::Delete(key.clone()));
        if let Some(err) = take_fault(&mut state, key) {
            return Err(err);
        }
        state.objects.remove(key);
        Ok(())
    }
}
