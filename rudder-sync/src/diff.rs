//! Diff engine: desired vs. live classification.
//!
//! [`diff`] is a pure function. Every key in `desired ∪ owned(live)` lands in
//! exactly one [`DiffClass`]; live resources labelled for other Applications
//! or not labelled at all are outside this Application's view unless a
//! desired resource shares their key.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use similar::TextDiff;

use rudder_core::types::{Change, DiffClass, INSTANCE_LABEL};
use rudder_core::{AppName, Resource, ResourceKey};

use crate::error::SyncError;
use crate::hashing::manifest_hash;

/// Resource keys already declared by other Applications on the same
/// destination server, from the status store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Claims {
    owners: HashMap<ResourceKey, AppName>,
}

impl Claims {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: ResourceKey, owner: AppName) {
        self.owners.entry(key).or_insert(owner);
    }

    pub fn owner(&self, key: &ResourceKey) -> Option<&AppName> {
        self.owners.get(key)
    }
}

/// Diff result for one resource key.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDiff {
    pub key: ResourceKey,
    pub class: DiffClass,
    /// Desired manifest with the tracking label applied.
    pub desired: Option<Resource>,
    pub live: Option<Resource>,
    pub desired_hash: Option<String>,
    pub live_hash: Option<String>,
    pub wave: i32,
    /// Carries the `Prune=false` keep marker (desired or live side).
    pub prune_protected: bool,
}

impl ResourceDiff {
    pub fn is_out_of_sync(&self) -> bool {
        matches!(self.class, DiffClass::OutOfSync(_))
    }
}

/// `resource` with [`INSTANCE_LABEL`] set to `app`.
pub fn tracked(app: &AppName, resource: &Resource) -> Resource {
    let mut out = resource.clone();
    out.set_label(INSTANCE_LABEL, &app.0);
    out
}

/// Classify every resource key of `app`.
///
/// Fails with [`SyncError::Conflict`] when a desired resource is owned by a
/// different Application, either through its live tracking label or through
/// `claims`. Nothing is classified in that case.
pub fn diff(
    app: &AppName,
    desired: &[Resource],
    live: &[Resource],
    ignore: &[&str],
    claims: &Claims,
) -> Result<Vec<ResourceDiff>, SyncError> {
    let live_by_key: BTreeMap<&ResourceKey, &Resource> = live.iter().map(|r| (&r.key, r)).collect();

    let mut conflicts = BTreeSet::new();
    let mut owners = BTreeSet::new();
    let mut out = Vec::with_capacity(desired.len());
    let mut seen = BTreeSet::new();

    for resource in desired {
        seen.insert(&resource.key);
        let current = live_by_key.get(&resource.key).copied();
        let foreign = current
            .and_then(Resource::owner)
            .filter(|owner| owner != app)
            .or_else(|| claims.owner(&resource.key).filter(|o| *o != app).cloned());
        if let Some(owner) = foreign {
            conflicts.insert(resource.key.clone());
            owners.insert(owner);
            continue;
        }

        let desired = tracked(app, resource);
        let desired_hash = manifest_hash(&desired.manifest, ignore);
        let live_hash = current.map(|l| manifest_hash(&l.manifest, ignore));
        let class = match &live_hash {
            None => DiffClass::OutOfSync(Change::Create),
            Some(h) if *h != desired_hash => DiffClass::OutOfSync(Change::Update),
            Some(_) => DiffClass::Unchanged,
        };
        out.push(ResourceDiff {
            key: resource.key.clone(),
            class,
            wave: resource.wave().unwrap_or(0),
            prune_protected: desired.is_prune_protected(),
            desired: Some(desired),
            live: current.cloned(),
            desired_hash: Some(desired_hash),
            live_hash,
        });
    }

    if !conflicts.is_empty() {
        return Err(SyncError::Conflict {
            app: app.clone(),
            owners: owners.into_iter().collect(),
            resources: conflicts.into_iter().collect(),
        });
    }

    for resource in live {
        if seen.contains(&resource.key) || resource.owner().as_ref() != Some(app) {
            continue;
        }
        out.push(ResourceDiff {
            key: resource.key.clone(),
            class: DiffClass::Extra,
            wave: resource.wave().unwrap_or(0),
            prune_protected: resource.is_prune_protected(),
            desired: None,
            live: Some(resource.clone()),
            desired_hash: None,
            live_hash: Some(manifest_hash(&resource.manifest, ignore)),
        });
    }

    out.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(out)
}

/// Unified text diff of one resource, for `rudder diff`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceTextDiff {
    pub key: ResourceKey,
    pub class: DiffClass,
    pub unified_diff: String,
}

/// Render every non-`Unchanged` entry as a unified diff of normalized YAML,
/// live (`a/`) against desired (`b/`).
pub fn render(diffs: &[ResourceDiff], ignore: &[&str]) -> Vec<ResourceTextDiff> {
    diffs
        .iter()
        .filter(|d| d.class != DiffClass::Unchanged)
        .map(|d| {
            let live = d
                .live
                .as_ref()
                .map(|r| to_yaml(&crate::hashing::normalize(&r.manifest, ignore)))
                .unwrap_or_default();
            let desired = d
                .desired
                .as_ref()
                .map(|r| to_yaml(&crate::hashing::normalize(&r.manifest, ignore)))
                .unwrap_or_default();
            let old_header = format!("a/{}", d.key);
            let new_header = format!("b/{}", d.key);
            let unified = TextDiff::from_lines(&live, &desired)
                .unified_diff()
                .header(&old_header, &new_header)
                .context_radius(3)
                .to_string();
            ResourceTextDiff {
                key: d.key.clone(),
                class: d.class,
                unified_diff: unified,
            }
        })
        .collect()
}

fn to_yaml(value: &serde_json::Value) -> String {
    serde_yaml::to_string(value).unwrap_or_else(|_| value.to_string())
}
