//! A [`LiveState`] adapter that keeps the target environment on disk.
//!
//! Layout under the cluster root:
//!
//! ```text
//! <root>/<server>/<namespace>/<Kind>/<name>.yaml
//! <root>/<server>/_cluster/<Kind>/<name>.yaml   (cluster-scoped kinds)
//! ```
//!
//! Writes follow the same `.tmp` + rename protocol as the status store so a
//! crash never leaves a truncated object. Applied objects receive
//! server-managed metadata (`uid`, `resourceVersion`, `generation`,
//! `creationTimestamp`); an existing `status` stanza is preserved across
//! applies, as a real environment would.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use rudder_core::{ApplyError, Destination, LiveState, Resource, ResourceKey};

use crate::error::{io_err, SyncError};

const CLUSTER_SCOPE_DIR: &str = "_cluster";

/// Directory-backed target environment.
#[derive(Debug, Clone)]
pub struct DirectoryCluster {
    root: PathBuf,
}

impl DirectoryCluster {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn server_dir(&self, destination: &Destination) -> PathBuf {
        let server = if destination.server.is_empty() {
            "default".to_string()
        } else {
            sanitize(&destination.server)
        };
        self.root.join(server)
    }

    /// `<root>/<server>/<namespace|_cluster>/<Kind>/<name>.yaml`. Pure, no I/O.
    pub fn object_path(&self, destination: &Destination, key: &ResourceKey) -> PathBuf {
        let scope = if key.namespace.is_empty() {
            CLUSTER_SCOPE_DIR.to_string()
        } else {
            sanitize(&key.namespace)
        };
        self.server_dir(destination)
            .join(scope)
            .join(sanitize(&key.kind))
            .join(format!("{}.yaml", sanitize(&key.name)))
    }

    fn read_scope(&self, dir: &Path, out: &mut Vec<Resource>) -> Result<(), SyncError> {
        if !dir.exists() {
            return Ok(());
        }
        let mut kinds: Vec<PathBuf> = std::fs::read_dir(dir)
            .map_err(|e| io_err(dir, e))?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_dir())
            .collect();
        kinds.sort();
        for kind_dir in kinds {
            let mut files: Vec<PathBuf> = std::fs::read_dir(&kind_dir)
                .map_err(|e| io_err(&kind_dir, e))?
                .filter_map(|e| e.ok().map(|e| e.path()))
                .filter(|p| p.extension().and_then(|x| x.to_str()) == Some("yaml"))
                .collect();
            files.sort();
            for file in files {
                let text = std::fs::read_to_string(&file).map_err(|e| io_err(&file, e))?;
                let manifest: Value = serde_yaml::from_str(&text)?;
                match Resource::from_manifest(manifest, "") {
                    Ok(resource) => out.push(resource),
                    Err(err) => {
                        tracing::warn!(path = %file.display(), error = %err, "ignoring unreadable live object")
                    }
                }
            }
        }
        Ok(())
    }

    fn list_sync(&self, destination: &Destination) -> Result<Vec<Resource>, SyncError> {
        let server = self.server_dir(destination);
        let mut out = Vec::new();
        self.read_scope(&server.join(CLUSTER_SCOPE_DIR), &mut out)?;
        if !destination.namespace.is_empty() {
            self.read_scope(&server.join(sanitize(&destination.namespace)), &mut out)?;
        }
        Ok(out)
    }

    fn apply_sync(&self, destination: &Destination, resource: &Resource) -> Result<(), SyncError> {
        let path = self.object_path(destination, &resource.key);
        let previous: Option<Value> = match std::fs::read_to_string(&path) {
            Ok(text) => Some(serde_yaml::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(io_err(&path, e)),
        };

        let mut manifest = resource.manifest.clone();
        if let Some(map) = manifest.as_object_mut() {
            map.remove("status");
            if let Some(status) = previous.as_ref().and_then(|p| p.get("status")) {
                map.insert("status".to_string(), status.clone());
            }
        }
        let version = previous
            .as_ref()
            .and_then(|p| p.pointer("/metadata/resourceVersion"))
            .and_then(Value::as_str)
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0)
            + 1;
        let generation = previous
            .as_ref()
            .and_then(|p| p.pointer("/metadata/generation"))
            .and_then(Value::as_u64)
            .unwrap_or(0)
            + 1;
        let uid = previous
            .as_ref()
            .and_then(|p| p.pointer("/metadata/uid").cloned())
            .unwrap_or_else(|| json!(new_uid(&resource.key)));
        let created = previous
            .as_ref()
            .and_then(|p| p.pointer("/metadata/creationTimestamp").cloned())
            .unwrap_or_else(|| json!(Utc::now().to_rfc3339()));
        if let Some(meta) = manifest.get_mut("metadata").and_then(Value::as_object_mut) {
            meta.insert("uid".to_string(), uid);
            meta.insert("resourceVersion".to_string(), json!(version.to_string()));
            meta.insert("generation".to_string(), json!(generation));
            meta.insert("creationTimestamp".to_string(), created);
        }

        let yaml = serde_yaml::to_string(&manifest)?;
        write_atomic(&path, &yaml)
    }

    fn delete_sync(&self, destination: &Destination, key: &ResourceKey) -> Result<(), SyncError> {
        let path = self.object_path(destination, key);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err(&path, e)),
        }
    }
}

#[async_trait]
impl LiveState for DirectoryCluster {
    async fn list(&self, destination: &Destination) -> Result<Vec<Resource>, ApplyError> {
        self.list_sync(destination).map_err(transient)
    }

    async fn apply(&self, destination: &Destination, resource: &Resource) -> Result<(), ApplyError> {
        if resource.manifest.get("apiVersion").is_none() {
            return Err(ApplyError::Rejected(format!(
                "{} has no apiVersion",
                resource.key
            )));
        }
        self.apply_sync(destination, resource).map_err(transient)?;
        tracing::debug!(resource = %resource.key, "applied");
        Ok(())
    }

    async fn delete(&self, destination: &Destination, key: &ResourceKey) -> Result<(), ApplyError> {
        self.delete_sync(destination, key).map_err(transient)?;
        tracing::debug!(resource = %key, "deleted");
        Ok(())
    }
}

fn transient(err: SyncError) -> ApplyError {
    ApplyError::Transient(err.to_string())
}

fn sanitize(segment: &str) -> String {
    segment
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn new_uid(key: &ResourceKey) -> String {
    let mut h = Sha256::new();
    h.update(key.to_string().as_bytes());
    h.update(Utc::now().timestamp_nanos_opt().unwrap_or_default().to_le_bytes());
    let digest = hex::encode(h.finalize());
    format!(
        "{}-{}-{}-{}-{}",
        &digest[0..8],
        &digest[8..12],
        &digest[12..16],
        &digest[16..20],
        &digest[20..32]
    )
}

fn write_atomic(path: &Path, content: &str) -> Result<(), SyncError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
    }
    let tmp = PathBuf::from(format!("{}.tmp", path.display()));
    std::fs::write(&tmp, content).map_err(|e| io_err(&tmp, e))?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(io_err(path, e));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn dest() -> Destination {
        Destination {
            server: "https://kubernetes.default.svc".into(),
            namespace: "shop".into(),
        }
    }

    fn svc() -> Resource {
        Resource::from_manifest(
            json!({"apiVersion": "v1", "kind": "Service", "metadata": {"name": "web"}, "spec": {"port": 80}}),
            "shop",
        )
        .expect("resource")
    }

    #[tokio::test]
    async fn apply_list_delete_roundtrip() {
        let root = TempDir::new().expect("root");
        let cluster = DirectoryCluster::new(root.path());
        cluster.apply(&dest(), &svc()).await.expect("apply");
        cluster.apply(&dest(), &Resource::namespace("shop")).await.expect("apply ns");

        let path = cluster.object_path(&dest(), &svc().key);
        assert!(path.ends_with("https___kubernetes.default.svc/shop/Service/web.yaml"));
        assert!(!PathBuf::from(format!("{}.tmp", path.display())).exists());

        let live = cluster.list(&dest()).await.expect("list");
        let keys: Vec<_> = live.iter().map(|r| r.key.clone()).collect();
        assert_eq!(keys, vec![ResourceKey::namespace("shop"), svc().key]);
        assert_eq!(live[1].manifest["metadata"]["generation"], json!(1));

        cluster.delete(&dest(), &svc().key).await.expect("delete");
        cluster.delete(&dest(), &svc().key).await.expect("delete absent");
        assert_eq!(cluster.list(&dest()).await.expect("list").len(), 1);
    }

    #[tokio::test]
    async fn reapply_keeps_uid_and_status() {
        let root = TempDir::new().expect("root");
        let cluster = DirectoryCluster::new(root.path());
        cluster.apply(&dest(), &svc()).await.expect("apply");
        let path = cluster.object_path(&dest(), &svc().key);
        let mut live: Value = serde_yaml::from_str(&std::fs::read_to_string(&path).expect("read")).expect("yaml");
        let uid = live["metadata"]["uid"].clone();
        live["status"] = json!({"loadBalancer": {"ingress": [{"ip": "10.0.0.1"}]}});
        std::fs::write(&path, serde_yaml::to_string(&live).expect("yaml")).expect("write");

        cluster.apply(&dest(), &svc()).await.expect("reapply");
        let live = cluster.list(&dest()).await.expect("list").remove(0);
        assert_eq!(live.manifest["metadata"]["uid"], uid);
        assert_eq!(live.manifest["metadata"]["resourceVersion"], json!("2"));
        assert_eq!(live.manifest["status"]["loadBalancer"]["ingress"][0]["ip"], json!("10.0.0.1"));
    }

    #[tokio::test]
    async fn missing_api_version_is_rejected() {
        let root = TempDir::new().expect("root");
        let cluster = DirectoryCluster::new(root.path());
        let bare = Resource::from_manifest(json!({"kind": "ConfigMap", "metadata": {"name": "c"}}), "shop")
            .expect("resource");
        assert!(matches!(
            cluster.apply(&dest(), &bare).await,
            Err(ApplyError::Rejected(_))
        ));
    }
}
