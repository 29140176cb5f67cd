//! Controller configuration, read from `<home>/.rudder/config.yaml`.
//!
//! Every field has a default, so an absent or partial file is valid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{io_err, StoreError};
use crate::store::rudder_root;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Cadence of scheduled reconciliation passes.
    #[serde(with = "crate::duration::serde_str")]
    pub poll_interval: Duration,
    /// Reconciliation passes allowed to run in parallel.
    pub workers: usize,
    /// Upper bound on a single sync operation's Running state.
    #[serde(with = "crate::duration::serde_str")]
    pub max_operation_duration: Duration,
    /// Depth at which app-of-apps resolution gives up.
    pub max_tree_depth: usize,
    /// How long a workload may stay Progressing before it is Degraded.
    #[serde(with = "crate::duration::serde_str")]
    pub progress_deadline: Duration,
    /// Root of the directory-backed target environment.
    pub cluster_root: Option<PathBuf>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(180),
            workers: 4,
            max_operation_duration: Duration::from_secs(600),
            max_tree_depth: 16,
            progress_deadline: Duration::from_secs(600),
            cluster_root: None,
        }
    }
}

impl ControllerConfig {
    /// Resolved cluster root: configured value or `<home>/.rudder/cluster`.
    pub fn cluster_root_at(&self, home: &Path) -> PathBuf {
        self.cluster_root
            .clone()
            .unwrap_or_else(|| rudder_root(home).join("cluster"))
    }
}

/// `<home>/.rudder/config.yaml`
pub fn config_path_at(home: &Path) -> PathBuf {
    rudder_root(home).join("config.yaml")
}

/// Load the config, falling back to defaults when the file is absent.
pub fn load_at(home: &Path) -> Result<ControllerConfig, StoreError> {
    let path = config_path_at(home);
    if !path.exists() {
        return Ok(ControllerConfig::default());
    }
    let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
    if contents.trim().is_empty() {
        return Ok(ControllerConfig::default());
    }
    let config: ControllerConfig =
        serde_yaml::from_str(&contents).map_err(|e| StoreError::Parse {
            path: path.clone(),
            message: e.to_string(),
        })?;
    if config.workers == 0 {
        return Err(StoreError::Parse {
            path,
            message: "workers must be at least 1".to_string(),
        });
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_config(home: &Path, body: &str) {
        let path = config_path_at(home);
        std::fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        std::fs::write(path, body).expect("write");
    }

    #[test]
    fn defaults_when_missing() {
        let home = TempDir::new().expect("home");
        let config = load_at(home.path()).expect("load");
        assert_eq!(config, ControllerConfig::default());
        assert!(config
            .cluster_root_at(home.path())
            .ends_with(".rudder/cluster"));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let home = TempDir::new().expect("home");
        write_config(home.path(), "poll_interval: 30s\nworkers: 8\n");
        let config = load_at(home.path()).expect("load");
        assert_eq!(config.poll_interval, Duration::from_secs(30));
        assert_eq!(config.workers, 8);
        assert_eq!(config.max_tree_depth, 16);
    }

    #[test]
    fn malformed_duration_is_a_parse_error_with_path() {
        let home = TempDir::new().expect("home");
        write_config(home.path(), "poll_interval: soon\n");
        let err = load_at(home.path()).unwrap_err();
        assert!(matches!(err, StoreError::Parse { .. }));
        assert!(err.to_string().contains("config.yaml"));
    }

    #[test]
    fn zero_workers_rejected() {
        let home = TempDir::new().expect("home");
        write_config(home.path(), "workers: 0\n");
        assert!(load_at(home.path()).is_err());
    }
}
