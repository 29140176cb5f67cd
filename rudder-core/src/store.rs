//! On-disk controller state.
//!
//! # Storage layout
//!
//! ```text
//! <home>/.rudder/
//!   config.yaml          (optional controller config)
//!   apps/
//!     <name>.yaml        (root Application definitions, .yml also read)
//!   status/
//!     <name>.json        (one AppRecord per Application, roots and children)
//! ```
//!
//! Every function takes an explicit `home`; callers resolve it once with
//! [`home_dir`].
//!
//! Status records are the arena for the whole app-of-apps forest: children
//! reference their parent by name, never by pointer. Every write goes through
//! a `.tmp` sibling and `rename`, so a crash never leaves a half-written
//! record behind.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde_json::Value;

use crate::error::{io_err, StoreError};
use crate::manifest::{application_from_document, to_document};
use crate::types::{AppName, AppRecord, Application};

// ---------------------------------------------------------------------------
// 1. Path helpers
// ---------------------------------------------------------------------------

/// The user's home directory.
pub fn home_dir() -> Result<PathBuf, StoreError> {
    dirs::home_dir().ok_or(StoreError::HomeNotFound)
}

/// `<home>/.rudder`
pub fn rudder_root(home: &Path) -> PathBuf {
    home.join(".rudder")
}

/// `<home>/.rudder/apps`
pub fn apps_dir_at(home: &Path) -> PathBuf {
    rudder_root(home).join("apps")
}

/// `<home>/.rudder/status`
pub fn status_dir_at(home: &Path) -> PathBuf {
    rudder_root(home).join("status")
}

/// `<home>/.rudder/apps/<name>.yaml`. Pure, no I/O.
pub fn root_app_path_at(home: &Path, name: &AppName) -> PathBuf {
    apps_dir_at(home).join(format!("{}.yaml", name.0))
}

/// `<home>/.rudder/status/<name>.json`. Pure, no I/O.
pub fn record_path_at(home: &Path, name: &AppName) -> PathBuf {
    status_dir_at(home).join(format!("{}.json", name.0))
}

// ---------------------------------------------------------------------------
// 2. Root application definitions
// ---------------------------------------------------------------------------

/// A root Application and the file it was loaded from.
#[derive(Debug, Clone, PartialEq)]
pub struct RootDefinition {
    pub path: PathBuf,
    pub app: Application,
}

/// Outcome of scanning `<home>/.rudder/apps`.
///
/// A file that cannot be loaded never hides the others: its error is kept
/// in `errors` and every name it might declare lands in `unreadable`, so
/// callers can avoid treating that root as removed.
#[derive(Debug, Default)]
pub struct RootScan {
    /// Loaded definitions, sorted by name.
    pub definitions: Vec<RootDefinition>,
    /// One error per rejected file, in file-name order.
    pub errors: Vec<StoreError>,
    /// File stems of rejected files, plus `metadata.name` where readable.
    pub unreadable: BTreeSet<AppName>,
}

impl RootScan {
    pub fn apps(&self) -> Vec<Application> {
        self.definitions.iter().map(|d| d.app.clone()).collect()
    }

    pub fn find(&self, name: &AppName) -> Option<&RootDefinition> {
        self.definitions.iter().find(|d| &d.app.name == name)
    }

    /// The definition loaded from `path`, if that file is a valid root.
    pub fn by_path(&self, path: &Path) -> Option<&RootDefinition> {
        self.definitions.iter().find(|d| d.path == path)
    }
}

/// Scan every root definition under `<home>/.rudder/apps` (`.yaml` and
/// `.yml`).
///
/// Only a missing or unreadable directory is an error. When two files
/// declare the same name the first in file-name order wins and the other is
/// reported as a duplicate.
pub fn scan_root_apps_at(home: &Path) -> Result<RootScan, StoreError> {
    let mut scan = RootScan::default();
    let mut seen: BTreeMap<AppName, PathBuf> = BTreeMap::new();
    for path in definition_files(home)? {
        match load_definition(&path) {
            Ok(app) => {
                if let Some(first) = seen.get(&app.name) {
                    scan.errors.push(StoreError::Parse {
                        message: format!(
                            "duplicate application '{}' (already defined in {})",
                            app.name,
                            first.display()
                        ),
                        path,
                    });
                    continue;
                }
                seen.insert(app.name.clone(), path.clone());
                scan.definitions.push(RootDefinition { path, app });
            }
            Err(err) => {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    scan.unreadable.insert(AppName::from(stem));
                }
                if let Some(name) = declared_name(&path) {
                    scan.unreadable.insert(name);
                }
                scan.errors.push(err);
            }
        }
    }
    scan.definitions.sort_by(|a, b| a.app.name.cmp(&b.app.name));
    Ok(scan)
}

/// `.yaml`/`.yml` files in the apps directory, sorted by file name.
fn definition_files(home: &Path) -> Result<Vec<PathBuf>, StoreError> {
    let dir = apps_dir_at(home);
    if !dir.exists() {
        return Ok(vec![]);
    }
    let mut files: Vec<PathBuf> = std::fs::read_dir(&dir)
        .map_err(|e| io_err(&dir, e))?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .map(|e| e.path())
        .filter(|path| {
            matches!(
                path.extension().and_then(|ext| ext.to_str()),
                Some("yaml") | Some("yml")
            )
        })
        .collect();
    files.sort();
    Ok(files)
}

fn load_definition(path: &Path) -> Result<Application, StoreError> {
    let contents = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
    let doc: Value = serde_yaml::from_str(&contents).map_err(|e| StoreError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    application_from_document(&doc).map_err(|source| StoreError::Definition {
        path: path.to_path_buf(),
        source,
    })
}

/// `metadata.name` of a definition file, without validating the rest.
fn declared_name(path: &Path) -> Option<AppName> {
    let contents = std::fs::read_to_string(path).ok()?;
    let doc: Value = serde_yaml::from_str(&contents).ok()?;
    doc.pointer("/metadata/name")
        .and_then(Value::as_str)
        .map(AppName::from)
}

/// Atomically write a root Application definition. Returns its path.
pub fn save_root_app_at(home: &Path, app: &Application) -> Result<PathBuf, StoreError> {
    let dir = apps_dir_at(home);
    ensure_dir(&dir)?;
    let path = root_app_path_at(home, &app.name);
    let yaml = serde_yaml::to_string(&to_document(app))?;
    write_atomic(&path, yaml.as_bytes())?;
    Ok(path)
}

/// Remove every definition file declaring `name`, whatever its file name
/// or extension, plus `apps/<name>.yaml`. Returns `false` if none existed.
pub fn remove_root_app_at(home: &Path, name: &AppName) -> Result<bool, StoreError> {
    let mut removed = remove_if_exists(&root_app_path_at(home, name))?;
    for path in definition_files(home)? {
        if declared_name(&path).as_ref() == Some(name) {
            removed |= remove_if_exists(&path)?;
        }
    }
    Ok(removed)
}

// ---------------------------------------------------------------------------
// 3. Status records
// ---------------------------------------------------------------------------

/// Load the record for `name`; [`StoreError::NotFound`] if absent.
pub fn load_record_at(home: &Path, name: &AppName) -> Result<AppRecord, StoreError> {
    let path = record_path_at(home, name);
    if !path.exists() {
        return Err(StoreError::NotFound {
            name: name.0.clone(),
        });
    }
    let contents = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
    serde_json::from_str(&contents).map_err(|e| StoreError::Parse {
        path,
        message: e.to_string(),
    })
}

/// Atomically persist `record`, stamping `updated_at`.
pub fn save_record_at(home: &Path, record: &mut AppRecord) -> Result<(), StoreError> {
    ensure_dir(&status_dir_at(home))?;
    record.updated_at = Utc::now();
    let json = serde_json::to_string_pretty(record)?;
    write_atomic(&record_path_at(home, &record.app.name), json.as_bytes())
}

/// Delete the record for `name`. Returns `false` if it did not exist.
pub fn delete_record_at(home: &Path, name: &AppName) -> Result<bool, StoreError> {
    remove_if_exists(&record_path_at(home, name))
}

/// Every stored record, sorted by name.
///
/// Unreadable records are skipped with a warning so one corrupt file cannot
/// stop the controller from resuming the rest.
pub fn list_records_at(home: &Path) -> Result<Vec<AppRecord>, StoreError> {
    let dir = status_dir_at(home);
    if !dir.exists() {
        return Ok(vec![]);
    }
    let mut names: Vec<AppName> = std::fs::read_dir(&dir)
        .map_err(|e| io_err(&dir, e))?
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let path = e.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                return None;
            }
            path.file_stem()
                .and_then(|s| s.to_str())
                .map(AppName::from)
        })
        .collect();
    names.sort();

    let mut records = Vec::with_capacity(names.len());
    for name in names {
        match load_record_at(home, &name) {
            Ok(record) => records.push(record),
            Err(err) => tracing::warn!(app = %name, error = %err, "skipping unreadable status record"),
        }
    }
    Ok(records)
}

// ---------------------------------------------------------------------------
// Private helpers
// ---------------------------------------------------------------------------

fn ensure_dir(dir: &Path) -> Result<(), StoreError> {
    if !dir.exists() {
        std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
        set_dir_permissions(dir)?;
    }
    Ok(())
}

/// Write flow: `<path>.tmp` → `chmod 0600` → `rename`.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!("{file_name}.tmp"));
    std::fs::write(&tmp, bytes).map_err(|e| io_err(&tmp, e))?;
    set_file_permissions(&tmp)?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(io_err(path, e));
    }
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<bool, StoreError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(io_err(path, e)),
    }
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), StoreError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
        .map_err(|e| io_err(path, e))
}
#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), StoreError> {
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), StoreError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|e| io_err(path, e))
}
#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), StoreError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
