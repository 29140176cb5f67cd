pub mod app;
pub mod daemon;
pub mod delete;
pub mod diff;
pub mod sync;
pub mod terminate;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::Value;

use rudder_daemon::{execute_local, is_running, request, DaemonRequest};

pub(crate) fn home() -> Result<PathBuf> {
    rudder_core::store::home_dir().context("could not determine home directory")
}

/// Send `req` to the running daemon, or execute it in-process when none is
/// listening.
pub(crate) fn send(home: &Path, req: DaemonRequest) -> Result<Value> {
    let cmd = req.name();
    if is_running(home) {
        request(home, &req).with_context(|| format!("daemon rejected '{cmd}'"))
    } else {
        execute_local(home, req).with_context(|| format!("'{cmd}' failed"))
    }
}
