//! `rudder sync` and `rudder refresh`.

use anyhow::{bail, Context, Result};
use clap::Args;
use serde_json::Value;

use rudder_core::types::{ResourceOutcome, ResourceResult};
use rudder_core::AppStatus;
use rudder_daemon::DaemonRequest;

use super::app::phase_label;

/// Arguments for `rudder sync`.
#[derive(Args, Debug)]
pub struct SyncArgs {
    /// Application to sync.
    pub name: String,

    /// Plan the operation without mutating the target environment.
    #[arg(long)]
    pub dry_run: bool,

    /// Delete and re-create resources instead of updating them in place.
    #[arg(long)]
    pub force: bool,

    /// Delete managed resources that are no longer declared.
    #[arg(long)]
    pub prune: bool,
}

impl SyncArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home()?;
        let payload = super::send(
            &home,
            DaemonRequest::Sync {
                app: self.name.clone(),
                dry_run: self.dry_run,
                force: self.force,
                prune: self.prune,
            },
        )?;
        print_outcome(&self.name, &payload, true)
    }
}

/// Arguments for `rudder refresh`.
#[derive(Args, Debug)]
pub struct RefreshArgs {
    /// Application to refresh.
    pub name: String,
}

impl RefreshArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home()?;
        let payload = super::send(
            &home,
            DaemonRequest::Refresh {
                app: self.name.clone(),
            },
        )?;
        print_outcome(&self.name, &payload, false)
    }
}

fn print_outcome(name: &str, payload: &Value, manual: bool) -> Result<()> {
    if payload["coalesced"].as_bool().unwrap_or(false) {
        println!("'{name}' already has a pass in flight; request coalesced into it");
        return Ok(());
    }
    let status: AppStatus = serde_json::from_value(payload["status"].clone())
        .context("daemon returned a malformed status")?;

    println!(
        "'{name}' {} / {} at {}",
        status.sync,
        status.health,
        status.revision.as_deref().unwrap_or("-")
    );
    if let Some(failure) = &status.failure {
        println!("  {}: {}", failure.kind, failure.message);
    }

    let Some(op) = status.operation.as_ref() else {
        return Ok(());
    };
    let prefix = if op.dry_run { "[dry-run] " } else { "" };
    let label = if manual { "operation" } else { "last operation" };
    print!("{prefix}{label} {}", phase_label(op.phase));
    if op.message.is_empty() {
        println!();
    } else {
        println!(": {}", op.message);
    }
    for result in &op.resources {
        println!("  {}", resource_line(result));
    }

    if manual && op.phase.is_failure() {
        bail!("sync of '{name}' ended {}", op.phase);
    }
    Ok(())
}

fn resource_line(result: &ResourceResult) -> String {
    let key = &result.key;
    let target = if key.namespace.is_empty() {
        format!("{}/{}", key.kind, key.name)
    } else {
        format!("{}/{}/{}", key.kind, key.namespace, key.name)
    };
    let outcome = match &result.outcome {
        ResourceOutcome::Synced => "synced".to_string(),
        ResourceOutcome::Pruned => "pruned".to_string(),
        ResourceOutcome::WouldApply => "would apply".to_string(),
        ResourceOutcome::WouldPrune => "would prune".to_string(),
        ResourceOutcome::PruneSkipped { reason } => format!("prune skipped ({reason})"),
        ResourceOutcome::Skipped { reason } => format!("skipped ({reason})"),
        ResourceOutcome::Failed { reason, .. } => format!("failed: {reason}"),
    };
    format!("{:?} {target}: {outcome}", result.action)
}
