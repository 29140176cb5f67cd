//! `rudder diff <name>`: unified diffs of live against desired state.

use anyhow::{Context, Result};
use clap::Args;
use serde::Deserialize;

use rudder_core::{DiffClass, ResourceKey};
use rudder_daemon::DaemonRequest;

/// Arguments for `rudder diff`.
#[derive(Args, Debug)]
pub struct DiffArgs {
    /// Application to diff.
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct RenderedDiff {
    key: ResourceKey,
    class: DiffClass,
    unified_diff: String,
}

impl DiffArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home()?;
        let payload = super::send(
            &home,
            DaemonRequest::Diff {
                app: self.name.clone(),
            },
        )?;
        let diffs: Vec<RenderedDiff> =
            serde_json::from_value(payload).context("daemon returned a malformed diff")?;

        if diffs.is_empty() {
            println!("No differences for '{}'.", self.name);
            return Ok(());
        }

        for diff in diffs {
            header_line(&diff);
            print!("{}", diff.unified_diff);
            if !diff.unified_diff.ends_with('\n') {
                println!();
            }
        }
        Ok(())
    }
}

fn header_line(diff: &RenderedDiff) {
    let key = &diff.key;
    if key.namespace.is_empty() {
        println!("# {} {} ({})", key.kind, key.name, diff.class);
    } else {
        println!("# {} {}/{} ({})", key.kind, key.namespace, key.name, diff.class);
    }
}
