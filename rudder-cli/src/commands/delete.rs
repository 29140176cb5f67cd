//! `rudder delete <name> [--cascade]`.

use anyhow::Result;
use clap::Args;

use rudder_daemon::DaemonRequest;

/// Arguments for `rudder delete`.
#[derive(Args, Debug)]
pub struct DeleteArgs {
    /// Application to delete.
    pub name: String,

    /// Also delete managed resources and every descendant Application.
    #[arg(long)]
    pub cascade: bool,
}

impl DeleteArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home()?;
        let payload = super::send(
            &home,
            DaemonRequest::Delete {
                app: self.name.clone(),
                cascade: self.cascade,
            },
        )?;

        let deleted: Vec<&str> = payload["deleted"]
            .as_array()
            .map(|names| names.iter().filter_map(|n| n.as_str()).collect())
            .unwrap_or_default();
        for name in &deleted {
            println!("deleted '{name}'");
        }
        if !self.cascade {
            println!("managed resources of '{}' were left in place", self.name);
        }
        Ok(())
    }
}
