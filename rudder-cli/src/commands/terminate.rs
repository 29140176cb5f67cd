//! `rudder terminate <name>`: cancel an in-flight sync operation.

use anyhow::{Context, Result};
use clap::Args;

use rudder_daemon::{request, DaemonError, DaemonRequest};

/// Arguments for `rudder terminate`.
#[derive(Args, Debug)]
pub struct TerminateArgs {
    /// Application whose operation should stop.
    pub name: String,
}

impl TerminateArgs {
    pub fn run(self) -> Result<()> {
        let home = super::home()?;
        let payload = match request(
            &home,
            &DaemonRequest::Terminate {
                app: self.name.clone(),
            },
        ) {
            Ok(payload) => payload,
            Err(DaemonError::DaemonNotRunning { .. }) => {
                println!("daemon is not running; no operation can be in flight");
                return Ok(());
            }
            Err(err) => {
                return Err(err).with_context(|| format!("failed to terminate '{}'", self.name))
            }
        };

        if payload["terminated"].as_bool().unwrap_or(false) {
            println!("termination requested for '{}'", self.name);
        } else {
            println!("'{}' has no operation in flight", self.name);
        }
        Ok(())
    }
}
