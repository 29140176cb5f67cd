//! `rudder app`: read Application status straight from the status store.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Subcommand};
use colored::Colorize;
use tabled::{settings::Style, Table, Tabled};

use rudder_core::store::{list_records_at, load_record_at, record_path_at};
use rudder_core::{AppName, AppRecord, HealthStatus, OperationPhase, SyncStatusCode};
use rudder_daemon::summarize;

#[derive(Subcommand, Debug)]
pub enum AppCommand {
    /// List every known Application.
    List(ListArgs),
    /// Show one Application with its per-resource status.
    Get(GetArgs),
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Emit machine-readable JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Args, Debug)]
pub struct GetArgs {
    /// Application name.
    pub name: String,

    /// Emit the full status record as JSON.
    #[arg(long)]
    pub json: bool,
}

#[derive(Tabled)]
struct AppRow {
    #[tabled(rename = "name")]
    name: String,
    #[tabled(rename = "parent")]
    parent: String,
    #[tabled(rename = "sync")]
    sync: String,
    #[tabled(rename = "health")]
    health: String,
    #[tabled(rename = "revision")]
    revision: String,
    #[tabled(rename = "last operation")]
    operation: String,
    #[tabled(rename = "reconciled")]
    reconciled: String,
}

#[derive(Tabled)]
struct ResourceRow {
    #[tabled(rename = "kind")]
    kind: String,
    #[tabled(rename = "namespace")]
    namespace: String,
    #[tabled(rename = "name")]
    name: String,
    #[tabled(rename = "status")]
    status: String,
    #[tabled(rename = "health")]
    health: String,
    #[tabled(rename = "wave")]
    wave: i32,
    #[tabled(rename = "message")]
    message: String,
}

pub fn run(command: AppCommand) -> Result<()> {
    let home = super::home()?;
    match command {
        AppCommand::List(args) => {
            let records = list_records_at(&home).context("failed to read status store")?;
            if args.json {
                let rows: Vec<_> = records.iter().map(summarize).collect();
                println!(
                    "{}",
                    serde_json::to_string_pretty(&rows).context("failed to render JSON")?
                );
                return Ok(());
            }
            if records.is_empty() {
                println!("No applications. Add a definition under ~/.rudder/apps/.");
                return Ok(());
            }
            let mut table = Table::new(records.iter().map(app_row));
            table.with(Style::rounded());
            println!("{table}");
        }
        AppCommand::Get(args) => {
            let name = AppName::from(args.name.as_str());
            if !record_path_at(&home, &name).exists() {
                bail!("unknown application '{name}'");
            }
            let record = load_record_at(&home, &name)
                .with_context(|| format!("failed to load status for '{name}'"))?;
            if args.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&record).context("failed to render JSON")?
                );
                return Ok(());
            }
            print_record(&record);
        }
    }
    Ok(())
}

fn app_row(record: &AppRecord) -> AppRow {
    let status = &record.status;
    let mut name = record.app.name.to_string();
    if status.orphaned {
        name.push_str(" (orphaned)");
    }
    AppRow {
        name,
        parent: record
            .parent
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "-".to_string()),
        sync: sync_label(status.sync),
        health: health_label(status.health),
        revision: status.revision.clone().unwrap_or_else(|| "-".to_string()),
        operation: status
            .operation
            .as_ref()
            .map(|op| phase_label(op.phase))
            .unwrap_or_else(|| "-".to_string()),
        reconciled: status
            .reconciled_at
            .map(format_age)
            .unwrap_or_else(|| "never".to_string()),
    }
}

fn print_record(record: &AppRecord) {
    let app = &record.app;
    let status = &record.status;

    println!("{}  {}", "Name:".bold(), app.name);
    if let Some(parent) = &record.parent {
        println!("{}  {parent}", "Parent:".bold());
    }
    println!(
        "{}  {} @ {} ({})",
        "Source:".bold(),
        app.source.repo_url,
        app.source.target_revision,
        app.source.path
    );
    println!(
        "{}  {}/{}",
        "Destination:".bold(),
        app.destination.server,
        app.destination.namespace
    );
    println!(
        "{}  {}  {}  {}",
        "Status:".bold(),
        sync_label(status.sync),
        health_label(status.health),
        if status.orphaned {
            "orphaned".magenta().to_string()
        } else {
            String::new()
        }
    );
    println!(
        "{}  {} (synced {})",
        "Revision:".bold(),
        status.revision.as_deref().unwrap_or("-"),
        status.synced_revision.as_deref().unwrap_or("-")
    );
    if let Some(op) = &status.operation {
        let mut line = format!(
            "{} {} attempt {} ({:?})",
            phase_label(op.phase),
            op.revision,
            op.attempt,
            op.trigger
        );
        if op.dry_run {
            line.push_str(" [dry-run]");
        }
        if !op.message.is_empty() {
            line.push_str(&format!(": {}", op.message));
        }
        println!("{}  {line}", "Operation:".bold());
    }
    if let Some(failure) = &status.failure {
        println!(
            "{}  {}: {}",
            "Failure:".bold(),
            failure.kind.to_string().red(),
            failure.message
        );
    }
    if !status.children.is_empty() {
        let children: Vec<_> = status.children.iter().map(ToString::to_string).collect();
        println!("{}  {}", "Children:".bold(), children.join(", "));
    }

    if status.resources.is_empty() {
        return;
    }
    let rows: Vec<ResourceRow> = status
        .resources
        .iter()
        .map(|r| ResourceRow {
            kind: r.key.kind.clone(),
            namespace: r.key.namespace.clone(),
            name: r.key.name.clone(),
            status: r.class.to_string(),
            health: health_label(r.health),
            wave: r.wave,
            message: r
                .error
                .clone()
                .or_else(|| r.health_message.clone())
                .unwrap_or_default(),
        })
        .collect();
    let mut table = Table::new(rows);
    table.with(Style::rounded());
    println!();
    println!("{table}");
}

fn sync_label(sync: SyncStatusCode) -> String {
    match sync {
        SyncStatusCode::Synced => sync.to_string().green().to_string(),
        SyncStatusCode::OutOfSync => sync.to_string().yellow().to_string(),
        SyncStatusCode::Unknown => sync.to_string().dimmed().to_string(),
    }
}

fn health_label(health: HealthStatus) -> String {
    let text = health.to_string();
    match health {
        HealthStatus::Healthy => text.green().to_string(),
        HealthStatus::Progressing => text.cyan().to_string(),
        HealthStatus::Degraded => text.red().to_string(),
        HealthStatus::Missing => text.yellow().to_string(),
        HealthStatus::Unknown => text.dimmed().to_string(),
    }
}

pub(crate) fn phase_label(phase: OperationPhase) -> String {
    let text = phase.to_string();
    match phase {
        OperationPhase::Succeeded => text.green().to_string(),
        OperationPhase::Failed | OperationPhase::Error => text.red().to_string(),
        OperationPhase::Terminated => text.yellow().to_string(),
        OperationPhase::Pending | OperationPhase::Running => text.cyan().to_string(),
    }
}

fn format_age(at: DateTime<Utc>) -> String {
    let secs = (Utc::now() - at).num_seconds().max(0);
    match secs {
        0..=59 => format!("{secs}s ago"),
        60..=3599 => format!("{}m ago", secs / 60),
        3600..=86_399 => format!("{}h ago", secs / 3600),
        _ => format!("{}d ago", secs / 86_400),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn age_picks_the_largest_whole_unit() {
        assert_eq!(format_age(Utc::now() - Duration::seconds(5)), "5s ago");
        assert_eq!(format_age(Utc::now() - Duration::minutes(3)), "3m ago");
        assert_eq!(format_age(Utc::now() - Duration::hours(2)), "2h ago");
        assert_eq!(format_age(Utc::now() - Duration::days(4)), "4d ago");
    }

    #[test]
    fn future_timestamps_clamp_to_zero() {
        assert_eq!(format_age(Utc::now() + Duration::minutes(1)), "0s ago");
    }
}
