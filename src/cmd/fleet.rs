//! Operator commands against the shared datastore: `scanfleet queue` and
//! `scanfleet fleet`.

use std::path::PathBuf;

use anyhow::Result;
use scanfleet::context::FleetContext;

use super::super::{FleetCommands, QueueCommands};

pub async fn cmd_queue(
    project_dir: PathBuf,
    db_path: Option<PathBuf>,
    command: QueueCommands,
) -> Result<()> {
    let ctx = FleetContext::open(project_dir, db_path)?;
    match command {
        QueueCommands::Depth { name } => {
            let depth = ctx.transport.depth(&name).await?;
            println!("{}: {}", name, depth);
        }
    }
    Ok(())
}

pub async fn cmd_fleet(
    project_dir: PathBuf,
    db_path: Option<PathBuf>,
    command: FleetCommands,
) -> Result<()> {
    let ctx = FleetContext::open(project_dir, db_path)?;
    match command {
        FleetCommands::Maintenance { enabled } => {
            ctx.db
                .call(move |db| db.set_maintenance_mode(enabled))
                .await?;
            println!(
                "Maintenance mode {}.",
                if enabled { "enabled" } else { "disabled" }
            );
        }
        FleetCommands::Shutdown => {
            let count = ctx.db.call(|db| db.request_fleet_shutdown()).await?;
            println!("Shutdown requested for {} running engine(s).", count);
        }
        FleetCommands::Scans => {
            let records = ctx.db.call(|db| db.list_scan_records()).await?;
            if records.is_empty() {
                println!("No accepted scans recorded.");
            }
            for r in records {
                println!(
                    "{}  {}/{}  created {}  expires {}",
                    r.scan_id,
                    r.service,
                    r.repo,
                    r.create_date.format("%Y-%m-%d %H:%M"),
                    r.expires.format("%Y-%m-%d")
                );
            }
        }
    }
    Ok(())
}
