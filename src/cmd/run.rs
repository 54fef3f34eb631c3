//! Long-running and one-shot pipeline stages: `scanfleet engine`,
//! `scanfleet dispatch`, `scanfleet discover` and `scanfleet enqueue-org`.

use std::path::PathBuf;

use anyhow::{Context, Result};
use scanfleet::context::FleetContext;
use scanfleet::discovery::DiscoveryRequest;
use scanfleet::engine::HostRelease;

pub async fn cmd_engine(project_dir: PathBuf, db_path: Option<PathBuf>) -> Result<()> {
    let ctx = FleetContext::open(project_dir, db_path)?;
    let worker = ctx.engine_worker()?;
    match worker.run().await {
        HostRelease::Terminated => println!("Engine stopped; host terminated."),
        HostRelease::SiblingsActive => println!("Engine stopped; other engines still running."),
        HostRelease::Unknown => println!("Engine stopped; host state unknown."),
    }
    Ok(())
}

pub async fn cmd_dispatch(
    project_dir: PathBuf,
    db_path: Option<PathBuf>,
    target: Option<usize>,
) -> Result<()> {
    let ctx = FleetContext::open(project_dir, db_path)?;
    let target = target.unwrap_or(ctx.config.toml.dispatch.target_count);
    let consumer = ctx.dispatcher()?;
    let outcomes = consumer.drain(target).await?;

    if outcomes.is_empty() {
        println!("No scan requests waiting.");
        return Ok(());
    }
    for outcome in outcomes {
        println!(
            "{:<12} {:?}: submitted {}, accepted {}, requeued {}, dropped {}, unsettled {}",
            outcome.service,
            outcome.class,
            outcome.submitted,
            outcome.accepted.len(),
            outcome.requeued,
            outcome.dropped,
            outcome.unsettled,
        );
    }
    Ok(())
}

pub async fn cmd_discover(
    project_dir: PathBuf,
    db_path: Option<PathBuf>,
    max: usize,
) -> Result<()> {
    let ctx = FleetContext::open(project_dir, db_path)?;
    let settled = ctx.discoverer()?.process_queue(max).await?;
    println!("Processed {} discovery request(s).", settled);
    Ok(())
}

pub async fn cmd_enqueue_org(
    project_dir: PathBuf,
    db_path: Option<PathBuf>,
    target: &str,
    plugins: Option<Vec<String>>,
    default_branch_only: bool,
) -> Result<()> {
    let (service, org) = target
        .split_once('/')
        .filter(|(s, o)| !s.is_empty() && !o.is_empty())
        .with_context(|| format!("Expected <service>/<org>, got '{}'", target))?;

    let ctx = FleetContext::open(project_dir, db_path)?;
    ctx.config.service(service)?;

    let mut request = DiscoveryRequest::org(service, org);
    request.default_branch_only = default_branch_only;
    request.plugins = plugins.filter(|p| !p.is_empty());
    request.batch_id = Some(uuid::Uuid::new_v4().to_string());
    ctx.discoverer()?.enqueue(&request).await?;

    println!(
        "Queued discovery for {}/{} (batch {})",
        service,
        org,
        request.batch_id.as_deref().unwrap_or_default()
    );
    Ok(())
}
