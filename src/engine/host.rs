//! Host release after an engine stops.
//!
//! Several engines can share one host. The last one out flags the host
//! unhealthy and terminates it, but only after a random delay and a fresh
//! look at its siblings. Two engines stopping together may both see the
//! other and leave the host running; that miss is accepted. Terminating a
//! host while a sibling is still running is not.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::Docker;
use bollard::query_parameters::ListContainersOptionsBuilder;
use rand::Rng;
use tokio::process::Command;

use crate::plugin::ENGINE_LABEL;
use crate::store::DbHandle;

/// Abstraction over host lifecycle calls for testability.
/// Real implementation: `CommandHostControl`.
#[async_trait]
pub trait HostControl: Send + Sync {
    async fn set_unhealthy(&self) -> Result<()>;
    async fn terminate(&self) -> Result<()>;
}

/// Abstraction over sibling discovery for testability.
/// Real implementations: `RegistrySiblings`, `DockerSiblings`,
/// combined by `HostSiblings`.
#[async_trait]
pub trait SiblingSource: Send + Sync {
    /// Ids of engines with at least one running container on this host.
    async fn running_engines(&self) -> Result<BTreeSet<String>>;
}

/// Runs configured shell commands with `SCANFLEET_INSTANCE_ID` set.
/// An unset command is a logged no-op.
pub struct CommandHostControl {
    instance_id: Option<String>,
    unhealthy_command: Option<String>,
    terminate_command: Option<String>,
}

impl CommandHostControl {
    pub fn new(
        instance_id: Option<String>,
        unhealthy_command: Option<String>,
        terminate_command: Option<String>,
    ) -> Self {
        Self {
            instance_id,
            unhealthy_command,
            terminate_command,
        }
    }

    async fn run(&self, what: &str, command: Option<&str>) -> Result<()> {
        let Some(command) = command else {
            tracing::warn!(action = what, "no host command configured");
            return Ok(());
        };
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .env(
                "SCANFLEET_INSTANCE_ID",
                self.instance_id.as_deref().unwrap_or_default(),
            )
            .output()
            .await
            .with_context(|| format!("Failed to spawn {} command", what))?;
        if !output.status.success() {
            anyhow::bail!(
                "{} command exited with {}: {}",
                what,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

#[async_trait]
impl HostControl for CommandHostControl {
    async fn set_unhealthy(&self) -> Result<()> {
        self.run("unhealthy", self.unhealthy_command.as_deref()).await
    }

    async fn terminate(&self) -> Result<()> {
        self.run("terminate", self.terminate_command.as_deref())
            .await
    }
}

/// Lists running containers carrying the engine label. Plugin containers
/// carry it too, so an engine mid-plugin counts as running.
pub struct DockerSiblings {
    docker: Docker,
}

impl DockerSiblings {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }
}

#[async_trait]
impl SiblingSource for DockerSiblings {
    async fn running_engines(&self) -> Result<BTreeSet<String>> {
        let filters: HashMap<&str, Vec<&str>> = HashMap::from([
            ("label", vec![ENGINE_LABEL]),
            ("status", vec!["running"]),
        ]);
        let opts = ListContainersOptionsBuilder::default()
            .all(false)
            .filters(&filters)
            .build();
        let containers = self
            .docker
            .list_containers(Some(opts))
            .await
            .context("Failed to list engine containers")?;
        Ok(containers
            .into_iter()
            .filter_map(|c| c.labels.and_then(|mut l| l.remove(ENGINE_LABEL)))
            .collect())
    }
}

/// Engines registered on the same instance that have not stopped. Catches
/// siblings idle between scans, which have no plugin container running.
pub struct RegistrySiblings {
    db: DbHandle,
    instance_id: Option<String>,
}

impl RegistrySiblings {
    pub fn new(db: DbHandle, instance_id: Option<String>) -> Self {
        Self { db, instance_id }
    }
}

#[async_trait]
impl SiblingSource for RegistrySiblings {
    async fn running_engines(&self) -> Result<BTreeSet<String>> {
        let instance_id = self.instance_id.clone();
        let ids = self
            .db
            .call(move |db| db.live_engines_on(instance_id.as_deref()))
            .await?;
        Ok(ids.into_iter().collect())
    }
}

/// Union of several sibling sources. A failing source is logged and skipped; the
/// check fails only when every source does.
pub struct HostSiblings {
    sources: Vec<(&'static str, Arc<dyn SiblingSource>)>,
}

impl HostSiblings {
    pub fn new(sources: Vec<(&'static str, Arc<dyn SiblingSource>)>) -> Self {
        Self { sources }
    }
}

#[async_trait]
impl SiblingSource for HostSiblings {
    async fn running_engines(&self) -> Result<BTreeSet<String>> {
        let mut running = BTreeSet::new();
        let mut last_err = None;
        let mut answered = false;
        for (name, lookup) in &self.sources {
            match lookup.running_engines().await {
                Ok(ids) => {
                    answered = true;
                    running.extend(ids);
                }
                Err(e) => {
                    tracing::warn!(source = name, error = %format!("{:#}", e), "sibling lookup failed");
                    last_err = Some(e);
                }
            }
        }
        match (answered, last_err) {
            (false, Some(e)) => Err(e),
            _ => Ok(running),
        }
    }
}

/// What `release_host` ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostRelease {
    Terminated,
    /// Another engine was seen running.
    SiblingsActive,
    /// Siblings could not be listed, or the terminate call failed.
    Unknown,
}

pub async fn release_host(
    host: &dyn HostControl,
    lookup: &dyn SiblingSource,
    engine_id: &str,
    jitter: Duration,
) -> HostRelease {
    if let Err(e) = host.set_unhealthy().await {
        tracing::error!(error = %format!("{:#}", e), "unable to set host unhealthy");
    }

    let delay = random_delay(jitter);
    tracing::info!(delay_ms = delay.as_millis() as u64, "waiting before sibling check");
    tokio::time::sleep(delay).await;

    let running = match lookup.running_engines().await {
        Ok(running) => running,
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "unable to list sibling engines");
            return HostRelease::Unknown;
        }
    };
    let siblings: Vec<&String> = running.iter().filter(|id| *id != engine_id).collect();
    if !siblings.is_empty() {
        tracing::info!(?siblings, "sibling engines still running, leaving host up");
        return HostRelease::SiblingsActive;
    }

    tracing::info!("no sibling engines running, terminating host");
    match host.terminate().await {
        Ok(()) => HostRelease::Terminated,
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "unable to terminate host");
            HostRelease::Unknown
        }
    }
}

fn random_delay(jitter: Duration) -> Duration {
    let max = jitter.as_millis() as u64;
    if max == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::rng().random_range(0..max))
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct MockHost {
        pub unhealthy_calls: Mutex<u32>,
        pub terminate_calls: Mutex<u32>,
        pub fail_unhealthy: bool,
    }

    #[async_trait]
    impl HostControl for MockHost {
        async fn set_unhealthy(&self) -> Result<()> {
            *self.unhealthy_calls.lock().unwrap() += 1;
            if self.fail_unhealthy {
                anyhow::bail!("health endpoint unreachable");
            }
            Ok(())
        }

        async fn terminate(&self) -> Result<()> {
            *self.terminate_calls.lock().unwrap() += 1;
            Ok(())
        }
    }

    pub struct StaticSiblings(pub Result<BTreeSet<String>, String>);

    #[async_trait]
    impl SiblingSource for StaticSiblings {
        async fn running_engines(&self) -> Result<BTreeSet<String>> {
            self.0.clone().map_err(|e| anyhow::anyhow!(e))
        }
    }
}
