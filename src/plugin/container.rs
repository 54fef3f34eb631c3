//! One-shot plugin containers.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::Docker;
use bollard::container::LogOutput;
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, CreateImageOptionsBuilder, LogsOptionsBuilder,
    RemoveContainerOptionsBuilder, StartContainerOptions, WaitContainerOptionsBuilder,
};
use futures_util::StreamExt;

/// Label carried by every container the fleet starts.
pub const ENGINE_LABEL: &str = "scanfleet.engine";

/// What to run. Secrets travel in `env`, never in `cmd`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub cmd: Vec<String>,
    pub env: Vec<(String, String)>,
    /// `host_path:container_path[:mode]` bind mounts.
    pub binds: Vec<String>,
    pub labels: HashMap<String, String>,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContainerOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i64>,
    pub timed_out: bool,
}

/// Abstraction over the container engine for testability.
/// Real implementation: `DockerRuntime`.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn pull(&self, image: &str) -> Result<()>;

    /// Run to completion and collect both streams. Removes the container.
    async fn run(&self, spec: ContainerSpec) -> Result<ContainerOutput>;
}

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn connect() -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().context("Failed to connect to Docker")?;
        Ok(Self { docker })
    }

    pub fn client(&self) -> &Docker {
        &self.docker
    }

    async fn remove(&self, name: &str) {
        let opts = RemoveContainerOptionsBuilder::default().force(true).build();
        if let Err(e) = self.docker.remove_container(name, Some(opts)).await {
            tracing::debug!(container = name, error = %e, "container removal failed");
        }
    }

    async fn wait(&self, name: &str) -> Result<Option<i64>> {
        let opts = WaitContainerOptionsBuilder::default()
            .condition("not-running")
            .build();
        let mut stream = self.docker.wait_container(name, Some(opts));
        let mut code = None;
        while let Some(item) = stream.next().await {
            match item {
                Ok(resp) => code = Some(resp.status_code),
                // Non-zero exits surface as an error carrying the code.
                Err(bollard::errors::Error::DockerContainerWaitError { code: c, .. }) => {
                    code = Some(c)
                }
                Err(e) => return Err(e).context("Failed waiting for container"),
            }
        }
        Ok(code)
    }

    async fn collect_logs(&self, name: &str) -> Result<(String, String)> {
        let opts = LogsOptionsBuilder::default()
            .stdout(true)
            .stderr(true)
            .build();
        let mut stream = self.docker.logs(name, Some(opts));
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        while let Some(chunk) = stream.next().await {
            match chunk.context("Failed to read container logs")? {
                LogOutput::StdOut { message } | LogOutput::Console { message } => {
                    stdout.extend_from_slice(&message)
                }
                LogOutput::StdErr { message } => stderr.extend_from_slice(&message),
                LogOutput::StdIn { .. } => {}
            }
        }
        Ok((
            String::from_utf8_lossy(&stdout).into_owned(),
            String::from_utf8_lossy(&stderr).into_owned(),
        ))
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn pull(&self, image: &str) -> Result<()> {
        let opts = CreateImageOptionsBuilder::default().from_image(image).build();
        let mut stream = self.docker.create_image(Some(opts), None, None);
        while let Some(progress) = stream.next().await {
            progress.with_context(|| format!("Unable to pull image: {}", image))?;
        }
        Ok(())
    }

    async fn run(&self, spec: ContainerSpec) -> Result<ContainerOutput> {
        // A container left over from a crashed run would block the name.
        self.remove(&spec.name).await;

        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            cmd: if spec.cmd.is_empty() {
                None
            } else {
                Some(spec.cmd.clone())
            },
            env: Some(
                spec.env
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect(),
            ),
            labels: Some(spec.labels.clone()),
            host_config: Some(HostConfig {
                binds: Some(spec.binds.clone()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let opts = CreateContainerOptionsBuilder::default()
            .name(&spec.name)
            .build();
        self.docker
            .create_container(Some(opts), body)
            .await
            .with_context(|| format!("Failed to create container {}", spec.name))?;
        // Once created, the container is removed however the run ends.
        finally(self.start_and_collect(&spec), self.remove(&spec.name)).await
    }
}

impl DockerRuntime {
    async fn start_and_collect(&self, spec: &ContainerSpec) -> Result<ContainerOutput> {
        self.docker
            .start_container(&spec.name, None::<StartContainerOptions>)
            .await
            .with_context(|| format!("Failed to start container {}", spec.name))?;

        let (exit_code, timed_out) = match spec.timeout {
            Some(limit) => match tokio::time::timeout(limit, self.wait(&spec.name)).await {
                Ok(code) => (code?, false),
                Err(_) => (None, true),
            },
            None => (self.wait(&spec.name).await?, false),
        };

        let (stdout, stderr) = if timed_out {
            (String::new(), String::new())
        } else {
            self.collect_logs(&spec.name).await?
        };
        Ok(ContainerOutput {
            stdout,
            stderr,
            exit_code,
            timed_out,
        })
    }
}

/// Await `work`, then `cleanup`, whatever `work` produced.
async fn finally<T>(
    work: impl std::future::Future<Output = T>,
    cleanup: impl std::future::Future<Output = ()>,
) -> T {
    let out = work.await;
    cleanup.await;
    out
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    #[tokio::test]
    async fn test_cleanup_runs_after_failed_work() {
        let cleaned = AtomicBool::new(false);
        let result: Result<()> = finally(
            async { Err(anyhow::anyhow!("Failed to start container p1")) },
            async { cleaned.store(true, Ordering::SeqCst) },
        )
        .await;
        assert!(result.is_err());
        assert!(cleaned.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cleanup_runs_after_success() {
        let cleaned = AtomicBool::new(false);
        let out = finally(async { 7 }, async { cleaned.store(true, Ordering::SeqCst) }).await;
        assert_eq!(out, 7);
        assert!(cleaned.load(Ordering::SeqCst));
    }
}
