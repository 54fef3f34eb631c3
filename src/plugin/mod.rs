//! Plugin Runner: one isolated container per plugin invocation.
//!
//! `PluginRunner::run` resolves settings, gates on enabled/feature flags,
//! pulls the image when a registry is configured, runs the container and
//! parses its stdout envelope. Bad plugin behaviour (pull failure, timeout,
//! invalid output) comes back as an unsuccessful `PluginResult`; only runner
//! breakage is an `Err`.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use scanfleet_common::{PluginResult, Scan};
use serde_json::{Value, json};
use tracing::Instrument;

use crate::config::{FleetConfig, ServiceConfig};
use crate::errors::PluginError;

pub mod container;
pub mod envelope;
pub mod secrets;
pub mod settings;

pub use container::{ContainerOutput, ContainerRuntime, ContainerSpec, DockerRuntime, ENGINE_LABEL};
pub use settings::{PluginSettings, list_plugins};

pub const ENGINE_VARS_ENV: &str = "SCANFLEET_ENGINE_VARS";
pub const IMAGES_ENV: &str = "SCANFLEET_IMAGES";
pub const PLUGIN_CONFIG_ENV: &str = "SCANFLEET_PLUGIN_CONFIG";
pub const SERVICE_TOKEN_ENV: &str = "SCANFLEET_SERVICE_TOKEN";
const PLUGIN_LABEL: &str = "scanfleet.plugin";
const WORK_MOUNT: &str = "/work";

/// Static runner configuration, fixed for the life of an engine.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub plugin_dir: PathBuf,
    pub registry: Option<String>,
    pub engine_id: String,
    /// Host-side parent of per-scan working dirs, as seen by the container engine.
    pub host_working_dir: PathBuf,
    pub java_heap_size: String,
    pub env_passthrough: Vec<String>,
}

impl RunnerConfig {
    pub fn from_config(config: &FleetConfig, engine_id: &str) -> Self {
        let engine = &config.toml.engine;
        Self {
            plugin_dir: config.plugin_dir(),
            registry: engine.registry.clone(),
            engine_id: engine_id.to_string(),
            host_working_dir: engine
                .host_working_dir
                .clone()
                .unwrap_or_else(|| config.working_dir()),
            java_heap_size: engine.java_heap_size.clone(),
            env_passthrough: engine.plugin_env_passthrough.clone(),
        }
    }
}

/// Per-invocation inputs beyond the scan itself.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Images built by earlier plugins in this scan.
    pub images: Value,
    pub plugin_config: Value,
    pub service: Option<ServiceConfig>,
}

pub struct PluginRunner {
    config: RunnerConfig,
    runtime: Arc<dyn ContainerRuntime>,
}

impl PluginRunner {
    pub fn new(config: RunnerConfig, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { config, runtime }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn settings(&self, plugin: &str) -> Result<PluginSettings, PluginError> {
        PluginSettings::load(&self.config.plugin_dir, plugin, self.config.registry.as_deref())
            .map_err(|source| PluginError::Settings {
                plugin: plugin.to_string(),
                source,
            })
    }

    pub async fn run(
        &self,
        plugin: &str,
        scan: &Scan,
        options: &RunOptions,
    ) -> Result<PluginResult, PluginError> {
        let span = tracing::info_span!("plugin", plugin = plugin);
        self.run_inner(plugin, scan, options).instrument(span).await
    }

    async fn run_inner(
        &self,
        plugin: &str,
        scan: &Scan,
        options: &RunOptions,
    ) -> Result<PluginResult, PluginError> {
        let started = Utc::now();
        let settings = self.settings(plugin)?;
        let kind = settings.kind();

        if settings.image.is_empty() {
            return Ok(PluginResult::unconfigured(plugin, kind));
        }
        if !settings.is_enabled() || !settings.feature_allowed(&scan.features) {
            return Ok(PluginResult::disabled(plugin, kind));
        }

        if self.config.registry.is_some()
            && let Err(e) = self.runtime.pull(&settings.image).await
        {
            tracing::error!(image = %settings.image, error = %e, "image pull failed");
            return Ok(stamped(
                PluginResult::failed(plugin, kind, format!("{:#}", e)),
                started,
            ));
        }

        let spec = self.container_spec(plugin, &settings, scan, options)?;
        tracing::info!(image = %spec.image, "starting plugin container");
        let output = self
            .runtime
            .run(spec)
            .await
            .map_err(|source| PluginError::Container {
                plugin: plugin.to_string(),
                source,
            })?;

        for line in output.stderr.lines().filter(|l| !l.trim().is_empty()) {
            tracing::debug!(target: "scanfleet::plugin_log", "{}", line);
        }

        let result = if output.timed_out {
            PluginResult::failed(
                plugin,
                kind,
                format!(
                    "Plugin {} exceeded maximum runtime ({} seconds).",
                    settings.name,
                    settings.timeout.unwrap_or_default()
                ),
            )
        } else {
            envelope::parse_output(plugin, kind, &output.stdout, &output.stderr)
        };
        Ok(stamped(result, started))
    }

    fn container_spec(
        &self,
        plugin: &str,
        settings: &PluginSettings,
        scan: &Scan,
        options: &RunOptions,
    ) -> Result<ContainerSpec, PluginError> {
        let encode = |value: &Value| {
            serde_json::to_string(value).map_err(|e| PluginError::Invocation {
                plugin: plugin.to_string(),
                message: e.to_string(),
            })
        };

        let mut env = vec![
            (
                ENGINE_VARS_ENV.to_string(),
                encode(&self.engine_vars(scan, options.service.as_ref()))?,
            ),
            (IMAGES_ENV.to_string(), encode(&options.images)?),
            (PLUGIN_CONFIG_ENV.to_string(), encode(&options.plugin_config)?),
        ];
        if let Some(token) = options.service.as_ref().and_then(ServiceConfig::token) {
            env.push((SERVICE_TOKEN_ENV.to_string(), token));
        }
        for name in &self.config.env_passthrough {
            if let Ok(value) = std::env::var(name) {
                env.push((name.clone(), value));
            }
        }

        let host_dir = self.config.host_working_dir.join(&scan.id);
        Ok(ContainerSpec {
            name: format!("plugin-{}", self.config.engine_id),
            image: settings.image.clone(),
            cmd: Vec::new(),
            env,
            binds: vec![format!("{}:{}", host_dir.display(), WORK_MOUNT)],
            labels: [
                (ENGINE_LABEL.to_string(), self.config.engine_id.clone()),
                (PLUGIN_LABEL.to_string(), plugin.to_string()),
            ]
            .into_iter()
            .collect(),
            timeout: settings.timeout.map(std::time::Duration::from_secs),
        })
    }

    fn engine_vars(&self, scan: &Scan, service: Option<&ServiceConfig>) -> Value {
        json!({
            "scan_id": scan.id,
            "repo": scan.repo,
            "ref": scan.branch,
            "registry_url": self.config.registry,
            "depth": scan.depth,
            "include_dev": scan.include_dev,
            "engine_id": self.config.engine_id,
            "java_heap_size": self.config.java_heap_size,
            "service_name": scan.service,
            "service_type": service.map(|s| s.kind.as_str()),
            "service_hostname": service.and_then(|s| s.hostname.clone()),
        })
    }
}

fn stamped(mut result: PluginResult, started: chrono::DateTime<Utc>) -> PluginResult {
    result.start_time = Some(started);
    result.end_time = Some(Utc::now());
    result
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted container runtime shared by runner and worker tests.

    use std::collections::HashMap;
    use std::sync::Mutex;

    use anyhow::Result;
    use async_trait::async_trait;

    use super::*;

    #[derive(Default)]
    pub struct MockRuntime {
        /// stdout to return, keyed by image.
        pub outputs: Mutex<HashMap<String, ContainerOutput>>,
        pub pull_error: Mutex<Option<String>>,
        pub run_error: Mutex<Option<String>>,
        pub runs: Mutex<Vec<ContainerSpec>>,
        pub pulls: Mutex<Vec<String>>,
    }

    impl MockRuntime {
        pub fn with_stdout(self, image: &str, stdout: &str) -> Self {
            self.outputs.lock().unwrap().insert(
                image.to_string(),
                ContainerOutput {
                    stdout: stdout.to_string(),
                    exit_code: Some(0),
                    ..Default::default()
                },
            );
            self
        }

        pub fn with_output(self, image: &str, output: ContainerOutput) -> Self {
            self.outputs.lock().unwrap().insert(image.to_string(), output);
            self
        }
    }

    #[async_trait]
    impl ContainerRuntime for MockRuntime {
        async fn pull(&self, image: &str) -> Result<()> {
            self.pulls.lock().unwrap().push(image.to_string());
            match self.pull_error.lock().unwrap().clone() {
                Some(e) => Err(anyhow::anyhow!(e)),
                None => Ok(()),
            }
        }

        async fn run(&self, spec: ContainerSpec) -> Result<ContainerOutput> {
            self.runs.lock().unwrap().push(spec.clone());
            if let Some(e) = self.run_error.lock().unwrap().clone() {
                return Err(anyhow::anyhow!(e));
            }
            Ok(self
                .outputs
                .lock()
                .unwrap()
                .get(&spec.image)
                .cloned()
                .unwrap_or_default())
        }
    }

    /// Write `<dir>/<name>/settings.json`.
    pub fn write_plugin(dir: &std::path::Path, name: &str, settings: serde_json::Value) {
        let plugin_dir = dir.join(name);
        std::fs::create_dir_all(&plugin_dir).unwrap();
        std::fs::write(
            plugin_dir.join(settings::SETTINGS_FILE),
            serde_json::to_string(&settings).unwrap(),
        )
        .unwrap();
    }
}
