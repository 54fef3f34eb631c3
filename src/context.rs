//! Shared wiring for the subcommands: resolved config, the datastore and
//! the queue transport built on top of it.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::config::FleetConfig;
use crate::discovery::{Discoverer, DiscoveryConfig, Provider, provider_for};
use crate::dispatch::{DispatchConfig, DispatchConsumer, HttpAdmissionApi};
use crate::engine::{
    CommandHostControl, DockerSiblings, EngineManager, EngineWorker, HostSiblings,
    ManagerConfig, ProcessorConfig, RegistrySiblings, ScanProcessor, SiblingSource,
    WorkerConfig,
};
use crate::events::{EventPublisher, QueueEventSink};
use crate::plugin::{DockerRuntime, PluginRunner, RunnerConfig};
use crate::queue::{QueueTransport, SqliteQueue};
use crate::store::{DbHandle, FleetDb};

pub struct FleetContext {
    pub config: FleetConfig,
    pub db: DbHandle,
    pub transport: Arc<dyn QueueTransport>,
}

impl FleetContext {
    pub fn open(project_dir: PathBuf, db_path: Option<PathBuf>) -> Result<Self> {
        let config = FleetConfig::new(project_dir)?.with_db_path(db_path);
        let db = FleetDb::new(&config.db_path)
            .with_context(|| format!("Failed to open {}", config.db_path.display()))?;
        let db = DbHandle::new(db);
        let visibility = Duration::from_secs(config.toml.queues.visibility_timeout_secs);
        let transport: Arc<dyn QueueTransport> = Arc::new(SqliteQueue::new(db.clone(), visibility));
        Ok(Self {
            config,
            db,
            transport,
        })
    }

    /// Configured engine id, or a fresh one for this process.
    pub fn engine_id(&self) -> String {
        self.config
            .toml
            .engine
            .id
            .clone()
            .unwrap_or_else(|| format!("engine-{}", uuid::Uuid::new_v4()))
    }

    pub fn dispatcher(&self) -> Result<DispatchConsumer> {
        let section = &self.config.toml.dispatch;
        let url = self.config.admission_url()?;
        let api_key = std::env::var(&section.api_key_env)
            .with_context(|| format!("{} is not set", section.api_key_env))?;
        let api = HttpAdmissionApi::new(
            url,
            &api_key,
            Duration::from_secs(section.request_timeout_secs),
        )?;
        Ok(DispatchConsumer::new(
            DispatchConfig::from_sections(section, &self.config.toml.queues),
            self.transport.clone(),
            Arc::new(api),
            self.db.clone(),
        ))
    }

    pub fn discoverer(&self) -> Result<Discoverer> {
        let section = &self.config.toml.discovery;
        if section.services.is_empty() {
            anyhow::bail!("No discovery services configured under [discovery.services]");
        }
        let timeout = Duration::from_secs(section.request_timeout_secs);
        let mut providers: HashMap<String, Arc<dyn Provider>> = HashMap::new();
        for (name, service) in &section.services {
            providers.insert(name.clone(), provider_for(service, timeout, section.page_size)?);
        }
        Ok(Discoverer::new(
            DiscoveryConfig::from_sections(section, &self.config.toml.queues),
            self.transport.clone(),
            providers,
        ))
    }

    pub fn engine_worker(&self) -> Result<EngineWorker> {
        let toml = &self.config.toml;
        let engine_id = self.engine_id();
        let runtime = DockerRuntime::connect()?;
        let siblings = HostSiblings::new(vec![
            (
                "registry",
                Arc::new(RegistrySiblings::new(
                    self.db.clone(),
                    toml.engine.instance_id.clone(),
                )) as Arc<dyn SiblingSource>,
            ),
            (
                "containers",
                Arc::new(DockerSiblings::new(runtime.client().clone())) as Arc<dyn SiblingSource>,
            ),
        ]);
        let runner = PluginRunner::new(
            RunnerConfig::from_config(&self.config, &engine_id),
            Arc::new(runtime),
        );

        let sink = Arc::new(QueueEventSink::new(
            self.transport.clone(),
            &toml.queues.event_queue,
        ));
        let events = Arc::new(EventPublisher::new(sink, toml.events.clone()));
        let processor = ScanProcessor::new(
            ProcessorConfig {
                engine_id: engine_id.clone(),
                working_dir: self.config.working_dir(),
                callback_queue: toml.queues.callback_queue.clone(),
                mandatory_include: toml.engine.mandatory_include_paths.clone(),
                fleet: toml.clone(),
            },
            self.db.clone(),
            runner,
            events,
            self.transport.clone(),
        );

        let manager = EngineManager::new(
            ManagerConfig::from_section(&toml.engine, &engine_id),
            Arc::new(self.db.clone()),
        );
        let host = CommandHostControl::new(
            toml.engine.instance_id.clone(),
            toml.engine.host_unhealthy_command.clone(),
            toml.engine.host_terminate_command.clone(),
        );
        Ok(EngineWorker::new(
            WorkerConfig {
                task_queue: toml.queues.task_queue.clone(),
                priority_task_queue: toml.queues.priority_task_queue.clone(),
                poll_wait: toml.engine.poll_wait(),
                priority_poll_wait: toml.engine.priority_poll_wait(),
                termination_jitter: toml.engine.termination_jitter(),
            },
            manager,
            processor,
            self.transport.clone(),
            Arc::new(host),
            Arc::new(siblings),
        ))
    }
}
