//! Engine Worker: datastore session lifecycle, maintenance polling and the
//! shutdown handshake.
//!
//! `EngineManager` is the only thing that touches the engine's own record.
//! Connectivity loss is retried a bounded number of times; once retries run
//! out the manager turns `abnormal`, which makes the shutdown check answer
//! "stop" and sends the worker down the host-release path.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scanfleet_common::{EngineState, PluginKind};

use crate::config::EngineSection;
use crate::errors::{EngineError, StoreError};
use crate::plugin::{PluginSettings, list_plugins};
use crate::store::DbHandle;

pub mod host;
pub mod worker;
pub mod workspace;

pub use host::{
    CommandHostControl, DockerSiblings, HostControl, HostRelease, HostSiblings,
    RegistrySiblings, SiblingSource, release_host,
};
pub use worker::{EngineWorker, ProcessorConfig, ScanProcessor, WorkerConfig};
pub use workspace::{PathRules, Workspace};

/// Abstraction over the engine record store for testability.
/// Real implementation: `DbHandle`.
#[async_trait]
pub trait EngineRegistry: Send + Sync {
    /// Drop any stale session and prove the datastore answers.
    async fn connect(&self) -> Result<(), StoreError>;
    async fn register(&self, engine_id: &str, instance_id: Option<&str>) -> Result<(), StoreError>;
    async fn state(&self, engine_id: &str) -> Result<Option<EngineState>, StoreError>;
    async fn set_state(
        &self,
        engine_id: &str,
        state: EngineState,
        shutdown_time: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;
    async fn maintenance_mode(&self) -> Result<bool, StoreError>;
    async fn register_plugin(
        &self,
        name: &str,
        kind: PluginKind,
        enabled: bool,
    ) -> Result<(), StoreError>;
}

#[async_trait]
impl EngineRegistry for DbHandle {
    async fn connect(&self) -> Result<(), StoreError> {
        self.reconnect().await.map_err(StoreError::classify)?;
        self.call(|db| db.ping()).await.map_err(StoreError::classify)
    }

    async fn register(&self, engine_id: &str, instance_id: Option<&str>) -> Result<(), StoreError> {
        let engine_id = engine_id.to_string();
        let instance_id = instance_id.map(str::to_string);
        self.call(move |db| db.register_engine(&engine_id, instance_id.as_deref()))
            .await
            .map_err(StoreError::classify)
    }

    async fn state(&self, engine_id: &str) -> Result<Option<EngineState>, StoreError> {
        let engine_id = engine_id.to_string();
        self.call(move |db| db.engine_state(&engine_id))
            .await
            .map_err(StoreError::classify)
    }

    async fn set_state(
        &self,
        engine_id: &str,
        state: EngineState,
        shutdown_time: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let engine_id = engine_id.to_string();
        self.call(move |db| db.set_engine_state(&engine_id, state, shutdown_time))
            .await
            .map_err(StoreError::classify)
    }

    async fn maintenance_mode(&self) -> Result<bool, StoreError> {
        self.call(|db| db.maintenance_mode())
            .await
            .map_err(StoreError::classify)
    }

    async fn register_plugin(
        &self,
        name: &str,
        kind: PluginKind,
        enabled: bool,
    ) -> Result<(), StoreError> {
        let name = name.to_string();
        self.call(move |db| db.register_plugin(&name, kind, enabled))
            .await
            .map_err(StoreError::classify)
    }
}

/// Lifecycle settings for one engine.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub engine_id: String,
    pub instance_id: Option<String>,
    pub retry_wait: Duration,
    pub retry_limit: u32,
    pub maintenance_interval: Duration,
}

impl ManagerConfig {
    pub fn from_section(section: &EngineSection, engine_id: &str) -> Self {
        Self {
            engine_id: engine_id.to_string(),
            instance_id: section.instance_id.clone(),
            retry_wait: section.db_retry_wait(),
            retry_limit: section.db_retry_limit,
            maintenance_interval: section.maintenance_interval(),
        }
    }
}

pub struct EngineManager {
    config: ManagerConfig,
    registry: Arc<dyn EngineRegistry>,
    abnormal: bool,
    maintenance: bool,
    next_maintenance_check: Option<Instant>,
}

impl EngineManager {
    pub fn new(config: ManagerConfig, registry: Arc<dyn EngineRegistry>) -> Self {
        Self {
            config,
            registry,
            abnormal: false,
            // Assume not in maintenance until the first check says otherwise.
            maintenance: false,
            next_maintenance_check: None,
        }
    }

    pub fn engine_id(&self) -> &str {
        &self.config.engine_id
    }

    pub fn is_abnormal(&self) -> bool {
        self.abnormal
    }

    /// Connect and register. Returns false (and marks the engine abnormal)
    /// when the datastore never became reachable.
    pub async fn start(&mut self) -> bool {
        if let Err(e) = self.connect_with_retry().await {
            tracing::error!(error = %e, "engine startup failed, skipping registration");
            self.abnormal = true;
            return false;
        }
        if let Err(e) = self
            .registry
            .register(&self.config.engine_id, self.config.instance_id.as_deref())
            .await
        {
            tracing::error!(error = %e, "engine registration failed");
            self.abnormal = true;
            return false;
        }
        tracing::info!(engine_id = %self.config.engine_id, "engine registered");
        true
    }

    /// Record every plugin under `plugin_dir` with its enabled flag.
    /// Returns how many were registered.
    pub async fn register_plugins(&self, plugin_dir: &Path, registry_url: Option<&str>) -> usize {
        let names = match list_plugins(plugin_dir) {
            Ok(names) => names,
            Err(e) => {
                tracing::error!(dir = %plugin_dir.display(), error = %format!("{:#}", e), "unable to list plugins");
                return 0;
            }
        };
        let mut registered = 0;
        for name in names {
            let settings = match PluginSettings::load(plugin_dir, &name, registry_url) {
                Ok(settings) => settings,
                Err(e) => {
                    tracing::warn!(plugin = %name, error = %format!("{:#}", e), "skipping plugin with unreadable settings");
                    continue;
                }
            };
            let enabled = settings.is_enabled();
            match self
                .registry
                .register_plugin(&name, settings.kind(), enabled)
                .await
            {
                Ok(()) => {
                    tracing::info!(plugin = %name, enabled, "registered plugin");
                    registered += 1;
                }
                Err(e) => tracing::error!(plugin = %name, error = %e, "unable to register plugin"),
            }
        }
        registered
    }

    async fn connect_with_retry(&self) -> Result<(), EngineError> {
        let limit = self.config.retry_limit.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.registry.connect().await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < limit => {
                    tracing::warn!(attempt, limit, error = %e, "datastore unavailable, retrying");
                    tokio::time::sleep(self.config.retry_wait).await;
                }
                Err(e) if e.is_transient() => {
                    tracing::error!(attempts = attempt, error = %e, "datastore retries exhausted");
                    return Err(EngineError::DatastoreExhausted { attempts: attempt });
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Read the engine's state, reconnecting once through the bounded retry
    /// if the session went away.
    async fn refresh(&self) -> Result<Option<EngineState>, EngineError> {
        match self.registry.state(&self.config.engine_id).await {
            Ok(state) => Ok(state),
            Err(e) if e.is_transient() => {
                tracing::warn!(error = %e, "lost datastore session, reconnecting");
                self.connect_with_retry().await?;
                Ok(self.registry.state(&self.config.engine_id).await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Whether the worker should stop. Errs on the side of stopping.
    pub async fn shutdown_requested(&mut self) -> bool {
        if self.abnormal {
            return true;
        }
        let state = match self.refresh().await {
            Ok(state) => state,
            Err(e) => {
                tracing::error!(error = %e, "error when checking if shutdown requested");
                self.abnormal = true;
                return true;
            }
        };
        match state {
            Some(EngineState::ShutdownRequested) => {
                tracing::info!("shutdown requested");
                if let Err(e) = self
                    .registry
                    .set_state(
                        &self.config.engine_id,
                        EngineState::Shutdown,
                        Some(Utc::now()),
                    )
                    .await
                {
                    tracing::error!(error = %e, "unable to record shutdown");
                }
                true
            }
            Some(EngineState::Shutdown | EngineState::Terminated) => true,
            Some(EngineState::Running) => false,
            None => {
                tracing::warn!("engine record missing, re-registering");
                if let Err(e) = self
                    .registry
                    .register(&self.config.engine_id, self.config.instance_id.as_deref())
                    .await
                {
                    tracing::error!(error = %e, "engine re-registration failed");
                }
                false
            }
        }
    }

    /// Cached maintenance flag, refreshed at most once per interval.
    pub async fn maintenance_mode(&mut self) -> bool {
        let now = Instant::now();
        if self.next_maintenance_check.is_some_and(|next| now < next) {
            return self.maintenance;
        }
        tracing::info!("checking for maintenance mode");
        self.maintenance = match self.registry.maintenance_mode().await {
            Ok(enabled) => enabled,
            Err(e) => {
                tracing::error!(error = %e, "unable to check maintenance mode");
                false
            }
        };
        tracing::info!(maintenance = self.maintenance, "maintenance mode");
        self.next_maintenance_check = Some(now + self.config.maintenance_interval);
        self.maintenance
    }

    /// Best-effort final state write once the host has been released.
    pub async fn mark_terminated(&self) {
        if self.abnormal {
            return;
        }
        if let Err(e) = self
            .registry
            .set_state(&self.config.engine_id, EngineState::Terminated, None)
            .await
        {
            tracing::warn!(error = %e, "unable to record termination");
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;

    fn unavailable() -> StoreError {
        StoreError::Unavailable(anyhow::anyhow!("connection refused"))
    }

    /// Scripted registry: `connect` fails `connect_failures` times first,
    /// `state` pops scripted answers and then reports `Running`.
    #[derive(Default)]
    pub struct ScriptedRegistry {
        pub connect_failures: Mutex<u32>,
        pub connect_calls: Mutex<u32>,
        pub states: Mutex<VecDeque<Result<Option<EngineState>, ()>>>,
        pub writes: Mutex<Vec<(EngineState, bool)>>,
        pub registered: Mutex<Vec<String>>,
        pub plugins: Mutex<Vec<(String, PluginKind, bool)>>,
        pub maintenance: Mutex<VecDeque<Result<bool, ()>>>,
        pub maintenance_calls: Mutex<u32>,
    }

    impl ScriptedRegistry {
        pub fn failing_connects(n: u32) -> Self {
            Self {
                connect_failures: Mutex::new(n),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl EngineRegistry for ScriptedRegistry {
        async fn connect(&self) -> Result<(), StoreError> {
            *self.connect_calls.lock().unwrap() += 1;
            let mut failures = self.connect_failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(unavailable());
            }
            Ok(())
        }

        async fn register(&self, engine_id: &str, _: Option<&str>) -> Result<(), StoreError> {
            self.registered.lock().unwrap().push(engine_id.to_string());
            Ok(())
        }

        async fn state(&self, _: &str) -> Result<Option<EngineState>, StoreError> {
            match self.states.lock().unwrap().pop_front() {
                Some(Ok(state)) => Ok(state),
                Some(Err(())) => Err(unavailable()),
                None => Ok(Some(EngineState::Running)),
            }
        }

        async fn set_state(
            &self,
            _: &str,
            state: EngineState,
            shutdown_time: Option<DateTime<Utc>>,
        ) -> Result<(), StoreError> {
            self.writes
                .lock()
                .unwrap()
                .push((state, shutdown_time.is_some()));
            Ok(())
        }

        async fn maintenance_mode(&self) -> Result<bool, StoreError> {
            *self.maintenance_calls.lock().unwrap() += 1;
            match self.maintenance.lock().unwrap().pop_front() {
                Some(Ok(v)) => Ok(v),
                Some(Err(())) => Err(unavailable()),
                None => Ok(false),
            }
        }

        async fn register_plugin(
            &self,
            name: &str,
            kind: PluginKind,
            enabled: bool,
        ) -> Result<(), StoreError> {
            self.plugins
                .lock()
                .unwrap()
                .push((name.to_string(), kind, enabled));
            Ok(())
        }
    }

    pub fn manager_config(retry_limit: u32) -> ManagerConfig {
        ManagerConfig {
            engine_id: "i-1-engine-1".into(),
            instance_id: Some("i-1".into()),
            retry_wait: Duration::ZERO,
            retry_limit,
            maintenance_interval: Duration::from_secs(300),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{ScriptedRegistry, manager_config};
    use super::*;

    #[tokio::test]
    async fn test_connect_recovers_within_retry_limit() {
        let registry = Arc::new(ScriptedRegistry::failing_connects(2));
        let mut manager = EngineManager::new(manager_config(5), registry.clone());

        assert!(manager.start().await);
        assert!(!manager.is_abnormal());
        assert_eq!(*registry.connect_calls.lock().unwrap(), 3);
        assert_eq!(registry.registered.lock().unwrap().as_slice(), ["i-1-engine-1"]);
        assert!(!manager.shutdown_requested().await);
    }

    #[tokio::test]
    async fn test_exhausted_retries_mark_abnormal_and_stop() {
        let registry = Arc::new(ScriptedRegistry::failing_connects(3));
        let mut manager = EngineManager::new(manager_config(3), registry.clone());

        assert!(!manager.start().await);
        assert!(manager.is_abnormal());
        assert_eq!(*registry.connect_calls.lock().unwrap(), 3);
        assert!(registry.registered.lock().unwrap().is_empty());
        assert!(manager.shutdown_requested().await);
    }

    #[tokio::test]
    async fn test_lost_session_during_check_reconnects() {
        let registry = Arc::new(ScriptedRegistry::default());
        registry.states.lock().unwrap().push_back(Err(()));
        let mut manager = EngineManager::new(manager_config(3), registry.clone());
        assert!(manager.start().await);

        assert!(!manager.shutdown_requested().await);
        assert!(!manager.is_abnormal());
        assert_eq!(*registry.connect_calls.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_unrecoverable_session_during_check_fails_safe() {
        let registry = Arc::new(ScriptedRegistry::default());
        let mut manager = EngineManager::new(manager_config(2), registry.clone());
        assert!(manager.start().await);

        registry.states.lock().unwrap().push_back(Err(()));
        *registry.connect_failures.lock().unwrap() = 2;

        assert!(manager.shutdown_requested().await);
        assert!(manager.is_abnormal());
    }

    #[tokio::test]
    async fn test_shutdown_requested_writes_shutdown_once() {
        let registry = Arc::new(ScriptedRegistry::default());
        registry
            .states
            .lock()
            .unwrap()
            .extend([Ok(Some(EngineState::ShutdownRequested)), Ok(Some(EngineState::Shutdown))]);
        let mut manager = EngineManager::new(manager_config(3), registry.clone());

        assert!(manager.shutdown_requested().await);
        assert!(manager.shutdown_requested().await);
        assert_eq!(
            registry.writes.lock().unwrap().as_slice(),
            [(EngineState::Shutdown, true)]
        );
    }

    #[tokio::test]
    async fn test_terminated_engine_stops_without_writing() {
        let registry = Arc::new(ScriptedRegistry::default());
        registry
            .states
            .lock()
            .unwrap()
            .push_back(Ok(Some(EngineState::Terminated)));
        let mut manager = EngineManager::new(manager_config(3), registry.clone());

        assert!(manager.shutdown_requested().await);
        assert!(registry.writes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_maintenance_is_cached_between_checks() {
        let registry = Arc::new(ScriptedRegistry::default());
        registry
            .maintenance
            .lock()
            .unwrap()
            .extend([Ok(true), Ok(false)]);
        let mut manager = EngineManager::new(manager_config(3), registry.clone());

        assert!(manager.maintenance_mode().await);
        assert!(manager.maintenance_mode().await);
        assert_eq!(*registry.maintenance_calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_maintenance_lookup_failure_fails_open() {
        let registry = Arc::new(ScriptedRegistry::default());
        registry.maintenance.lock().unwrap().push_back(Err(()));
        let mut config = manager_config(3);
        config.maintenance_interval = Duration::ZERO;
        let mut manager = EngineManager::new(config, registry.clone());

        assert!(!manager.maintenance_mode().await);
        registry.maintenance.lock().unwrap().push_back(Ok(true));
        assert!(manager.maintenance_mode().await);
        assert_eq!(*registry.maintenance_calls.lock().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_register_plugins_records_enabled_flag() {
        let dir = tempfile::tempdir().unwrap();
        crate::plugin::testing::write_plugin(
            dir.path(),
            "trivy",
            serde_json::json!({"name": "Trivy", "image": "trivy", "type": "vulnerability"}),
        );
        crate::plugin::testing::write_plugin(
            dir.path(),
            "legacy",
            serde_json::json!({"name": "Legacy", "image": "legacy", "enabled": false}),
        );
        let registry = Arc::new(ScriptedRegistry::default());
        let manager = EngineManager::new(manager_config(3), registry.clone());

        assert_eq!(manager.register_plugins(dir.path(), None).await, 2);
        let plugins = registry.plugins.lock().unwrap();
        assert!(plugins.contains(&("trivy".into(), PluginKind::Vulnerability, true)));
        assert!(plugins.contains(&("legacy".into(), PluginKind::Misc, false)));
    }

    #[tokio::test]
    async fn test_db_handle_registry_round_trip() -> anyhow::Result<()> {
        let db = DbHandle::new(crate::store::FleetDb::new_in_memory()?);
        db.connect().await?;
        EngineRegistry::register(&db, "e1", Some("i-1")).await?;
        assert_eq!(db.state("e1").await?, Some(EngineState::Running));

        db.call(|db| db.request_fleet_shutdown()).await?;
        let mut manager = EngineManager::new(
            ManagerConfig {
                engine_id: "e1".into(),
                ..manager_config(3)
            },
            Arc::new(db.clone()),
        );
        assert!(manager.shutdown_requested().await);
        assert_eq!(db.state("e1").await?, Some(EngineState::Shutdown));
        Ok(())
    }
}
