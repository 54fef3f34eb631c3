//! Scan execution and the engine poll loop.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use scanfleet_common::{AllowListItem, AllowListKind, PluginKind, PluginResult, Scan, ScanStatus, ScanTask};
use serde_json::json;
use tracing::Instrument;

use super::host::{HostControl, HostRelease, SiblingSource, release_host};
use super::workspace::{PathRules, Workspace, available_space, has_disk_space};
use super::EngineManager;
use crate::config::{FleetToml, ServiceConfig, ServiceType};
use crate::errors::EngineError;
use crate::events::EventPublisher;
use crate::plugin::{PluginRunner, RunOptions, secrets};
use crate::queue::{QueueMessage, QueueTransport};
use crate::reconcile::{Reconciler, SeverityCache};
use crate::store::DbHandle;

const REPO_UNAVAILABLE: &str =
    "Repository was unable to be scanned. Please contact support with the scan id.";

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    pub engine_id: String,
    pub working_dir: PathBuf,
    pub callback_queue: String,
    pub mandatory_include: Vec<String>,
    pub fleet: FleetToml,
}

/// Runs one scan end to end. Every path ends in a terminal status.
pub struct ScanProcessor {
    config: ProcessorConfig,
    db: DbHandle,
    runner: PluginRunner,
    reconciler: Reconciler,
    severity: SeverityCache,
    events: Arc<EventPublisher>,
    transport: Arc<dyn QueueTransport>,
}

/// Allowlist entries that shape secrets results and events.
struct SecretAllowList {
    raw: Vec<String>,
    structured: Vec<AllowListItem>,
}

impl ScanProcessor {
    pub fn new(
        config: ProcessorConfig,
        db: DbHandle,
        runner: PluginRunner,
        events: Arc<EventPublisher>,
        transport: Arc<dyn QueueTransport>,
    ) -> Self {
        let severity = SeverityCache::new(db.clone(), config.fleet.cache.severity_ttl_secs);
        Self {
            reconciler: Reconciler::new(db.clone()),
            severity,
            config,
            db,
            runner,
            events,
            transport,
        }
    }

    pub fn runner(&self) -> &PluginRunner {
        &self.runner
    }

    /// Persist the scan row for a freshly received task.
    pub async fn record(&self, task: &ScanTask) -> Result<Scan, EngineError> {
        let mut scan = task.to_scan();
        scan.engine_id = Some(self.config.engine_id.clone());
        let row = scan.clone();
        self.db.call(move |db| db.upsert_scan(&row)).await?;
        Ok(scan)
    }

    pub async fn process(&self, task: &ScanTask) -> Result<ScanStatus, EngineError> {
        let span = tracing::info_span!(
            "scan",
            scan_id = %task.scan_id,
            repo = %task.repo,
            service = %task.service
        );
        self.process_inner(task).instrument(span).await
    }

    async fn process_inner(&self, task: &ScanTask) -> Result<ScanStatus, EngineError> {
        let mut scan = self.record(task).await?;
        tracing::info!("scan starting");
        let (id, engine_id, now) = (scan.id.clone(), self.config.engine_id.clone(), Utc::now());
        self.db
            .call(move |db| db.start_scan(&id, &engine_id, now))
            .await?;
        scan.status = ScanStatus::Running;

        let available = available_space(&self.config.working_dir).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "unable to read free disk space");
            u64::MAX
        });
        let status = if !has_disk_space(task.repo_size, available) {
            tracing::info!(repo_size_kb = task.repo_size, available, "not enough disk space");
            scan.errors
                .push(format!("Repo too large ({} KB)", task.repo_size));
            ScanStatus::Error
        } else {
            let workspace = Workspace::new(&self.config.working_dir, &scan.id);
            let status = self.run_scan(&mut scan, task, &workspace).await;
            if let Err(e) = workspace.remove() {
                tracing::warn!(error = %e, "unable to remove scan working dir");
            }
            status
        };

        let (id, errors, alerts, debug) = (
            scan.id.clone(),
            scan.errors.clone(),
            scan.alerts.clone(),
            scan.debug.clone(),
        );
        self.db
            .call(move |db| db.finish_scan(&id, status, &errors, &alerts, &debug))
            .await?;
        tracing::info!(status = status.as_str(), "scan finished");

        self.queue_callback(task, status).await;
        Ok(status)
    }

    async fn run_scan(&self, scan: &mut Scan, task: &ScanTask, workspace: &Workspace) -> ScanStatus {
        let service = self.config.fleet.discovery.services.get(&scan.service).cloned();
        let rules = PathRules {
            include: scan.include_paths.clone(),
            exclude: scan.exclude_paths.clone(),
            mandatory_include: self.config.mandatory_include.clone(),
        };

        if let Err(e) = self
            .prepare_repo(task, service.as_ref(), workspace, &rules)
            .await
        {
            tracing::error!(error = %e, "repo could not be pulled, plugins will not be processed");
            scan.errors.push(REPO_UNAVAILABLE.to_string());
            return ScanStatus::Error;
        }
        tracing::info!("repo processed");

        let errored = self.run_plugins(scan, service, workspace, &rules).await;

        if let Err(e) = self.reconciler.resolve(scan, &errored).await {
            tracing::error!(error = %format!("{:#}", e), "vulnerability resolution failed");
        }
        if self.events.flags().vulnerability {
            match self.reconciler.vulnerability_events(scan).await {
                Ok(details) => {
                    self.events.vulnerabilities(scan, details).await;
                }
                Err(e) => {
                    tracing::error!(error = %format!("{:#}", e), "unable to build vulnerability events")
                }
            }
        }
        if scan.is_default_branch() && self.events.flags().metadata {
            let id = scan.id.clone();
            let metadata = self
                .db
                .call(move |db| db.application_metadata(&id))
                .await
                .unwrap_or_else(|e| {
                    tracing::warn!(error = %format!("{:#}", e), "unable to read application metadata");
                    None
                })
                .unwrap_or_else(|| json!({}));
            self.events.metadata(scan, metadata).await;
        }
        ScanStatus::Completed
    }

    async fn prepare_repo(
        &self,
        task: &ScanTask,
        service: Option<&ServiceConfig>,
        workspace: &Workspace,
        rules: &PathRules,
    ) -> Result<(), EngineError> {
        let url = clone_url(task, service).ok_or_else(|| EngineError::Workspace {
            path: workspace.repo_dir(),
            message: format!("no clone URL for service {}", task.service),
        })?;
        tracing::info!(branch = task.branch.as_deref().unwrap_or("HEAD"), "pulling repo");
        let token = service.and_then(ServiceConfig::token);
        let (branch, depth) = (task.branch.clone(), task.depth);
        let ws = workspace.clone();
        let rules = rules.clone();
        tokio::task::spawn_blocking(move || {
            ws.clone_repo(&url, branch.as_deref(), depth, token.as_deref())?;
            ws.reset(&rules)
        })
        .await
        .map_err(|e| EngineError::Other(anyhow::anyhow!("clone task panicked: {}", e)))?
    }

    /// Run the selected plugins in order. Returns the plugins that errored.
    async fn run_plugins(
        &self,
        scan: &mut Scan,
        service: Option<ServiceConfig>,
        workspace: &Workspace,
        rules: &PathRules,
    ) -> HashSet<String> {
        let plugins = scan.selected_plugins();
        tracing::info!(?plugins, "running plugins");
        let allowlist = self.secret_allowlist(scan).await;
        let full_repo = scan.full_repo();
        let mut errored = HashSet::new();

        for plugin in plugins {
            scan.progress.start_plugin(&plugin, Utc::now());
            let (id, progress) = (scan.id.clone(), scan.progress.clone());
            if let Err(e) = self
                .db
                .call(move |db| db.update_scan_progress(&id, &progress))
                .await
            {
                tracing::warn!(plugin = %plugin, error = %format!("{:#}", e), "unable to update progress");
            }

            let options = RunOptions {
                images: json!({}),
                plugin_config: self
                    .config
                    .fleet
                    .plugin_config_for(&plugin, &full_repo)
                    .and_then(|table| serde_json::to_value(table).ok())
                    .unwrap_or_else(|| json!({})),
                service: service.clone(),
            };

            tracing::info!(plugin = %plugin, "running plugin");
            match self.runner.run(&plugin, scan, &options).await {
                Ok(result) if result.disabled => {
                    tracing::info!(plugin = %plugin, "plugin is disabled");
                    continue;
                }
                Ok(mut result) => {
                    if !result.success {
                        errored.insert(plugin.clone());
                    }
                    if let Err(e) = self.handle_result(scan, &mut result, &allowlist).await {
                        tracing::error!(plugin = %plugin, error = %e, "unable to record plugin result");
                        scan.errors
                            .push(format!("Unable to record results for plugin {}: {}", plugin, e));
                        errored.insert(plugin.clone());
                    } else {
                        tracing::info!(plugin = %plugin, "plugin results updated");
                    }
                }
                Err(e) => {
                    tracing::error!(plugin = %plugin, error = %e, "error running plugin");
                    scan.errors.push(e.to_string());
                    errored.insert(plugin.clone());
                }
            }

            let ws = workspace.clone();
            let rules = rules.clone();
            match tokio::task::spawn_blocking(move || ws.reset(&rules)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(error = %e, "workspace reset failed"),
                Err(e) => tracing::error!(error = %e, "workspace reset panicked"),
            }
        }
        errored
    }

    async fn handle_result(
        &self,
        scan: &Scan,
        result: &mut PluginResult,
        allowlist: &SecretAllowList,
    ) -> Result<(), EngineError> {
        match result.kind {
            PluginKind::Secrets => secrets::strip_raw_allowlisted(result, &allowlist.raw),
            PluginKind::Vulnerability => {
                self.reconciler.merge_findings(scan, result).await?;
            }
            PluginKind::Sbom => {
                let recorded = self.reconciler.record_sbom(scan, result).await?;
                tracing::info!(plugin = %result.name, components = recorded, "sbom processed");
            }
            _ => {}
        }

        let (id, stored) = (scan.id.clone(), result.clone());
        self.db
            .call(move |db| db.save_plugin_result(&id, &stored))
            .await?;
        self.severity.merge_result(result).await?;
        self.events
            .plugin_result(scan, result, &allowlist.structured)
            .await;
        Ok(())
    }

    async fn secret_allowlist(&self, scan: &Scan) -> SecretAllowList {
        let (service, repo) = (scan.service.clone(), scan.repo.clone());
        let loaded = self
            .db
            .call(move |db| {
                let now = Utc::now();
                let raw = db.active_allowlist(&service, &repo, AllowListKind::SecretRaw, now)?;
                let structured = db.active_allowlist(&service, &repo, AllowListKind::Secret, now)?;
                Ok((raw, structured))
            })
            .await;
        match loaded {
            Ok((raw, structured)) => SecretAllowList {
                raw: raw
                    .iter()
                    .filter_map(|item| item.value_str("value").map(str::to_string))
                    .collect(),
                structured,
            },
            Err(e) => {
                tracing::error!(error = %format!("{:#}", e), "unable to load secrets allowlist");
                SecretAllowList {
                    raw: Vec::new(),
                    structured: Vec::new(),
                }
            }
        }
    }

    async fn queue_callback(&self, task: &ScanTask, status: ScanStatus) {
        let Some(callback) = &task.callback else {
            return;
        };
        tracing::info!(url = %callback.url, "queuing callback");
        let body = json!({
            "url": callback.url,
            "client_id": callback.client_id,
            "data": {
                "repo": format!("{}/{}", task.repo, task.scan_id),
                "status": status.as_str(),
            },
        });
        if let Err(e) = self
            .transport
            .send(&self.config.callback_queue, body.to_string())
            .await
        {
            tracing::error!(url = %callback.url, error = %e, "unable to queue callback");
        }
    }
}

fn clone_url(task: &ScanTask, service: Option<&ServiceConfig>) -> Option<String> {
    if let Some(url) = &task.url {
        return Some(url.clone());
    }
    let service = service?;
    let host = service.hostname.clone().unwrap_or_else(|| {
        match service.kind {
            ServiceType::Github => "github.com",
            ServiceType::Gitlab => "gitlab.com",
            ServiceType::Bitbucket => "bitbucket.org",
        }
        .to_string()
    });
    Some(format!("https://{}/{}.git", host, task.repo))
}

// ── Poll loop ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub task_queue: String,
    pub priority_task_queue: String,
    pub poll_wait: Duration,
    pub priority_poll_wait: Duration,
    pub termination_jitter: Duration,
}

pub struct EngineWorker {
    config: WorkerConfig,
    manager: EngineManager,
    processor: ScanProcessor,
    transport: Arc<dyn QueueTransport>,
    host: Arc<dyn HostControl>,
    siblings: Arc<dyn SiblingSource>,
}

impl EngineWorker {
    pub fn new(
        config: WorkerConfig,
        manager: EngineManager,
        processor: ScanProcessor,
        transport: Arc<dyn QueueTransport>,
        host: Arc<dyn HostControl>,
        siblings: Arc<dyn SiblingSource>,
    ) -> Self {
        Self {
            config,
            manager,
            processor,
            transport,
            host,
            siblings,
        }
    }

    /// Poll until shutdown, then release the host.
    pub async fn run(mut self) -> HostRelease {
        if self.manager.start().await {
            let runner = self.processor.runner().config();
            self.manager
                .register_plugins(&runner.plugin_dir, runner.registry.as_deref())
                .await;

            loop {
                if self.manager.maintenance_mode().await {
                    tracing::debug!("skipping shutdown check and queue polling during maintenance");
                    tokio::time::sleep(self.config.poll_wait + self.config.priority_poll_wait).await;
                    continue;
                }
                if self.manager.shutdown_requested().await {
                    break;
                }
                if let Err(e) = self.poll_once().await {
                    tracing::error!(error = %e, "error in engine loop");
                }
            }
        }

        tracing::info!(abnormal = self.manager.is_abnormal(), "engine stopping");
        let outcome = release_host(
            self.host.as_ref(),
            self.siblings.as_ref(),
            self.manager.engine_id(),
            self.config.termination_jitter,
        )
        .await;
        if outcome == HostRelease::Terminated {
            self.manager.mark_terminated().await;
        }
        outcome
    }

    /// Take at most one task, priority queue first. Returns whether a task
    /// was handled.
    pub async fn poll_once(&self) -> Result<bool, EngineError> {
        for (queue, wait, priority) in [
            (
                &self.config.priority_task_queue,
                self.config.priority_poll_wait,
                true,
            ),
            (&self.config.task_queue, self.config.poll_wait, false),
        ] {
            let mut messages = self.transport.receive(queue, 1, wait).await?;
            if let Some(message) = messages.pop() {
                tracing::info!(queue = %queue, priority, "got task");
                self.handle(queue, message).await?;
                return Ok(true);
            }
            tracing::debug!(queue = %queue, "poll timeout");
        }
        Ok(false)
    }

    /// The message is acknowledged once the scan row exists; a redelivery
    /// after that point would only repeat a scan already on record.
    async fn handle(&self, queue: &str, message: QueueMessage) -> Result<(), EngineError> {
        let task = match serde_json::from_str::<ScanTask>(&message.body) {
            Ok(task) => task,
            Err(e) => {
                self.transport
                    .delete_batch(queue, vec![message.receipt])
                    .await?;
                return Err(EngineError::MalformedTask(e.to_string()));
            }
        };
        self.processor.record(&task).await?;
        self.transport
            .delete_batch(queue, vec![message.receipt])
            .await?;
        self.processor.process(&task).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineRegistry;
    use crate::engine::host::testing::{MockHost, StaticSiblings};
    use crate::engine::testing::{ScriptedRegistry, manager_config};
    use crate::engine::workspace::testing::init_repo;
    use crate::events::testing::{RecordingSink, all_enabled};
    use crate::plugin::testing::{MockRuntime, write_plugin};
    use crate::plugin::RunnerConfig;
    use crate::queue::SqliteQueue;
    use crate::store::FleetDb;
    use scanfleet_common::{EngineState, PluginEnvelope};
    use serde_json::Value;

    struct Harness {
        _dirs: Vec<tempfile::TempDir>,
        db: DbHandle,
        queue: Arc<SqliteQueue>,
        sink: Arc<RecordingSink>,
        runtime: Arc<MockRuntime>,
        repo_url: String,
        processor: ScanProcessor,
    }

    fn harness(runtime: MockRuntime) -> Harness {
        let plugins = tempfile::tempdir().unwrap();
        write_plugin(
            plugins.path(),
            "p1",
            json!({"name": "P1", "image": "p1-image", "type": "vulnerability"}),
        );
        write_plugin(
            plugins.path(),
            "p2",
            json!({"name": "P2", "image": "p2-image", "type": "vulnerability"}),
        );
        write_plugin(
            plugins.path(),
            "sbom",
            json!({"name": "SBOM", "image": "sbom-image", "type": "sbom"}),
        );
        write_plugin(
            plugins.path(),
            "off",
            json!({"name": "Off", "image": "off-image", "enabled": false}),
        );
        let origin = tempfile::tempdir().unwrap();
        init_repo(origin.path(), &[("package-lock.json", "{}")]);
        let work = tempfile::tempdir().unwrap();

        let db = DbHandle::new(FleetDb::new_in_memory().unwrap());
        let queue = Arc::new(SqliteQueue::new(db.clone(), Duration::from_secs(60)));
        let sink = Arc::new(RecordingSink::default());
        let runtime = Arc::new(runtime);
        let runner = PluginRunner::new(
            RunnerConfig {
                plugin_dir: plugins.path().to_path_buf(),
                registry: None,
                engine_id: "eng-1".into(),
                host_working_dir: work.path().to_path_buf(),
                java_heap_size: "2g".into(),
                env_passthrough: Vec::new(),
            },
            runtime.clone(),
        );
        let processor = ScanProcessor::new(
            ProcessorConfig {
                engine_id: "eng-1".into(),
                working_dir: work.path().to_path_buf(),
                callback_queue: "callback".into(),
                mandatory_include: Vec::new(),
                fleet: FleetToml::default(),
            },
            db.clone(),
            runner,
            Arc::new(EventPublisher::new(sink.clone(), all_enabled())),
            queue.clone(),
        );
        Harness {
            repo_url: origin.path().to_string_lossy().into_owned(),
            _dirs: vec![plugins, origin, work],
            db,
            queue,
            sink,
            runtime,
            processor,
        }
    }

    fn task(h: &Harness, id: &str, plugins: &[&str]) -> ScanTask {
        serde_json::from_value(json!({
            "scan_id": id,
            "service": "github",
            "repo": "acme/api",
            "branch": "main",
            "url": h.repo_url,
            "plugins": plugins,
        }))
        .unwrap()
    }

    const NO_FINDINGS: &str = r#"{"success": true, "details": []}"#;

    /// Record a prior scan in which `plugin` found one vulnerability.
    async fn seed_vulnerability(h: &Harness, plugin: &str) {
        let prior = task(h, "prior", &[plugin]).to_scan();
        let row = prior.clone();
        h.db.call(move |db| db.upsert_scan(&row)).await.unwrap();
        let env: PluginEnvelope = serde_json::from_value(json!({
            "success": true,
            "details": [{
                "id": "CVE-2021-23337",
                "description": "Command injection",
                "severity": "high",
                "source": "package-lock.json",
                "inventory": {
                    "advisory_ids": ["CVE-2021-23337"],
                    "component": {"name": "lodash", "version": "4.17.20"}
                }
            }]
        }))
        .unwrap();
        let mut result = PluginResult::from_envelope(plugin, PluginKind::Vulnerability, env).unwrap();
        Reconciler::new(h.db.clone())
            .merge_findings(&prior, &mut result)
            .await
            .unwrap();
    }

    async fn open_count(h: &Harness) -> usize {
        h.db.call(|db| db.open_instances("github", "acme/api", "main"))
            .await
            .unwrap()
            .len()
    }

    async fn stored_scan(h: &Harness, id: &str) -> Scan {
        let id = id.to_string();
        h.db.call(move |db| db.get_scan(&id)).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_errored_plugin_keeps_its_vulnerability_open() {
        let runtime = MockRuntime::default().with_stdout("p1-image", NO_FINDINGS);
        let h = harness(runtime);
        seed_vulnerability(&h, "p2").await;
        // p2 breaks before producing a result envelope.
        std::fs::remove_file(h.processor.runner().config().plugin_dir.join("p2/settings.json")).unwrap();

        let status = h.processor.process(&task(&h, "s1", &["p1", "p2"])).await.unwrap();

        assert_eq!(status, ScanStatus::Completed);
        assert_eq!(open_count(&h).await, 1);
        let scan = stored_scan(&h, "s1").await;
        assert_eq!(scan.status, ScanStatus::Completed);
        assert_eq!(scan.errors.len(), 1);
        assert!(scan.errors[0].contains("p2"));
        assert_eq!(scan.progress.current_plugin, 2);
        assert_eq!(scan.progress.total_plugins, 2);
    }

    #[tokio::test]
    async fn test_clean_rerun_resolves_vulnerability() {
        let runtime = MockRuntime::default()
            .with_stdout("p1-image", NO_FINDINGS)
            .with_stdout("p2-image", NO_FINDINGS);
        let h = harness(runtime);
        seed_vulnerability(&h, "p2").await;

        let status = h.processor.process(&task(&h, "s1", &["p1", "p2"])).await.unwrap();

        assert_eq!(status, ScanStatus::Completed);
        assert_eq!(open_count(&h).await, 0);
        let events = h.sink.events.lock().unwrap();
        assert!(events.iter().any(|e| e["type"] == "vulnerability"
            && e["details"]["resolved"] == json!(true)));
    }

    #[tokio::test]
    async fn test_unsuccessful_result_counts_as_errored() {
        let runtime = MockRuntime::default()
            .with_stdout("p1-image", NO_FINDINGS)
            .with_stdout("p2-image", "Segmentation fault");
        let h = harness(runtime);
        seed_vulnerability(&h, "p2").await;

        h.processor.process(&task(&h, "s1", &["p1", "p2"])).await.unwrap();

        assert_eq!(open_count(&h).await, 1);
        let results = h.db.call(|db| db.plugin_results("s1")).await.unwrap();
        let p2 = results.iter().find(|r| r.plugin_name == "p2").unwrap();
        assert!(!p2.success);
        assert!(stored_scan(&h, "s1").await.errors.is_empty());
    }

    #[tokio::test]
    async fn test_disabled_plugin_is_not_persisted() {
        let runtime = MockRuntime::default().with_stdout("p1-image", NO_FINDINGS);
        let h = harness(runtime);

        h.processor.process(&task(&h, "s1", &["off", "p1"])).await.unwrap();

        let results = h.db.call(|db| db.plugin_results("s1")).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(h.runtime.runs.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sbom_components_recorded_and_details_cleared() {
        let sbom = json!({
            "success": true,
            "details": [[{
                "name": "lodash",
                "version": "4.17.21",
                "type": "npm",
                "licenses": [{"id": "MIT", "name": "MIT License"}],
                "deps": []
            }]]
        });
        let runtime = MockRuntime::default().with_stdout("sbom-image", &sbom.to_string());
        let h = harness(runtime);

        h.processor.process(&task(&h, "s1", &["sbom"])).await.unwrap();

        let results = h.db.call(|db| db.plugin_results("s1")).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].details, json!([]));
        let components = h
            .db
            .call(|db| db.repo_components("github", "acme/api"))
            .await
            .unwrap();
        assert_eq!(components.len(), 1);
        assert_eq!(components[0].name, "lodash");
        assert_eq!(components[0].licenses, vec!["mit"]);
    }

    #[tokio::test]
    async fn test_working_dir_removed_after_scan() {
        let runtime = MockRuntime::default().with_stdout("p1-image", NO_FINDINGS);
        let h = harness(runtime);

        h.processor.process(&task(&h, "s1", &["p1"])).await.unwrap();

        let runs = h.runtime.runs.lock().unwrap();
        assert_eq!(runs.len(), 1);
        assert!(!h.processor.config.working_dir.join("s1").exists());
    }

    #[tokio::test]
    async fn test_unreachable_repo_ends_in_error() {
        let h = harness(MockRuntime::default());
        let mut t = task(&h, "s1", &["p1"]);
        t.url = Some("/nonexistent/repo".into());

        let status = h.processor.process(&t).await.unwrap();

        assert_eq!(status, ScanStatus::Error);
        let scan = stored_scan(&h, "s1").await;
        assert_eq!(scan.errors, vec![REPO_UNAVAILABLE.to_string()]);
        assert!(h.runtime.runs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_repo_too_large_fails_without_cloning() {
        let h = harness(MockRuntime::default());
        let mut t = task(&h, "s1", &["p1"]);
        t.repo_size = u64::MAX / 4096;

        assert_eq!(h.processor.process(&t).await.unwrap(), ScanStatus::Error);
        let scan = stored_scan(&h, "s1").await;
        assert!(scan.errors[0].starts_with("Repo too large"));
        assert!(h.runtime.runs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_callback_is_queued_with_status() {
        let runtime = MockRuntime::default().with_stdout("p1-image", NO_FINDINGS);
        let h = harness(runtime);
        let mut t = task(&h, "s1", &["p1"]);
        t.callback = Some(scanfleet_common::request::ScanCallback {
            url: "https://ci.example.com/hook".into(),
            client_id: Some("ci".into()),
        });

        h.processor.process(&t).await.unwrap();

        let messages = h
            .queue
            .receive("callback", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);
        let body: Value = serde_json::from_str(&messages[0].body).unwrap();
        assert_eq!(body["data"]["repo"], "acme/api/s1");
        assert_eq!(body["data"]["status"], "completed");
        assert_eq!(body["client_id"], "ci");
    }

    #[tokio::test]
    async fn test_metadata_event_only_for_default_branch() {
        let runtime = MockRuntime::default().with_stdout("p1-image", NO_FINDINGS);
        let h = harness(runtime);

        h.processor.process(&task(&h, "s1", &["p1"])).await.unwrap();
        let mut t = task(&h, "s2", &["p1"]);
        t.branch = None;
        h.processor.process(&t).await.unwrap();

        let events = h.sink.events.lock().unwrap();
        let metadata: Vec<_> = events.iter().filter(|e| e["type"] == "metadata").collect();
        assert_eq!(metadata.len(), 1);
        assert_eq!(metadata[0]["application_metadata"], json!({}));
    }

    fn worker(
        h: Harness,
        registry: Arc<dyn EngineRegistry>,
    ) -> (EngineWorker, Arc<MockHost>, Vec<tempfile::TempDir>) {
        let host = Arc::new(MockHost::default());
        let worker = EngineWorker::new(
            WorkerConfig {
                task_queue: "task".into(),
                priority_task_queue: "task-priority".into(),
                poll_wait: Duration::ZERO,
                priority_poll_wait: Duration::ZERO,
                termination_jitter: Duration::ZERO,
            },
            EngineManager::new(manager_config(2), registry),
            h.processor,
            h.queue,
            host.clone(),
            Arc::new(StaticSiblings(Ok(Default::default()))),
        );
        (worker, host, h._dirs)
    }

    #[tokio::test]
    async fn test_poll_prefers_priority_queue_and_acknowledges() {
        let runtime = MockRuntime::default().with_stdout("p1-image", NO_FINDINGS);
        let h = harness(runtime);
        let (queue, db) = (h.queue.clone(), h.db.clone());
        let normal = serde_json::to_string(&task(&h, "normal", &["p1"])).unwrap();
        let urgent = serde_json::to_string(&task(&h, "urgent", &["p1"])).unwrap();
        queue.send("task", normal).await.unwrap();
        queue.send("task-priority", urgent).await.unwrap();
        let (worker, _, _dirs) = worker(h, Arc::new(ScriptedRegistry::default()));

        assert!(worker.poll_once().await.unwrap());
        let urgent = db.call(|db| db.get_scan("urgent")).await.unwrap().unwrap();
        assert_eq!(urgent.status, ScanStatus::Completed);
        assert!(db.call(|db| db.get_scan("normal")).await.unwrap().is_none());
        assert_eq!(queue.depth("task-priority").await.unwrap(), 0);

        assert!(worker.poll_once().await.unwrap());
        assert_eq!(queue.depth("task").await.unwrap(), 0);
        assert!(!worker.poll_once().await.unwrap());
    }

    #[tokio::test]
    async fn test_malformed_task_is_dropped() {
        let h = harness(MockRuntime::default());
        let queue = h.queue.clone();
        queue.send("task", "not json".into()).await.unwrap();
        let (worker, _, _dirs) = worker(h, Arc::new(ScriptedRegistry::default()));

        let err = worker.poll_once().await.unwrap_err();
        assert!(matches!(err, EngineError::MalformedTask(_)));
        assert_eq!(queue.depth("task").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_datastore_releases_host_without_polling() {
        let h = harness(MockRuntime::default());
        let queue = h.queue.clone();
        let t = serde_json::to_string(&task(&h, "s1", &["p1"])).unwrap();
        queue.send("task", t).await.unwrap();
        let registry = Arc::new(ScriptedRegistry::failing_connects(10));
        let (worker, host, _dirs) = worker(h, registry.clone());

        assert_eq!(worker.run().await, HostRelease::Terminated);
        assert_eq!(*host.unhealthy_calls.lock().unwrap(), 1);
        assert_eq!(queue.depth("task").await.unwrap(), 1);
        assert!(registry.writes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_request_stops_loop() {
        let h = harness(MockRuntime::default());
        let registry = Arc::new(ScriptedRegistry::default());
        registry
            .states
            .lock()
            .unwrap()
            .push_back(Ok(Some(EngineState::ShutdownRequested)));
        let (worker, host, _dirs) = worker(h, registry.clone());

        assert_eq!(worker.run().await, HostRelease::Terminated);
        assert_eq!(*host.terminate_calls.lock().unwrap(), 1);
        let writes = registry.writes.lock().unwrap();
        assert_eq!(
            writes.as_slice(),
            [(EngineState::Shutdown, true), (EngineState::Terminated, false)]
        );
    }
}
