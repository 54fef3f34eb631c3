//! Fleet configuration loaded from `.scanfleet/fleet.toml`.
//!
//! Layering is file → environment → CLI. Every section has defaults so an
//! empty (or missing) file yields a runnable local setup.
//!
//! ```toml
//! [engine]
//! db_retry_wait_secs = 5
//! db_retry_limit = 60
//! maintenance_interval_secs = 300
//! plugin_dir = "plugins"
//! registry = "123456789.dkr.ecr.us-east-2.amazonaws.com"
//!
//! [dispatch]
//! admission_url = "https://scans.example.com/api/v1/scans"
//! api_key_env = "SCANFLEET_API_KEY"
//!
//! [discovery.services.github]
//! type = "github"
//! url = "https://api.github.com/graphql"
//! token_env = "GITHUB_TOKEN"
//!
//! [[plugin_config]]
//! plugin = "trivy"
//! scope = ["github/acme/*"]
//! config = { severity = "HIGH" }
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

pub const CONFIG_DIR: &str = ".scanfleet";
pub const CONFIG_FILE: &str = "fleet.toml";
pub const DB_FILE: &str = "fleet.db";

// ── [engine] ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSection {
    /// Engine identity; generated at startup when unset.
    #[serde(default)]
    pub id: Option<String>,
    /// Host/instance identity used for health and termination calls.
    #[serde(default)]
    pub instance_id: Option<String>,
    #[serde(default = "default_db_retry_wait_secs")]
    pub db_retry_wait_secs: u64,
    #[serde(default = "default_db_retry_limit")]
    pub db_retry_limit: u32,
    #[serde(default = "default_maintenance_interval_secs")]
    pub maintenance_interval_secs: u64,
    #[serde(default = "default_termination_jitter_secs")]
    pub termination_jitter_secs: u64,
    #[serde(default = "default_poll_wait_secs")]
    pub poll_wait_secs: u64,
    #[serde(default = "default_priority_poll_wait_secs")]
    pub priority_poll_wait_secs: u64,
    /// Where the engine clones repositories, one directory per scan.
    #[serde(default = "default_working_dir")]
    pub working_dir: PathBuf,
    /// The same directory as seen by the container host, for bind mounts.
    #[serde(default)]
    pub host_working_dir: Option<PathBuf>,
    #[serde(default = "default_plugin_dir")]
    pub plugin_dir: PathBuf,
    /// Container registry substituted for `$REGISTRY` in plugin images.
    #[serde(default)]
    pub registry: Option<String>,
    #[serde(default = "default_java_heap_size")]
    pub java_heap_size: String,
    /// Paths restored after every workspace reset, regardless of excludes.
    #[serde(default)]
    pub mandatory_include_paths: Vec<String>,
    /// Environment variable names forwarded verbatim into plugin containers.
    #[serde(default)]
    pub plugin_env_passthrough: Vec<String>,
    /// Shell command that flags this host unhealthy with its load balancer or ASG.
    #[serde(default)]
    pub host_unhealthy_command: Option<String>,
    /// Shell command that terminates this host.
    #[serde(default)]
    pub host_terminate_command: Option<String>,
}

fn default_db_retry_wait_secs() -> u64 {
    5
}

fn default_db_retry_limit() -> u32 {
    60
}

fn default_maintenance_interval_secs() -> u64 {
    300
}

fn default_termination_jitter_secs() -> u64 {
    30
}

fn default_poll_wait_secs() -> u64 {
    20
}

fn default_priority_poll_wait_secs() -> u64 {
    5
}

fn default_working_dir() -> PathBuf {
    PathBuf::from("work")
}

fn default_plugin_dir() -> PathBuf {
    PathBuf::from("plugins")
}

fn default_java_heap_size() -> String {
    "2g".to_string()
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            id: None,
            instance_id: None,
            db_retry_wait_secs: default_db_retry_wait_secs(),
            db_retry_limit: default_db_retry_limit(),
            maintenance_interval_secs: default_maintenance_interval_secs(),
            termination_jitter_secs: default_termination_jitter_secs(),
            poll_wait_secs: default_poll_wait_secs(),
            priority_poll_wait_secs: default_priority_poll_wait_secs(),
            working_dir: default_working_dir(),
            host_working_dir: None,
            plugin_dir: default_plugin_dir(),
            registry: None,
            java_heap_size: default_java_heap_size(),
            mandatory_include_paths: Vec::new(),
            plugin_env_passthrough: Vec::new(),
            host_unhealthy_command: None,
            host_terminate_command: None,
        }
    }
}

impl EngineSection {
    pub fn db_retry_wait(&self) -> Duration {
        Duration::from_secs(self.db_retry_wait_secs)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }

    pub fn termination_jitter(&self) -> Duration {
        Duration::from_secs(self.termination_jitter_secs)
    }

    pub fn poll_wait(&self) -> Duration {
        Duration::from_secs(self.poll_wait_secs)
    }

    pub fn priority_poll_wait(&self) -> Duration {
        Duration::from_secs(self.priority_poll_wait_secs)
    }
}

// ── [queues] ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuesSection {
    #[serde(default = "default_repo_queue")]
    pub repo_queue: String,
    #[serde(default = "default_repo_dead_letter_queue")]
    pub repo_dead_letter_queue: String,
    #[serde(default = "default_org_queue")]
    pub org_queue: String,
    #[serde(default = "default_task_queue")]
    pub task_queue: String,
    #[serde(default = "default_priority_task_queue")]
    pub priority_task_queue: String,
    #[serde(default = "default_event_queue")]
    pub event_queue: String,
    #[serde(default = "default_callback_queue")]
    pub callback_queue: String,
    /// Seconds a received message stays invisible before redelivery.
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,
}

fn default_repo_queue() -> String {
    "repo".to_string()
}

fn default_repo_dead_letter_queue() -> String {
    "repo-dead-letter".to_string()
}

fn default_org_queue() -> String {
    "org".to_string()
}

fn default_task_queue() -> String {
    "task".to_string()
}

fn default_priority_task_queue() -> String {
    "task-priority".to_string()
}

fn default_event_queue() -> String {
    "event".to_string()
}

fn default_callback_queue() -> String {
    "callback".to_string()
}

fn default_visibility_timeout_secs() -> u64 {
    300
}

impl Default for QueuesSection {
    fn default() -> Self {
        Self {
            repo_queue: default_repo_queue(),
            repo_dead_letter_queue: default_repo_dead_letter_queue(),
            org_queue: default_org_queue(),
            task_queue: default_task_queue(),
            priority_task_queue: default_priority_task_queue(),
            event_queue: default_event_queue(),
            callback_queue: default_callback_queue(),
            visibility_timeout_secs: default_visibility_timeout_secs(),
        }
    }
}

// ── [dispatch] ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchSection {
    #[serde(default)]
    pub admission_url: Option<String>,
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_target_count")]
    pub target_count: usize,
    #[serde(default = "default_dispatch_plugins")]
    pub default_plugins: Vec<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Days an accepted scan record is kept for tracking.
    #[serde(default = "default_scan_record_ttl_days")]
    pub scan_record_ttl_days: i64,
}

fn default_api_key_env() -> String {
    "SCANFLEET_API_KEY".to_string()
}

fn default_target_count() -> usize {
    100
}

fn default_dispatch_plugins() -> Vec<String> {
    vec!["gitsecrets".to_string(), "base_images".to_string()]
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_scan_record_ttl_days() -> i64 {
    60
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            admission_url: None,
            api_key_env: default_api_key_env(),
            target_count: default_target_count(),
            default_plugins: default_dispatch_plugins(),
            request_timeout_secs: default_request_timeout_secs(),
            scan_record_ttl_days: default_scan_record_ttl_days(),
        }
    }
}

// ── [discovery] ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    Github,
    Gitlab,
    Bitbucket,
}

impl ServiceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Github => "github",
            Self::Gitlab => "gitlab",
            Self::Bitbucket => "bitbucket",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(rename = "type")]
    pub kind: ServiceType,
    /// API base URL (GraphQL endpoint for GitHub and GitLab, REST root for Bitbucket).
    pub url: String,
    /// GitLab REST root (`.../api/v4`) used for branch listings.
    #[serde(default)]
    pub branch_url: Option<String>,
    /// Hostname plugins use when cloning or calling the service.
    #[serde(default)]
    pub hostname: Option<String>,
    /// Environment variable holding the API token.
    #[serde(default)]
    pub token_env: Option<String>,
}

impl ServiceConfig {
    pub fn token(&self) -> Option<String> {
        self.token_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
            .filter(|t| !t.is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverySection {
    /// `service/org` entries this fleet does not own; only private repos are scanned.
    #[serde(default)]
    pub external_orgs: Vec<String>,
    #[serde(default = "default_dispatch_plugins")]
    pub default_plugins: Vec<String>,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// How long a throttled request stays invisible before it is retried.
    #[serde(default = "default_throttle_delay_secs")]
    pub throttle_delay_secs: u64,
    #[serde(default)]
    pub services: HashMap<String, ServiceConfig>,
}

fn default_page_size() -> u32 {
    75
}

fn default_throttle_delay_secs() -> u64 {
    60
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            external_orgs: Vec::new(),
            default_plugins: default_dispatch_plugins(),
            request_timeout_secs: default_request_timeout_secs(),
            page_size: default_page_size(),
            throttle_delay_secs: default_throttle_delay_secs(),
            services: HashMap::new(),
        }
    }
}

// ── [events] ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventsSection {
    #[serde(default)]
    pub secrets: bool,
    #[serde(default)]
    pub inventory: bool,
    #[serde(default)]
    pub configuration: bool,
    #[serde(default)]
    pub vulnerability: bool,
    #[serde(default)]
    pub metadata: bool,
    /// Emit secrets events even for scans that narrow paths.
    #[serde(default)]
    pub secrets_with_path_exclusions: bool,
    /// UI base URL used to build report links.
    #[serde(default)]
    pub report_base_url: Option<String>,
}

// ── [cache] ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSection {
    #[serde(default = "default_severity_ttl_secs")]
    pub severity_ttl_secs: i64,
}

fn default_severity_ttl_secs() -> i64 {
    7 * 24 * 60 * 60
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            severity_ttl_secs: default_severity_ttl_secs(),
        }
    }
}

// ── [[plugin_config]] ─────────────────────────────────────────────────

/// Per-repo plugin configuration; the first entry whose scope matches wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfigEntry {
    pub plugin: String,
    /// Glob patterns matched against `service/repo`.
    #[serde(default)]
    pub scope: Vec<String>,
    #[serde(default)]
    pub config: toml::Table,
}

// ── Root ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetToml {
    #[serde(default)]
    pub engine: EngineSection,
    #[serde(default)]
    pub queues: QueuesSection,
    #[serde(default)]
    pub dispatch: DispatchSection,
    #[serde(default)]
    pub discovery: DiscoverySection,
    #[serde(default)]
    pub events: EventsSection,
    #[serde(default)]
    pub cache: CacheSection,
    #[serde(default)]
    pub plugin_config: Vec<PluginConfigEntry>,
}

impl FleetToml {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Returns defaults when the file does not exist.
    pub fn load_or_default(dir: &Path) -> Result<Self, ConfigError> {
        let path = dir.join(CONFIG_FILE);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Apply `SCANFLEET_*` environment overrides.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|name| std::env::var(name).ok())
    }

    fn apply_env_from(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(v) = lookup("SCANFLEET_ENGINE_ID") {
            self.engine.id = Some(v);
        }
        if let Some(v) = lookup("SCANFLEET_INSTANCE_ID") {
            self.engine.instance_id = Some(v);
        }
        if let Some(v) = lookup("SCANFLEET_DB_RETRY_WAIT") {
            self.engine.db_retry_wait_secs = parse_env("SCANFLEET_DB_RETRY_WAIT", &v)?;
        }
        if let Some(v) = lookup("SCANFLEET_DB_RETRY_LIMIT") {
            self.engine.db_retry_limit = parse_env("SCANFLEET_DB_RETRY_LIMIT", &v)?;
        }
        if let Some(v) = lookup("SCANFLEET_REGISTRY") {
            self.engine.registry = Some(v);
        }
        if let Some(v) = lookup("SCANFLEET_PLUGIN_DIR") {
            self.engine.plugin_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("SCANFLEET_WORKING_DIR") {
            self.engine.working_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("SCANFLEET_HOST_WORKING_DIR") {
            self.engine.host_working_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("SCANFLEET_JAVA_HEAP_SIZE") {
            self.engine.java_heap_size = v;
        }
        if let Some(v) = lookup("SCANFLEET_ADMISSION_URL") {
            self.dispatch.admission_url = Some(v);
        }
        for (name, flag) in [
            ("SCANFLEET_SECRETS_EVENTS_ENABLED", &mut self.events.secrets),
            ("SCANFLEET_INVENTORY_EVENTS_ENABLED", &mut self.events.inventory),
            (
                "SCANFLEET_CONFIGURATION_EVENTS_ENABLED",
                &mut self.events.configuration,
            ),
            (
                "SCANFLEET_VULNERABILITY_EVENTS_ENABLED",
                &mut self.events.vulnerability,
            ),
            ("SCANFLEET_METADATA_EVENTS_ENABLED", &mut self.events.metadata),
        ] {
            if let Some(v) = lookup(name) {
                *flag = v.eq_ignore_ascii_case("true") || v == "1";
            }
        }
        Ok(())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if !is_valid_heap_size(&self.engine.java_heap_size) {
            warnings.push(format!(
                "Invalid java_heap_size '{}': expected e.g. '512m' or '2g'",
                self.engine.java_heap_size
            ));
        }
        if self.engine.db_retry_limit == 0 {
            warnings.push("db_retry_limit is 0: the engine will never connect".to_string());
        }
        if self.dispatch.admission_url.is_none() {
            warnings.push("dispatch.admission_url is not set; dispatch will refuse to run".into());
        }
        for entry in &self.plugin_config {
            for scope in &entry.scope {
                if glob::Pattern::new(scope).is_err() {
                    warnings.push(format!(
                        "Invalid scope '{}' for plugin '{}'",
                        scope, entry.plugin
                    ));
                }
            }
        }
        for (name, svc) in &self.discovery.services {
            if svc.token_env.is_none() {
                warnings.push(format!("Service '{}' has no token_env; calls are anonymous", name));
            }
            if svc.kind == ServiceType::Gitlab && svc.branch_url.is_none() {
                warnings.push(format!(
                    "Service '{}' has no branch_url; only default branches can be discovered",
                    name
                ));
            }
        }
        warnings
    }

    /// Config for `plugin` applicable to `full_repo` (`service/repo`).
    pub fn plugin_config_for(&self, plugin: &str, full_repo: &str) -> Option<&toml::Table> {
        self.plugin_config
            .iter()
            .filter(|e| e.plugin == plugin)
            .find(|e| {
                e.scope.iter().any(|scope| {
                    glob::Pattern::new(scope)
                        .map(|p| p.matches(full_repo))
                        .unwrap_or(false)
                })
            })
            .map(|e| &e.config)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        field: name.to_string(),
        message: format!("'{}' is not a valid number", value),
    })
}

fn is_valid_heap_size(value: &str) -> bool {
    Regex::new(r"^\d{1,4}[mg]$")
        .map(|re| re.is_match(value))
        .unwrap_or(false)
}

/// Resolved configuration: file + env + CLI overrides, plus derived paths.
#[derive(Debug, Clone)]
pub struct FleetConfig {
    pub project_dir: PathBuf,
    pub fleet_dir: PathBuf,
    pub toml: FleetToml,
    pub db_path: PathBuf,
}

impl FleetConfig {
    pub fn new(project_dir: PathBuf) -> Result<Self, ConfigError> {
        let fleet_dir = project_dir.join(CONFIG_DIR);
        let mut toml = FleetToml::load_or_default(&fleet_dir)?;
        toml.apply_env()?;
        let db_path = fleet_dir.join(DB_FILE);
        Ok(Self {
            project_dir,
            fleet_dir,
            toml,
            db_path,
        })
    }

    pub fn with_db_path(mut self, db_path: Option<PathBuf>) -> Self {
        if let Some(path) = db_path {
            self.db_path = path;
        }
        self
    }

    pub fn config_file(&self) -> PathBuf {
        self.fleet_dir.join(CONFIG_FILE)
    }

    /// Resolve a possibly relative path against the project directory.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_dir.join(path)
        }
    }

    pub fn working_dir(&self) -> PathBuf {
        self.resolve(&self.toml.engine.working_dir)
    }

    pub fn plugin_dir(&self) -> PathBuf {
        self.resolve(&self.toml.engine.plugin_dir)
    }

    /// Admission URL, required for dispatch.
    pub fn admission_url(&self) -> Result<&str, ConfigError> {
        self.toml
            .dispatch
            .admission_url
            .as_deref()
            .ok_or_else(|| ConfigError::Missing("dispatch.admission_url".to_string()))
    }

    pub fn service(&self, name: &str) -> Result<&ServiceConfig, ConfigError> {
        self.toml
            .discovery
            .services
            .get(name)
            .ok_or_else(|| ConfigError::Missing(format!("discovery.services.{}", name)))
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}
