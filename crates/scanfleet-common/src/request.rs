use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::scan::{Scan, ScanProgress, ScanStatus};

fn default_service() -> String {
    "github".to_string()
}

/// A request to scan one repository, as carried on the repo queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScanRequest {
    #[serde(default = "default_service")]
    pub service: String,
    #[serde(default)]
    pub org: String,
    #[serde(default)]
    pub repo: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugins: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depth: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
}

impl ScanRequest {
    pub fn new(service: &str, org: &str, repo: &str) -> Self {
        Self {
            service: service.to_string(),
            org: org.to_string(),
            repo: repo.to_string(),
            branch: None,
            plugins: None,
            depth: None,
            batch_id: None,
        }
    }

    pub fn with_branch(mut self, branch: &str) -> Self {
        self.branch = Some(branch.to_string());
        self
    }

    pub fn with_plugins(mut self, plugins: Vec<String>) -> Self {
        self.plugins = Some(plugins);
        self
    }

    pub fn with_batch_id(mut self, batch_id: Option<String>) -> Self {
        self.batch_id = batch_id;
        self
    }

    /// Both `org` and `repo` are required for admission.
    pub fn is_valid(&self) -> bool {
        !self.org.is_empty() && !self.repo.is_empty()
    }

    /// Lowercased `org/repo`, the identity the admission API echoes back.
    pub fn key(&self) -> String {
        format!("{}/{}", self.org, self.repo).to_lowercase()
    }
}

/// Where to report scan completion for API-initiated scans.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScanCallback {
    pub url: String,
    #[serde(default)]
    pub client_id: Option<String>,
}

/// An admitted scan handed to the engine fleet via the task queues.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScanTask {
    pub scan_id: String,
    #[serde(default = "default_service")]
    pub service: String,
    pub repo: String,
    /// Clone URL; derived from the service when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default)]
    pub plugins: Vec<String>,
    /// Repository size in KB as reported by the provider.
    #[serde(default)]
    pub repo_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depth: Option<u32>,
    #[serde(default)]
    pub include_dev: bool,
    #[serde(default)]
    pub features: HashMap<String, bool>,
    #[serde(default)]
    pub include_paths: Vec<String>,
    #[serde(default)]
    pub exclude_paths: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff_base: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff_compare: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback: Option<ScanCallback>,
}

impl ScanTask {
    pub fn to_scan(&self) -> Scan {
        Scan {
            id: self.scan_id.clone(),
            service: self.service.clone(),
            repo: self.repo.clone(),
            branch: self.branch.clone(),
            status: ScanStatus::Queued,
            progress: ScanProgress::new(
                self.plugins.iter().filter(|p| !p.starts_with('-')).count() as u32,
            ),
            plugins: self.plugins.clone(),
            depth: self.depth,
            include_dev: self.include_dev,
            features: self.features.clone(),
            include_paths: self.include_paths.clone(),
            exclude_paths: self.exclude_paths.clone(),
            diff_base: self.diff_base.clone(),
            diff_compare: self.diff_compare.clone(),
            owner: self.owner.clone(),
            batch_id: self.batch_id.clone(),
            engine_id: None,
            start_time: None,
            end_time: None,
            errors: Vec::new(),
            alerts: Vec::new(),
            debug: Vec::new(),
        }
    }
}
