use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    Queued,
    Running,
    Completed,
    Error,
    ShutdownRequested,
    Shutdown,
    Terminated,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::ShutdownRequested => "shutdown_requested",
            Self::Shutdown => "shutdown",
            Self::Terminated => "terminated",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Terminated)
    }
}

impl FromStr for ScanStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            "shutdown_requested" => Ok(Self::ShutdownRequested),
            "shutdown" => Ok(Self::Shutdown),
            "terminated" => Ok(Self::Terminated),
            _ => Err(format!("Invalid scan status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Running,
    ShutdownRequested,
    Shutdown,
    Terminated,
}

impl EngineState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::ShutdownRequested => "shutdown_requested",
            Self::Shutdown => "shutdown",
            Self::Terminated => "terminated",
        }
    }
}

impl FromStr for EngineState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "shutdown_requested" => Ok(Self::ShutdownRequested),
            "shutdown" => Ok(Self::Shutdown),
            "terminated" => Ok(Self::Terminated),
            _ => Err(format!("Invalid engine state: {}", s)),
        }
    }
}

/// Per-scan plugin progress. `current_plugin` is 1-based and capped at
/// `total_plugins`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ScanProgress {
    pub plugin_name: Option<String>,
    pub plugin_start_time: Option<DateTime<Utc>>,
    pub current_plugin: u32,
    pub total_plugins: u32,
}

impl ScanProgress {
    pub fn new(total_plugins: u32) -> Self {
        Self {
            total_plugins,
            ..Default::default()
        }
    }

    /// Record that `name` is starting. Never moves past `total_plugins`.
    pub fn start_plugin(&mut self, name: &str, at: DateTime<Utc>) {
        self.plugin_name = Some(name.to_string());
        self.plugin_start_time = Some(at);
        self.current_plugin = (self.current_plugin + 1).min(self.total_plugins);
    }
}

/// A scan as seen by the engine: what to run, where, and how far it got.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Scan {
    pub id: String,
    pub service: String,
    pub repo: String,
    /// `None` means the repository's default branch.
    pub branch: Option<String>,
    pub status: ScanStatus,
    pub progress: ScanProgress,
    pub plugins: Vec<String>,
    pub depth: Option<u32>,
    pub include_dev: bool,
    pub features: HashMap<String, bool>,
    pub include_paths: Vec<String>,
    pub exclude_paths: Vec<String>,
    pub diff_base: Option<String>,
    pub diff_compare: Option<String>,
    pub owner: Option<String>,
    pub batch_id: Option<String>,
    pub engine_id: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub errors: Vec<String>,
    pub alerts: Vec<String>,
    pub debug: Vec<String>,
}

impl Scan {
    /// The git ref to check out, `HEAD` for default-branch scans.
    pub fn git_ref(&self) -> &str {
        self.branch.as_deref().unwrap_or("HEAD")
    }

    pub fn is_default_branch(&self) -> bool {
        self.branch.is_none()
    }

    /// `service/repo`, the form plugin config scopes match against.
    pub fn full_repo(&self) -> String {
        format!("{}/{}", self.service, self.repo)
    }

    /// Plugin names actually requested, without `-name` exclusion markers.
    pub fn selected_plugins(&self) -> Vec<String> {
        self.plugins
            .iter()
            .filter(|p| !p.starts_with('-'))
            .cloned()
            .collect()
    }
}
