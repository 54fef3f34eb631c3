//! Shared domain types for the scanfleet pipeline.
//!
//! These types cross process boundaries (queue payloads, plugin output,
//! stored rows) so they live in their own crate with no runtime deps.

pub mod allowlist;
pub mod plugin;
pub mod request;
pub mod scan;
pub mod severity;

pub use allowlist::{AllowListItem, AllowListKind};
pub use plugin::{
    ComponentRef, ConfigurationCheck, PluginDetails, PluginEnvelope, PluginKind, PluginResult,
    SecretFinding, StaticAnalysisFinding, VulnerabilityFinding, VulnerabilityInventory,
};
pub use request::{ScanRequest, ScanTask};
pub use scan::{EngineState, Scan, ScanProgress, ScanStatus};
pub use severity::{Severity, UNKNOWN_RANK, most_severe, severity_rank};
