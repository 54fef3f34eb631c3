use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum PluginKind {
    StaticAnalysis,
    Vulnerability,
    Inventory,
    Sbom,
    Configuration,
    Secrets,
    #[default]
    Misc,
}

impl PluginKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StaticAnalysis => "static_analysis",
            Self::Vulnerability => "vulnerability",
            Self::Inventory => "inventory",
            Self::Sbom => "sbom",
            Self::Configuration => "configuration",
            Self::Secrets => "secrets",
            Self::Misc => "misc",
        }
    }
}

impl FromStr for PluginKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "static_analysis" => Ok(Self::StaticAnalysis),
            "vulnerability" => Ok(Self::Vulnerability),
            "inventory" => Ok(Self::Inventory),
            "sbom" => Ok(Self::Sbom),
            "configuration" => Ok(Self::Configuration),
            "secrets" => Ok(Self::Secrets),
            "misc" => Ok(Self::Misc),
            _ => Err(format!("Invalid plugin type: {}", s)),
        }
    }
}

/// The JSON object a plugin prints on stdout. Details stay untyped here and
/// are decoded per kind by [`PluginDetails::decode`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PluginEnvelope {
    /// Self-reported name. Informational only; results are keyed by the
    /// plugin identifier the runner invoked.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub truncated: bool,
    #[serde(default)]
    pub details: Value,
    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub alerts: Vec<String>,
    #[serde(default)]
    pub debug: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_info: Option<Map<String, Value>>,
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
        Null,
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
        OneOrMany::Null => Vec::new(),
    })
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StaticAnalysisFinding {
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub line: Option<i64>,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub severity: String,
    #[serde(rename = "type", default)]
    pub kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComponentRef {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

impl ComponentRef {
    /// `name-version`, the form structured allowlist entries use.
    pub fn label(&self) -> String {
        format!("{}-{}", self.name, self.version)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct VulnerabilityInventory {
    #[serde(default)]
    pub advisory_ids: Vec<String>,
    #[serde(default)]
    pub component: Option<ComponentRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VulnerabilityFinding {
    pub id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub remediation: String,
    #[serde(default, deserialize_with = "one_or_many")]
    pub source: Vec<String>,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub line: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inventory: Option<VulnerabilityInventory>,
}

impl VulnerabilityFinding {
    /// Advisory IDs reported for this finding, falling back to its own id.
    pub fn advisory_ids(&self) -> Vec<String> {
        match &self.inventory {
            Some(inv) if !inv.advisory_ids.is_empty() => inv.advisory_ids.clone(),
            _ => vec![self.id.clone()],
        }
    }

    pub fn component(&self) -> Option<&ComponentRef> {
        self.inventory.as_ref().and_then(|inv| inv.component.as_ref())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfigurationCheck {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub severity: String,
    pub pass: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SecretFinding {
    pub id: String,
    #[serde(default)]
    pub filename: String,
    #[serde(default)]
    pub line: i64,
    #[serde(default)]
    pub commit: String,
    #[serde(default)]
    pub author: String,
    #[serde(rename = "author-timestamp", default)]
    pub author_timestamp: String,
    #[serde(rename = "type", default)]
    pub secret_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

/// Plugin details decoded according to the plugin's declared kind.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum PluginDetails {
    StaticAnalysis(Vec<StaticAnalysisFinding>),
    Vulnerability(Vec<VulnerabilityFinding>),
    Configuration(Vec<ConfigurationCheck>),
    Secrets(Vec<SecretFinding>),
    Sbom(Vec<Value>),
    Inventory(Value),
    Misc(Value),
}

impl PluginDetails {
    pub fn empty(kind: PluginKind) -> Self {
        match kind {
            PluginKind::StaticAnalysis => Self::StaticAnalysis(Vec::new()),
            PluginKind::Vulnerability => Self::Vulnerability(Vec::new()),
            PluginKind::Configuration => Self::Configuration(Vec::new()),
            PluginKind::Secrets => Self::Secrets(Vec::new()),
            PluginKind::Sbom => Self::Sbom(Vec::new()),
            PluginKind::Inventory => Self::Inventory(Value::Array(Vec::new())),
            PluginKind::Misc => Self::Misc(Value::Array(Vec::new())),
        }
    }

    /// Decode raw plugin details. A missing/null value decodes as empty.
    pub fn decode(kind: PluginKind, raw: Value) -> Result<Self, serde_json::Error> {
        if raw.is_null() {
            return Ok(Self::empty(kind));
        }
        Ok(match kind {
            PluginKind::StaticAnalysis => Self::StaticAnalysis(serde_json::from_value(raw)?),
            PluginKind::Vulnerability => Self::Vulnerability(serde_json::from_value(raw)?),
            PluginKind::Configuration => Self::Configuration(serde_json::from_value(raw)?),
            PluginKind::Secrets => Self::Secrets(serde_json::from_value(raw)?),
            PluginKind::Sbom => Self::Sbom(serde_json::from_value(raw)?),
            PluginKind::Inventory => Self::Inventory(raw),
            PluginKind::Misc => Self::Misc(raw),
        })
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::StaticAnalysis(v) => v.is_empty(),
            Self::Vulnerability(v) => v.is_empty(),
            Self::Configuration(v) => v.is_empty(),
            Self::Secrets(v) => v.is_empty(),
            Self::Sbom(v) => v.is_empty(),
            Self::Inventory(v) | Self::Misc(v) => match v {
                Value::Null => true,
                Value::Array(a) => a.is_empty(),
                Value::Object(o) => o.is_empty(),
                _ => false,
            },
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// One plugin's outcome for one scan.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PluginResult {
    pub name: String,
    pub kind: PluginKind,
    pub success: bool,
    pub truncated: bool,
    pub details: PluginDetails,
    pub errors: Vec<String>,
    pub alerts: Vec<String>,
    pub debug: Vec<String>,
    pub disabled: bool,
    #[serde(skip)]
    pub event_info: Option<Map<String, Value>>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl PluginResult {
    fn base(name: &str, kind: PluginKind, success: bool) -> Self {
        Self {
            name: name.to_string(),
            kind,
            success,
            truncated: false,
            details: PluginDetails::empty(kind),
            errors: Vec::new(),
            alerts: Vec::new(),
            debug: Vec::new(),
            disabled: false,
            event_info: None,
            start_time: None,
            end_time: None,
        }
    }

    /// A skipped plugin: always successful, never carries details.
    pub fn disabled(name: &str, kind: PluginKind) -> Self {
        let mut result = Self::base(name, kind, true);
        result.disabled = true;
        result.debug.push(format!("Plugin {} is disabled", name));
        result
    }

    /// A plugin that could not produce output. Carries exactly one error.
    pub fn failed(name: &str, kind: PluginKind, error: impl Into<String>) -> Self {
        let mut result = Self::base(name, kind, false);
        result.errors.push(error.into());
        result
    }

    /// A plugin without a runnable image. Reported as an error but counted as
    /// successful so its (absent) findings do not block resolution.
    pub fn unconfigured(name: &str, kind: PluginKind) -> Self {
        let mut result = Self::base(name, kind, true);
        result
            .errors
            .push(format!("Unable to load settings for plugin {}", name));
        result
    }

    pub fn from_envelope(
        name: &str,
        kind: PluginKind,
        envelope: PluginEnvelope,
    ) -> Result<Self, serde_json::Error> {
        let details = PluginDetails::decode(kind, envelope.details)?;
        Ok(Self {
            name: name.to_string(),
            kind,
            success: envelope.success,
            truncated: envelope.truncated,
            details,
            errors: envelope.errors,
            alerts: envelope.alerts,
            debug: envelope.debug,
            disabled: false,
            event_info: envelope.event_info,
            start_time: None,
            end_time: None,
        })
    }
}
