use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AllowListKind {
    Secret,
    SecretRaw,
    Vulnerability,
    VulnerabilityRaw,
    StaticAnalysis,
}

impl AllowListKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Secret => "secret",
            Self::SecretRaw => "secret_raw",
            Self::Vulnerability => "vulnerability",
            Self::VulnerabilityRaw => "vulnerability_raw",
            Self::StaticAnalysis => "static_analysis",
        }
    }
}

impl FromStr for AllowListKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "secret" => Ok(Self::Secret),
            "secret_raw" => Ok(Self::SecretRaw),
            "vulnerability" => Ok(Self::Vulnerability),
            "vulnerability_raw" => Ok(Self::VulnerabilityRaw),
            "static_analysis" => Ok(Self::StaticAnalysis),
            _ => Err(format!("Invalid allowlist type: {}", s)),
        }
    }
}

/// An externally managed suppression rule. The shape of `value` depends on
/// `kind`; consumers decode the fields they care about.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AllowListItem {
    #[serde(rename = "type")]
    pub kind: AllowListKind,
    pub value: serde_json::Value,
    #[serde(default)]
    pub expires: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reason: String,
}

impl AllowListItem {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_none_or(|e| e > now)
    }

    /// String field of `value`, if present.
    pub fn value_str(&self, field: &str) -> Option<&str> {
        self.value.get(field).and_then(|v| v.as_str())
    }
}
