//! Cross-plugin severity cache.
//!
//! Keys are `static_analysis:severity:<type>:<line>` and
//! `vulnerability:severity:<id>`. Every write is a most-severe-wins merge, so
//! a finding's cached severity never decreases before its entry expires.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::{Duration, Utc};
use scanfleet_common::{PluginDetails, PluginResult, UNKNOWN_RANK, severity_rank};

use crate::store::DbHandle;

#[derive(Clone)]
pub struct SeverityCache {
    db: DbHandle,
    ttl: Duration,
    /// Unknown severity values already logged by this process.
    reported: Arc<Mutex<HashSet<String>>>,
}

impl SeverityCache {
    pub fn new(db: DbHandle, ttl_secs: i64) -> Self {
        Self {
            db,
            ttl: Duration::seconds(ttl_secs),
            reported: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Merge every cacheable item of `result`. Returns the number merged.
    pub async fn merge_result(&self, result: &PluginResult) -> Result<usize> {
        let entries = cache_entries(result);
        if entries.is_empty() {
            return Ok(0);
        }
        for severity in self.unreported_unknowns(&entries) {
            tracing::warn!(severity = %severity, "unexpected severity");
        }
        let ttl = self.ttl;
        self.db
            .call(move |db| {
                let now = Utc::now();
                for (key, severity) in &entries {
                    db.merge_severity(key, severity, now, now + ttl)?;
                }
                Ok(entries.len())
            })
            .await
    }

    /// Unknown severities in `entries` not logged before. Each distinct
    /// value is returned once per process.
    fn unreported_unknowns(&self, entries: &[(String, String)]) -> Vec<String> {
        let Ok(mut reported) = self.reported.lock() else {
            return Vec::new();
        };
        entries
            .iter()
            .map(|(_, severity)| severity)
            .filter(|s| !s.is_empty() && severity_rank(s) == UNKNOWN_RANK)
            .filter(|s| reported.insert(s.to_string()))
            .cloned()
            .collect()
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        self.db
            .call(move |db| db.cached_severity(&key, Utc::now()))
            .await
    }
}

pub fn static_analysis_key(kind: &str, line: Option<i64>) -> String {
    match line {
        Some(line) => format!("static_analysis:severity:{}:{}", kind, line),
        None => format!("static_analysis:severity:{}:None", kind),
    }
}

pub fn vulnerability_key(id: &str) -> String {
    format!("vulnerability:severity:{}", id)
}

/// Cacheable (key, severity) pairs. Only static analysis and vulnerability
/// results participate; items without an id or severity are skipped.
fn cache_entries(result: &PluginResult) -> Vec<(String, String)> {
    match &result.details {
        PluginDetails::StaticAnalysis(items) => items
            .iter()
            .filter(|i| !i.kind.is_empty() && !i.severity.is_empty())
            .map(|i| (static_analysis_key(&i.kind, i.line), i.severity.clone()))
            .collect(),
        PluginDetails::Vulnerability(items) => items
            .iter()
            .filter(|i| !i.id.is_empty() && !i.severity.is_empty())
            .map(|i| (vulnerability_key(&i.id), i.severity.clone()))
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FleetDb;
    use scanfleet_common::{PluginEnvelope, PluginKind};
    use serde_json::json;

    fn result(kind: PluginKind, details: serde_json::Value) -> PluginResult {
        let env: PluginEnvelope =
            serde_json::from_value(json!({"success": true, "details": details})).unwrap();
        PluginResult::from_envelope("p", kind, env).unwrap()
    }

    fn cache(ttl: i64) -> SeverityCache {
        SeverityCache::new(DbHandle::new(FleetDb::new_in_memory().unwrap()), ttl)
    }

    #[test]
    fn test_unknown_severity_reported_once() {
        let cache = cache(3600);
        let entries = vec![
            (vulnerability_key("CVE-1"), "moderate".to_string()),
            (vulnerability_key("CVE-2"), "moderate".to_string()),
            (vulnerability_key("CVE-3"), "high".to_string()),
        ];
        assert_eq!(cache.unreported_unknowns(&entries), vec!["moderate"]);
        assert!(cache.unreported_unknowns(&entries).is_empty());
        assert!(cache.clone().unreported_unknowns(&entries).is_empty());
    }

    #[tokio::test]
    async fn test_cached_high_survives_medium() {
        let cache = cache(3600);
        let high = result(PluginKind::Vulnerability, json!([{"id": "CVE-1", "severity": "high"}]));
        let medium = result(PluginKind::Vulnerability, json!([{"id": "CVE-1", "severity": "medium"}]));
        cache.merge_result(&high).await.unwrap();
        cache.merge_result(&medium).await.unwrap();
        assert_eq!(
            cache.get("vulnerability:severity:CVE-1").await.unwrap().as_deref(),
            Some("high")
        );
    }

    #[tokio::test]
    async fn test_static_analysis_key_includes_line() {
        let cache = cache(3600);
        let res = result(
            PluginKind::StaticAnalysis,
            json!([{"filename": "a.py", "line": 7, "type": "B101", "severity": "low"}]),
        );
        assert_eq!(cache.merge_result(&res).await.unwrap(), 1);
        assert_eq!(
            cache.get("static_analysis:severity:B101:7").await.unwrap().as_deref(),
            Some("low")
        );
    }

    #[tokio::test]
    async fn test_other_kinds_are_not_cached() {
        let cache = cache(3600);
        let res = result(PluginKind::Inventory, json!({"technology_discovery": {}}));
        assert_eq!(cache.merge_result(&res).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_expired_entry_is_absent() {
        let cache = cache(-1);
        let res = result(PluginKind::Vulnerability, json!([{"id": "CVE-2", "severity": "critical"}]));
        cache.merge_result(&res).await.unwrap();
        assert_eq!(cache.get("vulnerability:severity:CVE-2").await.unwrap(), None);
    }
}
