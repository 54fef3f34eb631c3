use std::collections::HashSet;

use scanfleet_common::{AllowListItem, AllowListKind};

use crate::store::EvidenceRow;

/// Active vulnerability allowlist for one repository.
#[derive(Debug, Clone, Default)]
pub struct VulnAllowList {
    raw_ids: HashSet<String>,
    structured: Vec<AllowListItem>,
}

impl VulnAllowList {
    /// Build from already-filtered active items. Items of other kinds are ignored.
    pub fn new(items: impl IntoIterator<Item = AllowListItem>) -> Self {
        let mut list = Self::default();
        for item in items {
            match item.kind {
                AllowListKind::VulnerabilityRaw => {
                    if let Some(id) = item.value_str("id") {
                        list.raw_ids.insert(id.to_string());
                    }
                }
                AllowListKind::Vulnerability => list.structured.push(item),
                _ => {}
            }
        }
        list
    }

    pub fn is_empty(&self) -> bool {
        self.raw_ids.is_empty() && self.structured.is_empty()
    }

    /// Whether an instance with these advisory IDs and evidence is suppressed.
    pub fn suppresses(&self, advisory_ids: &[String], evidence: &[EvidenceRow]) -> bool {
        if let Some(id) = advisory_ids.iter().find(|id| self.raw_ids.contains(*id)) {
            tracing::debug!(advisory = %id, "vulnerability matches raw allowlist");
            return true;
        }
        self.structured.iter().any(|item| {
            let (Some(id), Some(component), Some(source)) = (
                item.value_str("id"),
                item.value_str("component"),
                item.value_str("source"),
            ) else {
                return false;
            };
            advisory_ids.iter().any(|a| a == id)
                && evidence.iter().any(|ev| {
                    ev.component.as_deref() == Some(component)
                        && ev.source.iter().any(|s| s.contains(source))
                })
        })
    }
}
