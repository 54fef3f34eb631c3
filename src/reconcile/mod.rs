//! Vulnerability Reconciler.
//!
//! Folds vulnerability findings into the per repo/branch instance inventory,
//! resolves instances a capable scan no longer sees, and builds the outward
//! event stream with allowlist suppression applied at read time.

use std::collections::HashSet;

use anyhow::Result;
use chrono::{SecondsFormat, Utc};
use scanfleet_common::{AllowListKind, PluginDetails, PluginResult, Scan, most_severe};
use serde_json::{Value, json};

use crate::store::{DbHandle, EvidenceRow, FleetDb, VulnerabilityRow};

pub mod advisory;
pub mod allowlist;
pub mod sbom;
pub mod severity;

pub use advisory::{normalize_advisory_ids, valid_severity};
pub use allowlist::VulnAllowList;
pub use severity::SeverityCache;

#[derive(Clone)]
pub struct Reconciler {
    db: DbHandle,
}

/// Fields of a scan the blocking store closures need.
#[derive(Debug, Clone)]
struct ScanKey {
    id: String,
    service: String,
    repo: String,
    git_ref: String,
}

impl From<&Scan> for ScanKey {
    fn from(scan: &Scan) -> Self {
        Self {
            id: scan.id.clone(),
            service: scan.service.clone(),
            repo: scan.repo.clone(),
            git_ref: scan.git_ref().to_string(),
        }
    }
}

impl Reconciler {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }

    /// Record every vulnerability finding of `result` against this scan.
    ///
    /// Inventory data is stripped from the findings afterwards since it is
    /// captured in the vulnerability records. Returns the number of findings.
    pub async fn merge_findings(&self, scan: &Scan, result: &mut PluginResult) -> Result<usize> {
        let PluginDetails::Vulnerability(findings) = &mut result.details else {
            return Ok(0);
        };
        if findings.is_empty() {
            return Ok(0);
        }
        let key = ScanKey::from(scan);
        let plugin = result.name.clone();
        let batch = findings.clone();
        let merged = self
            .db
            .call(move |db| {
                for finding in &batch {
                    merge_one(db, &key, &plugin, finding)?;
                }
                Ok(batch.len())
            })
            .await?;
        for finding in findings.iter_mut() {
            finding.inventory = None;
        }
        Ok(merged)
    }

    /// Resolve open instances this scan could have found but did not.
    ///
    /// Capable plugins are the scan's selected plugins minus `errored`.
    pub async fn resolve(&self, scan: &Scan, errored: &HashSet<String>) -> Result<usize> {
        let capable: Vec<String> = scan
            .selected_plugins()
            .into_iter()
            .filter(|p| !errored.contains(p))
            .collect();
        if capable.is_empty() {
            tracing::info!("no capable plugins; skipping vulnerability resolution");
            return Ok(0);
        }
        let key = ScanKey::from(scan);
        let resolved = self
            .db
            .call(move |db| {
                db.resolve_missing_instances(&key.service, &key.repo, &key.git_ref, &key.id, &capable)
            })
            .await?;
        if resolved > 0 {
            tracing::info!(resolved, "resolved vulnerability instances");
        }
        Ok(resolved)
    }

    /// One event detail per instance this scan created, updated or resolved.
    /// Unresolved instances suppressed by the allowlist are left out.
    pub async fn vulnerability_events(&self, scan: &Scan) -> Result<Vec<Value>> {
        let key = ScanKey::from(scan);
        self.db
            .call(move |db| {
                let now = Utc::now();
                let mut items = db.active_allowlist(
                    &key.service,
                    &key.repo,
                    AllowListKind::Vulnerability,
                    now,
                )?;
                items.extend(db.active_allowlist(
                    &key.service,
                    &key.repo,
                    AllowListKind::VulnerabilityRaw,
                    now,
                )?);
                let allowlist = VulnAllowList::new(items);

                let mut events = Vec::new();
                for inst in db.instances_touched_by(&key.id)? {
                    let Some(vuln) = db.get_vulnerability(&inst.vuln_id)? else {
                        continue;
                    };
                    let evidence = db.instance_evidence(&inst.id, None)?;
                    if !inst.resolved && allowlist.suppresses(&vuln.advisory_ids, &evidence) {
                        tracing::debug!(instance = %inst.id, "vulnerability allowlisted; excluding");
                        continue;
                    }
                    let components: Vec<String> = evidence
                        .iter()
                        .filter_map(|e| e.component.clone())
                        .collect::<std::collections::BTreeSet<_>>()
                        .into_iter()
                        .collect();
                    let sources: Vec<Value> = evidence
                        .iter()
                        .filter(|e| e.scan_id == key.id)
                        .map(|e| json!({"source": e.source, "filename": e.filename, "line": e.line}))
                        .collect();
                    events.push(json!({
                        "id": inst.id,
                        "vulnerability_id": vuln.id,
                        "advisory_ids": vuln.advisory_ids,
                        "description": vuln.description,
                        "remediation": vuln.remediation,
                        "severity": vuln.severity,
                        "branch": inst.git_ref,
                        "resolved": inst.resolved,
                        "components": components,
                        "plugins": db.vulnerability_plugins(&vuln.id)?,
                        "source": sources,
                    }));
                }
                Ok(events)
            })
            .await
    }
}

fn merge_one(
    db: &FleetDb,
    key: &ScanKey,
    plugin: &str,
    finding: &scanfleet_common::VulnerabilityFinding,
) -> Result<()> {
    let advisory_ids = normalize_advisory_ids(&finding.advisory_ids());
    let severity = valid_severity(&finding.severity).to_string();
    let description = finding.description.trim().to_string();
    let remediation = finding.remediation.trim().to_string();

    let mut existing = db.find_vulnerabilities(&advisory_ids)?.into_iter();
    let vuln = match existing.next() {
        None => {
            tracing::debug!(advisories = ?advisory_ids, "creating vulnerability");
            let vuln = VulnerabilityRow {
                id: uuid::Uuid::new_v4().to_string(),
                description,
                remediation,
                severity,
                advisory_ids,
                added: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            };
            db.save_vulnerability(&vuln)?;
            vuln
        }
        Some(first) => {
            let mut survivor = first.clone();
            for other in existing {
                tracing::debug!(survivor = %survivor.id, other = %other.id, "merging vulnerabilities");
                fold(&mut survivor, &other.advisory_ids, &other.description, &other.remediation, &other.severity);
                db.absorb_vulnerability(&survivor.id, &other.id)?;
            }
            fold(&mut survivor, &advisory_ids, &description, &remediation, &severity);
            if survivor != first {
                db.save_vulnerability(&survivor)?;
            }
            survivor
        }
    };

    db.add_vulnerability_plugin(&vuln.id, plugin)?;
    let component = finding.component().map(|c| c.label());
    if let Some(label) = &component {
        db.add_vulnerability_component(&vuln.id, label)?;
    }

    let instance = db.touch_instance(&key.service, &key.repo, &key.git_ref, &vuln.id)?;
    db.append_evidence(
        &instance.id,
        &EvidenceRow {
            scan_id: key.id.clone(),
            plugin: plugin.to_string(),
            component,
            source: finding.source.clone(),
            filename: finding.filename.clone(),
            line: finding.line,
        },
    )
}

/// Merge another record's fields into `vuln`: union of advisory IDs, the
/// longer description and remediation, the most severe severity.
fn fold(
    vuln: &mut VulnerabilityRow,
    advisory_ids: &[String],
    description: &str,
    remediation: &str,
    severity: &str,
) {
    for id in advisory_ids {
        if !vuln.advisory_ids.contains(id) {
            vuln.advisory_ids.push(id.clone());
        }
    }
    if vuln.description.len() < description.len() {
        vuln.description = description.to_string();
    }
    if vuln.remediation.len() < remediation.len() {
        vuln.remediation = remediation.to_string();
    }
    vuln.severity = most_severe(&vuln.severity, severity).to_string();
}
