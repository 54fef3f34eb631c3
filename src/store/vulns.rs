use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{OptionalExtension, TransactionBehavior, params, params_from_iter};
use scanfleet_common::most_severe;

use super::{FleetDb, from_json, to_json};

#[derive(Debug, Clone, PartialEq)]
pub struct VulnerabilityRow {
    pub id: String,
    pub description: String,
    pub remediation: String,
    pub severity: String,
    pub advisory_ids: Vec<String>,
    pub added: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstanceRow {
    pub id: String,
    pub service: String,
    pub repo: String,
    pub git_ref: String,
    pub vuln_id: String,
    pub resolved: bool,
    pub resolved_by: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvidenceRow {
    pub scan_id: String,
    pub plugin: String,
    pub component: Option<String>,
    pub source: Vec<String>,
    pub filename: Option<String>,
    pub line: Option<i64>,
}

fn placeholders(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ")
}

fn instance_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<InstanceRow> {
    Ok(InstanceRow {
        id: row.get(0)?,
        service: row.get(1)?,
        repo: row.get(2)?,
        git_ref: row.get(3)?,
        vuln_id: row.get(4)?,
        resolved: row.get(5)?,
        resolved_by: row.get(6)?,
    })
}

const INSTANCE_COLUMNS: &str = "id, service, repo, git_ref, vuln_id, resolved, resolved_by";

impl FleetDb {
    // ── Vulnerabilities ───────────────────────────────────────────────

    /// Every vulnerability referencing any of `advisory_ids`, oldest first.
    pub fn find_vulnerabilities(&self, advisory_ids: &[String]) -> Result<Vec<VulnerabilityRow>> {
        if advisory_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT DISTINCT v.id, v.description, v.remediation, v.severity, v.advisory_ids, v.added
             FROM vulnerabilities v
             JOIN vulnerability_advisories a ON a.vuln_id = v.id
             WHERE a.advisory_id IN ({})
             ORDER BY v.added, v.id",
            placeholders(1, advisory_ids.len())
        );
        let mut stmt = self
            .conn()
            .prepare(&sql)
            .context("Failed to prepare find_vulnerabilities")?;
        let rows = stmt
            .query_map(params_from_iter(advisory_ids.iter()), |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })
            .context("Failed to query vulnerabilities")?;
        let mut vulns = Vec::new();
        for row in rows {
            let (id, description, remediation, severity, advisory_ids, added) =
                row.context("Failed to read vulnerability row")?;
            vulns.push(VulnerabilityRow {
                id,
                description,
                remediation,
                severity,
                advisory_ids: from_json(&advisory_ids)?,
                added,
            });
        }
        Ok(vulns)
    }

    pub fn get_vulnerability(&self, id: &str) -> Result<Option<VulnerabilityRow>> {
        let row = self
            .conn()
            .query_row(
                "SELECT id, description, remediation, severity, advisory_ids, added
                 FROM vulnerabilities WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()
            .context("Failed to query vulnerability")?;
        match row {
            Some((id, description, remediation, severity, advisory_ids, added)) => {
                Ok(Some(VulnerabilityRow {
                    id,
                    description,
                    remediation,
                    severity,
                    advisory_ids: from_json(&advisory_ids)?,
                    added,
                }))
            }
            None => Ok(None),
        }
    }

    /// Insert or overwrite a vulnerability and its advisory index.
    pub fn save_vulnerability(&self, vuln: &VulnerabilityRow) -> Result<()> {
        let tx = self
            .conn()
            .unchecked_transaction()
            .context("Failed to begin vulnerability save")?;
        tx.execute(
            "INSERT INTO vulnerabilities (id, description, remediation, severity, advisory_ids, added)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET description = excluded.description,
                 remediation = excluded.remediation, severity = excluded.severity,
                 advisory_ids = excluded.advisory_ids",
            params![
                vuln.id,
                vuln.description,
                vuln.remediation,
                vuln.severity,
                to_json(&vuln.advisory_ids)?,
                vuln.added
            ],
        )
        .context("Failed to save vulnerability")?;
        for adv in &vuln.advisory_ids {
            tx.execute(
                "INSERT OR IGNORE INTO vulnerability_advisories (advisory_id, vuln_id) VALUES (?1, ?2)",
                params![adv, vuln.id],
            )
            .context("Failed to index advisory id")?;
        }
        tx.commit().context("Failed to commit vulnerability save")?;
        Ok(())
    }

    /// Fold `other` into `survivor`: re-home its instances, evidence,
    /// plugin and component links, then delete it.
    pub fn absorb_vulnerability(&self, survivor: &str, other: &str) -> Result<()> {
        let tx = self
            .conn()
            .unchecked_transaction()
            .context("Failed to begin vulnerability merge")?;

        let moving: Vec<InstanceRow> = {
            let sql = format!(
                "SELECT {} FROM vuln_instances WHERE vuln_id = ?1",
                INSTANCE_COLUMNS
            );
            let mut stmt = tx.prepare(&sql)?;
            let rows = stmt.query_map(params![other], instance_from_row)?;
            rows.collect::<rusqlite::Result<_>>()
                .context("Failed to read instances to merge")?
        };
        for inst in moving {
            let existing: Option<String> = tx
                .query_row(
                    "SELECT id FROM vuln_instances
                     WHERE service = ?1 AND repo = ?2 AND git_ref = ?3 AND vuln_id = ?4",
                    params![inst.service, inst.repo, inst.git_ref, survivor],
                    |row| row.get(0),
                )
                .optional()?;
            match existing {
                Some(target) => {
                    tx.execute(
                        "UPDATE vuln_evidence SET instance_id = ?1 WHERE instance_id = ?2",
                        params![target, inst.id],
                    )?;
                    tx.execute("DELETE FROM vuln_instances WHERE id = ?1", params![inst.id])?;
                    if !inst.resolved {
                        tx.execute(
                            "UPDATE vuln_instances SET resolved = 0, resolved_by = NULL
                             WHERE id = ?1",
                            params![target],
                        )?;
                    }
                }
                None => {
                    tx.execute(
                        "UPDATE vuln_instances SET vuln_id = ?1 WHERE id = ?2",
                        params![survivor, inst.id],
                    )?;
                }
            }
        }

        tx.execute(
            "INSERT OR IGNORE INTO vulnerability_plugins (vuln_id, plugin)
             SELECT ?1, plugin FROM vulnerability_plugins WHERE vuln_id = ?2",
            params![survivor, other],
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO vulnerability_components (vuln_id, component)
             SELECT ?1, component FROM vulnerability_components WHERE vuln_id = ?2",
            params![survivor, other],
        )?;
        tx.execute(
            "INSERT OR IGNORE INTO vulnerability_advisories (advisory_id, vuln_id)
             SELECT advisory_id, ?1 FROM vulnerability_advisories WHERE vuln_id = ?2",
            params![survivor, other],
        )?;
        tx.execute("DELETE FROM vulnerabilities WHERE id = ?1", params![other])?;
        tx.commit().context("Failed to commit vulnerability merge")?;
        Ok(())
    }

    pub fn add_vulnerability_plugin(&self, vuln_id: &str, plugin: &str) -> Result<()> {
        self.conn()
            .execute(
                "INSERT OR IGNORE INTO vulnerability_plugins (vuln_id, plugin) VALUES (?1, ?2)",
                params![vuln_id, plugin],
            )
            .context("Failed to map plugin to vulnerability")?;
        Ok(())
    }

    pub fn add_vulnerability_component(&self, vuln_id: &str, component: &str) -> Result<()> {
        self.conn()
            .execute(
                "INSERT OR IGNORE INTO vulnerability_components (vuln_id, component) VALUES (?1, ?2)",
                params![vuln_id, component],
            )
            .context("Failed to map component to vulnerability")?;
        Ok(())
    }

    pub fn vulnerability_plugins(&self, vuln_id: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT plugin FROM vulnerability_plugins WHERE vuln_id = ?1 ORDER BY plugin")
            .context("Failed to prepare vulnerability_plugins")?;
        let rows = stmt
            .query_map(params![vuln_id], |row| row.get::<_, String>(0))
            .context("Failed to query vulnerability plugins")?;
        rows.collect::<rusqlite::Result<_>>()
            .context("Failed to read vulnerability plugin row")
    }

    pub fn vulnerability_components(&self, vuln_id: &str) -> Result<Vec<String>> {
        let mut stmt = self
            .conn()
            .prepare(
                "SELECT component FROM vulnerability_components WHERE vuln_id = ?1 ORDER BY component",
            )
            .context("Failed to prepare vulnerability_components")?;
        let rows = stmt
            .query_map(params![vuln_id], |row| row.get::<_, String>(0))
            .context("Failed to query vulnerability components")?;
        rows.collect::<rusqlite::Result<_>>()
            .context("Failed to read vulnerability component row")
    }

    // ── Instances ─────────────────────────────────────────────────────

    /// Get or create the instance for (repo, ref, vulnerability). A resolved
    /// instance found again is reopened.
    pub fn touch_instance(
        &self,
        service: &str,
        repo: &str,
        git_ref: &str,
        vuln_id: &str,
    ) -> Result<InstanceRow> {
        self.conn()
            .execute(
                "INSERT INTO vuln_instances (id, service, repo, git_ref, vuln_id, resolved)
                 VALUES (?1, ?2, ?3, ?4, ?5, 0)
                 ON CONFLICT(service, repo, git_ref, vuln_id)
                 DO UPDATE SET resolved = 0, resolved_by = NULL",
                params![
                    uuid::Uuid::new_v4().to_string(),
                    service,
                    repo,
                    git_ref,
                    vuln_id
                ],
            )
            .context("Failed to upsert vulnerability instance")?;
        self.find_instance(service, repo, git_ref, vuln_id)?
            .context("Instance not found after upsert")
    }

    pub fn find_instance(
        &self,
        service: &str,
        repo: &str,
        git_ref: &str,
        vuln_id: &str,
    ) -> Result<Option<InstanceRow>> {
        let sql = format!(
            "SELECT {} FROM vuln_instances
             WHERE service = ?1 AND repo = ?2 AND git_ref = ?3 AND vuln_id = ?4",
            INSTANCE_COLUMNS
        );
        self.conn()
            .query_row(&sql, params![service, repo, git_ref, vuln_id], instance_from_row)
            .optional()
            .context("Failed to query vulnerability instance")
    }

    pub fn append_evidence(&self, instance_id: &str, evidence: &EvidenceRow) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO vuln_evidence (instance_id, scan_id, plugin, component, source, filename, line)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    instance_id,
                    evidence.scan_id,
                    evidence.plugin,
                    evidence.component,
                    to_json(&evidence.source)?,
                    evidence.filename,
                    evidence.line
                ],
            )
            .context("Failed to append vulnerability evidence")?;
        Ok(())
    }

    /// Evidence for one instance, optionally restricted to one scan.
    pub fn instance_evidence(
        &self,
        instance_id: &str,
        scan_id: Option<&str>,
    ) -> Result<Vec<EvidenceRow>> {
        let mut stmt = self
            .conn()
            .prepare(
                "SELECT scan_id, plugin, component, source, filename, line FROM vuln_evidence
                 WHERE instance_id = ?1 AND (?2 IS NULL OR scan_id = ?2) ORDER BY id",
            )
            .context("Failed to prepare instance_evidence")?;
        let rows = stmt
            .query_map(params![instance_id, scan_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<i64>>(5)?,
                ))
            })
            .context("Failed to query evidence")?;
        let mut evidence = Vec::new();
        for row in rows {
            let (scan_id, plugin, component, source, filename, line) =
                row.context("Failed to read evidence row")?;
            evidence.push(EvidenceRow {
                scan_id,
                plugin,
                component,
                source: from_json(&source)?,
                filename,
                line,
            });
        }
        Ok(evidence)
    }

    pub fn open_instances(&self, service: &str, repo: &str, git_ref: &str) -> Result<Vec<InstanceRow>> {
        let sql = format!(
            "SELECT {} FROM vuln_instances
             WHERE service = ?1 AND repo = ?2 AND git_ref = ?3 AND resolved = 0 ORDER BY id",
            INSTANCE_COLUMNS
        );
        let mut stmt = self
            .conn()
            .prepare(&sql)
            .context("Failed to prepare open_instances")?;
        let rows = stmt
            .query_map(params![service, repo, git_ref], instance_from_row)
            .context("Failed to query open instances")?;
        rows.collect::<rusqlite::Result<_>>()
            .context("Failed to read instance row")
    }

    /// Mark open instances on this repo/ref resolved by `scan_id` when the
    /// scan did not see them and at least one of `capable_plugins` is known
    /// to detect their vulnerability.
    pub fn resolve_missing_instances(
        &self,
        service: &str,
        repo: &str,
        git_ref: &str,
        scan_id: &str,
        capable_plugins: &[String],
    ) -> Result<usize> {
        if capable_plugins.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "UPDATE vuln_instances SET resolved = 1, resolved_by = ?4
             WHERE service = ?1 AND repo = ?2 AND git_ref = ?3 AND resolved = 0
               AND id NOT IN (SELECT instance_id FROM vuln_evidence WHERE scan_id = ?4)
               AND vuln_id IN (
                   SELECT vuln_id FROM vulnerability_plugins WHERE plugin IN ({})
               )",
            placeholders(5, capable_plugins.len())
        );
        let mut values: Vec<String> = vec![
            service.to_string(),
            repo.to_string(),
            git_ref.to_string(),
            scan_id.to_string(),
        ];
        values.extend(capable_plugins.iter().cloned());
        self.conn()
            .execute(&sql, params_from_iter(values.iter()))
            .context("Failed to resolve vulnerability instances")
    }

    /// Instances this scan produced evidence for or resolved.
    pub fn instances_touched_by(&self, scan_id: &str) -> Result<Vec<InstanceRow>> {
        let sql = format!(
            "SELECT {} FROM vuln_instances
             WHERE id IN (SELECT instance_id FROM vuln_evidence WHERE scan_id = ?1)
                OR (resolved = 1 AND resolved_by = ?1)
             ORDER BY id",
            INSTANCE_COLUMNS
        );
        let mut stmt = self
            .conn()
            .prepare(&sql)
            .context("Failed to prepare instances_touched_by")?;
        let rows = stmt
            .query_map(params![scan_id], instance_from_row)
            .context("Failed to query touched instances")?;
        rows.collect::<rusqlite::Result<_>>()
            .context("Failed to read instance row")
    }

    // ── Severity cache ────────────────────────────────────────────────

    /// Cached severity for `key`, ignoring expired entries.
    pub fn cached_severity(&self, key: &str, now: DateTime<Utc>) -> Result<Option<String>> {
        self.conn()
            .query_row(
                "SELECT severity FROM severity_cache WHERE key = ?1 AND expires_at > ?2",
                params![key, now.to_rfc3339_opts(SecondsFormat::Micros, true)],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read severity cache")
    }

    /// Most-severe-wins upsert. Reads and writes under one immediate
    /// transaction so concurrent writers serialize. Returns the stored value.
    pub fn merge_severity(
        &self,
        key: &str,
        severity: &str,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<String> {
        let tx = rusqlite::Transaction::new_unchecked(self.conn(), TransactionBehavior::Immediate)
            .context("Failed to begin severity merge")?;
        let current: Option<String> = tx
            .query_row(
                "SELECT severity FROM severity_cache WHERE key = ?1 AND expires_at > ?2",
                params![key, now.to_rfc3339_opts(SecondsFormat::Micros, true)],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read severity cache")?;
        let merged = match current.as_deref() {
            Some(cached) => most_severe(severity, cached).to_string(),
            None => severity.to_string(),
        };
        // Keep the original expiry when the value is unchanged so a hot key
        // still ages out.
        if current.as_deref() != Some(merged.as_str()) {
            tx.execute(
                "INSERT INTO severity_cache (key, severity, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET severity = excluded.severity,
                     expires_at = excluded.expires_at",
                params![key, merged, expires_at.to_rfc3339_opts(SecondsFormat::Micros, true)],
            )
            .context("Failed to write severity cache")?;
        }
        tx.commit().context("Failed to commit severity merge")?;
        Ok(merged)
    }
}
