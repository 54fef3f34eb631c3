use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{OptionalExtension, params};
use scanfleet_common::{AllowListItem, AllowListKind, PluginResult, Scan, ScanProgress, ScanStatus};

use super::{FleetDb, from_json, parse_time, to_json};

/// Tracking record for a scan accepted by the admission API.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanRecord {
    pub scan_id: String,
    pub service: String,
    pub repo: String,
    pub create_date: DateTime<Utc>,
    pub expires: DateTime<Utc>,
}

/// A stored plugin result, as read back for reports and tests.
#[derive(Debug, Clone)]
pub struct StoredPluginResult {
    pub plugin_name: String,
    pub kind: String,
    pub success: bool,
    pub details: serde_json::Value,
    pub errors: Vec<String>,
}

const SCAN_COLUMNS: &str = "id, service, repo, branch, status, progress, plugins, depth, include_dev,
    features, include_paths, exclude_paths, diff_base, diff_compare, owner, batch_id, engine_id,
    start_time, end_time, errors, alerts, debug";

impl FleetDb {
    // ── Scans ─────────────────────────────────────────────────────────

    /// Insert a scan, or refresh its request fields if redelivered.
    pub fn upsert_scan(&self, scan: &Scan) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO scans (id, service, repo, branch, status, progress, plugins, depth,
                     include_dev, features, include_paths, exclude_paths, diff_base, diff_compare,
                     owner, batch_id, engine_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
                 ON CONFLICT(id) DO UPDATE SET plugins = excluded.plugins,
                     progress = excluded.progress, engine_id = excluded.engine_id",
                params![
                    scan.id,
                    scan.service,
                    scan.repo,
                    scan.branch,
                    scan.status.as_str(),
                    to_json(&scan.progress)?,
                    to_json(&scan.plugins)?,
                    scan.depth,
                    scan.include_dev,
                    to_json(&scan.features)?,
                    to_json(&scan.include_paths)?,
                    to_json(&scan.exclude_paths)?,
                    scan.diff_base,
                    scan.diff_compare,
                    scan.owner,
                    scan.batch_id,
                    scan.engine_id,
                ],
            )
            .context("Failed to upsert scan")?;
        Ok(())
    }

    pub fn get_scan(&self, id: &str) -> Result<Option<Scan>> {
        let sql = format!("SELECT {} FROM scans WHERE id = ?1", SCAN_COLUMNS);
        let row = self
            .conn()
            .query_row(&sql, params![id], |row| {
                Ok(ScanRow {
                    id: row.get(0)?,
                    service: row.get(1)?,
                    repo: row.get(2)?,
                    branch: row.get(3)?,
                    status: row.get(4)?,
                    progress: row.get(5)?,
                    plugins: row.get(6)?,
                    depth: row.get(7)?,
                    include_dev: row.get(8)?,
                    features: row.get(9)?,
                    include_paths: row.get(10)?,
                    exclude_paths: row.get(11)?,
                    diff_base: row.get(12)?,
                    diff_compare: row.get(13)?,
                    owner: row.get(14)?,
                    batch_id: row.get(15)?,
                    engine_id: row.get(16)?,
                    start_time: row.get(17)?,
                    end_time: row.get(18)?,
                    errors: row.get(19)?,
                    alerts: row.get(20)?,
                    debug: row.get(21)?,
                })
            })
            .optional()
            .context("Failed to query scan")?;
        row.map(ScanRow::into_scan).transpose()
    }

    pub fn start_scan(&self, id: &str, engine_id: &str, at: DateTime<Utc>) -> Result<()> {
        self.conn()
            .execute(
                "UPDATE scans SET status = 'running', engine_id = ?1, start_time = ?2 WHERE id = ?3",
                params![engine_id, at.to_rfc3339_opts(SecondsFormat::Micros, true), id],
            )
            .context("Failed to start scan")?;
        Ok(())
    }

    pub fn update_scan_progress(&self, id: &str, progress: &ScanProgress) -> Result<()> {
        self.conn()
            .execute(
                "UPDATE scans SET progress = ?1 WHERE id = ?2",
                params![to_json(progress)?, id],
            )
            .context("Failed to update scan progress")?;
        Ok(())
    }

    /// Move a scan to a terminal status with its collected messages.
    pub fn finish_scan(
        &self,
        id: &str,
        status: ScanStatus,
        errors: &[String],
        alerts: &[String],
        debug: &[String],
    ) -> Result<()> {
        self.conn()
            .execute(
                "UPDATE scans SET status = ?1, end_time = ?2, errors = ?3, alerts = ?4, debug = ?5
                 WHERE id = ?6",
                params![
                    status.as_str(),
                    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
                    to_json(&errors)?,
                    to_json(&alerts)?,
                    to_json(&debug)?,
                    id
                ],
            )
            .context("Failed to finish scan")?;
        Ok(())
    }

    pub fn set_application_metadata(&self, id: &str, metadata: &serde_json::Value) -> Result<()> {
        self.conn()
            .execute(
                "UPDATE scans SET application_metadata = ?1 WHERE id = ?2",
                params![to_json(metadata)?, id],
            )
            .context("Failed to store application metadata")?;
        Ok(())
    }

    pub fn application_metadata(&self, id: &str) -> Result<Option<serde_json::Value>> {
        let raw: Option<Option<String>> = self
            .conn()
            .query_row(
                "SELECT application_metadata FROM scans WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read application metadata")?;
        raw.flatten()
            .map(|s| serde_json::from_str(&s).context("Failed to decode application metadata"))
            .transpose()
    }

    // ── Plugin results ────────────────────────────────────────────────

    /// Write a plugin's result. Re-running a plugin for a scan replaces it.
    pub fn save_plugin_result(&self, scan_id: &str, result: &PluginResult) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO plugin_results (scan_id, plugin_name, kind, success, truncated, details,
                     errors, alerts, debug, start_time, end_time)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(scan_id, plugin_name) DO UPDATE SET kind = excluded.kind,
                     success = excluded.success, truncated = excluded.truncated,
                     details = excluded.details, errors = excluded.errors, alerts = excluded.alerts,
                     debug = excluded.debug, start_time = excluded.start_time,
                     end_time = excluded.end_time",
                params![
                    scan_id,
                    result.name,
                    result.kind.as_str(),
                    result.success,
                    result.truncated,
                    to_json(&result.details)?,
                    to_json(&result.errors)?,
                    to_json(&result.alerts)?,
                    to_json(&result.debug)?,
                    result.start_time.map(|t| t.to_rfc3339_opts(SecondsFormat::Micros, true)),
                    result.end_time.map(|t| t.to_rfc3339_opts(SecondsFormat::Micros, true)),
                ],
            )
            .context("Failed to save plugin result")?;
        Ok(())
    }

    pub fn plugin_results(&self, scan_id: &str) -> Result<Vec<StoredPluginResult>> {
        let mut stmt = self
            .conn()
            .prepare(
                "SELECT plugin_name, kind, success, details, errors FROM plugin_results
                 WHERE scan_id = ?1 ORDER BY id",
            )
            .context("Failed to prepare plugin_results")?;
        let rows = stmt
            .query_map(params![scan_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, bool>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .context("Failed to query plugin results")?;
        let mut results = Vec::new();
        for row in rows {
            let (plugin_name, kind, success, details, errors) =
                row.context("Failed to read plugin result row")?;
            results.push(StoredPluginResult {
                plugin_name,
                kind,
                success,
                details: serde_json::from_str(&details).unwrap_or(serde_json::Value::Null),
                errors: from_json(&errors)?,
            });
        }
        Ok(results)
    }

    // ── Scan records ──────────────────────────────────────────────────

    pub fn record_scan(&self, record: &ScanRecord) -> Result<()> {
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO scan_records (scan_id, service, repo, create_date, expires)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.scan_id,
                    record.service,
                    record.repo,
                    record.create_date.to_rfc3339_opts(SecondsFormat::Micros, true),
                    record.expires.to_rfc3339_opts(SecondsFormat::Micros, true)
                ],
            )
            .context("Failed to record scan")?;
        Ok(())
    }

    pub fn list_scan_records(&self) -> Result<Vec<ScanRecord>> {
        let mut stmt = self
            .conn()
            .prepare(
                "SELECT scan_id, service, repo, create_date, expires FROM scan_records
                 ORDER BY create_date, scan_id",
            )
            .context("Failed to prepare list_scan_records")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .context("Failed to query scan records")?;
        let mut records = Vec::new();
        for row in rows {
            let (scan_id, service, repo, create_date, expires) =
                row.context("Failed to read scan record row")?;
            records.push(ScanRecord {
                scan_id,
                service,
                repo,
                create_date: parse_time(Some(create_date)).unwrap_or_else(Utc::now),
                expires: parse_time(Some(expires)).unwrap_or_else(Utc::now),
            });
        }
        Ok(records)
    }

    /// Drop tracking records past their expiry. Returns how many went.
    pub fn purge_expired_scan_records(&self, now: DateTime<Utc>) -> Result<usize> {
        self.conn()
            .execute(
                "DELETE FROM scan_records WHERE expires <= ?1",
                params![now.to_rfc3339_opts(SecondsFormat::Micros, true)],
            )
            .context("Failed to purge scan records")
    }

    // ── Allowlist ─────────────────────────────────────────────────────

    pub fn add_allowlist_item(&self, service: &str, repo: &str, item: &AllowListItem) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO allowlist (service, repo, kind, value, expires, reason)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    service,
                    repo,
                    item.kind.as_str(),
                    to_json(&item.value)?,
                    item.expires.map(|t| t.to_rfc3339_opts(SecondsFormat::Micros, true)),
                    item.reason
                ],
            )
            .context("Failed to add allowlist item")?;
        Ok(())
    }

    /// Non-expired allowlist items of one kind for a repository.
    pub fn active_allowlist(
        &self,
        service: &str,
        repo: &str,
        kind: AllowListKind,
        now: DateTime<Utc>,
    ) -> Result<Vec<AllowListItem>> {
        let mut stmt = self
            .conn()
            .prepare(
                "SELECT value, expires, reason FROM allowlist
                 WHERE service = ?1 AND repo = ?2 AND kind = ?3 ORDER BY id",
            )
            .context("Failed to prepare active_allowlist")?;
        let rows = stmt
            .query_map(params![service, repo, kind.as_str()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })
            .context("Failed to query allowlist")?;
        let mut items = Vec::new();
        for row in rows {
            let (value, expires, reason) = row.context("Failed to read allowlist row")?;
            let item = AllowListItem {
                kind,
                value: serde_json::from_str(&value).context("Failed to decode allowlist value")?,
                expires: parse_time(expires),
                reason,
            };
            if item.is_active(now) {
                items.push(item);
            }
        }
        Ok(items)
    }
}

struct ScanRow {
    id: String,
    service: String,
    repo: String,
    branch: Option<String>,
    status: String,
    progress: String,
    plugins: String,
    depth: Option<u32>,
    include_dev: bool,
    features: String,
    include_paths: String,
    exclude_paths: String,
    diff_base: Option<String>,
    diff_compare: Option<String>,
    owner: Option<String>,
    batch_id: Option<String>,
    engine_id: Option<String>,
    start_time: Option<String>,
    end_time: Option<String>,
    errors: String,
    alerts: String,
    debug: String,
}

impl ScanRow {
    fn into_scan(self) -> Result<Scan> {
        Ok(Scan {
            status: self
                .status
                .parse::<ScanStatus>()
                .map_err(|e| anyhow::anyhow!(e))?,
            progress: from_json(&self.progress)?,
            plugins: from_json(&self.plugins)?,
            features: from_json(&self.features)?,
            include_paths: from_json(&self.include_paths)?,
            exclude_paths: from_json(&self.exclude_paths)?,
            start_time: parse_time(self.start_time),
            end_time: parse_time(self.end_time),
            errors: from_json(&self.errors)?,
            alerts: from_json(&self.alerts)?,
            debug: from_json(&self.debug)?,
            id: self.id,
            service: self.service,
            repo: self.repo,
            branch: self.branch,
            depth: self.depth,
            include_dev: self.include_dev,
            diff_base: self.diff_base,
            diff_compare: self.diff_compare,
            owner: self.owner,
            batch_id: self.batch_id,
            engine_id: self.engine_id,
        })
    }
}
