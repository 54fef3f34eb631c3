//! Shared datastore for engines, scans, findings and queues.
//!
//! `FleetDb` owns one SQLite connection. `DbHandle` wraps it in
//! `Arc<Mutex>` and runs every access on tokio's blocking pool so SQLite I/O
//! never stalls async workers. The per-table methods live in submodules as
//! further `impl FleetDb` blocks.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use scanfleet_common::{EngineState, PluginKind};

mod components;
mod queue;
mod scans;
mod vulns;

pub use components::{ComponentEntry, RepoComponent};
pub use queue::StoredMessage;
pub use scans::{ScanRecord, StoredPluginResult};
pub use vulns::{EvidenceRow, InstanceRow, VulnerabilityRow};

/// Settings key holding the fleet-wide maintenance flag.
pub const MAINTENANCE_KEY: &str = "maintenance_mode";

#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<FleetDb>>,
}

impl DbHandle {
    pub fn new(db: FleetDb) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&FleetDb) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Drop the current connection and open a fresh one at the same path.
    pub async fn reconnect(&self) -> Result<()> {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            guard.reopen()
        })
        .await
        .context("DB task panicked")?
    }
}

pub struct FleetDb {
    conn: Connection,
    path: Option<PathBuf>,
}

impl FleetDb {
    /// Open (or create) a SQLite database at the given path and bootstrap it.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self {
            conn,
            path: Some(path.to_path_buf()),
        };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn, path: None };
        db.init()?;
        Ok(db)
    }

    fn reopen(&mut self) -> Result<()> {
        // An in-memory database has nothing to reopen; keep its state.
        let Some(path) = self.path.clone() else {
            return Ok(());
        };
        self.conn = Connection::open(&path).context("Failed to reopen SQLite database")?;
        self.init()
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")
            .context("Failed to configure connection")?;
        self.create_tables().context("Failed to create tables")
    }

    fn create_tables(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS engines (
                id TEXT PRIMARY KEY,
                instance_id TEXT,
                state TEXT NOT NULL DEFAULT 'running',
                start_time TEXT NOT NULL,
                shutdown_time TEXT
            );

            CREATE TABLE IF NOT EXISTS plugins (
                name TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS scans (
                id TEXT PRIMARY KEY,
                service TEXT NOT NULL,
                repo TEXT NOT NULL,
                branch TEXT,
                status TEXT NOT NULL DEFAULT 'queued',
                progress TEXT NOT NULL DEFAULT '{}',
                plugins TEXT NOT NULL DEFAULT '[]',
                depth INTEGER,
                include_dev INTEGER NOT NULL DEFAULT 0,
                features TEXT NOT NULL DEFAULT '{}',
                include_paths TEXT NOT NULL DEFAULT '[]',
                exclude_paths TEXT NOT NULL DEFAULT '[]',
                diff_base TEXT,
                diff_compare TEXT,
                owner TEXT,
                batch_id TEXT,
                engine_id TEXT,
                start_time TEXT,
                end_time TEXT,
                errors TEXT NOT NULL DEFAULT '[]',
                alerts TEXT NOT NULL DEFAULT '[]',
                debug TEXT NOT NULL DEFAULT '[]',
                application_metadata TEXT
            );

            CREATE TABLE IF NOT EXISTS plugin_results (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                scan_id TEXT NOT NULL REFERENCES scans(id) ON DELETE CASCADE,
                plugin_name TEXT NOT NULL,
                kind TEXT NOT NULL,
                success INTEGER NOT NULL,
                truncated INTEGER NOT NULL DEFAULT 0,
                details TEXT NOT NULL DEFAULT '[]',
                errors TEXT NOT NULL DEFAULT '[]',
                alerts TEXT NOT NULL DEFAULT '[]',
                debug TEXT NOT NULL DEFAULT '[]',
                start_time TEXT,
                end_time TEXT,
                UNIQUE(scan_id, plugin_name)
            );

            CREATE TABLE IF NOT EXISTS scan_records (
                scan_id TEXT PRIMARY KEY,
                service TEXT NOT NULL,
                repo TEXT NOT NULL,
                create_date TEXT NOT NULL,
                expires TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS allowlist (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                service TEXT NOT NULL,
                repo TEXT NOT NULL,
                kind TEXT NOT NULL,
                value TEXT NOT NULL,
                expires TEXT,
                reason TEXT NOT NULL DEFAULT ''
            );

            CREATE TABLE IF NOT EXISTS vulnerabilities (
                id TEXT PRIMARY KEY,
                description TEXT NOT NULL DEFAULT '',
                remediation TEXT NOT NULL DEFAULT '',
                severity TEXT NOT NULL DEFAULT 'none',
                advisory_ids TEXT NOT NULL DEFAULT '[]',
                added TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS vulnerability_advisories (
                advisory_id TEXT NOT NULL,
                vuln_id TEXT NOT NULL REFERENCES vulnerabilities(id) ON DELETE CASCADE,
                PRIMARY KEY (advisory_id, vuln_id)
            );

            CREATE TABLE IF NOT EXISTS vulnerability_plugins (
                vuln_id TEXT NOT NULL REFERENCES vulnerabilities(id) ON DELETE CASCADE,
                plugin TEXT NOT NULL,
                PRIMARY KEY (vuln_id, plugin)
            );

            CREATE TABLE IF NOT EXISTS vulnerability_components (
                vuln_id TEXT NOT NULL REFERENCES vulnerabilities(id) ON DELETE CASCADE,
                component TEXT NOT NULL,
                PRIMARY KEY (vuln_id, component)
            );

            CREATE TABLE IF NOT EXISTS vuln_instances (
                id TEXT PRIMARY KEY,
                service TEXT NOT NULL,
                repo TEXT NOT NULL,
                git_ref TEXT NOT NULL,
                vuln_id TEXT NOT NULL REFERENCES vulnerabilities(id),
                resolved INTEGER NOT NULL DEFAULT 0,
                resolved_by TEXT,
                UNIQUE(service, repo, git_ref, vuln_id)
            );

            CREATE TABLE IF NOT EXISTS vuln_evidence (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                instance_id TEXT NOT NULL REFERENCES vuln_instances(id),
                scan_id TEXT NOT NULL,
                plugin TEXT NOT NULL,
                component TEXT,
                source TEXT NOT NULL DEFAULT '[]',
                filename TEXT,
                line INTEGER,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS severity_cache (
                key TEXT PRIMARY KEY,
                severity TEXT NOT NULL,
                expires_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS components (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                version TEXT NOT NULL,
                component_type TEXT,
                label TEXT NOT NULL,
                UNIQUE(name, version)
            );

            CREATE TABLE IF NOT EXISTS licenses (
                license_id TEXT PRIMARY KEY,
                name TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS component_licenses (
                component_id INTEGER NOT NULL REFERENCES components(id) ON DELETE CASCADE,
                license_id TEXT NOT NULL REFERENCES licenses(license_id),
                PRIMARY KEY (component_id, license_id)
            );

            CREATE TABLE IF NOT EXISTS repo_components (
                service TEXT NOT NULL,
                repo TEXT NOT NULL,
                component_id INTEGER NOT NULL REFERENCES components(id) ON DELETE CASCADE,
                scan_id TEXT NOT NULL,
                PRIMARY KEY (service, repo, component_id)
            );

            CREATE TABLE IF NOT EXISTS sbom_documents (
                scan_id TEXT NOT NULL,
                plugin TEXT NOT NULL,
                document TEXT NOT NULL,
                PRIMARY KEY (scan_id, plugin)
            );

            CREATE TABLE IF NOT EXISTS queue_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                queue TEXT NOT NULL,
                body TEXT NOT NULL,
                receipt TEXT,
                visible_at INTEGER NOT NULL,
                receive_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE INDEX IF NOT EXISTS idx_queue_visible ON queue_messages(queue, visible_at);
            CREATE INDEX IF NOT EXISTS idx_scans_repo ON scans(service, repo);
            CREATE INDEX IF NOT EXISTS idx_plugin_results_scan ON plugin_results(scan_id);
            CREATE INDEX IF NOT EXISTS idx_allowlist_repo ON allowlist(service, repo, kind);
            CREATE INDEX IF NOT EXISTS idx_vuln_instances_repo ON vuln_instances(service, repo, git_ref);
            CREATE INDEX IF NOT EXISTS idx_vuln_evidence_instance ON vuln_evidence(instance_id);
            CREATE INDEX IF NOT EXISTS idx_vuln_evidence_scan ON vuln_evidence(scan_id);
            ",
        )?;
        Ok(())
    }

    /// Cheapest possible round trip, used as a connectivity check.
    pub fn ping(&self) -> Result<()> {
        self.conn
            .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .context("Datastore ping failed")?;
        Ok(())
    }

    // ── Settings ──────────────────────────────────────────────────────

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read setting")
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, datetime('now'))
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, value],
            )
            .context("Failed to write setting")?;
        Ok(())
    }

    pub fn maintenance_mode(&self) -> Result<bool> {
        Ok(self
            .get_setting(MAINTENANCE_KEY)?
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false))
    }

    pub fn set_maintenance_mode(&self, enabled: bool) -> Result<()> {
        self.set_setting(MAINTENANCE_KEY, if enabled { "true" } else { "false" })
    }

    // ── Engines ───────────────────────────────────────────────────────

    pub fn register_engine(&self, id: &str, instance_id: Option<&str>) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO engines (id, instance_id, state, start_time) VALUES (?1, ?2, 'running', ?3)
                 ON CONFLICT(id) DO UPDATE SET instance_id = excluded.instance_id,
                     state = 'running', start_time = excluded.start_time, shutdown_time = NULL",
                params![id, instance_id, Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)],
            )
            .context("Failed to register engine")?;
        Ok(())
    }

    pub fn engine_state(&self, id: &str) -> Result<Option<EngineState>> {
        let state: Option<String> = self
            .conn
            .query_row(
                "SELECT state FROM engines WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read engine state")?;
        state
            .map(|s| s.parse::<EngineState>().map_err(|e| anyhow::anyhow!(e)))
            .transpose()
    }

    pub fn set_engine_state(
        &self,
        id: &str,
        state: EngineState,
        shutdown_time: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE engines SET state = ?1, shutdown_time = COALESCE(?2, shutdown_time) WHERE id = ?3",
                params![state.as_str(), shutdown_time.map(|t| t.to_rfc3339_opts(SecondsFormat::Micros, true)), id],
            )
            .context("Failed to update engine state")?;
        Ok(())
    }

    /// Engines on an instance that have not stopped yet. An engine asked to
    /// shut down may still be finishing a scan, so it counts too.
    pub fn live_engines_on(&self, instance_id: Option<&str>) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT id FROM engines
             WHERE instance_id IS ?1 AND state IN ('running', 'shutdown_requested')
             ORDER BY id",
        )?;
        let ids = stmt
            .query_map(params![instance_id], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()
            .context("Failed to list live engines")?;
        Ok(ids)
    }

    /// Ask every running engine to drain and stop.
    pub fn request_fleet_shutdown(&self) -> Result<usize> {
        self.conn
            .execute(
                "UPDATE engines SET state = 'shutdown_requested' WHERE state = 'running'",
                [],
            )
            .context("Failed to request shutdown")
    }

    // ── Plugins ───────────────────────────────────────────────────────

    pub fn register_plugin(&self, name: &str, kind: PluginKind, enabled: bool) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO plugins (name, kind, enabled, updated_at) VALUES (?1, ?2, ?3, datetime('now'))
                 ON CONFLICT(name) DO UPDATE SET kind = excluded.kind, enabled = excluded.enabled,
                     updated_at = excluded.updated_at",
                params![name, kind.as_str(), enabled],
            )
            .context("Failed to register plugin")?;
        Ok(())
    }

    pub fn list_plugins(&self) -> Result<Vec<(String, PluginKind, bool)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name, kind, enabled FROM plugins ORDER BY name")
            .context("Failed to prepare list_plugins")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, bool>(2)?,
                ))
            })
            .context("Failed to query plugins")?;
        let mut plugins = Vec::new();
        for row in rows {
            let (name, kind, enabled) = row.context("Failed to read plugin row")?;
            let kind = kind.parse::<PluginKind>().unwrap_or_default();
            plugins.push((name, kind, enabled));
        }
        Ok(plugins)
    }
}

/// Encode a value as a JSON column.
pub(crate) fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).context("Failed to encode JSON column")
}

/// Decode a JSON column, falling back to the type's default when empty.
pub(crate) fn from_json<T: serde::de::DeserializeOwned + Default>(raw: &str) -> Result<T> {
    if raw.is_empty() {
        return Ok(T::default());
    }
    serde_json::from_str(raw).context("Failed to decode JSON column")
}

pub(crate) fn parse_time(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|t| t.with_timezone(&Utc))
}
