use anyhow::{Context, Result};
use rusqlite::params;

use super::FleetDb;

/// One dependency reported by an SBOM plugin, flattened out of its tree.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentEntry {
    pub name: String,
    pub version: String,
    pub component_type: Option<String>,
    /// `(license id, license name)` pairs. Ids are stored lowercased.
    pub licenses: Vec<(String, String)>,
}

/// A component as last seen in a repository.
#[derive(Debug, Clone, PartialEq)]
pub struct RepoComponent {
    pub name: String,
    pub version: String,
    pub component_type: Option<String>,
    pub scan_id: String,
    pub licenses: Vec<String>,
}

impl FleetDb {
    // ── Components ────────────────────────────────────────────────────

    /// Record the components a scan's SBOM reported for its repository.
    ///
    /// Components are shared across repos by `(name, version)`. A component's
    /// type is only filled in when it was previously missing or `unknown`,
    /// and the repo mapping always points at the latest scan.
    pub fn record_components(
        &self,
        scan_id: &str,
        service: &str,
        repo: &str,
        entries: &[ComponentEntry],
    ) -> Result<usize> {
        let tx = self
            .conn()
            .unchecked_transaction()
            .context("Failed to begin component update")?;
        for entry in entries {
            let label = uuid::Uuid::new_v4().simple().to_string();
            let component_type = entry.component_type.as_deref().map(str::to_lowercase);
            let id: i64 = tx
                .query_row(
                    "INSERT INTO components (name, version, component_type, label)
                     VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT(name, version) DO UPDATE SET component_type = CASE
                         WHEN components.component_type IS NULL
                           OR components.component_type = 'unknown'
                         THEN COALESCE(excluded.component_type, components.component_type)
                         ELSE components.component_type END
                     RETURNING id",
                    params![entry.name, entry.version, component_type, label],
                    |row| row.get(0),
                )
                .context("Failed to upsert component")?;

            if !entry.licenses.is_empty() {
                tx.execute(
                    "DELETE FROM component_licenses WHERE component_id = ?1",
                    params![id],
                )?;
                for (license_id, name) in &entry.licenses {
                    let license_id = license_id.to_lowercase();
                    tx.execute(
                        "INSERT OR IGNORE INTO licenses (license_id, name) VALUES (?1, ?2)",
                        params![license_id, name],
                    )?;
                    tx.execute(
                        "INSERT OR IGNORE INTO component_licenses (component_id, license_id)
                         VALUES (?1, ?2)",
                        params![id, license_id],
                    )?;
                }
            }

            tx.execute(
                "INSERT INTO repo_components (service, repo, component_id, scan_id)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(service, repo, component_id) DO UPDATE SET scan_id = excluded.scan_id",
                params![service, repo, id, scan_id],
            )
            .context("Failed to map component to repo")?;
        }
        tx.commit().context("Failed to commit component update")?;
        Ok(entries.len())
    }

    pub fn repo_components(&self, service: &str, repo: &str) -> Result<Vec<RepoComponent>> {
        let mut stmt = self.conn().prepare(
            "SELECT c.id, c.name, c.version, c.component_type, rc.scan_id
             FROM repo_components rc JOIN components c ON c.id = rc.component_id
             WHERE rc.service = ?1 AND rc.repo = ?2
             ORDER BY c.name, c.version",
        )?;
        let rows = stmt
            .query_map(params![service, repo], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    RepoComponent {
                        name: row.get(1)?,
                        version: row.get(2)?,
                        component_type: row.get(3)?,
                        scan_id: row.get(4)?,
                        licenses: Vec::new(),
                    },
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to read repo components")?;

        let mut licenses = self.conn().prepare(
            "SELECT license_id FROM component_licenses WHERE component_id = ?1 ORDER BY license_id",
        )?;
        let mut components = Vec::with_capacity(rows.len());
        for (id, mut component) in rows {
            component.licenses = licenses
                .query_map(params![id], |row| row.get(0))?
                .collect::<rusqlite::Result<_>>()
                .context("Failed to read component licenses")?;
            components.push(component);
        }
        Ok(components)
    }

    /// Store the raw SBOM a plugin produced for a scan.
    pub fn save_sbom_document(
        &self,
        scan_id: &str,
        plugin: &str,
        document: &serde_json::Value,
    ) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO sbom_documents (scan_id, plugin, document) VALUES (?1, ?2, ?3)
                 ON CONFLICT(scan_id, plugin) DO UPDATE SET document = excluded.document",
                params![scan_id, plugin, super::to_json(document)?],
            )
            .context("Failed to save SBOM document")?;
        Ok(())
    }

    pub fn sbom_document(&self, scan_id: &str, plugin: &str) -> Result<Option<serde_json::Value>> {
        use rusqlite::OptionalExtension;

        let raw: Option<String> = self
            .conn()
            .query_row(
                "SELECT document FROM sbom_documents WHERE scan_id = ?1 AND plugin = ?2",
                params![scan_id, plugin],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to read SBOM document")?;
        raw.map(|r| serde_json::from_str(&r).context("Failed to decode SBOM document"))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, version: &str, kind: Option<&str>, licenses: &[(&str, &str)]) -> ComponentEntry {
        ComponentEntry {
            name: name.into(),
            version: version.into(),
            component_type: kind.map(String::from),
            licenses: licenses
                .iter()
                .map(|(id, name)| (id.to_string(), name.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_component_type_only_fills_unknown() -> Result<()> {
        let db = FleetDb::new_in_memory()?;
        db.record_components("s1", "github", "acme/api", &[entry("lodash", "4.17.21", None, &[])])?;
        db.record_components("s2", "github", "acme/api", &[entry("lodash", "4.17.21", Some("NPM"), &[])])?;
        db.record_components("s3", "github", "acme/api", &[entry("lodash", "4.17.21", Some("pypi"), &[])])?;

        let components = db.repo_components("github", "acme/api")?;
        assert_eq!(components.len(), 1);
        assert_eq!(components[0].component_type.as_deref(), Some("npm"));
        assert_eq!(components[0].scan_id, "s3");
        Ok(())
    }

    #[test]
    fn test_licenses_are_replaced_and_lowercased() -> Result<()> {
        let db = FleetDb::new_in_memory()?;
        db.record_components(
            "s1",
            "github",
            "acme/api",
            &[entry("serde", "1.0.0", Some("cargo"), &[("MIT", "MIT License"), ("Apache-2.0", "Apache")])],
        )?;
        db.record_components(
            "s2",
            "github",
            "acme/web",
            &[entry("serde", "1.0.0", Some("cargo"), &[("MIT", "MIT License")])],
        )?;
        let api = db.repo_components("github", "acme/api")?;
        assert_eq!(api[0].licenses, vec!["mit"]);
        assert_eq!(db.repo_components("github", "acme/web")?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_sbom_document_round_trip() -> Result<()> {
        let db = FleetDb::new_in_memory()?;
        assert!(db.sbom_document("s1", "trivy_sbom")?.is_none());
        db.save_sbom_document("s1", "trivy_sbom", &serde_json::json!({"bomFormat": "CycloneDX"}))?;
        let doc = db.sbom_document("s1", "trivy_sbom")?.context("missing")?;
        assert_eq!(doc["bomFormat"], "CycloneDX");
        Ok(())
    }
}
