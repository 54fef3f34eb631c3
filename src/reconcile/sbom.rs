//! SBOM post-processing: component and license inventory per repository.
//!
//! Two result shapes are accepted. A dependency graph plugin reports a list
//! of graphs, each a list of direct dependencies with nested `deps`. A
//! CycloneDX plugin reports `[document, components]` where `components` is
//! the already flattened dependency list.

use anyhow::{Context, Result};
use scanfleet_common::{PluginDetails, PluginResult, Scan};
use serde::Deserialize;
use serde_json::Value;

use super::Reconciler;
use crate::store::ComponentEntry;

/// License names past this length are scanner noise.
const MAX_LICENSE_NAME: usize = 256;
/// More licenses than this on one component is logged as suspect.
const MAX_LICENSES: usize = 20;

#[derive(Debug, Deserialize)]
struct Dependency {
    name: String,
    version: String,
    #[serde(rename = "type", default)]
    component_type: Option<String>,
    #[serde(default)]
    licenses: Vec<License>,
    #[serde(default)]
    deps: Vec<Dependency>,
}

#[derive(Debug, Deserialize)]
struct License {
    id: String,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SbomFormat {
    Graph,
    CycloneDx,
}

impl SbomFormat {
    pub fn detect(details: &[Value]) -> Self {
        match details.first() {
            Some(Value::Array(_)) => Self::Graph,
            _ => Self::CycloneDx,
        }
    }
}

/// Flattened component entries plus the document to keep for the scan.
fn parse(details: &[Value]) -> Result<Option<(Vec<ComponentEntry>, Value)>> {
    if details.is_empty() {
        return Ok(None);
    }
    let mut entries = Vec::new();
    let document = match SbomFormat::detect(details) {
        SbomFormat::Graph => {
            let mut roots = Vec::new();
            for graph in details {
                let Value::Array(directs) = graph else {
                    anyhow::bail!("SBOM graph is not a list");
                };
                for direct in directs {
                    let dep: Dependency = serde_json::from_value(direct.clone())
                        .context("Malformed SBOM dependency")?;
                    flatten(dep, &mut entries);
                    roots.push(direct.clone());
                }
            }
            Value::Array(roots)
        }
        SbomFormat::CycloneDx => {
            let parsed = details.get(1).cloned().unwrap_or(Value::Array(Vec::new()));
            let deps: Vec<Dependency> =
                serde_json::from_value(parsed).context("Malformed SBOM component list")?;
            for dep in deps {
                flatten(dep, &mut entries);
            }
            details[0].clone()
        }
    };
    Ok(Some((entries, document)))
}

fn flatten(dep: Dependency, out: &mut Vec<ComponentEntry>) {
    let mut licenses = Vec::new();
    for license in dep.licenses {
        if license.name.chars().count() > MAX_LICENSE_NAME {
            tracing::error!(
                component = %dep.name,
                version = %dep.version,
                "license name exceeds character limit, skipping"
            );
            continue;
        }
        licenses.push((license.id.to_lowercase(), license.name));
    }
    if licenses.len() > MAX_LICENSES {
        tracing::error!(
            component = %dep.name,
            count = licenses.len(),
            "too many licenses reported"
        );
    }
    out.push(ComponentEntry {
        name: dep.name,
        version: dep.version,
        component_type: dep.component_type,
        licenses,
    });
    for child in dep.deps {
        flatten(child, out);
    }
}

impl Reconciler {
    /// Record the components of an SBOM result and keep its document.
    ///
    /// The bulky details are cleared afterwards so the stored plugin result
    /// stays small. Returns the number of components recorded.
    pub async fn record_sbom(&self, scan: &Scan, result: &mut PluginResult) -> Result<usize> {
        let PluginDetails::Sbom(details) = &mut result.details else {
            return Ok(0);
        };
        let Some((entries, document)) = parse(details)? else {
            tracing::warn!(plugin = %result.name, "no results returned from SBOM plugin");
            return Ok(0);
        };
        let (scan_id, service, repo, plugin) = (
            scan.id.clone(),
            scan.service.clone(),
            scan.repo.clone(),
            result.name.clone(),
        );
        let recorded = self
            .db
            .call(move |db| {
                let n = db.record_components(&scan_id, &service, &repo, &entries)?;
                db.save_sbom_document(&scan_id, &plugin, &document)?;
                Ok(n)
            })
            .await?;
        details.clear();
        Ok(recorded)
    }
}
