//! `settings.json` that ships next to every plugin.

use std::path::Path;

use anyhow::{Context, Result};
use scanfleet_common::PluginKind;
use serde::Deserialize;
use serde_json::Value;

pub const SETTINGS_FILE: &str = "settings.json";
const REGISTRY_VAR: &str = "$REGISTRY";

/// Plugin description. Only `name` is required.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct PluginSettings {
    pub name: String,
    #[serde(default)]
    pub image: String,
    /// `true`/`false`, or `"$VAR"` naming an env var holding `1`/`0`.
    #[serde(default)]
    enabled: Option<Value>,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    pub build_images: bool,
    #[serde(default)]
    pub feature: Option<String>,
    /// Maximum runtime in seconds. None waits forever.
    #[serde(default)]
    pub timeout: Option<u64>,
}

impl PluginSettings {
    /// Load `<plugin_dir>/<plugin>/settings.json`, substituting the registry
    /// into the image name.
    pub fn load(plugin_dir: &Path, plugin: &str, registry: Option<&str>) -> Result<Self> {
        let path = plugin_dir.join(plugin).join(SETTINGS_FILE);
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let mut settings: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        settings.image = resolve_image(&settings.image, registry);
        Ok(settings)
    }

    pub fn kind(&self) -> PluginKind {
        self.kind
            .as_deref()
            .and_then(|k| k.parse().ok())
            .unwrap_or_default()
    }

    pub fn is_enabled(&self) -> bool {
        self.is_enabled_with(|name| std::env::var(name).ok())
    }

    /// Missing flag or unset variable means enabled. Anything unparseable
    /// means disabled.
    pub fn is_enabled_with(&self, lookup: impl Fn(&str) -> Option<String>) -> bool {
        match &self.enabled {
            None | Some(Value::Null) => true,
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) if s.starts_with('$') => {
                match lookup(&s[1..]).as_deref().map(str::trim) {
                    None => true,
                    Some(v) => v.parse::<i64>().map(|n| n != 0).unwrap_or(false),
                }
            }
            Some(_) => false,
        }
    }

    /// Whether the scan's feature map lets this plugin run.
    pub fn feature_allowed(&self, features: &std::collections::HashMap<String, bool>) -> bool {
        match &self.feature {
            Some(f) => features.get(f).copied().unwrap_or(true),
            None => true,
        }
    }
}

fn resolve_image(image: &str, registry: Option<&str>) -> String {
    let image = image.replace(REGISTRY_VAR, registry.unwrap_or(""));
    image.strip_prefix('/').unwrap_or(&image).to_string()
}

/// Names of every plugin directory containing a settings file.
pub fn list_plugins(plugin_dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let entries = std::fs::read_dir(plugin_dir)
        .with_context(|| format!("Failed to list {}", plugin_dir.display()))?;
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if is_valid_plugin_name(&name) && entry.path().join(SETTINGS_FILE).is_file() {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}

fn is_valid_plugin_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}
