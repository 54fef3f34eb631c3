//! Project bootstrap: `scanfleet init`.

use std::path::Path;

use anyhow::{Context, Result};
use scanfleet::config::{CONFIG_DIR, CONFIG_FILE, FleetToml};
use scanfleet::store::FleetDb;

pub fn cmd_init(project_dir: &Path) -> Result<()> {
    let fleet_dir = project_dir.join(CONFIG_DIR);
    std::fs::create_dir_all(&fleet_dir)
        .with_context(|| format!("Failed to create {}", fleet_dir.display()))?;

    let config_path = fleet_dir.join(CONFIG_FILE);
    if config_path.exists() {
        println!("fleet.toml already exists at {}", config_path.display());
    } else {
        std::fs::write(&config_path, FleetToml::default().to_toml_string()?)
            .with_context(|| format!("Failed to write {}", config_path.display()))?;
        println!("Created fleet.toml at {}", config_path.display());
    }

    let db_path = fleet_dir.join(scanfleet::config::DB_FILE);
    FleetDb::new(&db_path)?;
    println!("Database initialized at {}", db_path.display());
    println!();
    println!("Next steps:");
    println!("  - set [dispatch] admission_url and export the API key");
    println!("  - add [discovery.services.<name>] entries for each provider");
    Ok(())
}
