//! Integration tests for the scanfleet CLI
//!
//! These run the binary against a throwaway project directory.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

const ENV_OVERRIDES: [&str; 4] = [
    "SCANFLEET_ADMISSION_URL",
    "SCANFLEET_DB_PATH",
    "SCANFLEET_ENGINE_ID",
    "RUST_LOG",
];

/// Helper to create a scanfleet Command with no leaked overrides
fn scanfleet() -> Command {
    let mut cmd = cargo_bin_cmd!("scanfleet");
    for name in ENV_OVERRIDES {
        cmd.env_remove(name);
    }
    cmd
}

fn create_temp_project() -> TempDir {
    TempDir::new().unwrap()
}

fn init_project(dir: &TempDir) {
    scanfleet()
        .current_dir(dir.path())
        .arg("init")
        .assert()
        .success();
}

fn write_config(dir: &TempDir, content: &str) {
    fs::create_dir_all(dir.path().join(".scanfleet")).unwrap();
    fs::write(dir.path().join(".scanfleet/fleet.toml"), content).unwrap();
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_scanfleet_help() {
        scanfleet()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("enqueue-org"));
    }

    #[test]
    fn test_scanfleet_version() {
        scanfleet().arg("--version").assert().success();
    }

    #[test]
    fn test_init_creates_config_and_db() {
        let dir = create_temp_project();

        scanfleet()
            .current_dir(dir.path())
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("Created fleet.toml"));

        assert!(dir.path().join(".scanfleet/fleet.toml").exists());
        assert!(dir.path().join(".scanfleet/fleet.db").exists());
    }

    #[test]
    fn test_init_idempotent() {
        let dir = create_temp_project();
        init_project(&dir);

        scanfleet()
            .current_dir(dir.path())
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));
    }

    #[test]
    fn test_invalid_log_format_rejected() {
        scanfleet()
            .args(["--log-format", "xml", "config"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid log format"));
    }
}

// =============================================================================
// Configuration Tests
// =============================================================================

mod configuration {
    use super::*;

    #[test]
    fn test_config_show_defaults() {
        let dir = create_temp_project();

        scanfleet()
            .current_dir(dir.path())
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No fleet.toml found"))
            .stdout(predicate::str::contains("target_count = 100"));
    }

    #[test]
    fn test_config_show_applies_env_overrides() {
        let dir = create_temp_project();
        init_project(&dir);

        scanfleet()
            .current_dir(dir.path())
            .env("SCANFLEET_ADMISSION_URL", "https://admission.internal/scans")
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("https://admission.internal/scans"));
    }

    #[test]
    fn test_config_validate_reports_warnings() {
        let dir = create_temp_project();
        write_config(
            &dir,
            r#"
            [engine]
            java_heap_size = "lots"
            "#,
        );

        scanfleet()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Invalid java_heap_size 'lots'"))
            .stdout(predicate::str::contains("admission_url"));
    }

    #[test]
    fn test_malformed_config_fails() {
        let dir = create_temp_project();
        write_config(&dir, "[engine\n");

        scanfleet()
            .current_dir(dir.path())
            .args(["config", "show"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Failed to parse config file"));
    }
}

// =============================================================================
// Pipeline Commands
// =============================================================================

mod pipeline {
    use super::*;

    const GITHUB_SERVICE: &str = r#"
        [discovery.services.github]
        type = "github"
        url = "http://127.0.0.1:9/graphql"
    "#;

    #[test]
    fn test_dispatch_requires_admission_url() {
        let dir = create_temp_project();
        init_project(&dir);

        scanfleet()
            .current_dir(dir.path())
            .arg("dispatch")
            .assert()
            .failure()
            .stderr(predicate::str::contains("dispatch.admission_url"));
    }

    #[test]
    fn test_dispatch_with_empty_queue() {
        let dir = create_temp_project();
        write_config(
            &dir,
            r#"
            [dispatch]
            admission_url = "http://127.0.0.1:9/scans"
            "#,
        );

        scanfleet()
            .current_dir(dir.path())
            .env("SCANFLEET_API_KEY", "k")
            .arg("dispatch")
            .assert()
            .success()
            .stdout(predicate::str::contains("No scan requests waiting"));
    }

    #[test]
    fn test_enqueue_org_puts_request_on_org_queue() {
        let dir = create_temp_project();
        write_config(&dir, GITHUB_SERVICE);

        scanfleet()
            .current_dir(dir.path())
            .args(["enqueue-org", "github/acme", "--plugins", "gitsecrets,bandit"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Queued discovery for github/acme"));

        scanfleet()
            .current_dir(dir.path())
            .args(["queue", "depth", "org"])
            .assert()
            .success()
            .stdout(predicate::str::contains("org: 1"));
    }

    #[test]
    fn test_enqueue_org_unknown_service_fails() {
        let dir = create_temp_project();
        write_config(&dir, GITHUB_SERVICE);

        scanfleet()
            .current_dir(dir.path())
            .args(["enqueue-org", "gitlab/acme"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("discovery.services.gitlab"));
    }

    #[test]
    fn test_enqueue_org_rejects_bad_target() {
        let dir = create_temp_project();
        write_config(&dir, GITHUB_SERVICE);

        scanfleet()
            .current_dir(dir.path())
            .args(["enqueue-org", "acme"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Expected <service>/<org>"));
    }

    #[test]
    fn test_discover_with_nothing_queued() {
        let dir = create_temp_project();
        write_config(&dir, GITHUB_SERVICE);

        scanfleet()
            .current_dir(dir.path())
            .args(["discover", "--max", "5"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Processed 0 discovery request(s)"));
    }

    #[test]
    fn test_db_path_override() {
        let dir = create_temp_project();
        let db = dir.path().join("elsewhere.db");

        scanfleet()
            .current_dir(dir.path())
            .arg("--db-path")
            .arg(&db)
            .args(["queue", "depth", "repo"])
            .assert()
            .success()
            .stdout(predicate::str::contains("repo: 0"));

        assert!(db.exists());
        assert!(!dir.path().join(".scanfleet/fleet.db").exists());
    }
}

// =============================================================================
// Fleet Controls
// =============================================================================

mod fleet {
    use super::*;

    #[test]
    fn test_maintenance_toggle() {
        let dir = create_temp_project();
        init_project(&dir);

        scanfleet()
            .current_dir(dir.path())
            .args(["fleet", "maintenance", "true"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Maintenance mode enabled"));

        scanfleet()
            .current_dir(dir.path())
            .args(["fleet", "maintenance", "false"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Maintenance mode disabled"));
    }

    #[test]
    fn test_shutdown_with_no_engines() {
        let dir = create_temp_project();
        init_project(&dir);

        scanfleet()
            .current_dir(dir.path())
            .args(["fleet", "shutdown"])
            .assert()
            .success()
            .stdout(predicate::str::contains("0 running engine(s)"));
    }

    #[test]
    fn test_scans_empty() {
        let dir = create_temp_project();
        init_project(&dir);

        scanfleet()
            .current_dir(dir.path())
            .args(["fleet", "scans"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No accepted scans recorded"));
    }
}

// =============================================================================
// End to end: queue -> dispatch -> admission API
// =============================================================================

mod end_to_end {
    use super::*;
    use axum::Json;
    use axum::routing::post;
    use scanfleet::queue::{QueueTransport, SqliteQueue};
    use scanfleet::store::{DbHandle, FleetDb};
    use serde_json::{Value, json};
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_dispatch_records_accepted_scans() {
        let app = axum::Router::new().route(
            "/scans/github",
            post(|Json(body): Json<Vec<Value>>| async move {
                let queued: Vec<String> = body
                    .iter()
                    .map(|i| format!("{}/{}/scan-1", i["org"].as_str().unwrap(), i["repo"].as_str().unwrap()))
                    .collect();
                Json(json!({"queued": queued, "failed": []}))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let dir = create_temp_project();
        write_config(
            &dir,
            &format!("[dispatch]\nadmission_url = \"http://{}/scans\"\n", addr),
        );

        let db = FleetDb::new(&dir.path().join(".scanfleet/fleet.db")).unwrap();
        let queue = SqliteQueue::new(DbHandle::new(db), Duration::from_secs(30));
        queue
            .send("repo", json!({"service": "github", "org": "acme", "repo": "api"}).to_string())
            .await
            .unwrap();

        let root = dir.path().to_path_buf();
        let dispatched = tokio::task::spawn_blocking(move || {
            scanfleet()
                .current_dir(&root)
                .env("SCANFLEET_API_KEY", "k")
                .arg("dispatch")
                .assert()
                .success()
                .get_output()
                .stdout
                .clone()
        })
        .await
        .unwrap();
        let out = String::from_utf8_lossy(&dispatched);
        assert!(out.contains("accepted 1"), "unexpected output: {}", out);

        assert_eq!(queue.depth("repo").await.unwrap(), 0);

        let root = dir.path().to_path_buf();
        tokio::task::spawn_blocking(move || {
            scanfleet()
                .current_dir(&root)
                .args(["fleet", "scans"])
                .assert()
                .success()
                .stdout(predicate::str::contains("scan-1  github/acme/api"));
        })
        .await
        .unwrap();
    }
}
