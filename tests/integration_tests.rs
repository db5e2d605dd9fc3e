//! Integration tests for the fleet-hub CLI.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Helper to create a fleet-hub Command isolated from the caller's environment
fn fleet_hub(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("fleet-hub");
    cmd.current_dir(dir.path())
        .env_remove("FLEET_DEVICE_TOKEN")
        .env_remove("FLEET_CLIENT_TOKEN")
        .env_remove("RUST_LOG");
    cmd
}

mod cli_basics {
    use super::*;

    #[test]
    fn test_help() {
        let dir = TempDir::new().unwrap();
        fleet_hub(&dir)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("serve"))
            .stdout(predicate::str::contains("init-db"));
    }

    #[test]
    fn test_version() {
        let dir = TempDir::new().unwrap();
        fleet_hub(&dir).arg("--version").assert().success();
    }

    #[test]
    fn test_unknown_subcommand_fails() {
        let dir = TempDir::new().unwrap();
        fleet_hub(&dir).arg("launch").assert().failure();
    }
}

mod config_commands {
    use super::*;

    #[test]
    fn test_config_init_creates_file() {
        let dir = TempDir::new().unwrap();
        fleet_hub(&dir)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created fleet.toml"));

        let content = fs::read_to_string(dir.path().join("fleet.toml")).unwrap();
        assert!(content.contains("[server]"));
        assert!(content.contains("page_size = 20"));
    }

    #[test]
    fn test_config_init_does_not_overwrite() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("fleet.toml"), "[server]\nport = 9001\n").unwrap();

        fleet_hub(&dir)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));

        let content = fs::read_to_string(dir.path().join("fleet.toml")).unwrap();
        assert!(content.contains("9001"));
    }

    #[test]
    fn test_config_show_defaults_without_file() {
        let dir = TempDir::new().unwrap();
        fleet_hub(&dir)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No fleet.toml found"))
            .stdout(predicate::str::contains("port = 8080"));
    }

    #[test]
    fn test_config_show_hides_secrets() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("fleet.toml"),
            "[auth]\ndevice_token = \"very-secret\"\n",
        )
        .unwrap();

        fleet_hub(&dir)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("device_token = <set>"))
            .stdout(predicate::str::contains("very-secret").not());
    }

    #[test]
    fn test_config_validate_warns_about_missing_tokens() {
        let dir = TempDir::new().unwrap();
        fleet_hub(&dir)
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No device token configured"))
            .stdout(predicate::str::contains("No client token configured"));
    }

    #[test]
    fn test_config_validate_clean_file() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("fleet.toml"),
            "[auth]\ndevice_token = \"d\"\nclient_token = \"c\"\n",
        )
        .unwrap();

        fleet_hub(&dir)
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration is valid."));
    }

    #[test]
    fn test_env_token_satisfies_validation() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("fleet.toml"),
            "[auth]\nclient_token = \"c\"\n",
        )
        .unwrap();

        fleet_hub(&dir)
            .env("FLEET_DEVICE_TOKEN", "from-env")
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration is valid."));
    }

    #[test]
    fn test_config_custom_path() {
        let dir = TempDir::new().unwrap();
        fleet_hub(&dir)
            .args(["--config", "conf/hub.toml", "config", "init"])
            .assert()
            .success();
        assert!(dir.path().join("conf/hub.toml").exists());
    }

    #[test]
    fn test_invalid_config_is_reported() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("fleet.toml"), "[server\nport = ").unwrap();

        fleet_hub(&dir)
            .args(["config", "validate"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Failed to parse fleet.toml"));
    }
}

mod database {
    use super::*;

    #[test]
    fn test_init_db_creates_database() {
        let dir = TempDir::new().unwrap();
        fleet_hub(&dir)
            .args(["init-db", "--db-path", "data/hub.db"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Fleet database initialized"));
        assert!(dir.path().join("data/hub.db").exists());
    }

    #[test]
    fn test_init_db_uses_configured_path() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("fleet.toml"),
            "[server]\ndb_path = \"state/fleet.db\"\n",
        )
        .unwrap();

        fleet_hub(&dir).arg("init-db").assert().success();
        assert!(dir.path().join("state/fleet.db").exists());
    }
}
