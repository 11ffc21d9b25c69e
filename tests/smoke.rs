//! Smoke tests -- verify the binary runs and offline commands behave.

use assert_cmd::Command;
use predicates::prelude::*;
use predicates::str::contains;

fn crewdeck(dir: &tempfile::TempDir) -> Command {
    let mut cmd = Command::cargo_bin("crewdeck").unwrap();
    cmd.current_dir(dir.path())
        .env_remove("CREWDECK_CONFIG")
        .env_remove("CREWDECK_API_URL")
        .env_remove("CREWDECK_WS_URL")
        .env_remove("CREWDECK_TOKEN")
        .env("RUST_LOG", "error");
    cmd
}

#[test]
fn test_cli_help() {
    Command::cargo_bin("crewdeck")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(contains("crew orchestration service"));
}

#[test]
fn test_cli_version() {
    Command::cargo_bin("crewdeck")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(contains("crewdeck"));
}

#[test]
fn test_subcommands_exist() {
    for args in [
        &["crews", "list", "--help"][..],
        &["crews", "from-template", "--help"],
        &["agents", "list", "--help"],
        &["templates", "list", "--help"],
        &["execute", "--help"],
        &["executions", "cancel", "--help"],
        &["executions", "stats", "--help"],
        &["health", "--help"],
    ] {
        Command::cargo_bin("crewdeck").unwrap().args(args).assert().success();
    }
}

#[test]
fn test_validate_accepts_good_crew() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("crew.json"),
        r#"{
            "name": "Research",
            "agents": [{"name": "Ada", "role": "Researcher", "goal": "Find facts"}],
            "tasks": [{"description": "Research", "expectedOutput": "Notes"}]
        }"#,
    )
    .unwrap();

    crewdeck(&dir)
        .args(["crews", "validate", "crew.json"])
        .assert()
        .success()
        .stdout(contains("Crew 'Research' is valid."));
}

#[test]
fn test_validate_lists_problems() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("crew.json"), r#"{"name": "", "tasks": []}"#).unwrap();

    crewdeck(&dir)
        .args(["crews", "validate", "crew.json"])
        .assert()
        .failure()
        .stdout(contains("Crew name is required"))
        .stdout(contains("At least one agent is required"));
}

#[test]
fn test_config_shows_env_override() {
    let dir = tempfile::tempdir().unwrap();
    crewdeck(&dir)
        .env("CREWDECK_API_URL", "http://orchestrator.test:9000")
        .env("CREWDECK_TOKEN", "secret-token")
        .arg("config")
        .assert()
        .success()
        .stdout(contains("http://orchestrator.test:9000"))
        .stdout(contains("<redacted>"))
        .stdout(contains("secret-token").not());
}

#[test]
fn test_stats_on_fresh_database() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("crewdeck.toml"),
        "[storage]\ndb_path = \"state/crewdeck.db\"\n",
    )
    .unwrap();

    crewdeck(&dir)
        .args(["executions", "stats"])
        .assert()
        .success()
        .stdout(contains("Total:        0"))
        .stdout(contains("Success rate: 0.0%"));
    assert!(dir.path().join("state").join("crewdeck.db").exists());
}

#[test]
fn test_templates_list_offline_shows_builtins() {
    let dir = tempfile::tempdir().unwrap();
    crewdeck(&dir)
        .env("CREWDECK_API_URL", "http://127.0.0.1:9")
        .args(["templates", "list", "--cached"])
        .assert()
        .success()
        .stdout(contains("research_and_write"))
        .stdout(contains("content_creation"));
}

#[test]
fn test_rejected_cancel_prints_notification() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("bundle.json"),
        r#"{"execution": {"id": "exec-1", "crewId": "c1", "status": "running"}, "logs": []}"#,
    )
    .unwrap();

    crewdeck(&dir)
        .args(["executions", "import", "bundle.json"])
        .assert()
        .success()
        .stdout(contains("Execution exec-1 imported (running)."));

    crewdeck(&dir)
        .env("CREWDECK_API_URL", "http://127.0.0.1:9")
        .args(["executions", "cancel", "exec-1"])
        .assert()
        .failure()
        .stdout(contains("[error] Failed to cancel execution"));
}
