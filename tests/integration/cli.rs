#[path = "common/mod.rs"]
mod common;

use assert_cmd::Command;
use common::HomeEnvGuard;
use predicates::prelude::*;

fn stigmer(home: &HomeEnvGuard) -> Command {
    let mut cmd = Command::cargo_bin("stigmer").expect("binary");
    cmd.env(stigmer::constants::ENV_HOME, home.path());
    cmd
}

#[test]
fn help_lists_the_user_commands() {
    let home = HomeEnvGuard::new();
    stigmer(&home)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("server"))
        .stdout(predicate::str::contains("apply"))
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("logs"))
        .stdout(predicate::str::contains("config"));
}

#[test]
fn config_path_points_into_the_data_dir() {
    let home = HomeEnvGuard::new();
    stigmer(&home)
        .args(["config", "path"])
        .assert()
        .success()
        .stdout(predicate::str::contains("config.yaml"));
}

#[test]
fn config_set_then_get_round_trips() {
    let home = HomeEnvGuard::new();
    stigmer(&home)
        .args(["config", "set", "backend.local.execution.mode", "sandbox"])
        .assert()
        .success();
    stigmer(&home)
        .args(["config", "get", "backend.local.execution.mode"])
        .assert()
        .success()
        .stdout(predicate::str::contains("sandbox"));
}

#[test]
fn unknown_config_key_fails_with_error_prefix() {
    let home = HomeEnvGuard::new();
    stigmer(&home)
        .args(["config", "get", "backend.nope"])
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::starts_with("Error:"));
}

#[test]
fn config_list_shows_every_key() {
    let home = HomeEnvGuard::new();
    stigmer(&home)
        .args(["config", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("backend.type"))
        .stdout(predicate::str::contains("backend.local.execution.ttl"));
}

#[test]
fn backend_set_switches_the_type() {
    let home = HomeEnvGuard::new();
    stigmer(&home)
        .args(["backend", "set", "cloud"])
        .assert()
        .success()
        .stdout(predicate::str::contains("cloud"));
    stigmer(&home)
        .args(["config", "get", "backend.type"])
        .assert()
        .success()
        .stdout(predicate::str::contains("cloud"));
}

#[test]
fn unknown_logs_component_is_rejected() {
    let home = HomeEnvGuard::new();
    stigmer(&home)
        .args(["logs", "--component", "nonsense", "--follow", "false"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown component"));
}

#[test]
fn new_scaffolds_into_the_working_directory() {
    let home = HomeEnvGuard::new();
    let workdir = tempfile::tempdir().expect("tempdir");
    stigmer(&home)
        .current_dir(workdir.path())
        .args(["new", "demo"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Created project"));
    assert!(workdir.path().join("demo/Stigmer.yaml").is_file());
}

#[test]
fn internal_personality_banner_reaches_stderr_before_failure() {
    let home = HomeEnvGuard::new();
    // The worker cannot reach a daemon on this port; with a tiny dial budget
    // it must still announce itself on stderr before dying.
    stigmer(&home)
        .arg("internal-workflow-runner")
        .env(stigmer::constants::ENV_SERVER_ADDR, "localhost:1")
        .env(stigmer::constants::ENV_DIAL_BUDGET_MS, "200")
        .timeout(std::time::Duration::from_secs(30))
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("internal-workflow-runner starting"))
        .stderr(predicate::str::contains("Error:"));
}

#[test]
fn internal_names_never_reach_the_user_parser() {
    let home = HomeEnvGuard::new();
    // A genuinely unknown subcommand is a parser error (exit code 2 from
    // clap), which proves the reserved names above took a different path.
    stigmer(&home)
        .arg("internal-not-a-personality")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unrecognized subcommand"));
}

#[test]
fn server_status_on_empty_data_dir_reports_stopped() {
    let home = HomeEnvGuard::new();
    stigmer(&home)
        .args(["server", "status"])
        .env(stigmer::constants::ENV_SERVER_ADDR, "localhost:1")
        .assert()
        .success()
        .stdout(predicate::str::contains("daemon"))
        .stdout(predicate::str::contains("Stopped"));
}
