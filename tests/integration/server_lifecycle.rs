#[path = "common/mod.rs"]
mod common;

use std::{env, fs, time::Duration};

use common::{HomeEnvGuard, free_port, stigmer_bin, wait_until};
use nix::{
    sys::signal::{Signal, kill},
    unistd::Pid,
};
use stigmer::{
    config::{Config, ExecutionMode, ExecutionOverrides, resolve_execution},
    constants, deploy, detect, exec,
    gateway::{self, Backend},
    manifest::{Manifest, ResourceKind},
    paths::{self, Service},
    rpc::proto::ExecutionPhase,
    supervisor::Supervisor,
};

struct ServerEnvGuard;

impl ServerEnvGuard {
    fn set(port: u16) -> Self {
        unsafe {
            env::set_var(constants::ENV_SERVER_ADDR, format!("localhost:{port}"));
            env::set_var(constants::ENV_BIN, stigmer_bin());
        }
        ServerEnvGuard
    }
}

impl Drop for ServerEnvGuard {
    fn drop(&mut self) {
        unsafe {
            env::remove_var(constants::ENV_SERVER_ADDR);
            env::remove_var(constants::ENV_BIN);
        }
    }
}

fn local_supervisor() -> (Supervisor, Config) {
    let mut config = Config::default();
    // Keep the container runtime out of the test environment.
    config.backend.local.execution.mode = ExecutionMode::Local;
    let execution = resolve_execution(&config, &ExecutionOverrides::default());
    (Supervisor::new(config.clone(), execution), config)
}

fn sample_manifest() -> Manifest {
    serde_json::from_str(
        r#"{
            "agents": [
                {"metadata": {"name": "code-reviewer", "displayName": "Code Reviewer"},
                 "spec": {"description": "Reviews pull requests",
                          "iconURL": "https://stigmer.dev/icons/reviewer.png"}}
            ],
            "workflows": [
                {"metadata": {"name": "review-pipeline"},
                 "spec": {"steps": [
                     {"name": "fetch", "message": "fetched sources"},
                     {"name": "review", "message": "review complete"}
                 ]}}
            ],
            "skills": []
        }"#,
    )
    .expect("manifest")
}

#[test]
fn daemon_lifecycle_start_deploy_run_crash_restart_stop() {
    let _home = HomeEnvGuard::new();
    let port = free_port();
    let _env = ServerEnvGuard::set(port);
    let (supervisor, config) = local_supervisor();

    // S1: empty data dir, `server start`.
    supervisor.start_all().expect("start");
    assert!(paths::pidfile(Service::Daemon).is_file(), "daemon pid file written");
    assert!(paths::pidfile(Service::WorkflowRunner).is_file());
    assert!(
        gateway::probe(&format!("localhost:{port}"), Duration::from_secs(3)),
        "tier-3 port probe succeeds"
    );
    assert!(detect::is_running(Service::Daemon));

    // Starting again must not spawn a second daemon.
    let first_pid: u32 = fs::read_to_string(paths::pidfile(Service::Daemon))
        .expect("read pid")
        .trim()
        .parse()
        .expect("pid");
    supervisor.start_all().expect("idempotent start");
    let still_pid: u32 = fs::read_to_string(paths::pidfile(Service::Daemon))
        .expect("read pid")
        .trim()
        .parse()
        .expect("pid");
    assert_eq!(first_pid, still_pid, "no second daemon spawned");

    // S2: deploy a manifest with one agent and one workflow.
    let backend = Backend::connect(&config).expect("connect");
    let manifest = sample_manifest();
    let report = deploy::apply(&backend, &manifest).expect("apply");
    assert!(!report.has_failures(), "apply failed: {:?}", report.results);
    assert_eq!(report.summary(), "Deployed: 1 agent(s) and 1 workflow(s)");

    let deployed = exec::resolve_target(&backend, "code-reviewer").expect("resolve agent");
    assert_eq!(deployed.kind, ResourceKind::Agent);
    let spec: serde_json::Value =
        serde_json::from_str(&deployed.resource.spec_json).expect("spec json");
    assert_eq!(spec["description"], "Reviews pull requests");
    assert_eq!(spec["iconURL"], "https://stigmer.dev/icons/reviewer.png");

    // S3: a second apply issues no new ids and reports unchanged.
    let ids: Vec<Option<String>> = report.results.iter().map(|r| r.id.clone()).collect();
    let second = deploy::apply(&backend, &manifest).expect("second apply");
    let second_ids: Vec<Option<String>> = second.results.iter().map(|r| r.id.clone()).collect();
    assert_eq!(ids, second_ids, "resource ids must be stable across applies");
    assert!(
        second
            .results
            .iter()
            .all(|r| matches!(r.outcome, deploy::ApplyOutcome::Unchanged)),
        "second apply must be unchanged: {:?}",
        second.results
    );

    // Run the workflow end-to-end through the workflow runner.
    let target = exec::resolve_target(&backend, "review-pipeline").expect("resolve workflow");
    assert_eq!(target.kind, ResourceKind::Workflow);
    let execution_id =
        exec::create_execution(&backend, &target, Some("please review"), Default::default())
            .expect("create execution");

    let stop = std::sync::atomic::AtomicBool::new(false);
    let execution = exec::wait(
        &backend,
        ResourceKind::Workflow,
        &execution_id,
        Duration::from_secs(30),
        &stop,
    )
    .expect("execution reaches a terminal phase");
    assert_eq!(execution.phase(), ExecutionPhase::Completed);
    assert_eq!(execution.messages.len(), 2);
    assert_eq!(execution.messages[0].role, "fetch");
    assert_eq!(execution.messages[1].text, "review complete");

    // An unknown reference names both kinds in the error.
    let err = exec::resolve_target(&backend, "no-such-thing").expect_err("unknown ref");
    let rendered = err.to_string();
    assert!(rendered.contains("workflow") && rendered.contains("agent"));

    // S4: SIGKILL the daemon (simulated crash), then restart.
    kill(Pid::from_raw(first_pid as i32), Signal::SIGKILL).expect("kill daemon");
    assert!(
        wait_until(Duration::from_secs(5), || !detect::is_running(Service::Daemon)),
        "daemon should be detected as down after SIGKILL"
    );

    supervisor.restart_all().expect("restart after crash");
    let restarted_pid: u32 = fs::read_to_string(paths::pidfile(Service::Daemon))
        .expect("read pid")
        .trim()
        .parse()
        .expect("pid");
    assert_ne!(restarted_pid, first_pid, "restart must spawn a fresh daemon");
    assert!(detect::is_running(Service::Daemon));

    // The store survived the crash: resources are still resolvable.
    let backend = Backend::connect(&config).expect("reconnect");
    exec::resolve_target(&backend, "code-reviewer").expect("agent survives restart");

    // Stop: port released, records removed, status reports stopped.
    supervisor.stop_all().expect("stop");
    assert!(
        wait_until(Duration::from_secs(5), || {
            !gateway::probe(&format!("localhost:{port}"), Duration::from_millis(300))
        }),
        "port must be free after stop"
    );
    assert!(!paths::pidfile(Service::Daemon).exists());
    assert!(!detect::is_running(Service::WorkflowRunner));
}

#[test]
fn restart_with_nothing_running_is_equivalent_to_start() {
    let _home = HomeEnvGuard::new();
    let port = free_port();
    let _env = ServerEnvGuard::set(port);
    let (supervisor, _config) = local_supervisor();

    supervisor.restart_all().expect("restart from cold");
    assert!(detect::is_running(Service::Daemon));

    supervisor.stop_all().expect("stop");
    assert!(
        wait_until(Duration::from_secs(5), || !detect::is_running(Service::Daemon)),
        "daemon stops"
    );
}
