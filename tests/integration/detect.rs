#[path = "common/mod.rs"]
mod common;

use std::fs;

use common::HomeEnvGuard;
use fs2::FileExt;
use stigmer::{
    detect::{self, Holder},
    paths::{self, Service},
};

#[test]
fn fresh_data_dir_reports_everything_stopped() {
    let _home = HomeEnvGuard::new();
    unsafe {
        // Point the daemon probe at a port nothing listens on.
        std::env::set_var(stigmer::constants::ENV_SERVER_ADDR, "localhost:1");
    }

    assert!(!detect::is_running(Service::Daemon));
    assert!(!detect::is_running(Service::WorkflowRunner));
    assert!(detect::recorded_holder(Service::Daemon).is_none());

    unsafe {
        std::env::remove_var(stigmer::constants::ENV_SERVER_ADDR);
    }
}

#[test]
fn held_lock_is_authoritative_over_missing_pid_file() {
    let _home = HomeEnvGuard::new();

    let lock_path = paths::lockfile(Service::WorkflowRunner);
    let lock = fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(&lock_path)
        .expect("open lock");
    lock.try_lock_exclusive().expect("acquire");

    // No PID file exists, but tier 1 already settles it.
    assert!(detect::is_running(Service::WorkflowRunner));

    fs2::FileExt::unlock(&lock).expect("release");
    assert!(!detect::is_running(Service::WorkflowRunner));
}

#[test]
fn stale_pid_file_alone_does_not_mean_running() {
    let _home = HomeEnvGuard::new();
    unsafe {
        std::env::set_var(stigmer::constants::ENV_SERVER_ADDR, "localhost:1");
    }

    fs::write(paths::pidfile(Service::Daemon), "999999999").expect("write pid");
    assert_eq!(
        detect::recorded_holder(Service::Daemon),
        Some(Holder::Process(999_999_999))
    );
    assert!(!detect::is_running(Service::Daemon));
    // The stop path must not find a live holder either.
    assert!(detect::find_holder(Service::Daemon).is_none());

    unsafe {
        std::env::remove_var(stigmer::constants::ENV_SERVER_ADDR);
    }
}

#[test]
fn container_id_records_are_read_back() {
    let _home = HomeEnvGuard::new();

    fs::write(
        paths::container_id_file(Service::AgentRunner),
        "abc123def456\n",
    )
    .expect("write cid");
    assert_eq!(
        detect::recorded_holder(Service::AgentRunner),
        Some(Holder::Container("abc123def456".into()))
    );
}
