#[path = "common/mod.rs"]
mod common;

use std::{
    fs,
    time::{Duration, SystemTime},
};

use common::HomeEnvGuard;
use stigmer::{
    paths::{self, Service},
    supervisor,
};

#[test]
fn rotation_preserves_pre_start_contents() {
    let _home = HomeEnvGuard::new();

    let live = paths::log_file(Service::Daemon);
    let err = paths::err_file(Service::Daemon);
    fs::write(&live, "line one\nline two\n").expect("write log");
    fs::write(&err, "oops\n").expect("write err");

    supervisor::rotate_logs(Service::Daemon);

    assert!(!live.exists());
    assert!(!err.exists());

    let mut archived_log = None;
    let mut archived_err = None;
    for entry in fs::read_dir(paths::logs_dir()).expect("read dir").flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with("daemon.log.") {
            archived_log = Some(entry.path());
        } else if name.starts_with("daemon.err.") {
            archived_err = Some(entry.path());
        }
    }

    let archived_log = archived_log.expect("stdout archive exists");
    assert_eq!(
        fs::read_to_string(archived_log).expect("read archive"),
        "line one\nline two\n"
    );
    let archived_err = archived_err.expect("stderr archive exists");
    assert_eq!(fs::read_to_string(archived_err).expect("read archive"), "oops\n");
}

#[test]
fn rotation_stamp_is_a_utc_timestamp() {
    let _home = HomeEnvGuard::new();

    let live = paths::log_file(Service::WorkflowRunner);
    fs::write(&live, "x\n").expect("write");
    supervisor::rotate_logs(Service::WorkflowRunner);

    let archive = fs::read_dir(paths::logs_dir())
        .expect("read dir")
        .flatten()
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .find(|name| name.starts_with("workflow-runner.log."))
        .expect("archive present");

    let stamp = archive.trim_start_matches("workflow-runner.log.");
    // YYYY-MM-DD-HHMMSS
    assert_eq!(stamp.len(), 17, "unexpected stamp '{stamp}'");
    assert!(stamp.chars().filter(|c| *c == '-').count() == 3);
}

#[test]
fn retention_deletes_only_expired_archives() {
    let _home = HomeEnvGuard::new();

    let expired = paths::logs_dir().join("daemon.log.2026-01-01-000000");
    let recent = paths::logs_dir().join("daemon.log.2026-07-30-000000");
    let live = paths::log_file(Service::Daemon);
    fs::write(&expired, "old").expect("write");
    fs::write(&recent, "new").expect("write");
    fs::write(&live, "live").expect("write");

    // Age the expired archive by backdating its modification time.
    let old_mtime = SystemTime::now() - Duration::from_secs(8 * 24 * 60 * 60);
    let file = fs::OpenOptions::new().write(true).open(&expired).expect("open");
    file.set_times(fs::FileTimes::new().set_modified(old_mtime))
        .expect("set mtime");

    supervisor::prune_archives(SystemTime::now());

    assert!(!expired.exists(), "expired archive should be pruned");
    assert!(recent.exists(), "recent archive must survive");
    assert!(live.exists(), "live log must survive");
}

#[test]
fn starting_rotation_twice_keeps_distinct_archives() {
    let _home = HomeEnvGuard::new();

    let live = paths::log_file(Service::Daemon);
    fs::write(&live, "first generation\n").expect("write");
    supervisor::rotate_logs(Service::Daemon);

    // A new live file appears (as the service writes) and is rotated again.
    std::thread::sleep(Duration::from_millis(1100));
    fs::write(&live, "second generation\n").expect("write");
    supervisor::rotate_logs(Service::Daemon);

    let archives: Vec<_> = fs::read_dir(paths::logs_dir())
        .expect("read dir")
        .flatten()
        .filter(|entry| {
            entry
                .file_name()
                .to_string_lossy()
                .starts_with("daemon.log.")
        })
        .collect();
    assert_eq!(archives.len(), 2, "each rotation must archive separately");
}
