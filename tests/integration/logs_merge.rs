#[path = "common/mod.rs"]
mod common;

use std::{fs, sync::Arc, sync::atomic::AtomicBool};

use common::HomeEnvGuard;
use stigmer::{
    logs::{self, LogSource, ViewOptions},
    paths::{self, Service},
};

fn render(sources: &[LogSource], tail: usize) -> String {
    let mut out = Vec::new();
    logs::view(
        sources,
        &ViewOptions { follow: false, tail },
        Arc::new(AtomicBool::new(false)),
        &mut out,
    )
    .expect("view");
    String::from_utf8(out).expect("utf8")
}

#[test]
fn per_source_order_matches_on_disk_order() {
    let _home = HomeEnvGuard::new();

    let path = paths::log_file(Service::Daemon);
    fs::write(
        &path,
        "2026-03-01T10:00:00Z alpha\n\
         2026-03-01T10:00:00Z beta\n\
         2026-03-01T10:00:00Z gamma\n",
    )
    .expect("write");

    let rendered = render(
        &[LogSource::File {
            component: "daemon".into(),
            path,
        }],
        50,
    );
    let positions: Vec<usize> = ["alpha", "beta", "gamma"]
        .iter()
        .map(|needle| rendered.find(needle).expect("present"))
        .collect();
    assert!(positions[0] < positions[1] && positions[1] < positions[2]);
}

#[test]
fn sources_interleave_by_timestamp() {
    let _home = HomeEnvGuard::new();

    let daemon = paths::log_file(Service::Daemon);
    let worker = paths::log_file(Service::WorkflowRunner);
    fs::write(
        &daemon,
        "2026-03-01T10:00:01Z daemon-early\n2026-03-01T10:00:05Z daemon-late\n",
    )
    .expect("write");
    fs::write(&worker, "2026-03-01T10:00:03Z worker-middle\n").expect("write");

    let rendered = render(
        &logs::sources_for(&[Service::Daemon, Service::WorkflowRunner], false),
        50,
    );
    let lines: Vec<&str> = rendered.lines().collect();
    assert!(lines[0].contains("daemon-early"));
    assert!(lines[1].contains("worker-middle"));
    assert!(lines[2].contains("daemon-late"));
}

#[test]
fn component_labels_are_fixed_width() {
    let _home = HomeEnvGuard::new();

    let daemon = paths::log_file(Service::Daemon);
    fs::write(&daemon, "2026-03-01T10:00:00Z hello\n").expect("write");

    let rendered = render(
        &logs::sources_for(&[Service::Daemon], false),
        50,
    );
    let expected_prefix = format!("[{:<15}]", "daemon");
    assert!(
        rendered.starts_with(&expected_prefix),
        "unexpected prefix in {rendered:?}"
    );
}

#[test]
fn stderr_sources_are_included_on_request() {
    let _home = HomeEnvGuard::new();

    fs::write(paths::log_file(Service::Daemon), "2026-03-01T10:00:00Z out\n")
        .expect("write");
    fs::write(paths::err_file(Service::Daemon), "2026-03-01T10:00:01Z err\n")
        .expect("write");

    let sources = logs::sources_for(&[Service::Daemon], true);
    assert_eq!(sources.len(), 2);
    let rendered = render(&sources, 50);
    assert!(rendered.contains("out"));
    assert!(rendered.contains("err"));
    assert!(rendered.contains("[daemon:err"));
}
