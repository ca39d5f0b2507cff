#[path = "common/mod.rs"]
mod common;

use std::{env, fs};

use common::HomeEnvGuard;
use stigmer::project;
use tempfile::tempdir;

#[test]
fn scaffold_produces_a_loadable_project() {
    let _home = HomeEnvGuard::new();
    let workdir = tempdir().expect("tempdir");
    let original = env::current_dir().expect("cwd");
    env::set_current_dir(workdir.path()).expect("chdir");

    let dir = project::scaffold("code-reviewer").expect("scaffold");
    assert!(dir.join("Stigmer.yaml").is_file());
    assert!(dir.join("go.mod").is_file());
    assert!(dir.join("main.go").is_file());

    let manifest = project::load_project(&dir).expect("load");
    assert_eq!(manifest.name, "code-reviewer");
    assert_eq!(manifest.runtime, "go");

    // Inside the project directory the detector flips on.
    env::set_current_dir(&dir).expect("chdir into project");
    assert!(project::in_project_directory());

    env::set_current_dir(original).expect("chdir back");
}

#[test]
fn non_project_directory_is_detected_as_such() {
    let _home = HomeEnvGuard::new();
    let workdir = tempdir().expect("tempdir");
    let original = env::current_dir().expect("cwd");
    env::set_current_dir(workdir.path()).expect("chdir");

    assert!(!project::in_project_directory());

    env::set_current_dir(original).expect("chdir back");
}

#[test]
fn project_manifest_optional_fields_round_trip() {
    let _home = HomeEnvGuard::new();
    let dir = tempdir().expect("tempdir");
    fs::write(
        dir.path().join("Stigmer.yaml"),
        "name: demo\nruntime: go\nmain: cmd/main.go\nversion: 1.2.3\ndescription: demo project\n",
    )
    .expect("write");

    let manifest = project::load_project(dir.path()).expect("load");
    assert_eq!(manifest.main, "cmd/main.go");
    assert_eq!(manifest.version.as_deref(), Some("1.2.3"));
    assert_eq!(manifest.description.as_deref(), Some("demo project"));
}

#[test]
fn malformed_project_manifest_is_a_descriptive_error() {
    let _home = HomeEnvGuard::new();
    let dir = tempdir().expect("tempdir");
    fs::write(dir.path().join("Stigmer.yaml"), "name: [oops").expect("write");

    let err = project::load_project(dir.path()).expect_err("should fail");
    assert!(err.to_string().contains("Stigmer.yaml"));
}
