//! Project manifests (`Stigmer.yaml`) and scaffolding for `stigmer new`.
use std::{
    env, fs, io,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{constants, error::ManifestError};

/// Typed view of a project's `Stigmer.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProjectManifest {
    /// Project name; doubles as the default run target slug.
    pub name: String,
    /// Toolchain used to execute the deployment program (e.g. `go`).
    pub runtime: String,
    /// Relative path of the deployment entrypoint.
    pub main: String,
    /// Optional project version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Optional free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// True iff the current working directory contains a project manifest.
pub fn in_project_directory() -> bool {
    env::current_dir()
        .map(|dir| dir.join(constants::PROJECT_MANIFEST).is_file())
        .unwrap_or(false)
}

/// Loads the project manifest from a directory.
pub fn load_project(dir: &Path) -> Result<ProjectManifest, ManifestError> {
    let path = dir.join(constants::PROJECT_MANIFEST);
    if !path.is_file() {
        return Err(ManifestError::NotAProject(
            constants::PROJECT_MANIFEST,
            dir.display().to_string(),
        ));
    }

    let raw = fs::read_to_string(&path).map_err(|err| ManifestError::InvalidProject {
        path: path.display().to_string(),
        reason: err.to_string(),
    })?;
    let manifest: ProjectManifest =
        serde_yaml::from_str(&raw).map_err(|err| ManifestError::InvalidProject {
            path: path.display().to_string(),
            reason: err.to_string(),
        })?;

    debug!("loaded project '{}' from {}", manifest.name, path.display());
    Ok(manifest)
}

/// Scaffolds a new Go project directory that is immediately runnable by the
/// harvester. When `STIGMER_SDK_PATH` points at a local SDK checkout, a
/// replace directive is written so in-tree SDK modules resolve.
pub fn scaffold(name: &str) -> io::Result<PathBuf> {
    let dir = env::current_dir()?.join(name);
    if dir.exists() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("directory '{name}' already exists"),
        ));
    }
    fs::create_dir_all(&dir)?;

    let manifest = ProjectManifest {
        name: name.to_string(),
        runtime: "go".to_string(),
        main: "main.go".to_string(),
        version: Some("0.1.0".to_string()),
        description: None,
    };
    let yaml = serde_yaml::to_string(&manifest)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    fs::write(dir.join(constants::PROJECT_MANIFEST), yaml)?;

    fs::write(dir.join("go.mod"), go_mod(name))?;
    fs::write(dir.join("main.go"), MAIN_GO_STUB.replace("{name}", name))?;

    Ok(dir)
}

fn go_mod(name: &str) -> String {
    let mut contents = format!(
        "module {name}\n\ngo 1.22\n\nrequire {SDK_MODULE} v0.0.0\n",
        SDK_MODULE = SDK_MODULE
    );
    if let Ok(sdk_path) = env::var("STIGMER_SDK_PATH")
        && !sdk_path.is_empty()
    {
        contents.push_str(&format!("\nreplace {SDK_MODULE} => {sdk_path}\n"));
    }
    contents
}

/// Go module path of the deployment SDK.
pub const SDK_MODULE: &str = "github.com/stigmer/stigmer-sdk-go";

const MAIN_GO_STUB: &str = r#"package main

import (
	stigmer "github.com/stigmer/stigmer-sdk-go"
)

func main() {
	project := stigmer.NewProject("{name}")

	project.Agent("{name}", stigmer.AgentSpec{
		Description: "Describe what this agent does.",
	})

	project.Emit()
}
"#;
