//! Runs the user's deployment program and harvests its stdout as a manifest.
//!
//! No pre-execution validation of the user code is performed: the toolchain's
//! compiler and the manifest schema are the only validators. The single
//! semantic check is on outcome — at least one resource must be produced.
use std::{path::Path, process::Command};

use tracing::{debug, info};

use crate::{
    constants,
    error::{ManifestError, StigmerError},
    manifest::Manifest,
    project::{self, ProjectManifest},
};

/// Executes the project's deployment program and parses its manifest.
pub fn harvest(project_dir: &Path, org: &str) -> Result<Manifest, StigmerError> {
    let project = project::load_project(project_dir)?;
    let mut cmd = toolchain_command(&project)?;
    cmd.current_dir(project_dir)
        .env(constants::ENV_ORG, org)
        .env(constants::ENV_MANIFEST_MODE, "json");

    info!(
        "harvesting manifest from '{}' ({} {})",
        project.name, project.runtime, project.main
    );

    let output = cmd.output().map_err(|source| StigmerError::Spawn {
        service: format!("{} {}", project.runtime, project.main),
        stderr: String::new(),
        source,
    })?;

    if !output.status.success() {
        // Pass the toolchain's stderr through verbatim; rewriting it produces
        // strictly worse diagnostics.
        return Err(ManifestError::ProgramFailed {
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
        .into());
    }

    debug!("captured {} bytes of manifest output", output.stdout.len());
    let manifest = Manifest::parse(&output.stdout)?;
    if manifest.is_empty() {
        return Err(ManifestError::Empty(constants::SDK_QUICKSTART).into());
    }

    Ok(manifest)
}

/// Builds the toolchain invocation for the project's runtime.
fn toolchain_command(project: &ProjectManifest) -> Result<Command, ManifestError> {
    match project.runtime.as_str() {
        "go" => {
            let mut cmd = Command::new("go");
            cmd.arg("run").arg(&project.main);
            Ok(cmd)
        }
        other => Err(ManifestError::UnsupportedRuntime(other.to_string())),
    }
}
