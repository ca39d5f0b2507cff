//! Thin wrapper over the container runtime CLI used for the agent runner.
//!
//! Every container-facing boundary (env injection, log addressing) funnels
//! `localhost` addresses through [`host_address`] so the container can reach
//! services bound on the host regardless of the host OS.
use std::process::{Command, Stdio};

use tracing::{debug, warn};

use crate::error::StigmerError;

/// True when a usable container runtime is on PATH.
pub fn runtime_available() -> bool {
    Command::new("docker")
        .args(["version", "--format", "{{.Server.Version}}"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Error for an absent container runtime, with remediation text.
pub fn runtime_missing_error() -> StigmerError {
    StigmerError::PrerequisiteMissing {
        what: "container runtime (docker)".into(),
        remedy: "Install Docker (https://docs.docker.com/get-docker/) or set \
                 `backend.local.execution.mode` to `local`."
            .into(),
    }
}

/// Options for starting a detached container.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Stable container name, used for orphan discovery.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Environment variables. Addresses must already be host-rewritten.
    pub env: Vec<(String, String)>,
    /// Host-path / container-path volume mounts.
    pub volumes: Vec<(String, String)>,
}

/// Starts a detached container with `--restart unless-stopped` and returns
/// the container id printed by the runtime.
pub fn run_detached(options: &RunOptions) -> Result<String, StigmerError> {
    let mut cmd = Command::new("docker");
    cmd.args(["run", "-d", "--restart", "unless-stopped", "--name", &options.name]);
    for (key, value) in &options.env {
        cmd.arg("-e").arg(format!("{key}={value}"));
    }
    for (host, container) in &options.volumes {
        cmd.arg("-v").arg(format!("{host}:{container}"));
    }
    cmd.arg(&options.image);

    let output = cmd.output().map_err(|source| StigmerError::Spawn {
        service: options.name.clone(),
        stderr: String::new(),
        source,
    })?;
    if !output.status.success() {
        return Err(StigmerError::Spawn {
            service: options.name.clone(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            source: std::io::Error::new(std::io::ErrorKind::Other, "docker run failed"),
        });
    }

    let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
    debug!("started container {} ({})", options.name, id);
    Ok(id)
}

/// Stops a container with the runtime's default grace period, leaving it in
/// place for inspection.
pub fn stop(id: &str) -> Result<(), StigmerError> {
    let stop = Command::new("docker").args(["stop", id]).output()?;
    if !stop.status.success() {
        warn!(
            "docker stop {} failed: {}",
            id,
            String::from_utf8_lossy(&stop.stderr).trim()
        );
    }
    Ok(())
}

/// Stops and removes a container. Errors are reported to the caller; most
/// call sites treat them as warnings because the container may already be
/// gone.
pub fn stop_and_remove(id: &str) -> Result<(), StigmerError> {
    stop(id)?;
    let rm = Command::new("docker").args(["rm", "-f", id]).output()?;
    if !rm.status.success() {
        warn!(
            "docker rm {} failed: {}",
            id,
            String::from_utf8_lossy(&rm.stderr).trim()
        );
    }
    Ok(())
}

/// True when the container with the given id is currently running.
pub fn is_running(id: &str) -> bool {
    Command::new("docker")
        .args(["inspect", "-f", "{{.State.Running}}", id])
        .output()
        .map(|output| {
            output.status.success()
                && String::from_utf8_lossy(&output.stdout).trim() == "true"
        })
        .unwrap_or(false)
}

/// Resolves a container id by name, if one exists in any state.
pub fn resolve_by_name(name: &str) -> Option<String> {
    let output = Command::new("docker")
        .args(["ps", "-aq", "--filter", &format!("name=^{name}$")])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let id = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if id.is_empty() { None } else { Some(id) }
}

/// True when the image is present locally.
pub fn image_present(image: &str) -> bool {
    Command::new("docker")
        .args(["image", "inspect", image])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Pulls an image, streaming the runtime's progress output to the terminal.
pub fn pull(image: &str) -> Result<(), StigmerError> {
    let status = Command::new("docker").args(["pull", image]).status()?;
    if !status.success() {
        return Err(StigmerError::PrerequisiteMissing {
            what: format!("container image '{image}'"),
            remedy: format!("Pull it manually with `docker pull {image}`."),
        });
    }
    Ok(())
}

/// Builds the `docker logs` invocation for a container source.
pub fn logs_command(id: &str, follow: bool, tail: usize) -> Command {
    let mut cmd = Command::new("docker");
    cmd.arg("logs").arg("--tail").arg(tail.to_string());
    if follow {
        cmd.arg("-f");
    }
    cmd.arg(id);
    cmd
}

/// Rewrites a host-local address for use inside a container. On Linux the
/// container shares the host network namespace semantics we rely on, so the
/// address is unchanged; on macOS and Windows the runtime's VM boundary means
/// `localhost` must become `host.docker.internal`.
pub fn host_address(addr: &str) -> String {
    rewrite_host_address(addr, std::env::consts::OS)
}

fn rewrite_host_address(addr: &str, host_os: &str) -> String {
    if host_os == "linux" {
        return addr.to_string();
    }

    let (scheme, rest) = match addr.split_once("://") {
        Some((scheme, rest)) => (Some(scheme), rest),
        None => (None, addr),
    };
    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => (host, Some(port)),
        _ => (rest, None),
    };

    let rewritten_host = match host {
        "localhost" | "127.0.0.1" => "host.docker.internal",
        other => other,
    };

    let mut result = String::new();
    if let Some(scheme) = scheme {
        result.push_str(scheme);
        result.push_str("://");
    }
    result.push_str(rewritten_host);
    if let Some(port) = port {
        result.push(':');
        result.push_str(port);
    }
    result
}
