//! Three-tier liveness detection for managed services.
//!
//! Tier 1 is the advisory lockfile: if a non-blocking acquisition succeeds
//! the file was unheld and the service is not running. Tier 2 is the
//! PID/container-id file plus a liveness check. Tier 3, for the daemon only,
//! is a bounded gRPC dial against the declared port, which recovers orphans
//! that lost both their lock and their PID file. PID files are diagnostic;
//! the lock is authoritative.
use std::{fs, path::Path};

use fs2::FileExt;
use nix::{sys::signal::kill, unistd::Pid};
use sysinfo::{ProcessesToUpdate, System};
use tracing::{debug, warn};

use crate::{
    constants, container, gateway,
    paths::{self, Service, Transport},
};

/// The process or container currently backing a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Holder {
    /// Subprocess identified by its PID (which is also its process group id).
    Process(u32),
    /// Container identified by its runtime id.
    Container(String),
}

/// True when the service is running, per the detection cascade.
pub fn is_running(service: Service) -> bool {
    if lockfile_held(service) {
        return true;
    }
    if let Some(holder) = recorded_holder(service) {
        match holder {
            Holder::Process(pid) => {
                if process_alive(pid) {
                    return true;
                }
            }
            Holder::Container(id) => {
                if container::is_running(&id) {
                    return true;
                }
            }
        }
    }
    if service == Service::Daemon {
        let (addr, _) = gateway::resolve_endpoint(&crate::config::Config::default());
        if gateway::probe(&addr, constants::STATUS_DIAL_TIMEOUT) {
            debug!("daemon detected via port probe despite missing records");
            return true;
        }
    }
    false
}

/// The port the daemon is expected to listen on, honoring the endpoint
/// override used by tests.
fn daemon_port() -> u16 {
    let (addr, _) = gateway::resolve_endpoint(&crate::config::Config::default());
    addr.rsplit_once(':')
        .and_then(|(_, port)| port.parse().ok())
        .unwrap_or(constants::DAEMON_PORT)
}

/// Locates the live holder of a service, if any. Used by the stop path; the
/// final port-scan fallback catches orphans whose records went stale.
pub fn find_holder(service: Service) -> Option<Holder> {
    if let Some(holder) = recorded_holder(service) {
        let alive = match &holder {
            Holder::Process(pid) => process_alive(*pid),
            Holder::Container(id) => container::is_running(id),
        };
        if alive {
            return Some(holder);
        }
        debug!(
            "stale {} record for '{}'",
            match holder {
                Holder::Process(_) => "PID",
                Holder::Container(_) => "container-id",
            },
            service.name()
        );
    }

    if service == Service::Daemon {
        let port = daemon_port();
        if let Some(pid) = pid_listening_on(port) {
            warn!(
                "daemon port {port} held by untracked process {pid}; treating it \
                 as the holder"
            );
            return Some(Holder::Process(pid));
        }
    }

    if service.transport() == Transport::Container
        && let Some(id) = container::resolve_by_name(constants::AGENT_RUNNER_CONTAINER)
        && container::is_running(&id)
    {
        return Some(Holder::Container(id));
    }

    None
}

/// Tier 1: non-blocking probe of the advisory lock. Returns `true` when some
/// process holds the lock.
pub fn lockfile_held(service: Service) -> bool {
    let path = paths::lockfile(service);
    if !path.exists() {
        return false;
    }
    let file = match fs::OpenOptions::new().read(true).write(true).open(&path) {
        Ok(file) => file,
        Err(err) => {
            debug!("cannot open lockfile {}: {}", path.display(), err);
            return false;
        }
    };
    match file.try_lock_exclusive() {
        Ok(()) => {
            // Acquisition succeeded, so nothing held it. Release immediately.
            let _ = fs2::FileExt::unlock(&file);
            false
        }
        Err(_) => true,
    }
}

/// Tier 2: the recorded PID or container id, without a liveness check.
pub fn recorded_holder(service: Service) -> Option<Holder> {
    match service.transport() {
        Transport::Subprocess => {
            let pid = read_id_file(&paths::pidfile(service))?.parse::<u32>().ok()?;
            Some(Holder::Process(pid))
        }
        Transport::Container => {
            let id = read_id_file(&paths::container_id_file(service))?;
            Some(Holder::Container(id))
        }
    }
}

fn read_id_file(path: &Path) -> Option<String> {
    let raw = fs::read_to_string(path).ok()?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// True when the PID exists and belongs to one of our personalities. A bare
/// zero-signal is not enough: PIDs are recycled, so the command line must
/// match the expected image.
pub fn process_alive(pid: u32) -> bool {
    if kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }

    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[sysinfo::Pid::from_u32(pid)]), true);
    match system.process(sysinfo::Pid::from_u32(pid)) {
        Some(process) => {
            let name = process.name().to_string_lossy().to_ascii_lowercase();
            let cmd_matches = process.cmd().iter().any(|arg| {
                arg.to_string_lossy().to_ascii_lowercase().contains("stigmer")
            });
            name.contains("stigmer") || cmd_matches
        }
        // Signal 0 succeeded but the process table misses it; trust the signal.
        None => true,
    }
}

/// Finds the PID listening on a local TCP port. Linux reads the kernel's
/// socket table directly; other platforms fall back to `lsof`.
#[cfg(target_os = "linux")]
pub fn pid_listening_on(port: u16) -> Option<u32> {
    let inode = listening_socket_inode(port)?;
    let needle = format!("socket:[{inode}]");

    for entry in fs::read_dir("/proc").ok()?.flatten() {
        let name = entry.file_name();
        let Some(pid) = name.to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        let fd_dir = entry.path().join("fd");
        let Ok(fds) = fs::read_dir(&fd_dir) else {
            continue;
        };
        for fd in fds.flatten() {
            if let Ok(target) = fs::read_link(fd.path())
                && target.to_string_lossy() == needle
            {
                return Some(pid);
            }
        }
    }
    None
}

#[cfg(target_os = "linux")]
fn listening_socket_inode(port: u16) -> Option<u64> {
    const TCP_LISTEN: &str = "0A";
    for table in ["/proc/net/tcp", "/proc/net/tcp6"] {
        let Ok(contents) = fs::read_to_string(table) else {
            continue;
        };
        for line in contents.lines().skip(1) {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 10 {
                continue;
            }
            let Some((_, local_port_hex)) = fields[1].rsplit_once(':') else {
                continue;
            };
            let Ok(local_port) = u16::from_str_radix(local_port_hex, 16) else {
                continue;
            };
            if local_port == port && fields[3] == TCP_LISTEN {
                if let Ok(inode) = fields[9].parse::<u64>() {
                    return Some(inode);
                }
            }
        }
    }
    None
}

#[cfg(not(target_os = "linux"))]
pub fn pid_listening_on(port: u16) -> Option<u32> {
    use std::process::Command;

    let output = Command::new("lsof")
        .args(["-ti", &format!("tcp:{port}"), "-sTCP:LISTEN"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .next()?
        .trim()
        .parse()
        .ok()
}
