//! Supervisor: deterministic lifecycle management for the daemon, the
//! workflow runner and the agent-runner container.
//!
//! Start order is daemon, then workflow runner, then agent runner; the later
//! services depend on the earlier ones but carry no cross-references in the
//! binary layout. Stop is always safe to call and restart never gates its
//! stop on a liveness check, so a stale PID file cannot let an orphan
//! survive a restart and keep the port.
use std::{
    fs::{self, File, OpenOptions},
    io,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    thread,
    time::{Duration, Instant, SystemTime},
};

#[cfg(unix)]
use std::os::unix::process::CommandExt;

use chrono::Utc;
use fs2::FileExt;
use nix::{
    sys::signal::{Signal, kill, killpg},
    unistd::Pid,
};
use tracing::{debug, info, warn};

use crate::{
    config::{Config, ExecutionMode, ExecutionSettings},
    constants, container, detect,
    detect::Holder,
    error::StigmerError,
    gateway,
    paths::{self, Service},
};

/// Supervisor over the managed service fleet.
pub struct Supervisor {
    config: Config,
    execution: ExecutionSettings,
}

/// Reported state of one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStatus {
    /// The service.
    pub service: Service,
    /// Whether the detector considers it running.
    pub running: bool,
    /// Recorded holder, for display.
    pub holder: Option<Holder>,
}

impl Supervisor {
    /// Creates a supervisor with resolved execution settings.
    pub fn new(config: Config, execution: ExecutionSettings) -> Self {
        Self { config, execution }
    }

    /// Starts the daemon and the services it manages. Idempotent: already
    /// running services are left alone.
    pub fn start_all(&self) -> Result<(), StigmerError> {
        paths::ensure_data_dir()?;
        self.start(Service::Daemon)?;
        self.start(Service::WorkflowRunner)?;
        self.start_agent_runner_if_configured()?;
        Ok(())
    }

    /// Stops all managed services, leaf services first.
    pub fn stop_all(&self) -> Result<(), StigmerError> {
        self.stop(Service::AgentRunner)?;
        self.stop(Service::WorkflowRunner)?;
        self.stop(Service::Daemon)?;
        Ok(())
    }

    /// Unconditional restart: stop (idempotent) then start, never gated on a
    /// liveness check.
    pub fn restart_all(&self) -> Result<(), StigmerError> {
        self.stop_all()?;
        self.start_all()
    }

    /// Detector-backed status of every service.
    pub fn status(&self) -> Vec<ServiceStatus> {
        Service::all()
            .into_iter()
            .map(|service| ServiceStatus {
                service,
                running: detect::is_running(service),
                holder: detect::recorded_holder(service),
            })
            .collect()
    }

    /// Starts the daemon if it is not already running. Client commands that
    /// need a local backend (`apply`, `run`, `logs`) call this before
    /// dialing; cloud-backed commands skip it.
    pub fn ensure_daemon(&self) -> Result<(), StigmerError> {
        if detect::is_running(Service::Daemon) {
            return Ok(());
        }
        info!("local daemon is not running; starting it");
        paths::ensure_data_dir()?;
        self.start(Service::Daemon)?;
        self.start(Service::WorkflowRunner)
    }

    /// Starts one service. Success when it is already running.
    pub fn start(&self, service: Service) -> Result<(), StigmerError> {
        if detect::is_running(service) {
            info!("'{}' is already running", service.name());
            return Ok(());
        }

        // The start lock serializes concurrent CLI invocations during the
        // pre-spawn phase only. It must be released before the spawn: the
        // personality acquires the same lockfile as its first act and holds
        // it for its lifetime, and would lose to a CLI still holding it.
        let start_lock = acquire_lock(service, constants::LOCK_WAIT)?;
        rotate_logs(service);
        drop(start_lock);

        match service {
            Service::Daemon => self.spawn_daemon(),
            Service::WorkflowRunner => self.spawn_workflow_runner(),
            Service::AgentRunner => self.start_agent_runner(),
        }
    }

    fn start_agent_runner_if_configured(&self) -> Result<(), StigmerError> {
        match self.execution.mode {
            ExecutionMode::Local => {
                debug!("execution mode is local; agent runner container not started");
                Ok(())
            }
            ExecutionMode::Sandbox => {
                if !container::runtime_available() {
                    return Err(container::runtime_missing_error());
                }
                self.start(Service::AgentRunner)
            }
            ExecutionMode::Auto => {
                if container::runtime_available() {
                    self.start(Service::AgentRunner)
                } else {
                    warn!(
                        "no container runtime found; agent executions will run \
                         on the host"
                    );
                    Ok(())
                }
            }
        }
    }

    fn spawn_daemon(&self) -> Result<(), StigmerError> {
        let (addr, _) = gateway::resolve_endpoint(&self.config);
        let port = addr
            .rsplit_once(':')
            .and_then(|(_, port)| port.parse::<u16>().ok())
            .unwrap_or(constants::DAEMON_PORT);

        if let Some(pid) = detect::pid_listening_on(port) {
            return Err(StigmerError::PrerequisiteMissing {
                what: format!("port {port}"),
                remedy: format!(
                    "It is held by foreign process {pid}. Stop it or set {} to \
                     a different address.",
                    constants::ENV_SERVER_ADDR
                ),
            });
        }

        let mut cmd = personality_command(constants::INTERNAL_SERVER)?;
        cmd.env(constants::ENV_PORT, port.to_string());
        let child = spawn_logged(Service::Daemon, cmd)?;
        write_pidfile(Service::Daemon, child)?;

        wait_for_ready(&addr, constants::STARTUP_PROBE_BUDGET).map_err(|err| {
            // Surface the child's stderr; the crash reason lives there.
            let stderr = read_tail(&paths::err_file(Service::Daemon));
            match err {
                StigmerError::Timeout { .. } => StigmerError::Spawn {
                    service: Service::Daemon.name().to_string(),
                    stderr,
                    source: io::Error::new(
                        io::ErrorKind::TimedOut,
                        "daemon did not accept connections in time",
                    ),
                },
                other => other,
            }
        })?;

        info!("daemon listening on {addr} (pid {child})");
        Ok(())
    }

    fn spawn_workflow_runner(&self) -> Result<(), StigmerError> {
        let (addr, _) = gateway::resolve_endpoint(&self.config);
        let mut cmd = personality_command(constants::INTERNAL_WORKFLOW_RUNNER)?;
        cmd.env(constants::ENV_SERVER_ADDR, &addr)
            .env(
                constants::ENV_TEMPORAL_ADDR,
                format!("localhost:{}", constants::TEMPORAL_PORT),
            )
            .env(constants::ENV_TASK_QUEUES, constants::WORKFLOW_TASK_QUEUE);
        let child = spawn_logged(Service::WorkflowRunner, cmd)?;
        write_pidfile(Service::WorkflowRunner, child)?;
        info!("workflow runner started (pid {child})");
        Ok(())
    }

    fn start_agent_runner(&self) -> Result<(), StigmerError> {
        if !container::runtime_available() {
            return Err(container::runtime_missing_error());
        }
        self.ensure_sandbox_image()?;

        // Remove any orphan left by a previous run; failure is a warning.
        if let Some(orphan) = container::resolve_by_name(constants::AGENT_RUNNER_CONTAINER) {
            debug!("removing previous agent-runner container {orphan}");
            if let Err(err) = container::stop_and_remove(&orphan) {
                warn!("could not remove previous agent-runner container: {err}");
            }
        }

        let options = container::RunOptions {
            name: constants::AGENT_RUNNER_CONTAINER.to_string(),
            image: self.execution.sandbox_image.clone(),
            env: agent_runner_env(&self.config, self.execution.ttl),
            volumes: vec![(
                paths::workspace_dir().display().to_string(),
                constants::CONTAINER_WORKSPACE.to_string(),
            )],
        };
        let id = container::run_detached(&options)?;
        fs::write(paths::container_id_file(Service::AgentRunner), &id)?;
        info!("agent runner container started ({id})");
        Ok(())
    }

    /// Pre-pulls the sandbox image, guarded by an on-disk version marker so
    /// an unchanged image is not re-pulled on every start.
    fn ensure_sandbox_image(&self) -> Result<(), StigmerError> {
        let marker = paths::bin_dir().join(".image-version");
        let current = fs::read_to_string(&marker).unwrap_or_default();
        if current.trim() == self.execution.sandbox_image
            && container::image_present(&self.execution.sandbox_image)
        {
            return Ok(());
        }

        if !container::image_present(&self.execution.sandbox_image) {
            if !self.execution.auto_pull {
                return Err(StigmerError::PrerequisiteMissing {
                    what: format!("container image '{}'", self.execution.sandbox_image),
                    remedy: format!(
                        "Pull it with `docker pull {}` or enable \
                         backend.local.execution.auto_pull.",
                        self.execution.sandbox_image
                    ),
                });
            }
            info!("pulling sandbox image {}", self.execution.sandbox_image);
            container::pull(&self.execution.sandbox_image)?;
        }

        if let Err(err) = fs::write(&marker, &self.execution.sandbox_image) {
            warn!("could not write image version marker: {err}");
        }
        Ok(())
    }

    /// Stops one service. Idempotent: succeeds when nothing is running.
    pub fn stop(&self, service: Service) -> Result<(), StigmerError> {
        let holder = detect::find_holder(service);
        match holder {
            Some(Holder::Process(pid)) => {
                info!("stopping '{}' (pid {pid})", service.name());
                terminate_group(pid, constants::STOP_GRACE)?;
            }
            Some(Holder::Container(id)) => {
                info!("stopping '{}' (container {id})", service.name());
                let result = if self.execution.cleanup {
                    container::stop_and_remove(&id)
                } else {
                    container::stop(&id)
                };
                if let Err(err) = result {
                    warn!("container cleanup for '{}' failed: {err}", service.name());
                }
            }
            None => {
                debug!("'{}' is not running", service.name());
            }
        }

        // Stale records are removed even when nothing was running.
        remove_if_exists(&paths::pidfile(service));
        remove_if_exists(&paths::container_id_file(service));
        Ok(())
    }
}

/// Builds the command that re-invokes this binary as an internal personality.
/// `STIGMER_BIN` overrides the executable, which tests use to point at the
/// built binary instead of the test harness.
fn personality_command(personality: &str) -> Result<Command, StigmerError> {
    let bin = match std::env::var_os(constants::ENV_BIN) {
        Some(bin) => PathBuf::from(bin),
        None => std::env::current_exe()?,
    };
    let mut cmd = Command::new(bin);
    cmd.arg(personality);
    cmd.env(constants::ENV_HOME, paths::data_dir());
    Ok(cmd)
}

/// Spawns a child in a fresh process group with stdio redirected to its log
/// files, and returns its PID. The group lets stop reach grandchildren
/// spawned by toolchain wrappers.
fn spawn_logged(service: Service, mut cmd: Command) -> Result<u32, StigmerError> {
    let stdout = open_log(&paths::log_file(service))?;
    let stderr = open_log(&paths::err_file(service))?;
    cmd.stdin(Stdio::null()).stdout(stdout).stderr(stderr);

    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| {
            if libc::setpgid(0, 0) != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = cmd.spawn().map_err(|source| StigmerError::Spawn {
        service: service.name().to_string(),
        stderr: String::new(),
        source,
    })?;
    Ok(child.id())
}

fn open_log(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

fn write_pidfile(service: Service, pid: u32) -> io::Result<()> {
    fs::write(paths::pidfile(service), pid.to_string())
}

/// Acquires a service lockfile, retrying until the bounded wait elapses.
pub fn acquire_lock(service: Service, wait: Duration) -> Result<File, StigmerError> {
    let path = paths::lockfile(service);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&path)?;

    let deadline = Instant::now() + wait;
    loop {
        match file.try_lock_exclusive() {
            Ok(()) => return Ok(file),
            Err(_) if Instant::now() < deadline => {
                thread::sleep(constants::LOCK_RETRY_INTERVAL);
            }
            Err(_) => {
                let pid = match detect::recorded_holder(service) {
                    Some(Holder::Process(pid)) => Some(pid),
                    _ => None,
                };
                return Err(StigmerError::LockContention {
                    service: service.name().to_string(),
                    pid,
                });
            }
        }
    }
}

/// Rotates a service's non-empty log files to timestamped archives and prunes
/// archives past the retention horizon. Rotation failures are warnings, not
/// fatal.
pub fn rotate_logs(service: Service) {
    let stamp = Utc::now().format(constants::ROTATION_STAMP_FORMAT);
    for path in [paths::log_file(service), paths::err_file(service)] {
        match fs::metadata(&path) {
            Ok(meta) if meta.len() > 0 => {
                let archived = path.with_file_name(format!(
                    "{}.{stamp}",
                    path.file_name().unwrap_or_default().to_string_lossy()
                ));
                if let Err(err) = fs::rename(&path, &archived) {
                    warn!("could not rotate {}: {err}", path.display());
                }
            }
            _ => {}
        }
    }
    prune_archives(SystemTime::now());
}

/// Deletes archived logs whose modification time is past the retention
/// horizon. Takes `now` so retention is testable.
pub fn prune_archives(now: SystemTime) {
    let Ok(entries) = fs::read_dir(paths::logs_dir()) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let name = entry.file_name();
        let name = name.to_string_lossy();
        // Archives look like `<service>.log.<stamp>` / `<service>.err.<stamp>`.
        let is_archive = !name.ends_with(".log") && !name.ends_with(".err");
        if !is_archive {
            continue;
        }
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        let Ok(modified) = meta.modified() else {
            continue;
        };
        if now
            .duration_since(modified)
            .map(|age| age > constants::LOG_RETENTION)
            .unwrap_or(false)
        {
            debug!("pruning archived log {}", path.display());
            if let Err(err) = fs::remove_file(&path) {
                warn!("could not prune {}: {err}", path.display());
            }
        }
    }
}

/// Sends SIGTERM to the entire process group, waits up to the grace period,
/// then force-kills the group.
pub fn terminate_group(pid: u32, grace: Duration) -> Result<(), StigmerError> {
    let pgid = Pid::from_raw(pid as i32);

    match killpg(pgid, Signal::SIGTERM) {
        Ok(()) => {}
        Err(nix::errno::Errno::ESRCH) => return Ok(()),
        // The leader may have died leaving no group; fall back to the PID.
        Err(_) => {
            let _ = kill(pgid, Signal::SIGTERM);
        }
    }

    // A negative PID addresses the whole group, catching grandchildren that
    // outlive the leader.
    let group_probe = Pid::from_raw(-(pid as i32));
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if kill(group_probe, None).is_err() {
            return Ok(());
        }
        thread::sleep(Duration::from_millis(100));
    }

    warn!("process group {pid} did not exit within {grace:?}; sending SIGKILL");
    match killpg(pgid, Signal::SIGKILL) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(err) => Err(io::Error::from_raw_os_error(err as i32).into()),
    }
}

/// Blocks until a gRPC endpoint accepts connections or the budget elapses.
fn wait_for_ready(addr: &str, budget: Duration) -> Result<(), StigmerError> {
    let deadline = Instant::now() + budget;
    loop {
        if gateway::probe(addr, Duration::from_millis(500)) {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(StigmerError::Timeout {
                operation: format!("waiting for {addr} to accept connections"),
                seconds: budget.as_secs(),
                last_state: "connection refused".to_string(),
            });
        }
        thread::sleep(Duration::from_millis(100));
    }
}

fn remove_if_exists(path: &Path) {
    if path.exists()
        && let Err(err) = fs::remove_file(path)
    {
        warn!("could not remove {}: {err}", path.display());
    }
}

fn read_tail(path: &Path) -> String {
    match fs::read_to_string(path) {
        Ok(contents) => {
            let lines: Vec<&str> = contents.lines().collect();
            let start = lines.len().saturating_sub(20);
            lines[start..].join("\n")
        }
        Err(_) => String::new(),
    }
}

/// Environment handed to the agent-runner container, with host-local
/// addresses rewritten for the container boundary.
pub fn agent_runner_env(config: &Config, ttl: u64) -> Vec<(String, String)> {
    let (addr, _) = gateway::resolve_endpoint(config);
    vec![
        (
            constants::ENV_BACKEND_URL.to_string(),
            container::host_address(&addr),
        ),
        (
            constants::ENV_TEMPORAL_ADDR.to_string(),
            container::host_address(&format!("localhost:{}", constants::TEMPORAL_PORT)),
        ),
        (
            constants::ENV_TASK_QUEUES.to_string(),
            constants::AGENT_TASK_QUEUE.to_string(),
        ),
        (constants::ENV_SANDBOX_TTL.to_string(), ttl.to_string()),
    ]
}
