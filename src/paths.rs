//! Resolution of the on-disk data directory and the per-service state files.
//!
//! Layout under the data directory (default `~/.stigmer`):
//!
//! ```text
//! config.yaml
//! data/
//!   db/          daemon's local store
//!   logs/        service logs plus rotated archives
//!   bin/         extracted prerequisites and version markers
//!   workspace/   mounted into the agent-runner container
//!   <service>.pid | <service>-container.id
//!   <service>.lock
//! ```
use std::{
    env, fs, io,
    path::PathBuf,
    sync::{OnceLock, RwLock},
};

#[cfg(unix)]
use std::os::unix::fs::DirBuilderExt;

use crate::constants;

/// A managed service kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    /// Backend gRPC server (the daemon).
    Daemon,
    /// Workflow worker polling the daemon's task queues.
    WorkflowRunner,
    /// Containerized agent executor.
    AgentRunner,
}

/// How a service is hosted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Child subprocess of the same binary.
    Subprocess,
    /// Opaque container managed through the container runtime.
    Container,
}

impl Service {
    /// All managed services, in start order.
    pub fn all() -> [Service; 3] {
        [
            Service::Daemon,
            Service::WorkflowRunner,
            Service::AgentRunner,
        ]
    }

    /// Stable name used for file names and log labels.
    pub fn name(&self) -> &'static str {
        match self {
            Service::Daemon => "daemon",
            Service::WorkflowRunner => "workflow-runner",
            Service::AgentRunner => "agent-runner",
        }
    }

    /// Transport semantics of the service.
    pub fn transport(&self) -> Transport {
        match self {
            Service::Daemon | Service::WorkflowRunner => Transport::Subprocess,
            Service::AgentRunner => Transport::Container,
        }
    }

    /// Parses a user-facing component name.
    pub fn from_name(name: &str) -> Option<Service> {
        match name {
            "daemon" => Some(Service::Daemon),
            "workflow-runner" => Some(Service::WorkflowRunner),
            "agent-runner" => Some(Service::AgentRunner),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct PathContext {
    data_dir: PathBuf,
}

static CONTEXT: OnceLock<RwLock<PathContext>> = OnceLock::new();

fn context_lock() -> &'static RwLock<PathContext> {
    CONTEXT.get_or_init(|| RwLock::new(PathContext::from_env()))
}

impl PathContext {
    fn from_env() -> Self {
        let data_dir = env::var_os(constants::ENV_HOME)
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/"));
                home.join(".stigmer")
            });
        Self { data_dir }
    }
}

/// Re-reads `STIGMER_HOME`/`HOME` and replaces the active context. Personalities
/// call this on entry so a supervisor-provided override takes effect.
pub fn init() {
    let mut guard = context_lock().write().expect("path context poisoned");
    *guard = PathContext::from_env();
}

/// Root data directory.
pub fn data_dir() -> PathBuf {
    context_lock()
        .read()
        .expect("path context poisoned")
        .data_dir
        .clone()
}

/// Directory holding service logs and rotated archives.
pub fn logs_dir() -> PathBuf {
    data_dir().join("data").join("logs")
}

/// Directory holding the daemon's local store.
pub fn db_dir() -> PathBuf {
    data_dir().join("data").join("db")
}

/// Directory for extracted prerequisites and version markers.
pub fn bin_dir() -> PathBuf {
    data_dir().join("data").join("bin")
}

/// Host directory mounted into the agent-runner container.
pub fn workspace_dir() -> PathBuf {
    data_dir().join("data").join("workspace")
}

/// Path of the user config file.
pub fn config_file() -> PathBuf {
    data_dir().join(constants::CONFIG_FILE)
}

/// Advisory lockfile for a service. The lock is the authoritative liveness
/// signal; PID files are diagnostic only.
pub fn lockfile(service: Service) -> PathBuf {
    data_dir().join("data").join(format!("{}.lock", service.name()))
}

/// PID file for a subprocess service.
pub fn pidfile(service: Service) -> PathBuf {
    data_dir().join("data").join(format!("{}.pid", service.name()))
}

/// Container-id file for a container service.
pub fn container_id_file(service: Service) -> PathBuf {
    data_dir()
        .join("data")
        .join(format!("{}-container.id", service.name()))
}

/// Stdout log file of a service.
pub fn log_file(service: Service) -> PathBuf {
    logs_dir().join(format!("{}.log", service.name()))
}

/// Stderr log file of a service.
pub fn err_file(service: Service) -> PathBuf {
    logs_dir().join(format!("{}.err", service.name()))
}

/// Creates the data directory tree with owner-only permissions. Idempotent.
pub fn ensure_data_dir() -> io::Result<PathBuf> {
    let root = data_dir();
    create_private_dir(&root)?;
    for sub in [logs_dir(), db_dir(), bin_dir(), workspace_dir()] {
        fs::create_dir_all(&sub)?;
    }
    Ok(root)
}

#[cfg(unix)]
fn create_private_dir(path: &std::path::Path) -> io::Result<()> {
    if path.exists() {
        return Ok(());
    }
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true).mode(0o700);
    builder.create(path)
}

#[cfg(not(unix))]
fn create_private_dir(path: &std::path::Path) -> io::Result<()> {
    fs::create_dir_all(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::env_lock;
    use tempfile::tempdir;

    #[test]
    fn stigmer_home_overrides_default_layout() {
        let _guard = env_lock();
        let temp = tempdir().expect("tempdir");
        unsafe {
            env::set_var(constants::ENV_HOME, temp.path());
        }
        init();

        assert_eq!(data_dir(), temp.path());
        assert_eq!(
            lockfile(Service::Daemon),
            temp.path().join("data/daemon.lock")
        );
        assert_eq!(
            pidfile(Service::WorkflowRunner),
            temp.path().join("data/workflow-runner.pid")
        );
        assert_eq!(
            container_id_file(Service::AgentRunner),
            temp.path().join("data/agent-runner-container.id")
        );
        assert_eq!(
            log_file(Service::Daemon),
            temp.path().join("data/logs/daemon.log")
        );

        unsafe {
            env::remove_var(constants::ENV_HOME);
        }
        init();
    }

    #[test]
    fn ensure_data_dir_creates_tree() {
        let _guard = env_lock();
        let temp = tempdir().expect("tempdir");
        unsafe {
            env::set_var(constants::ENV_HOME, temp.path());
        }
        init();

        ensure_data_dir().expect("create tree");
        assert!(logs_dir().is_dir());
        assert!(db_dir().is_dir());
        assert!(workspace_dir().is_dir());

        unsafe {
            env::remove_var(constants::ENV_HOME);
        }
        init();
    }

    #[test]
    fn service_names_round_trip() {
        for service in Service::all() {
            assert_eq!(Service::from_name(service.name()), Some(service));
        }
        assert_eq!(Service::from_name("nope"), None);
    }
}
