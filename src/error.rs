//! Error handling for the stigmer CLI.
use std::io;

use thiserror::Error;

/// Top-level error surfaced by CLI commands. `main` prints these with an
/// `Error:` prefix and exits 1.
#[derive(Debug, Error)]
pub enum StigmerError {
    /// Invalid configuration file or unrecognized key.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Another process holds a service lockfile.
    #[error("lock for '{service}' is held by another process{}", holder_suffix(.pid))]
    LockContention {
        /// Service whose lockfile was contended.
        service: String,
        /// PID of the competing holder, when resolvable.
        pid: Option<u32>,
    },

    /// A child service failed to start.
    #[error("failed to start '{service}': {source}{}", stderr_suffix(.stderr))]
    Spawn {
        /// Service that failed to spawn.
        service: String,
        /// Captured stderr of the child, if any was produced.
        stderr: String,
        /// The underlying spawn error.
        #[source]
        source: io::Error,
    },

    /// A required external dependency is absent.
    #[error("{what} is not available. {remedy}")]
    PrerequisiteMissing {
        /// Human-readable name of the missing prerequisite.
        what: String,
        /// Remediation instructions, including install commands when known.
        remedy: String,
    },

    /// gRPC dial timed out or was refused.
    #[error("could not connect to backend at {endpoint}: {reason}. Is the server running? Try `stigmer server start`")]
    Connection {
        /// The resolved endpoint that was dialed.
        endpoint: String,
        /// The transport-level failure.
        reason: String,
    },

    /// The user deployment program failed or produced an unusable manifest.
    #[error(transparent)]
    Manifest(#[from] ManifestError),

    /// The backend returned an RPC error.
    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    /// An operation exceeded its deadline.
    #[error("{operation} timed out after {seconds}s (last observed state: {last_state})")]
    Timeout {
        /// Operation that timed out.
        operation: String,
        /// Deadline that elapsed, in seconds.
        seconds: u64,
        /// Last state observed before the deadline, for diagnosing stalls.
        last_state: String,
    },

    /// Filesystem or process-level I/O failure.
    #[error(transparent)]
    Io(#[from] io::Error),
}

fn holder_suffix(pid: &Option<u32>) -> String {
    match pid {
        Some(pid) => format!(" (pid {pid})"),
        None => String::new(),
    }
}

fn stderr_suffix(stderr: &str) -> String {
    if stderr.trim().is_empty() {
        String::new()
    } else {
        format!("\n{}", stderr.trim_end())
    }
}

/// Errors loading, parsing or editing the config file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading the config file.
    #[error("failed to read config file {path}: {source}")]
    Read {
        /// Path of the offending file.
        path: String,
        /// The underlying I/O failure.
        #[source]
        source: io::Error,
    },

    /// Invalid YAML in the config file.
    #[error("invalid config file {path}: {source}")]
    Parse {
        /// Path of the offending file.
        path: String,
        /// The underlying YAML failure.
        #[source]
        source: serde_yaml::Error,
    },

    /// `config get`/`config set` addressed a key that does not exist.
    #[error("unrecognized config key '{key}'")]
    UnknownKey {
        /// The dotted key the user supplied.
        key: String,
    },

    /// `config set` received a value the key cannot hold.
    #[error("invalid value '{value}' for config key '{key}': {reason}")]
    InvalidValue {
        /// The dotted key the user supplied.
        key: String,
        /// The rejected value.
        value: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// Error writing the config file back to disk.
    #[error("failed to write config file {path}: {source}")]
    Write {
        /// Path of the offending file.
        path: String,
        /// The underlying I/O failure.
        #[source]
        source: io::Error,
    },
}

/// Errors from the manifest harvester.
#[derive(Debug, Error)]
pub enum ManifestError {
    /// The project directory has no project manifest.
    #[error("no {0} found in {1}; run `stigmer new <name>` to scaffold a project")]
    NotAProject(&'static str, String),

    /// The project manifest is unreadable or malformed.
    #[error("invalid project manifest {path}: {reason}")]
    InvalidProject {
        /// Path of the project manifest.
        path: String,
        /// Why it could not be used.
        reason: String,
    },

    /// The project declares a runtime the harvester cannot execute.
    #[error("unsupported project runtime '{0}' (supported: go)")]
    UnsupportedRuntime(String),

    /// The user program exited non-zero. Its stderr is passed through
    /// verbatim; the toolchain's diagnostics beat anything we could write.
    #[error("deployment program exited with {status}:\n{stderr}")]
    ProgramFailed {
        /// Exit status description of the subprocess.
        status: String,
        /// The subprocess's stderr, verbatim.
        stderr: String,
    },

    /// The program's stdout was not a valid manifest payload.
    #[error("deployment program produced an invalid manifest: {0}")]
    Invalid(#[from] serde_json::Error),

    /// The program ran but declared no resources.
    #[error("deployment program produced no resources; see {0} to define your first agent")]
    Empty(&'static str),
}

/// Errors propagated from backend RPCs, keyed by status code.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The referenced resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The request was malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The backend is not in a state to accept the request.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// The backend failed internally.
    #[error("backend error: {0}")]
    Internal(String),

    /// Any other status code.
    #[error("backend returned {code:?}: {message}")]
    Other {
        /// The raw gRPC status code.
        code: tonic::Code,
        /// The status message.
        message: String,
    },
}

impl From<tonic::Status> for UpstreamError {
    fn from(status: tonic::Status) -> Self {
        let message = status.message().to_string();
        match status.code() {
            tonic::Code::NotFound => UpstreamError::NotFound(message),
            tonic::Code::InvalidArgument => UpstreamError::InvalidArgument(message),
            tonic::Code::FailedPrecondition => UpstreamError::FailedPrecondition(message),
            tonic::Code::Internal => UpstreamError::Internal(message),
            code => UpstreamError::Other { code, message },
        }
    }
}

impl From<tonic::Status> for StigmerError {
    fn from(status: tonic::Status) -> Self {
        StigmerError::Upstream(status.into())
    }
}
