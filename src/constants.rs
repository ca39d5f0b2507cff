//! Constants shared across the stigmer control plane.
//!
//! Centralizes ports, reserved personality names, on-disk file names and the
//! timing values used by the supervisor, detector and log follower.

use std::time::Duration;

// ============================================================================
// Tool personalities
// ============================================================================

/// Reserved `argv[1]` value that dispatches to the backend daemon personality.
///
/// The supervisor spawns children by these names; they must never change
/// without a coordinated change to the spawn path.
pub const INTERNAL_SERVER: &str = "internal-server";

/// Reserved `argv[1]` value that dispatches to the workflow worker personality.
pub const INTERNAL_WORKFLOW_RUNNER: &str = "internal-workflow-runner";

// ============================================================================
// Network
// ============================================================================

/// Fixed port the local daemon listens on.
pub const DAEMON_PORT: u16 = 7464;

/// Organization identifier used for all resources against a local backend.
pub const LOCAL_ORG: &str = "local";

/// Task queue polled by the workflow runner.
pub const WORKFLOW_TASK_QUEUE: &str = "stigmer-workflows";

/// Task queue polled by the containerized agent runner.
pub const AGENT_TASK_QUEUE: &str = "stigmer-agents";

/// Port of the workflow orchestration plane advertised to containers.
pub const TEMPORAL_PORT: u16 = 7233;

// ============================================================================
// Environment variables
// ============================================================================

/// Overrides the data directory (primarily a test hook).
pub const ENV_HOME: &str = "STIGMER_HOME";

/// Overrides the local backend endpoint (used by tests).
pub const ENV_SERVER_ADDR: &str = "STIGMER_SERVER_ADDR";

/// Overrides the binary the supervisor spawns for internal personalities.
pub const ENV_BIN: &str = "STIGMER_BIN";

/// Listen port handed to the daemon personality.
pub const ENV_PORT: &str = "STIGMER_PORT";

/// Backend endpoint handed to the containerized agent runner.
pub const ENV_BACKEND_URL: &str = "STIGMER_BACKEND_URL";

/// Workflow orchestrator address handed to runner personalities.
pub const ENV_TEMPORAL_ADDR: &str = "TEMPORAL_SERVICE_ADDRESS";

/// Comma-separated task queue names handed to the workflow runner.
pub const ENV_TASK_QUEUES: &str = "STIGMER_TASK_QUEUES";

/// Execution-mode cascade variables.
pub const ENV_EXECUTION_MODE: &str = "STIGMER_EXECUTION_MODE";
pub const ENV_SANDBOX_IMAGE: &str = "STIGMER_SANDBOX_IMAGE";
pub const ENV_SANDBOX_AUTO_PULL: &str = "STIGMER_SANDBOX_AUTO_PULL";
pub const ENV_SANDBOX_CLEANUP: &str = "STIGMER_SANDBOX_CLEANUP";
pub const ENV_SANDBOX_TTL: &str = "STIGMER_SANDBOX_TTL";

/// Target organization injected into user deployment programs.
pub const ENV_ORG: &str = "STIGMER_ORG";

/// Serialization mode injected into user deployment programs.
pub const ENV_MANIFEST_MODE: &str = "STIGMER_MANIFEST_MODE";

/// Bounds the dial/retry budget of internal personalities (test hook).
pub const ENV_DIAL_BUDGET_MS: &str = "STIGMER_DIAL_BUDGET_MS";

// ============================================================================
// Timing
// ============================================================================

/// Deadline for dials issued by commands that may have just started a server.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for dials issued by status checks and liveness probes.
pub const STATUS_DIAL_TIMEOUT: Duration = Duration::from_secs(2);

/// Bounded wait for a service lockfile before giving up.
pub const LOCK_WAIT: Duration = Duration::from_secs(30);

/// Retry interval while waiting for a contended lockfile.
pub const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Grace period between SIGTERM and SIGKILL when stopping a process group.
pub const STOP_GRACE: Duration = Duration::from_secs(5);

/// Poll interval used while waiting for process exit or execution phases.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Retry interval for log followers after EOF, rotation or container churn.
pub const FOLLOW_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Bounded wait for the daemon to accept connections after spawn.
pub const STARTUP_PROBE_BUDGET: Duration = Duration::from_secs(10);

/// Interval of the daemon's internal wiring health monitor.
pub const HEALTH_MONITOR_INTERVAL: Duration = Duration::from_secs(30);

/// Consecutive PENDING polls before the execution driver hints at a stuck
/// workflow-creation plane.
pub const STUCK_PENDING_POLLS: u32 = 20;

// ============================================================================
// Log management
// ============================================================================

/// Archived log files older than this are deleted during rotation.
pub const LOG_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Timestamp suffix appended to rotated log files (UTC).
pub const ROTATION_STAMP_FORMAT: &str = "%Y-%m-%d-%H%M%S";

/// Capacity of the bounded channel feeding the merged log printer. Producers
/// block when full; lines are never dropped.
pub const LOG_CHANNEL_CAPACITY: usize = 100;

/// Width of the `[component]` label prefixed to merged log lines.
pub const LOG_LABEL_WIDTH: usize = 15;

// ============================================================================
// Containers
// ============================================================================

/// Name given to the agent-runner container so orphans can be found by name.
pub const AGENT_RUNNER_CONTAINER: &str = "stigmer-agent-runner";

/// Default sandbox image for the agent runner.
pub const DEFAULT_SANDBOX_IMAGE: &str = "stigmer/agent-runner:latest";

/// Mount point of the host workspace inside the agent-runner container.
pub const CONTAINER_WORKSPACE: &str = "/workspace";

// ============================================================================
// Projects and manifests
// ============================================================================

/// Project manifest file that marks a directory as a stigmer project.
pub const PROJECT_MANIFEST: &str = "Stigmer.yaml";

/// User config file name inside the data directory.
pub const CONFIG_FILE: &str = "config.yaml";

/// Pointer printed when a deployment program produced no resources.
pub const SDK_QUICKSTART: &str = "https://docs.stigmer.dev/sdk/quickstart";
