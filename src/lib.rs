//! Local control plane for the Stigmer workflow/agent runtime.
//!
//! One binary, three personalities: the user-facing CLI, the backend daemon
//! (`internal-server`) and the workflow worker (`internal-workflow-runner`).
//! Internal personalities are spawned by the supervisor from the same
//! on-disk binary, so the fleet is always version-coherent.

/// CLI parsing.
pub mod cli;

/// Config loading and the resolution cascade.
pub mod config;

/// Constants.
pub mod constants;

/// Container runtime calls and host-address rewriting.
pub mod container;

/// Deploy pipeline.
pub mod deploy;

/// Process liveness detection.
pub mod detect;

/// Errors.
pub mod error;

/// Execution driver.
pub mod exec;

/// Backend gateway.
pub mod gateway;

/// Manifest harvester.
pub mod harvest;

/// Log multiplexer.
pub mod logs;

/// Manifest data model.
pub mod manifest;

/// Data directory layout.
pub mod paths;

/// Project manifests and scaffolding.
pub mod project;

/// gRPC contract.
pub mod rpc;

/// Backend daemon personality.
pub mod server;

/// Process supervisor.
pub mod supervisor;

/// Workflow worker personality.
pub mod worker;

/// Test utils.
#[doc(hidden)]
pub mod test_utils;
