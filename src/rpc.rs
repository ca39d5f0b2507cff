//! gRPC contract shared by the CLI, daemon and runner personalities.

/// Generated protobuf/tonic bindings for `stigmer.v1`.
pub mod proto {
    tonic::include_proto!("stigmer.v1");
}

use proto::{ExecutionPhase, ResourceRef};

/// Scope constant for organization-scoped references.
pub const SCOPE_ORGANIZATION: &str = "organization";

/// Builds an organization-scoped resource reference.
pub fn reference(org: &str, kind: &str, slug: &str) -> ResourceRef {
    ResourceRef {
        scope: SCOPE_ORGANIZATION.to_string(),
        org: org.to_string(),
        kind: kind.to_string(),
        slug: slug.to_string(),
    }
}

/// Terminal execution phases.
pub fn is_terminal(phase: ExecutionPhase) -> bool {
    matches!(
        phase,
        ExecutionPhase::Completed | ExecutionPhase::Failed | ExecutionPhase::Canceled
    )
}

/// User-facing phase name.
pub fn phase_name(phase: ExecutionPhase) -> &'static str {
    match phase {
        ExecutionPhase::Unspecified => "UNKNOWN",
        ExecutionPhase::Pending => "PENDING",
        ExecutionPhase::Running => "RUNNING",
        ExecutionPhase::Completed => "COMPLETED",
        ExecutionPhase::Failed => "FAILED",
        ExecutionPhase::Canceled => "CANCELED",
    }
}
