//! Execution driver: create agent/workflow executions, resolve targets by
//! slug, poll to completion and surface diagnostics.
use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use tracing::{debug, warn};

use crate::{
    constants,
    error::{StigmerError, UpstreamError},
    gateway::{Backend, block_on},
    manifest::ResourceKind,
    rpc::{
        self, is_terminal, phase_name,
        proto::{
            CreateExecutionRequest, Execution, ExecutionPhase, GetByReferenceRequest,
            GetExecutionRequest, Resource,
        },
    },
};

/// A resolved run target.
#[derive(Debug, Clone)]
pub struct Target {
    /// Whether the target is a workflow or an agent.
    pub kind: ResourceKind,
    /// The stored resource.
    pub resource: Resource,
}

/// Resolves a reference to a workflow first, then an agent. A reference may
/// be a slug or a server-issued id; the backend resolves either shape.
/// When both kinds share a slug the workflow wins.
pub fn resolve_target(backend: &Backend, reference: &str) -> Result<Target, StigmerError> {
    let workflow = lookup(backend, ResourceKind::Workflow, reference)?;
    let agent = lookup(backend, ResourceKind::Agent, reference)?;

    match pick_target(workflow, agent) {
        Some(target) => Ok(target),
        None => Err(UpstreamError::NotFound(format!(
            "'{reference}' matches neither a workflow nor an agent in org '{}'",
            backend.org
        ))
        .into()),
    }
}

/// Workflow-first tiebreak, kept separate so the policy is testable.
fn pick_target(workflow: Option<Resource>, agent: Option<Resource>) -> Option<Target> {
    if let Some(resource) = workflow {
        return Some(Target {
            kind: ResourceKind::Workflow,
            resource,
        });
    }
    agent.map(|resource| Target {
        kind: ResourceKind::Agent,
        resource,
    })
}

fn lookup(
    backend: &Backend,
    kind: ResourceKind,
    reference: &str,
) -> Result<Option<Resource>, StigmerError> {
    let request = GetByReferenceRequest {
        reference: Some(rpc::reference(&backend.org, kind.as_str(), reference)),
    };

    let response = block_on(async {
        match kind {
            ResourceKind::Workflow => backend.workflows().get_workflow(request).await,
            ResourceKind::Agent => backend.agents().get_agent(request).await,
            ResourceKind::Skill => backend.skills().get_skill(request).await,
        }
    })?;

    match response {
        Ok(found) => Ok(found.into_inner().resource),
        Err(status) if status.code() == tonic::Code::NotFound => Ok(None),
        Err(status) => Err(status.into()),
    }
}

/// Creates an execution for the target and returns its id.
pub fn create_execution(
    backend: &Backend,
    target: &Target,
    message: Option<&str>,
    env: HashMap<String, String>,
) -> Result<String, StigmerError> {
    let request = CreateExecutionRequest {
        target: Some(rpc::reference(
            &backend.org,
            target.kind.as_str(),
            &target.resource.slug,
        )),
        input_message: message.unwrap_or_default().to_string(),
        env,
    };

    let response = block_on(async {
        match target.kind {
            ResourceKind::Workflow => {
                backend
                    .workflows()
                    .create_workflow_execution(request)
                    .await
            }
            _ => backend.agents().create_agent_execution(request).await,
        }
    })??;

    Ok(response.into_inner().execution_id)
}

/// Fetches the current state of an execution.
pub fn get_execution(
    backend: &Backend,
    kind: ResourceKind,
    execution_id: &str,
) -> Result<Execution, StigmerError> {
    let request = GetExecutionRequest {
        execution_id: execution_id.to_string(),
    };
    let response = block_on(async {
        match kind {
            ResourceKind::Workflow => backend.workflows().get_workflow_execution(request).await,
            _ => backend.agents().get_agent_execution(request).await,
        }
    })??;

    response
        .into_inner()
        .execution
        .ok_or_else(|| UpstreamError::NotFound(format!("execution '{execution_id}'")).into())
}

/// Polls an execution until it reaches a terminal phase or the timeout
/// elapses. Timeout errors carry the last observed phase, which is the main
/// clue for stuck-in-PENDING diagnosis.
pub fn wait(
    backend: &Backend,
    kind: ResourceKind,
    execution_id: &str,
    timeout: Duration,
    stop: &AtomicBool,
) -> Result<Execution, StigmerError> {
    let started = Instant::now();
    let mut pending_polls = 0u32;
    let mut last_phase = ExecutionPhase::Unspecified;

    loop {
        if stop.load(Ordering::Relaxed) {
            return Err(StigmerError::Timeout {
                operation: format!("waiting for execution {execution_id}"),
                seconds: started.elapsed().as_secs(),
                last_state: format!("{} (interrupted)", phase_name(last_phase)),
            });
        }

        let execution = get_execution(backend, kind, execution_id)?;
        last_phase = execution.phase();
        if is_terminal(last_phase) {
            return Ok(execution);
        }

        if last_phase == ExecutionPhase::Pending {
            pending_polls += 1;
            if pending_polls == constants::STUCK_PENDING_POLLS {
                warn!(
                    "execution {} has been PENDING for {} polls; the daemon's \
                     workflow plane may be down — check `stigmer server status`",
                    execution_id, pending_polls
                );
            }
        } else {
            pending_polls = 0;
        }

        if started.elapsed() >= timeout {
            return Err(StigmerError::Timeout {
                operation: format!("waiting for execution {execution_id}"),
                seconds: timeout.as_secs(),
                last_state: phase_name(last_phase).to_string(),
            });
        }

        debug!("execution {} is {}", execution_id, phase_name(last_phase));
        thread::sleep(constants::POLL_INTERVAL);
    }
}

/// Follows an execution, printing messages as they appear until the run
/// reaches a terminal phase or the stop flag is set.
pub fn stream_messages(
    backend: &Backend,
    kind: ResourceKind,
    execution_id: &str,
    stop: Arc<AtomicBool>,
) -> Result<Execution, StigmerError> {
    let mut printed = 0usize;

    loop {
        let execution = get_execution(backend, kind, execution_id)?;
        for message in execution.messages.iter().skip(printed) {
            println!("[{}] {}", message.role, message.text);
        }
        printed = execution.messages.len();

        if is_terminal(execution.phase()) {
            return Ok(execution);
        }
        if stop.load(Ordering::Relaxed) {
            return Ok(execution);
        }
        thread::sleep(constants::POLL_INTERVAL);
    }
}
