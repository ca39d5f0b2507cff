//! Workflow worker personality: polls the daemon's task queues and drives
//! workflow executions to completion.
//!
//! The dispatcher calls [`run`] directly, never through the CLI parser; the
//! worker has no argument surface of its own, so an accidental trip through
//! the parser would reject the personality name and die before logging is up.
use std::{
    env,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use serde_json::Value;
use tonic::transport::Channel;
use tracing::{debug, info, warn};

use crate::{
    constants,
    error::StigmerError,
    paths::{self, Service},
    rpc::proto::{
        CompleteTaskRequest, ExecutionMessage, PollTaskRequest, Task,
        task_queue_service_client::TaskQueueServiceClient,
    },
};

/// Entry point of the `internal-workflow-runner` personality.
pub fn run() -> Result<(), StigmerError> {
    paths::init();
    paths::ensure_data_dir()?;

    let lock = crate::supervisor::acquire_lock(Service::WorkflowRunner, Duration::from_secs(5))?;

    let addr = env::var(constants::ENV_SERVER_ADDR)
        .unwrap_or_else(|_| format!("localhost:{}", constants::DAEMON_PORT));
    let queues: Vec<String> = env::var(constants::ENV_TASK_QUEUES)
        .unwrap_or_else(|_| constants::WORKFLOW_TASK_QUEUE.to_string())
        .split(',')
        .map(str::trim)
        .filter(|queue| !queue.is_empty())
        .map(str::to_string)
        .collect();

    let stop = Arc::new(AtomicBool::new(false));
    let stop_for_handler = Arc::clone(&stop);
    if let Err(err) = ctrlc::set_handler(move || {
        stop_for_handler.store(true, Ordering::Relaxed);
    }) {
        warn!("cannot install interrupt handler: {err}");
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(poll_loop(&addr, &queues, &stop));
    drop(lock);
    result
}

async fn poll_loop(
    addr: &str,
    queues: &[String],
    stop: &AtomicBool,
) -> Result<(), StigmerError> {
    let mut client = dial(addr, dial_budget()).await?;
    info!("workflow runner polling {queues:?} on {addr}");

    while !stop.load(Ordering::Relaxed) {
        let mut worked = false;
        for queue in queues {
            let request = PollTaskRequest {
                task_queue: queue.clone(),
            };
            match client.poll_task(request).await {
                Ok(response) => {
                    if let Some(task) = response.into_inner().task {
                        worked = true;
                        let completion = execute_task(&task);
                        if let Err(status) = client.complete_task(completion).await {
                            warn!(
                                "could not report completion for {}: {}",
                                task.execution_id,
                                status.message()
                            );
                        }
                    }
                }
                Err(status) => {
                    warn!("poll failed ({}); re-dialing {addr}", status.message());
                    client = dial(addr, dial_budget()).await?;
                }
            }
        }
        if !worked {
            tokio::time::sleep(constants::POLL_INTERVAL).await;
        }
    }

    info!("workflow runner stopping");
    Ok(())
}

fn dial_budget() -> Duration {
    env::var(constants::ENV_DIAL_BUDGET_MS)
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(Duration::from_secs(60))
}

async fn dial(
    addr: &str,
    budget: Duration,
) -> Result<TaskQueueServiceClient<Channel>, StigmerError> {
    let endpoint = if addr.contains("://") {
        addr.to_string()
    } else {
        format!("http://{addr}")
    };
    let deadline = Instant::now() + budget;
    loop {
        match tonic::transport::Endpoint::from_shared(endpoint.clone())
            .map_err(|err| StigmerError::Connection {
                endpoint: endpoint.clone(),
                reason: err.to_string(),
            })?
            .connect_timeout(constants::STATUS_DIAL_TIMEOUT)
            .connect()
            .await
        {
            Ok(channel) => return Ok(TaskQueueServiceClient::new(channel)),
            Err(err) if Instant::now() < deadline => {
                debug!("daemon not reachable yet: {err}");
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
            Err(err) => {
                return Err(StigmerError::Connection {
                    endpoint,
                    reason: err.to_string(),
                });
            }
        }
    }
}

/// Executes one workflow task. Steps come from the workflow spec's `steps`
/// array; each step contributes one message. A spec without steps echoes the
/// input so every run produces observable output.
fn execute_task(task: &Task) -> CompleteTaskRequest {
    let spec: Value = serde_json::from_str(&task.spec_json).unwrap_or(Value::Null);
    let mut messages = Vec::new();

    let steps = spec
        .get("steps")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    if steps.is_empty() {
        messages.push(message(
            &task.target_slug,
            &format!("completed with input: {}", task.input_message),
        ));
    } else {
        for (index, step) in steps.iter().enumerate() {
            let name = step
                .get("name")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| format!("step-{}", index + 1));
            let output = step
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("done");
            messages.push(message(&name, output));
        }
    }

    debug!(
        "executed workflow task {} ({} step(s))",
        task.execution_id,
        messages.len()
    );

    CompleteTaskRequest {
        execution_id: task.execution_id.clone(),
        failed: false,
        failure_reason: String::new(),
        messages,
    }
}

fn message(role: &str, text: &str) -> ExecutionMessage {
    ExecutionMessage {
        role: role.to_string(),
        text: text.to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(spec: &str, input: &str) -> Task {
        Task {
            execution_id: "exe-test".into(),
            org: "local".into(),
            target_kind: "workflow".into(),
            target_slug: "pipeline".into(),
            input_message: input.into(),
            spec_json: spec.into(),
            env: Default::default(),
        }
    }

    #[test]
    fn spec_steps_become_messages_in_order() {
        let spec = r#"{"steps": [
            {"name": "fetch", "message": "fetched"},
            {"name": "review", "message": "reviewed"}
        ]}"#;
        let completion = execute_task(&task(spec, "go"));
        assert!(!completion.failed);
        assert_eq!(completion.messages.len(), 2);
        assert_eq!(completion.messages[0].role, "fetch");
        assert_eq!(completion.messages[0].text, "fetched");
        assert_eq!(completion.messages[1].role, "review");
    }

    #[test]
    fn stepless_spec_echoes_the_input() {
        let completion = execute_task(&task("{}", "hello"));
        assert_eq!(completion.messages.len(), 1);
        assert!(completion.messages[0].text.contains("hello"));
    }

    #[test]
    fn unnamed_steps_get_positional_roles() {
        let spec = r#"{"steps": [{"message": "x"}]}"#;
        let completion = execute_task(&task(spec, ""));
        assert_eq!(completion.messages[0].role, "step-1");
    }

    #[test]
    fn malformed_spec_still_completes() {
        let completion = execute_task(&task("not json", "in"));
        assert!(!completion.failed);
        assert_eq!(completion.messages.len(), 1);
    }
}
