//! Backend daemon personality: the gRPC server the CLI and the runner
//! personalities talk to.
//!
//! Startup follows a strict order: every controller is registered on the
//! gRPC server before it begins serving, then in-process client handles are
//! created against the loopback endpoint and injected into the controllers
//! through setter operations. Controllers that need the task-queue client
//! cannot receive it earlier because the client cannot exist until the
//! server is serving; registering anything after serve is forbidden.
use std::{
    collections::{HashMap, VecDeque},
    env, fs,
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, Mutex, RwLock},
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use tonic::{Request, Response, Status, transport::Channel};
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::{
    constants,
    error::StigmerError,
    paths::{self, Service},
    rpc::proto::{
        self, CompleteTaskRequest, CompleteTaskResponse, CreateExecutionRequest,
        CreateExecutionResponse, EnqueueTaskRequest, EnqueueTaskResponse, Execution,
        ExecutionMessage, ExecutionPhase, GetByReferenceRequest, GetByReferenceResponse,
        GetExecutionRequest, GetExecutionResponse, PingRequest, PingResponse,
        PollTaskRequest, PollTaskResponse, Resource, Task, UpsertOutcome, UpsertRequest,
        UpsertResponse,
        agent_service_server::{AgentService, AgentServiceServer},
        skill_service_server::{SkillService, SkillServiceServer},
        task_queue_service_client::TaskQueueServiceClient,
        task_queue_service_server::{TaskQueueService, TaskQueueServiceServer},
        workflow_service_server::{WorkflowService, WorkflowServiceServer},
    },
};

/// Entry point of the `internal-server` personality.
pub fn run() -> Result<(), StigmerError> {
    paths::init();
    paths::ensure_data_dir()?;

    // The lock is held for the life of this process; it is the authoritative
    // liveness signal the detector's tier-1 probe checks.
    let lock = crate::supervisor::acquire_lock(Service::Daemon, Duration::from_secs(5))?;

    let port = env::var(constants::ENV_PORT)
        .ok()
        .and_then(|raw| raw.parse::<u16>().ok())
        .unwrap_or(constants::DAEMON_PORT);

    let store = Arc::new(Store::load(paths::db_dir().join("store.json"))?);
    let queues = Arc::new(TaskQueues::default());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(serve(port, store, queues));
    drop(lock);
    result
}

async fn serve(
    port: u16,
    store: Arc<Store>,
    queues: Arc<TaskQueues>,
) -> Result<(), StigmerError> {
    let addr: SocketAddr = format!("0.0.0.0:{port}")
        .parse()
        .map_err(|err| StigmerError::Connection {
            endpoint: format!("0.0.0.0:{port}"),
            reason: format!("invalid listen address: {err}"),
        })?;

    // Phase 1: instantiate controllers with unset client dependencies and
    // register them all.
    let agent_controller = Arc::new(AgentController {
        store: Arc::clone(&store),
        queue_client: QueueClientSlot::default(),
    });
    let workflow_controller = Arc::new(WorkflowController {
        store: Arc::clone(&store),
        queue_client: QueueClientSlot::default(),
    });
    let skill_controller = SkillController {
        store: Arc::clone(&store),
    };
    let queue_controller = TaskQueueController {
        store: Arc::clone(&store),
        queues: Arc::clone(&queues),
    };

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = tonic::transport::Server::builder()
        .add_service(AgentServiceServer::from_arc(Arc::clone(&agent_controller)))
        .add_service(WorkflowServiceServer::from_arc(Arc::clone(
            &workflow_controller,
        )))
        .add_service(SkillServiceServer::new(skill_controller))
        .add_service(TaskQueueServiceServer::new(queue_controller))
        .serve_with_shutdown(addr, async {
            let _ = shutdown_rx.await;
        });

    // Phase 2: begin serving.
    let serve_task = tokio::spawn(server);
    info!("daemon serving on {addr}");

    // Phase 3: create the in-process client and inject it via setters.
    let client = connect_loopback(port, constants::STARTUP_PROBE_BUDGET).await?;
    agent_controller.set_queue_client(client.clone());
    workflow_controller.set_queue_client(client);
    info!("task queue client wired into controllers");

    // The outbound wiring is not assumed immutable after boot: a health
    // monitor re-dials and re-injects when the connection goes bad.
    let monitor_agent = Arc::clone(&agent_controller);
    let monitor_workflow = Arc::clone(&workflow_controller);
    let monitor = tokio::spawn(async move {
        health_monitor(port, monitor_agent, monitor_workflow).await;
    });

    wait_for_shutdown_signal().await;
    info!("daemon shutting down");
    monitor.abort();
    let _ = shutdown_tx.send(());
    match serve_task.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(StigmerError::Connection {
            endpoint: addr.to_string(),
            reason: err.to_string(),
        }),
        Err(join_err) => Err(StigmerError::Connection {
            endpoint: addr.to_string(),
            reason: join_err.to_string(),
        }),
    }
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(err) => {
                error!("cannot install SIGTERM handler: {err}");
                std::future::pending::<()>().await;
                return;
            }
        };
        tokio::select! {
            _ = term.recv() => {}
            _ = tokio::signal::ctrl_c() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn connect_loopback(
    port: u16,
    budget: Duration,
) -> Result<TaskQueueServiceClient<Channel>, StigmerError> {
    let endpoint = format!("http://127.0.0.1:{port}");
    let deadline = Instant::now() + budget;
    loop {
        match tonic::transport::Endpoint::from_shared(endpoint.clone())
            .map_err(|err| StigmerError::Connection {
                endpoint: endpoint.clone(),
                reason: err.to_string(),
            })?
            .connect_timeout(Duration::from_secs(2))
            .connect()
            .await
        {
            Ok(channel) => return Ok(TaskQueueServiceClient::new(channel)),
            Err(err) if Instant::now() < deadline => {
                debug!("loopback dial not ready yet: {err}");
                tokio::time::sleep(Duration::from_millis(100)).await;
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

async fn health_monitor(
    port: u16,
    agents: Arc<AgentController>,
    workflows: Arc<WorkflowController>,
) {
    let mut interval = tokio::time::interval(constants::HEALTH_MONITOR_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let healthy = match agents.queue_client.get() {
            Some(mut client) => client.ping(PingRequest {}).await.is_ok(),
            None => false,
        };
        if healthy {
            continue;
        }
        warn!("task queue wiring unhealthy; reconnecting");
        match connect_loopback(port, Duration::from_secs(5)).await {
            Ok(client) => {
                agents.set_queue_client(client.clone());
                workflows.set_queue_client(client);
                info!("task queue wiring restored");
            }
            Err(err) => error!("task queue reconnect failed: {err}"),
        }
    }
}

/// Injectable slot for the in-process task-queue client.
#[derive(Default)]
struct QueueClientSlot {
    client: RwLock<Option<TaskQueueServiceClient<Channel>>>,
}

impl QueueClientSlot {
    fn set(&self, client: TaskQueueServiceClient<Channel>) {
        let mut guard = self.client.write().unwrap_or_else(|p| p.into_inner());
        *guard = Some(client);
    }

    fn get(&self) -> Option<TaskQueueServiceClient<Channel>> {
        self.client
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

/// In-memory task queues, keyed by queue name.
#[derive(Default)]
struct TaskQueues {
    queues: Mutex<HashMap<String, VecDeque<Task>>>,
}

impl TaskQueues {
    fn push(&self, queue: &str, task: Task) {
        let mut guard = self.queues.lock().unwrap_or_else(|p| p.into_inner());
        guard.entry(queue.to_string()).or_default().push_back(task);
    }

    fn pop(&self, queue: &str) -> Option<Task> {
        let mut guard = self.queues.lock().unwrap_or_else(|p| p.into_inner());
        guard.get_mut(queue).and_then(VecDeque::pop_front)
    }
}

// ----------------------------------------------------------------------------
// Store
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredResource {
    id: String,
    org: String,
    kind: String,
    slug: String,
    display_name: String,
    spec_json: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredExecution {
    id: String,
    org: String,
    target_kind: String,
    target_slug: String,
    phase: String,
    input_message: String,
    messages: Vec<StoredMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredMessage {
    role: String,
    text: String,
    timestamp: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreState {
    resources: Vec<StoredResource>,
    executions: Vec<StoredExecution>,
}

/// JSON-file-backed resource and execution store. Every mutation persists
/// synchronously; the daemon is the store's only writer.
struct Store {
    path: PathBuf,
    state: Mutex<StoreState>,
}

impl Store {
    fn load(path: PathBuf) -> Result<Store, StigmerError> {
        let state = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            serde_json::from_str(&raw).unwrap_or_else(|err| {
                warn!("store file {} unreadable ({err}); starting empty", path.display());
                StoreState::default()
            })
        } else {
            StoreState::default()
        };
        Ok(Store {
            path,
            state: Mutex::new(state),
        })
    }

    fn persist(&self, state: &StoreState) {
        match serde_json::to_vec_pretty(state) {
            Ok(raw) => {
                if let Err(err) = fs::write(&self.path, raw) {
                    error!("cannot persist store to {}: {err}", self.path.display());
                }
            }
            Err(err) => error!("cannot serialize store: {err}"),
        }
    }

    fn upsert(&self, kind: &str, request: &UpsertRequest) -> (String, UpsertOutcome) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let existing = state.resources.iter_mut().find(|resource| {
            resource.org == request.org && resource.kind == kind && resource.slug == request.slug
        });

        match existing {
            Some(resource) => {
                if resource.spec_json == request.spec_json
                    && resource.display_name == request.display_name
                {
                    return (resource.id.clone(), UpsertOutcome::Unchanged);
                }
                resource.spec_json = request.spec_json.clone();
                resource.display_name = request.display_name.clone();
                let id = resource.id.clone();
                self.persist(&state);
                (id, UpsertOutcome::Updated)
            }
            None => {
                let id = if request.id.is_empty() {
                    format!("{kind}-{}", Ulid::new().to_string().to_lowercase())
                } else {
                    request.id.clone()
                };
                state.resources.push(StoredResource {
                    id: id.clone(),
                    org: request.org.clone(),
                    kind: kind.to_string(),
                    slug: request.slug.clone(),
                    display_name: request.display_name.clone(),
                    spec_json: request.spec_json.clone(),
                });
                self.persist(&state);
                (id, UpsertOutcome::Created)
            }
        }
    }

    /// Resolves by slug, or by id when the reference is id-shaped.
    fn get(&self, kind: &str, org: &str, reference: &str) -> Option<Resource> {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state
            .resources
            .iter()
            .find(|resource| {
                resource.kind == kind
                    && resource.org == org
                    && (resource.slug == reference || resource.id == reference)
            })
            .map(|resource| Resource {
                id: resource.id.clone(),
                org: resource.org.clone(),
                kind: resource.kind.clone(),
                slug: resource.slug.clone(),
                display_name: resource.display_name.clone(),
                spec_json: resource.spec_json.clone(),
            })
    }

    fn create_execution(
        &self,
        org: &str,
        target_kind: &str,
        target_slug: &str,
        input_message: &str,
    ) -> String {
        let id = format!("exe-{}", Ulid::new().to_string().to_lowercase());
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.executions.push(StoredExecution {
            id: id.clone(),
            org: org.to_string(),
            target_kind: target_kind.to_string(),
            target_slug: target_slug.to_string(),
            phase: "PENDING".to_string(),
            input_message: input_message.to_string(),
            messages: Vec::new(),
        });
        self.persist(&state);
        id
    }

    fn set_phase(&self, execution_id: &str, phase: &str) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let Some(execution) = state
            .executions
            .iter_mut()
            .find(|execution| execution.id == execution_id)
        else {
            return false;
        };
        execution.phase = phase.to_string();
        self.persist(&state);
        true
    }

    fn complete_execution(
        &self,
        execution_id: &str,
        failed: bool,
        failure_reason: &str,
        messages: &[ExecutionMessage],
    ) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        let Some(execution) = state
            .executions
            .iter_mut()
            .find(|execution| execution.id == execution_id)
        else {
            return false;
        };
        execution.phase = if failed { "FAILED" } else { "COMPLETED" }.to_string();
        for message in messages {
            execution.messages.push(StoredMessage {
                role: message.role.clone(),
                text: message.text.clone(),
                timestamp: message.timestamp.clone(),
            });
        }
        if failed && !failure_reason.is_empty() {
            execution.messages.push(StoredMessage {
                role: "system".to_string(),
                text: failure_reason.to_string(),
                timestamp: chrono::Utc::now().to_rfc3339(),
            });
        }
        self.persist(&state);
        true
    }

    fn execution(&self, execution_id: &str) -> Option<Execution> {
        let state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state
            .executions
            .iter()
            .find(|execution| execution.id == execution_id)
            .map(|execution| Execution {
                id: execution.id.clone(),
                target: Some(crate::rpc::reference(
                    &execution.org,
                    &execution.target_kind,
                    &execution.target_slug,
                )),
                phase: phase_from_name(&execution.phase) as i32,
                messages: execution
                    .messages
                    .iter()
                    .map(|message| ExecutionMessage {
                        role: message.role.clone(),
                        text: message.text.clone(),
                        timestamp: message.timestamp.clone(),
                    })
                    .collect(),
            })
    }
}

fn phase_from_name(name: &str) -> ExecutionPhase {
    match name {
        "PENDING" => ExecutionPhase::Pending,
        "RUNNING" => ExecutionPhase::Running,
        "COMPLETED" => ExecutionPhase::Completed,
        "FAILED" => ExecutionPhase::Failed,
        "CANCELED" => ExecutionPhase::Canceled,
        _ => ExecutionPhase::Unspecified,
    }
}

// ----------------------------------------------------------------------------
// Controllers
// ----------------------------------------------------------------------------

struct AgentController {
    store: Arc<Store>,
    queue_client: QueueClientSlot,
}

impl AgentController {
    fn set_queue_client(&self, client: TaskQueueServiceClient<Channel>) {
        self.queue_client.set(client);
    }
}

struct WorkflowController {
    store: Arc<Store>,
    queue_client: QueueClientSlot,
}

impl WorkflowController {
    fn set_queue_client(&self, client: TaskQueueServiceClient<Channel>) {
        self.queue_client.set(client);
    }
}

struct SkillController {
    store: Arc<Store>,
}

struct TaskQueueController {
    store: Arc<Store>,
    queues: Arc<TaskQueues>,
}

fn validate_reference(
    request: &GetByReferenceRequest,
) -> Result<&proto::ResourceRef, Status> {
    request
        .reference
        .as_ref()
        .ok_or_else(|| Status::invalid_argument("reference is required"))
}

/// Creates an execution and enqueues its task. Returns FAILED_PRECONDITION
/// when the queue client is not wired: accepting work that cannot reach the
/// execution plane would be a silent drop.
async fn create_and_enqueue(
    store: &Store,
    queue_client: &QueueClientSlot,
    queue_name: &str,
    kind: &str,
    request: CreateExecutionRequest,
) -> Result<Response<CreateExecutionResponse>, Status> {
    let target = request
        .target
        .as_ref()
        .ok_or_else(|| Status::invalid_argument("target is required"))?;

    let resource = store
        .get(kind, &target.org, &target.slug)
        .ok_or_else(|| {
            Status::not_found(format!("{kind} '{}' in org '{}'", target.slug, target.org))
        })?;

    let Some(mut client) = queue_client.get() else {
        return Err(Status::failed_precondition(
            "execution plane is not connected; retry shortly or restart the server",
        ));
    };

    let execution_id =
        store.create_execution(&target.org, kind, &resource.slug, &request.input_message);

    let enqueue = EnqueueTaskRequest {
        task_queue: queue_name.to_string(),
        task: Some(Task {
            execution_id: execution_id.clone(),
            org: target.org.clone(),
            target_kind: kind.to_string(),
            target_slug: resource.slug.clone(),
            input_message: request.input_message.clone(),
            spec_json: resource.spec_json.clone(),
            env: request.env.clone(),
        }),
    };
    if let Err(status) = client.enqueue_task(enqueue).await {
        store.set_phase(&execution_id, "FAILED");
        return Err(Status::failed_precondition(format!(
            "could not enqueue execution task: {}",
            status.message()
        )));
    }

    Ok(Response::new(CreateExecutionResponse { execution_id }))
}

fn get_execution_response(
    store: &Store,
    request: &GetExecutionRequest,
) -> Result<Response<GetExecutionResponse>, Status> {
    match store.execution(&request.execution_id) {
        Some(execution) => Ok(Response::new(GetExecutionResponse {
            execution: Some(execution),
        })),
        None => Err(Status::not_found(format!(
            "execution '{}'",
            request.execution_id
        ))),
    }
}

#[tonic::async_trait]
impl AgentService for AgentController {
    async fn upsert_agent(
        &self,
        request: Request<UpsertRequest>,
    ) -> Result<Response<UpsertResponse>, Status> {
        let request = request.into_inner();
        let (id, outcome) = self.store.upsert("agent", &request);
        Ok(Response::new(UpsertResponse {
            id,
            outcome: outcome as i32,
        }))
    }

    async fn get_agent(
        &self,
        request: Request<GetByReferenceRequest>,
    ) -> Result<Response<GetByReferenceResponse>, Status> {
        let request = request.into_inner();
        let reference = validate_reference(&request)?;
        match self.store.get("agent", &reference.org, &reference.slug) {
            Some(resource) => Ok(Response::new(GetByReferenceResponse {
                resource: Some(resource),
            })),
            None => Err(Status::not_found(format!("agent '{}'", reference.slug))),
        }
    }

    async fn create_agent_execution(
        &self,
        request: Request<CreateExecutionRequest>,
    ) -> Result<Response<CreateExecutionResponse>, Status> {
        create_and_enqueue(
            &self.store,
            &self.queue_client,
            constants::AGENT_TASK_QUEUE,
            "agent",
            request.into_inner(),
        )
        .await
    }

    async fn get_agent_execution(
        &self,
        request: Request<GetExecutionRequest>,
    ) -> Result<Response<GetExecutionResponse>, Status> {
        get_execution_response(&self.store, &request.into_inner())
    }
}

#[tonic::async_trait]
impl WorkflowService for WorkflowController {
    async fn upsert_workflow(
        &self,
        request: Request<UpsertRequest>,
    ) -> Result<Response<UpsertResponse>, Status> {
        let request = request.into_inner();
        let (id, outcome) = self.store.upsert("workflow", &request);
        Ok(Response::new(UpsertResponse {
            id,
            outcome: outcome as i32,
        }))
    }

    async fn get_workflow(
        &self,
        request: Request<GetByReferenceRequest>,
    ) -> Result<Response<GetByReferenceResponse>, Status> {
        let request = request.into_inner();
        let reference = validate_reference(&request)?;
        match self.store.get("workflow", &reference.org, &reference.slug) {
            Some(resource) => Ok(Response::new(GetByReferenceResponse {
                resource: Some(resource),
            })),
            None => Err(Status::not_found(format!("workflow '{}'", reference.slug))),
        }
    }

    async fn create_workflow_execution(
        &self,
        request: Request<CreateExecutionRequest>,
    ) -> Result<Response<CreateExecutionResponse>, Status> {
        create_and_enqueue(
            &self.store,
            &self.queue_client,
            constants::WORKFLOW_TASK_QUEUE,
            "workflow",
            request.into_inner(),
        )
        .await
    }

    async fn get_workflow_execution(
        &self,
        request: Request<GetExecutionRequest>,
    ) -> Result<Response<GetExecutionResponse>, Status> {
        get_execution_response(&self.store, &request.into_inner())
    }
}

#[tonic::async_trait]
impl SkillService for SkillController {
    async fn upsert_skill(
        &self,
        request: Request<UpsertRequest>,
    ) -> Result<Response<UpsertResponse>, Status> {
        let request = request.into_inner();
        let (id, outcome) = self.store.upsert("skill", &request);
        Ok(Response::new(UpsertResponse {
            id,
            outcome: outcome as i32,
        }))
    }

    async fn get_skill(
        &self,
        request: Request<GetByReferenceRequest>,
    ) -> Result<Response<GetByReferenceResponse>, Status> {
        let request = request.into_inner();
        let reference = validate_reference(&request)?;
        match self.store.get("skill", &reference.org, &reference.slug) {
            Some(resource) => Ok(Response::new(GetByReferenceResponse {
                resource: Some(resource),
            })),
            None => Err(Status::not_found(format!("skill '{}'", reference.slug))),
        }
    }
}

#[tonic::async_trait]
impl TaskQueueService for TaskQueueController {
    async fn enqueue_task(
        &self,
        request: Request<EnqueueTaskRequest>,
    ) -> Result<Response<EnqueueTaskResponse>, Status> {
        let request = request.into_inner();
        let task = request
            .task
            .ok_or_else(|| Status::invalid_argument("task is required"))?;
        debug!(
            "enqueueing execution {} onto '{}'",
            task.execution_id, request.task_queue
        );
        self.queues.push(&request.task_queue, task);
        Ok(Response::new(EnqueueTaskResponse {}))
    }

    async fn poll_task(
        &self,
        request: Request<PollTaskRequest>,
    ) -> Result<Response<PollTaskResponse>, Status> {
        let request = request.into_inner();
        let task = self.queues.pop(&request.task_queue);
        if let Some(task) = &task {
            self.store.set_phase(&task.execution_id, "RUNNING");
        }
        Ok(Response::new(PollTaskResponse { task }))
    }

    async fn complete_task(
        &self,
        request: Request<CompleteTaskRequest>,
    ) -> Result<Response<CompleteTaskResponse>, Status> {
        let request = request.into_inner();
        let updated = self.store.complete_execution(
            &request.execution_id,
            request.failed,
            &request.failure_reason,
            &request.messages,
        );
        if !updated {
            return Err(Status::not_found(format!(
                "execution '{}'",
                request.execution_id
            )));
        }
        Ok(Response::new(CompleteTaskResponse {}))
    }

    async fn ping(
        &self,
        _request: Request<PingRequest>,
    ) -> Result<Response<PingResponse>, Status> {
        Ok(Response::new(PingResponse {
            version: env!("CARGO_PKG_VERSION").to_string(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn upsert_request(slug: &str, spec: &str) -> UpsertRequest {
        UpsertRequest {
            org: "local".into(),
            slug: slug.into(),
            display_name: slug.into(),
            spec_json: spec.into(),
            id: String::new(),
        }
    }

    #[test]
    fn upsert_is_idempotent_and_keeps_ids() {
        let temp = tempdir().expect("tempdir");
        let store = Store::load(temp.path().join("store.json")).expect("load");

        let (id1, outcome1) = store.upsert("agent", &upsert_request("reviewer", "{}"));
        assert_eq!(outcome1, UpsertOutcome::Created);

        let (id2, outcome2) = store.upsert("agent", &upsert_request("reviewer", "{}"));
        assert_eq!(outcome2, UpsertOutcome::Unchanged);
        assert_eq!(id1, id2);

        let (id3, outcome3) =
            store.upsert("agent", &upsert_request("reviewer", r#"{"x":1}"#));
        assert_eq!(outcome3, UpsertOutcome::Updated);
        assert_eq!(id1, id3);
    }

    #[test]
    fn store_survives_reload() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("store.json");

        let store = Store::load(path.clone()).expect("load");
        let (id, _) = store.upsert("workflow", &upsert_request("pipeline", "{}"));
        drop(store);

        let store = Store::load(path).expect("reload");
        let found = store.get("workflow", "local", "pipeline").expect("found");
        assert_eq!(found.id, id);
    }

    #[test]
    fn lookup_resolves_by_slug_or_id() {
        let temp = tempdir().expect("tempdir");
        let store = Store::load(temp.path().join("store.json")).expect("load");
        let (id, _) = store.upsert("agent", &upsert_request("reviewer", "{}"));

        assert!(store.get("agent", "local", "reviewer").is_some());
        assert!(store.get("agent", "local", &id).is_some());
        assert!(store.get("agent", "local", "missing").is_none());
        assert!(store.get("agent", "other-org", "reviewer").is_none());
    }

    #[test]
    fn execution_lifecycle_phases() {
        let temp = tempdir().expect("tempdir");
        let store = Store::load(temp.path().join("store.json")).expect("load");

        let id = store.create_execution("local", "workflow", "pipeline", "hello");
        let execution = store.execution(&id).expect("execution");
        assert_eq!(execution.phase(), ExecutionPhase::Pending);

        assert!(store.set_phase(&id, "RUNNING"));
        let messages = vec![ExecutionMessage {
            role: "workflow".into(),
            text: "done".into(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }];
        assert!(store.complete_execution(&id, false, "", &messages));

        let execution = store.execution(&id).expect("execution");
        assert_eq!(execution.phase(), ExecutionPhase::Completed);
        assert_eq!(execution.messages.len(), 1);
    }

    #[test]
    fn failed_completion_records_reason() {
        let temp = tempdir().expect("tempdir");
        let store = Store::load(temp.path().join("store.json")).expect("load");

        let id = store.create_execution("local", "agent", "reviewer", "hi");
        assert!(store.complete_execution(&id, true, "model backend absent", &[]));

        let execution = store.execution(&id).expect("execution");
        assert_eq!(execution.phase(), ExecutionPhase::Failed);
        assert!(execution.messages.iter().any(|m| m.text.contains("model backend")));
    }

    #[test]
    fn task_queue_is_fifo_per_queue() {
        let queues = TaskQueues::default();
        let task = |id: &str| Task {
            execution_id: id.into(),
            ..Default::default()
        };
        queues.push("q", task("one"));
        queues.push("q", task("two"));
        queues.push("other", task("three"));

        assert_eq!(queues.pop("q").expect("task").execution_id, "one");
        assert_eq!(queues.pop("q").expect("task").execution_id, "two");
        assert!(queues.pop("q").is_none());
        assert_eq!(queues.pop("other").expect("task").execution_id, "three");
    }
}
