//! Backend gateway: blocking gRPC dials with context deadlines, endpoint
//! resolution and a per-process cached connection.
//!
//! The dial contract is strict: always a blocking connect bounded by a
//! deadline, never a non-blocking dial followed by a verification RPC. A
//! returned channel is ready to carry requests.
use std::{
    env,
    future::Future,
    io,
    sync::{Mutex, OnceLock},
    time::Duration,
};

use tokio::runtime::{Builder, Runtime};
use tonic::{
    Request, Status,
    metadata::MetadataValue,
    service::{Interceptor, interceptor::InterceptedService},
    transport::{Channel, Endpoint},
};
use tracing::debug;

use crate::{
    config::{BackendType, Config},
    constants,
    error::StigmerError,
    rpc::proto::{
        agent_service_client::AgentServiceClient,
        skill_service_client::SkillServiceClient,
        task_queue_service_client::TaskQueueServiceClient,
        workflow_service_client::WorkflowServiceClient,
    },
};

/// Shared single-threaded runtime that drives every CLI-side gRPC call.
/// Channel background tasks are spawned onto this runtime, so all calls must
/// go through [`block_on`] for connections to make progress.
fn runtime() -> Result<&'static Runtime, io::Error> {
    static RUNTIME: OnceLock<Runtime> = OnceLock::new();
    if let Some(rt) = RUNTIME.get() {
        return Ok(rt);
    }
    let rt = Builder::new_current_thread().enable_all().build()?;
    Ok(RUNTIME.get_or_init(|| rt))
}

/// Runs a gRPC future to completion on the gateway runtime.
pub fn block_on<F: Future>(future: F) -> Result<F::Output, StigmerError> {
    Ok(runtime()?.block_on(future))
}

/// Attaches the cloud authorization header when an API key is configured.
#[derive(Debug, Clone, Default)]
pub struct AuthInterceptor {
    token: Option<MetadataValue<tonic::metadata::Ascii>>,
}

impl Interceptor for AuthInterceptor {
    fn call(&mut self, mut request: Request<()>) -> Result<Request<()>, Status> {
        if let Some(token) = &self.token {
            request.metadata_mut().insert("authorization", token.clone());
        }
        Ok(request)
    }
}

/// Client stub type returned by the gateway accessors.
pub type Authed = InterceptedService<Channel, AuthInterceptor>;

/// A ready connection to the backend plus the organization all requests are
/// scoped to.
#[derive(Clone)]
pub struct Backend {
    /// Organization all references are scoped to.
    pub org: String,
    endpoint: String,
    channel: Channel,
    interceptor: AuthInterceptor,
}

/// Resolves the backend endpoint and organization from configuration.
pub fn resolve_endpoint(config: &Config) -> (String, String) {
    match config.backend.backend_type {
        BackendType::Cloud => (
            config.backend.cloud.endpoint.clone(),
            config.backend.cloud.organization.clone(),
        ),
        BackendType::Local => {
            let addr = env::var(constants::ENV_SERVER_ADDR)
                .ok()
                .filter(|addr| !addr.is_empty())
                .unwrap_or_else(|| format!("localhost:{}", constants::DAEMON_PORT));
            (addr, constants::LOCAL_ORG.to_string())
        }
    }
}

impl Backend {
    /// Dials with the long deadline used by commands that may have just
    /// triggered a server start. Status checks use [`probe`] with the short
    /// deadline instead of a full client connection.
    pub fn connect(config: &Config) -> Result<Backend, StigmerError> {
        Backend::dial(config, constants::DIAL_TIMEOUT)
    }

    fn dial(config: &Config, timeout: Duration) -> Result<Backend, StigmerError> {
        let (endpoint, org) = resolve_endpoint(config);
        let uri = normalize_endpoint(&endpoint);

        let interceptor = match config.backend.backend_type {
            BackendType::Cloud if !config.backend.cloud.api_key.is_empty() => {
                let token = format!("Bearer {}", config.backend.cloud.api_key)
                    .parse()
                    .map_err(|_| StigmerError::Connection {
                        endpoint: endpoint.clone(),
                        reason: "configured API key is not a valid header value".into(),
                    })?;
                AuthInterceptor { token: Some(token) }
            }
            _ => AuthInterceptor::default(),
        };

        debug!("dialing backend at {uri} (deadline {timeout:?})");
        let channel = block_on(async {
            Endpoint::from_shared(uri.clone())
                .map_err(|err| StigmerError::Connection {
                    endpoint: endpoint.clone(),
                    reason: err.to_string(),
                })?
                .connect_timeout(timeout)
                .connect()
                .await
                .map_err(|err| StigmerError::Connection {
                    endpoint: endpoint.clone(),
                    reason: err.to_string(),
                })
        })??;

        Ok(Backend {
            org,
            endpoint,
            channel,
            interceptor,
        })
    }

    /// The endpoint this backend was dialed at.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Agent service client.
    pub fn agents(&self) -> AgentServiceClient<Authed> {
        AgentServiceClient::with_interceptor(self.channel.clone(), self.interceptor.clone())
    }

    /// Workflow service client.
    pub fn workflows(&self) -> WorkflowServiceClient<Authed> {
        WorkflowServiceClient::with_interceptor(self.channel.clone(), self.interceptor.clone())
    }

    /// Skill service client.
    pub fn skills(&self) -> SkillServiceClient<Authed> {
        SkillServiceClient::with_interceptor(self.channel.clone(), self.interceptor.clone())
    }

    /// Task queue client.
    pub fn tasks(&self) -> TaskQueueServiceClient<Authed> {
        TaskQueueServiceClient::with_interceptor(self.channel.clone(), self.interceptor.clone())
    }
}

/// Returns a cached backend connection, dialing on first use. The cache is
/// keyed by endpoint so a config change within a process is honored.
pub fn cached_backend(config: &Config) -> Result<Backend, StigmerError> {
    static CACHE: OnceLock<Mutex<Option<Backend>>> = OnceLock::new();
    let cache = CACHE.get_or_init(|| Mutex::new(None));
    let (endpoint, _) = resolve_endpoint(config);

    let mut guard = cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(backend) = guard.as_ref()
        && backend.endpoint == endpoint
    {
        return Ok(backend.clone());
    }

    let backend = Backend::connect(config)?;
    *guard = Some(backend.clone());
    Ok(backend)
}

/// Probes a gRPC endpoint for liveness with a bounded blocking dial. Used as
/// tier-3 detection; a successful dial confirms liveness even when no PID
/// file exists.
pub fn probe(addr: &str, timeout: Duration) -> bool {
    let uri = normalize_endpoint(addr);
    let result = block_on(async {
        match Endpoint::from_shared(uri) {
            Ok(endpoint) => endpoint.connect_timeout(timeout).connect().await.is_ok(),
            Err(_) => false,
        }
    });
    result.unwrap_or(false)
}

/// Ensures the endpoint carries a scheme tonic will accept.
fn normalize_endpoint(addr: &str) -> String {
    if addr.contains("://") {
        addr.to_string()
    } else {
        format!("http://{addr}")
    }
}
