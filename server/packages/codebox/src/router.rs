use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use codebox_agent_schema::{ExecutionTrace, TraceEvent};
use codebox_error::{AgentError, ErrorBody};
use codebox_sandbox_management::http_client::client_builder;
use codebox_sandbox_management::{
    HttpSandboxBackend, ProcessSandboxBackend, Sandbox, SandboxBackend, SandboxError,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tower_http::trace::TraceLayer;
use tracing::{info, warn, Span};
use utoipa::{OpenApi, ToSchema};

use crate::config::{AgentConfig, SandboxBackendKind};
use crate::model::{ModelGateway, OpenAiCompatibleGateway};
use crate::orchestrator::ToolLoop;
use crate::streaming::StreamingResponse;
use crate::tools::{FetchError, JsonFetcher, SandboxRunner, ToolSet};
use crate::traces::TraceStore;

pub const MAX_PROMPT_CHARS: usize = 2000;
pub const MAX_TRACE_ID_CHARS: usize = 64;
pub const TRACE_ID_HEADER: &str = "x-trace-id";

#[derive(Debug, Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

#[derive(Debug)]
struct AppStateInner {
    config: AgentConfig,
    traces: Arc<TraceStore>,
    model: Arc<dyn ModelGateway>,
    sandboxes: Arc<dyn SandboxBackend>,
    fetcher: JsonFetcher,
}

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to build http client: {0}")]
    Client(#[from] reqwest::Error),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

impl AppState {
    pub fn new(
        config: AgentConfig,
        traces: Arc<TraceStore>,
        model: Arc<dyn ModelGateway>,
        sandboxes: Arc<dyn SandboxBackend>,
        fetcher: JsonFetcher,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                config,
                traces,
                model,
                sandboxes,
                fetcher,
            }),
        }
    }

    /// Wires the production gateway and sandbox backend. Missing credentials
    /// are left for request time.
    pub fn from_config(config: AgentConfig) -> Result<Self, StartupError> {
        let model = OpenAiCompatibleGateway::new(
            config.gateway_url.clone(),
            config.gateway_api_key.clone().unwrap_or_default(),
            client_builder().build()?,
        );
        let sandboxes: Arc<dyn SandboxBackend> = match config.sandbox_backend {
            SandboxBackendKind::Http => Arc::new(HttpSandboxBackend::new(
                config.sandbox_url.clone().unwrap_or_default(),
                config.sandbox_token.clone().unwrap_or_default(),
            )?),
            SandboxBackendKind::Process => Arc::new(ProcessSandboxBackend::new()),
        };
        Ok(Self::new(
            config,
            Arc::new(TraceStore::new()),
            Arc::new(model),
            sandboxes,
            JsonFetcher::new()?,
        ))
    }

    pub fn config(&self) -> &AgentConfig {
        &self.inner.config
    }

    pub fn traces(&self) -> &Arc<TraceStore> {
        &self.inner.traces
    }
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AgentRequest {
    /// Task for the agent, 1 to 2000 characters after trimming.
    pub prompt: String,
    /// Optional caller-chosen trace id, 1 to 64 of `[A-Za-z0-9_-]`.
    #[serde(default)]
    pub trace_id: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(OpenApi)]
#[openapi(
    paths(post_agent, get_trace, get_health),
    components(schemas(AgentRequest, ExecutionTrace, TraceEvent, ErrorBody, HealthResponse)),
    tags((name = "agent", description = "Sandboxed tool-loop agent"))
)]
pub struct ApiDoc;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/agent", post(post_agent))
        .route("/agent/traces/:trace_id", get(get_trace))
        .route("/healthz", get(get_health))
        .route("/openapi.json", get(get_openapi))
        .with_state(state)
}

/// Adds one `http.request` span per request and a completion log line.
pub fn with_http_logging(router: Router) -> Router {
    router.layer(
        TraceLayer::new_for_http()
            .make_span_with(|request: &Request<Body>| {
                tracing::info_span!(
                    "http.request",
                    method = %request.method(),
                    uri = %request.uri()
                )
            })
            .on_request(|_request: &Request<Body>, _span: &Span| {})
            .on_response(|response: &Response, latency: Duration, _span: &Span| {
                info!(
                    status = response.status().as_u16(),
                    latency_ms = latency.as_millis() as u64,
                    "http.response"
                );
            }),
    )
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Agent(#[from] AgentError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let ApiError::Agent(err) = self;
        let status =
            StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            warn!(error = %err, "request failed");
        }
        (status, Json(err.to_error_body())).into_response()
    }
}

#[utoipa::path(
    post,
    path = "/agent",
    tag = "agent",
    request_body = AgentRequest,
    responses(
        (status = 200, description = "Answer text, streamed as it is produced", body = String, content_type = "text/plain",
            headers(("x-trace-id" = String, description = "Id of the execution trace"))),
        (status = 400, description = "Invalid request body or a traceId still in use", body = ErrorBody),
        (status = 500, description = "Configuration, sandbox or model failure", body = ErrorBody)
    )
)]
async fn post_agent(State(state): State<AppState>, body: Bytes) -> Result<Response, ApiError> {
    let request = parse_agent_request(&body)?;
    let trace_id = request
        .trace_id
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let config = state.config();
    config.check_credentials()?;
    if state.traces().is_in_flight(&trace_id) {
        return Err(trace_in_use(&trace_id).into());
    }

    let sandbox = Sandbox::create(state.inner.sandboxes.as_ref(), &config.runtime)
        .await
        .map_err(|err| AgentError::BackendUnavailable {
            message: match err {
                SandboxError::BackendUnavailable { message } => message,
                other => other.to_string(),
            },
        })?;

    if state
        .traces()
        .start(&trace_id, &request.prompt, &config.model, sandbox.id())
        .is_err()
    {
        sandbox.stop_in_background();
        return Err(trace_in_use(&trace_id).into());
    }
    info!(trace_id = %trace_id, sandbox_id = sandbox.id(), model = %config.model, "agent run started");

    let tools = ToolSet::new(
        state.inner.fetcher.clone(),
        SandboxRunner::new(sandbox.clone()),
    );
    let events = ToolLoop::new(state.inner.model.clone(), tools, config.model.clone())
        .run(&request.prompt);
    let mut stream =
        StreamingResponse::new(events, trace_id.clone(), state.traces().clone(), sandbox);
    stream.prime().await?;

    let trace_header = HeaderValue::from_str(&trace_id).map_err(|err| AgentError::Orchestration {
        message: err.to_string(),
    })?;
    Ok((
        [
            (
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/plain; charset=utf-8"),
            ),
            (header::CACHE_CONTROL, HeaderValue::from_static("no-store")),
            (header::HeaderName::from_static(TRACE_ID_HEADER), trace_header),
        ],
        Body::from_stream(stream),
    )
        .into_response())
}

#[utoipa::path(
    get,
    path = "/agent/traces/{trace_id}",
    tag = "agent",
    params(("trace_id" = String, Path, description = "Trace id from the X-Trace-Id header")),
    responses(
        (status = 200, description = "Full execution trace", body = ExecutionTrace),
        (status = 404, description = "Unknown or evicted trace", body = ErrorBody)
    )
)]
async fn get_trace(
    State(state): State<AppState>,
    Path(trace_id): Path<String>,
) -> Result<Json<ExecutionTrace>, ApiError> {
    state
        .traces()
        .get(&trace_id)
        .map(Json)
        .ok_or_else(|| AgentError::TraceNotFound { trace_id }.into())
}

#[utoipa::path(
    get,
    path = "/healthz",
    responses((status = 200, description = "Server is up", body = HealthResponse))
)]
async fn get_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn get_openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

/// Parsed and normalised `POST /agent` body.
#[derive(Debug, PartialEq, Eq)]
struct ValidatedRequest {
    prompt: String,
    trace_id: Option<String>,
}

fn parse_agent_request(body: &[u8]) -> Result<ValidatedRequest, AgentError> {
    let request: AgentRequest = serde_json::from_slice(body)
        .map_err(|err| AgentError::validation(format!("invalid request body: {err}")))?;
    let prompt = request.prompt.trim();
    let length = prompt.chars().count();
    if length == 0 {
        return Err(AgentError::validation("prompt must not be empty"));
    }
    if length > MAX_PROMPT_CHARS {
        return Err(AgentError::validation(format!(
            "prompt must be at most {MAX_PROMPT_CHARS} characters"
        )));
    }
    if let Some(trace_id) = &request.trace_id {
        if !is_valid_trace_id(trace_id) {
            return Err(AgentError::validation(format!(
                "traceId must be 1 to {MAX_TRACE_ID_CHARS} characters of [A-Za-z0-9_-]"
            )));
        }
    }
    Ok(ValidatedRequest {
        prompt: prompt.to_string(),
        trace_id: request.trace_id,
    })
}

fn trace_in_use(trace_id: &str) -> AgentError {
    AgentError::validation(format!(
        "traceId {trace_id} is already used by a run that is still in progress"
    ))
}

fn is_valid_trace_id(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= MAX_TRACE_ID_CHARS
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}
