//! Shared fakes and HTTP helpers for the endpoint tests.
#![allow(dead_code)]

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{HeaderMap, Method, Request, StatusCode};
use axum::Router;
use futures::stream::{self, StreamExt};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::util::ServiceExt;

use codebox::config::{AgentConfig, SandboxBackendKind};
use codebox::model::{
    ChatMessage, FinishReason, ModelError, ModelEvent, ModelGateway, ModelRequest, ModelStream,
    ToolCallRequest,
};
use codebox::router::{build_router, AppState};
use codebox::tools::JsonFetcher;
use codebox::traces::TraceStore;
use codebox_sandbox_management::{
    CommandOutput, CommandSpec, RuntimeSpec, SandboxBackend, SandboxError, SandboxSession,
};

type Responder = dyn Fn(&ModelRequest) -> Result<ModelStream, ModelError> + Send + Sync;

/// Model double driven by a closure over the full request of each turn.
pub struct ScriptedModel {
    respond: Box<Responder>,
    calls: AtomicUsize,
}

impl fmt::Debug for ScriptedModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptedModel")
            .field("calls", &self.calls.load(Ordering::SeqCst))
            .finish()
    }
}

impl ScriptedModel {
    pub fn new(
        respond: impl Fn(&ModelRequest) -> Result<ModelStream, ModelError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            respond: Box::new(respond),
            calls: AtomicUsize::new(0),
        })
    }

    /// Asks for one `runInSandbox` call, then answers with whatever the tool
    /// returned.
    pub fn calculator(code: &'static str) -> Arc<Self> {
        Self::new(move |request| match last_tool_output(request) {
            Some(output) => Ok(turn(vec![
                text("44 x 44 = "),
                text(&output),
                finish(FinishReason::Stop),
            ])),
            None => Ok(turn(vec![
                tool_call("call_1", "runInSandbox", serde_json::json!({ "code": code })),
                finish(FinishReason::ToolCalls),
            ])),
        })
    }

    pub fn answering(answer: &'static str) -> Arc<Self> {
        Self::new(move |_| Ok(turn(vec![text(answer), finish(FinishReason::Stop)])))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelGateway for ScriptedModel {
    async fn stream_turn(&self, request: ModelRequest) -> Result<ModelStream, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.respond)(&request)
    }
}

pub fn turn(events: Vec<Result<ModelEvent, ModelError>>) -> ModelStream {
    stream::iter(events).boxed()
}

/// Emits `events`, then never yields again.
pub fn hanging_turn(events: Vec<Result<ModelEvent, ModelError>>) -> ModelStream {
    stream::iter(events).chain(stream::pending()).boxed()
}

pub fn text(delta: &str) -> Result<ModelEvent, ModelError> {
    Ok(ModelEvent::TextDelta(delta.to_string()))
}

pub fn tool_call(id: &str, name: &str, input: Value) -> Result<ModelEvent, ModelError> {
    Ok(ModelEvent::ToolCall(ToolCallRequest {
        call_id: id.to_string(),
        tool_name: name.to_string(),
        input,
    }))
}

pub fn finish(reason: FinishReason) -> Result<ModelEvent, ModelError> {
    Ok(ModelEvent::Finish { reason })
}

pub fn last_tool_output(request: &ModelRequest) -> Option<String> {
    match request.messages.last() {
        Some(ChatMessage::Tool { content, .. }) => Some(content.clone()),
        _ => None,
    }
}

#[derive(Debug, Default)]
pub struct BackendCounters {
    pub creates: AtomicUsize,
    pub stops: AtomicUsize,
    pub commands: Mutex<Vec<CommandSpec>>,
}

/// Sandbox backend that evaluates `console.log(A*B)` scripts in memory.
#[derive(Debug, Default)]
pub struct FakeSandboxBackend {
    pub counters: Arc<BackendCounters>,
    pub unavailable: bool,
}

impl FakeSandboxBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn unavailable() -> Arc<Self> {
        Arc::new(Self {
            unavailable: true,
            ..Self::default()
        })
    }

    pub fn creates(&self) -> usize {
        self.counters.creates.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.counters.stops.load(Ordering::SeqCst)
    }

    pub async fn wait_for_stops(&self, expected: usize) {
        for _ in 0..200 {
            if self.stops() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(self.stops(), expected, "sandbox stop count");
    }
}

#[async_trait]
impl SandboxBackend for FakeSandboxBackend {
    async fn create(&self, spec: &RuntimeSpec) -> Result<Box<dyn SandboxSession>, SandboxError> {
        if self.unavailable {
            return Err(SandboxError::BackendUnavailable {
                message: "no capacity".to_string(),
            });
        }
        let n = self.counters.creates.fetch_add(1, Ordering::SeqCst) + 1;
        assert_eq!(spec.timeout, Duration::from_secs(30));
        Ok(Box::new(FakeSession {
            id: format!("sbx-{n}"),
            counters: self.counters.clone(),
        }))
    }
}

#[derive(Debug)]
struct FakeSession {
    id: String,
    counters: Arc<BackendCounters>,
}

#[async_trait]
impl SandboxSession for FakeSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn working_dir(&self) -> &str {
        "/workspace"
    }

    async fn run(&self, command: &CommandSpec) -> Result<CommandOutput, SandboxError> {
        self.counters
            .commands
            .lock()
            .expect("lock")
            .push(command.clone());
        let code = command.args.last().cloned().unwrap_or_default();
        Ok(evaluate(&code))
    }

    async fn stop(&self) -> Result<(), SandboxError> {
        self.counters.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn evaluate(code: &str) -> CommandOutput {
    let product = code
        .trim()
        .strip_prefix("console.log(")
        .and_then(|rest| rest.strip_suffix(')'))
        .and_then(|expr| {
            let (a, b) = expr.split_once('*')?;
            let a: i64 = a.trim().parse().ok()?;
            let b: i64 = b.trim().parse().ok()?;
            Some(a * b)
        });
    match product {
        Some(product) => CommandOutput {
            stdout: format!("{product}\n"),
            stderr: String::new(),
            exit_code: 0,
        },
        None => CommandOutput {
            stdout: String::new(),
            stderr: format!("SyntaxError: cannot evaluate {code}"),
            exit_code: 1,
        },
    }
}

pub struct TestApp {
    pub app: Router,
    pub state: AppState,
    pub model: Arc<ScriptedModel>,
    pub backend: Arc<FakeSandboxBackend>,
}

impl TestApp {
    pub fn new(model: Arc<ScriptedModel>) -> Self {
        Self::with_backend(model, FakeSandboxBackend::new())
    }

    pub fn with_backend(model: Arc<ScriptedModel>, backend: Arc<FakeSandboxBackend>) -> Self {
        Self::with_config(configured(), model, backend)
    }

    pub fn with_config(
        config: AgentConfig,
        model: Arc<ScriptedModel>,
        backend: Arc<FakeSandboxBackend>,
    ) -> Self {
        let state = AppState::new(
            config,
            Arc::new(TraceStore::new()),
            model.clone(),
            backend.clone(),
            JsonFetcher::new().expect("fetcher"),
        );
        Self {
            app: build_router(state.clone()),
            state,
            model,
            backend,
        }
    }
}

pub fn configured() -> AgentConfig {
    AgentConfig::default()
        .with_gateway_api_key("test-key")
        .with_sandbox_backend(SandboxBackendKind::Http)
        .with_sandbox_service("http://sandbox.test", "test-token")
}

pub async fn send(
    app: &Router,
    method: Method,
    path: &str,
    body: Option<Value>,
) -> (StatusCode, HeaderMap, Vec<u8>) {
    let mut builder = Request::builder().method(method).uri(path);
    let body = if let Some(body) = body {
        builder = builder.header("content-type", "application/json");
        Body::from(body.to_string())
    } else {
        Body::empty()
    };
    let request = builder.body(body).expect("request");
    let response = app.clone().oneshot(request).await.expect("request handled");
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("read body")
        .to_bytes();
    (status, headers, bytes.to_vec())
}

pub async fn send_json(
    app: &Router,
    method: Method,
    path: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let (status, _, bytes) = send(app, method, path, body).await;
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes)
            .unwrap_or(Value::String(String::from_utf8_lossy(&bytes).to_string()))
    };
    (status, value)
}

pub async fn get_trace(app: &Router, trace_id: &str) -> (StatusCode, Value) {
    send_json(app, Method::GET, &format!("/agent/traces/{trace_id}"), None).await
}

pub fn event_types(trace: &Value) -> Vec<String> {
    trace["events"]
        .as_array()
        .map(|events| {
            events
                .iter()
                .filter_map(|event| event["type"].as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}
