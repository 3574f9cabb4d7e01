//! End-to-end tests for `POST /agent` and trace retrieval.

#[path = "../common/mod.rs"]
mod common;

use axum::http::{Method, StatusCode};
use codebox::config::AgentConfig;
use codebox::model::{FinishReason, ModelError};
use serde_json::{json, Value};

use common::*;

#[tokio::test]
async fn answers_arithmetic_with_sandbox_and_records_trace() {
    let test_app = TestApp::new(ScriptedModel::calculator("console.log(44 * 44)"));
    let (status, headers, body) = send(
        &test_app.app,
        Method::POST,
        "/agent",
        Some(json!({ "prompt": "What is 44 x 44?" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let answer = String::from_utf8(body).expect("utf8 body");
    assert!(answer.contains("1936"), "answer was {answer:?}");
    assert_eq!(
        headers.get("cache-control").and_then(|v| v.to_str().ok()),
        Some("no-store")
    );
    assert!(headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .starts_with("text/plain"));
    let trace_id = headers
        .get("x-trace-id")
        .and_then(|v| v.to_str().ok())
        .expect("trace id header")
        .to_string();

    let (status, trace) = get_trace(&test_app.app, &trace_id).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(trace["id"], trace_id);
    assert_eq!(trace["prompt"], "What is 44 x 44?");
    assert_eq!(trace["sandboxId"], "sbx-1");
    assert!(trace["startedAt"].is_string());
    assert!(trace["finishedAt"].is_string(), "trace finished: {trace}");

    let events = trace["events"].as_array().expect("events");
    let call = events
        .iter()
        .find(|event| event["type"] == "tool-call")
        .expect("tool-call event");
    assert_eq!(call["toolName"], "runInSandbox");
    assert_eq!(call["callId"], "call_1");
    let result = events
        .iter()
        .find(|event| event["type"] == "tool-result")
        .expect("tool-result event");
    assert_eq!(result["output"], "1936");

    assert_eq!(test_app.model.calls(), 2);
    assert_eq!(test_app.backend.creates(), 1);
    test_app.backend.wait_for_stops(1).await;
}

#[tokio::test]
async fn metadata_fetch_is_denied() {
    let model = ScriptedModel::new(|request| match last_tool_output(request) {
        Some(_) => Ok(turn(vec![
            text("That address is not reachable."),
            finish(FinishReason::Stop),
        ])),
        None => Ok(turn(vec![
            tool_call(
                "call_meta",
                "fetchJson",
                json!({ "url": "http://169.254.169.254/" }),
            ),
            finish(FinishReason::ToolCalls),
        ])),
    });
    let test_app = TestApp::new(model);
    let (status, headers, _) = send(
        &test_app.app,
        Method::POST,
        "/agent",
        Some(json!({ "prompt": "Read the instance metadata" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let trace_id = headers
        .get("x-trace-id")
        .and_then(|v| v.to_str().ok())
        .expect("trace id");

    let (_, trace) = get_trace(&test_app.app, trace_id).await;
    let types = event_types(&trace);
    assert_eq!(types, vec!["tool-call", "tool-output-denied"]);
    assert!(!types.iter().any(|kind| kind == "tool-result"));
    test_app.backend.wait_for_stops(1).await;
}

#[tokio::test]
async fn invalid_prompts_are_rejected_before_allocating() {
    let test_app = TestApp::new(ScriptedModel::answering("unused"));
    for body in [
        json!({ "prompt": "   " }),
        json!({ "prompt": "x".repeat(2001) }),
        json!({ "message": "hi" }),
        json!({ "prompt": "hi", "traceId": "no spaces allowed" }),
    ] {
        let (status, payload) = send_json(&test_app.app, Method::POST, "/agent", Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(payload["error"].is_string(), "error body: {payload}");
    }
    assert_eq!(test_app.backend.creates(), 0);
    assert_eq!(test_app.model.calls(), 0);
}

#[tokio::test]
async fn missing_gateway_credential_is_a_server_error() {
    let test_app = TestApp::with_config(
        AgentConfig::default(),
        ScriptedModel::answering("unused"),
        FakeSandboxBackend::new(),
    );
    let (status, payload) = send_json(
        &test_app.app,
        Method::POST,
        "/agent",
        Some(json!({ "prompt": "hi" })),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(payload["error"]
        .as_str()
        .unwrap_or_default()
        .contains("AI_GATEWAY_API_KEY"));
    assert_eq!(test_app.backend.creates(), 0);
}

#[tokio::test]
async fn unavailable_backend_is_a_server_error() {
    let test_app = TestApp::with_backend(
        ScriptedModel::answering("unused"),
        FakeSandboxBackend::unavailable(),
    );
    let (status, payload) = send_json(
        &test_app.app,
        Method::POST,
        "/agent",
        Some(json!({ "prompt": "hi" })),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(payload["error"]
        .as_str()
        .unwrap_or_default()
        .contains("no capacity"));
    assert_eq!(test_app.model.calls(), 0);
    assert!(test_app.state.traces().is_empty());
}

#[tokio::test]
async fn gateway_failure_before_output_is_a_server_error() {
    let model = ScriptedModel::new(|_| {
        Err(ModelError::Status {
            status: 401,
            body: "bad key".to_string(),
        })
    });
    let test_app = TestApp::new(model);
    let (status, payload) = send_json(
        &test_app.app,
        Method::POST,
        "/agent",
        Some(json!({ "prompt": "hi", "traceId": "early-failure" })),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(payload["error"].as_str().unwrap_or_default().contains("401"));

    let (status, trace) = get_trace(&test_app.app, "early-failure").await;
    assert_eq!(status, StatusCode::OK);
    assert!(trace["finishedAt"].is_string());
    assert_eq!(event_types(&trace), vec!["tool-error"]);
    test_app.backend.wait_for_stops(1).await;
}

#[tokio::test]
async fn unknown_trace_is_not_found() {
    let test_app = TestApp::new(ScriptedModel::answering("unused"));
    let (status, payload) = get_trace(&test_app.app, "does-not-exist").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(payload, json!({ "error": "Trace not found." }));
}

#[tokio::test]
async fn health_and_openapi_are_served() {
    let test_app = TestApp::new(ScriptedModel::answering("unused"));
    let (status, payload) = send_json(&test_app.app, Method::GET, "/healthz", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(payload, json!({ "status": "ok" }));

    let (status, doc) = send_json(&test_app.app, Method::GET, "/openapi.json", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(doc["paths"]["/agent"].is_object());
    assert!(matches!(doc["openapi"], Value::String(_)));
}
