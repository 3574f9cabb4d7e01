//! Trace bookkeeping and sandbox teardown across the response lifetime.

#[path = "../common/mod.rs"]
mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use codebox::model::{FinishReason, ModelError};
use codebox::traces::MAX_TRACES;
use http_body_util::BodyExt;
use serde_json::json;
use tower::util::ServiceExt;

use common::*;

fn agent_request(prompt: &str, trace_id: &str) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri("/agent")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({ "prompt": prompt, "traceId": trace_id }).to_string(),
        ))
        .expect("request")
}

#[tokio::test]
async fn caller_trace_id_is_used() {
    let test_app = TestApp::new(ScriptedModel::answering("hello"));
    let (status, headers, body) = send(
        &test_app.app,
        Method::POST,
        "/agent",
        Some(json!({ "prompt": "say hello", "traceId": "my-run_1" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"hello");
    assert_eq!(
        headers.get("x-trace-id").and_then(|v| v.to_str().ok()),
        Some("my-run_1")
    );

    let (status, trace) = get_trace(&test_app.app, "my-run_1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(trace["prompt"], "say hello");
    assert!(trace["events"].as_array().expect("events").is_empty());
    assert!(trace.get("finishedAt").is_some());
}

#[tokio::test]
async fn oldest_traces_are_evicted() {
    let test_app = TestApp::new(ScriptedModel::answering("ok"));
    for n in 0..=MAX_TRACES {
        let (status, _, _) = send(
            &test_app.app,
            Method::POST,
            "/agent",
            Some(json!({ "prompt": "p", "traceId": format!("run-{n}") })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }
    assert_eq!(test_app.state.traces().len(), MAX_TRACES);

    let (status, _) = get_trace(&test_app.app, "run-0").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = get_trace(&test_app.app, "run-1").await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = get_trace(&test_app.app, &format!("run-{MAX_TRACES}")).await;
    assert_eq!(status, StatusCode::OK);

    test_app.backend.wait_for_stops(MAX_TRACES + 1).await;
}

#[tokio::test]
async fn client_disconnect_finishes_trace_and_stops_sandbox() {
    let model = ScriptedModel::new(|_| Ok(hanging_turn(vec![text("working on it")])));
    let test_app = TestApp::new(model);
    let response = test_app
        .app
        .clone()
        .oneshot(agent_request("slow task", "disconnect"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);

    let mut body = response.into_body();
    let frame = body
        .frame()
        .await
        .expect("first frame")
        .expect("frame ok")
        .into_data()
        .expect("data frame");
    assert_eq!(&frame[..], b"working on it");

    let (_, trace) = get_trace(&test_app.app, "disconnect").await;
    assert!(trace.get("finishedAt").is_none(), "still streaming");
    assert_eq!(test_app.backend.stops(), 0);

    drop(body);
    test_app.backend.wait_for_stops(1).await;
    let (_, trace) = get_trace(&test_app.app, "disconnect").await;
    assert!(trace["finishedAt"].is_string());
}

#[tokio::test]
async fn trace_id_of_a_running_request_is_refused() {
    let first_call = Arc::new(AtomicBool::new(true));
    let model = ScriptedModel::new(move |_| {
        if first_call.swap(false, Ordering::SeqCst) {
            Ok(hanging_turn(vec![text("still going")]))
        } else {
            Ok(turn(vec![text("second run"), finish(FinishReason::Stop)]))
        }
    });
    let test_app = TestApp::new(model);
    let response = test_app
        .app
        .clone()
        .oneshot(agent_request("first prompt", "shared"))
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body();

    let (status, payload) = send_json(
        &test_app.app,
        Method::POST,
        "/agent",
        Some(json!({ "prompt": "second prompt", "traceId": "shared" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(payload["error"]
        .as_str()
        .unwrap_or_default()
        .contains("shared"));
    assert_eq!(test_app.backend.creates(), 1);
    assert_eq!(test_app.model.calls(), 1);

    let (_, trace) = get_trace(&test_app.app, "shared").await;
    assert_eq!(trace["prompt"], "first prompt");
    assert!(trace.get("finishedAt").is_none());

    drop(body);
    test_app.backend.wait_for_stops(1).await;

    let (status, _, body) = send(
        &test_app.app,
        Method::POST,
        "/agent",
        Some(json!({ "prompt": "second prompt", "traceId": "shared" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"second run");
    let (_, trace) = get_trace(&test_app.app, "shared").await;
    assert_eq!(trace["prompt"], "second prompt");
    assert_eq!(trace["sandboxId"], "sbx-2");
    assert!(trace["finishedAt"].is_string());
    assert_eq!(test_app.state.traces().len(), 1);
    test_app.backend.wait_for_stops(2).await;
}

#[tokio::test]
async fn mid_stream_failure_truncates_response() {
    let model = ScriptedModel::new(|_| {
        Ok(turn(vec![
            text("partial answer"),
            Err(ModelError::Stream("connection reset".to_string())),
        ]))
    });
    let test_app = TestApp::new(model);
    let (status, _, body) = send(
        &test_app.app,
        Method::POST,
        "/agent",
        Some(json!({ "prompt": "p", "traceId": "truncated" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"partial answer");

    let (_, trace) = get_trace(&test_app.app, "truncated").await;
    assert!(trace["finishedAt"].is_string());
    let events = trace["events"].as_array().expect("events");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["type"], "tool-error");
    assert!(events[0].get("callId").is_none());
    assert!(events[0]["error"]
        .as_str()
        .unwrap_or_default()
        .contains("connection reset"));
    test_app.backend.wait_for_stops(1).await;
}

#[tokio::test]
async fn step_budget_ends_run_without_error() {
    let model = ScriptedModel::new(|request| {
        let step = request
            .messages
            .iter()
            .filter(|message| matches!(message, codebox::model::ChatMessage::Tool { .. }))
            .count();
        Ok(turn(vec![
            tool_call(
                &format!("call_{step}"),
                "runInSandbox",
                json!({ "code": "console.log(2 * 3)" }),
            ),
            finish(FinishReason::ToolCalls),
        ]))
    });
    let test_app = TestApp::new(model);
    let (status, _, body) = send(
        &test_app.app,
        Method::POST,
        "/agent",
        Some(json!({ "prompt": "never stop", "traceId": "budget" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.is_empty());
    assert_eq!(test_app.model.calls(), 6);

    let (_, trace) = get_trace(&test_app.app, "budget").await;
    let types = event_types(&trace);
    assert_eq!(types.iter().filter(|kind| *kind == "tool-call").count(), 6);
    assert_eq!(types.iter().filter(|kind| *kind == "tool-result").count(), 6);
    assert!(trace["finishedAt"].is_string());

    test_app.backend.wait_for_stops(1).await;
}
