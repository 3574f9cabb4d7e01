//! Bridges the tool loop to a streamed `text/plain` response body.

use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use codebox_agent_schema::{now_rfc3339, AgentEvent, TraceEvent};
use codebox_error::AgentError;
use codebox_sandbox_management::Sandbox;
use futures::{Stream, StreamExt};
use tracing::{debug, info, warn};

use crate::orchestrator::AgentEventStream;
use crate::traces::TraceStore;

/// Yields answer text as the loop produces it and mirrors tool events into
/// the trace store.
///
/// Whichever comes first of end of input, a loop error, or the value being
/// dropped (client disconnect), the trace is marked finished and the sandbox
/// is stopped. That happens exactly once.
pub struct StreamingResponse {
    events: AgentEventStream,
    buffered: Option<AgentEvent>,
    trace_id: String,
    traces: Arc<TraceStore>,
    sandbox: Sandbox,
    finalized: bool,
}

impl StreamingResponse {
    pub fn new(
        events: AgentEventStream,
        trace_id: impl Into<String>,
        traces: Arc<TraceStore>,
        sandbox: Sandbox,
    ) -> Self {
        Self {
            events,
            buffered: None,
            trace_id: trace_id.into(),
            traces,
            sandbox,
            finalized: false,
        }
    }

    /// Waits for the first loop event so a failure that happens before any
    /// output can still be answered with an error status.
    pub async fn prime(&mut self) -> Result<(), AgentError> {
        match self.events.next().await {
            Some(Ok(event)) => {
                self.buffered = Some(event);
                Ok(())
            }
            Some(Err(err)) => {
                self.record_failure(&err);
                self.finalize();
                Err(err)
            }
            None => {
                self.finalize();
                Ok(())
            }
        }
    }

    fn record(&self, event: AgentEvent) {
        match &event {
            AgentEvent::Finish { outcome, steps } => {
                info!(trace_id = %self.trace_id, ?outcome, steps, "agent run complete");
                return;
            }
            AgentEvent::ToolOutputDenied {
                tool_name, reason, ..
            } => {
                warn!(trace_id = %self.trace_id, tool = %tool_name, %reason, "tool output denied");
            }
            AgentEvent::ToolError {
                tool_name, error, ..
            } => {
                debug!(trace_id = %self.trace_id, tool = ?tool_name, %error, "tool error");
            }
            _ => {}
        }
        if let Some(trace_event) = TraceEvent::from_agent_event(&event, now_rfc3339()) {
            self.traces.append(&self.trace_id, trace_event);
        }
    }

    fn record_failure(&self, err: &AgentError) {
        warn!(trace_id = %self.trace_id, error = %err, "agent stream failed");
        self.traces.append(
            &self.trace_id,
            TraceEvent::ToolError {
                call_id: None,
                tool_name: None,
                error: err.to_string(),
                timestamp: now_rfc3339(),
            },
        );
    }

    fn finalize(&mut self) {
        if self.finalized {
            return;
        }
        self.finalized = true;
        self.buffered = None;
        self.traces.finish(&self.trace_id);
        self.sandbox.stop_in_background();
        debug!(trace_id = %self.trace_id, sandbox_id = self.sandbox.id(), "response finalized");
    }
}

impl Stream for StreamingResponse {
    type Item = Result<String, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if this.finalized {
                return Poll::Ready(None);
            }
            let event = match this.buffered.take() {
                Some(event) => event,
                None => match this.events.poll_next_unpin(cx) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(Some(Ok(event))) => event,
                    Poll::Ready(Some(Err(err))) => {
                        this.record_failure(&err);
                        this.finalize();
                        return Poll::Ready(None);
                    }
                    Poll::Ready(None) => {
                        this.finalize();
                        return Poll::Ready(None);
                    }
                },
            };
            match event {
                AgentEvent::TextDelta { text } if !text.is_empty() => {
                    return Poll::Ready(Some(Ok(text)));
                }
                AgentEvent::TextDelta { .. } => {}
                other => this.record(other),
            }
        }
    }
}

impl Drop for StreamingResponse {
    fn drop(&mut self) {
        if !self.finalized {
            info!(trace_id = %self.trace_id, "response dropped before completion");
            self.finalize();
        }
    }
}
