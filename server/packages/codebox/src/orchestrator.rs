//! The bounded model/tool loop behind one agent request.

use std::collections::VecDeque;
use std::sync::Arc;

use codebox_agent_schema::{AgentEvent, RunOutcome};
use codebox_error::AgentError;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::model::{
    ChatMessage, ModelEvent, ModelGateway, ModelRequest, ModelStream, ToolCallRequest,
    ToolDefinition,
};
use crate::tools::{ToolOutcome, ToolSet};

pub const MAX_STEPS: usize = 6;

pub const SYSTEM_INSTRUCTIONS: &str = "You are a precise assistant that solves tasks by \
writing and running code. Use runInSandbox to execute Node.js for any calculation, data \
processing or verification; print results with console.log and only rely on what the \
script outputs. Use fetchJson to read public JSON APIs when the task needs live data. \
If a tool reports an error, fix the cause and try again. When you have the result, answer \
briefly in plain text.";

/// Lazily evaluated, single-use sequence of loop events. An `Err` item ends
/// the run.
pub type AgentEventStream = BoxStream<'static, Result<AgentEvent, AgentError>>;

#[derive(Debug, Clone)]
pub struct ToolLoop {
    model: Arc<dyn ModelGateway>,
    tools: ToolSet,
    model_id: String,
    max_steps: usize,
}

impl ToolLoop {
    pub fn new(model: Arc<dyn ModelGateway>, tools: ToolSet, model_id: impl Into<String>) -> Self {
        Self {
            model,
            tools,
            model_id: model_id.into(),
            max_steps: MAX_STEPS,
        }
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }

    /// Nothing runs until the returned stream is polled.
    pub fn run(self, prompt: &str) -> AgentEventStream {
        let definitions = self.tools.definitions();
        let state = RunState {
            messages: vec![
                ChatMessage::System {
                    content: SYSTEM_INSTRUCTIONS.to_string(),
                },
                ChatMessage::User {
                    content: prompt.to_string(),
                },
            ],
            definitions,
            steps: 0,
            phase: Phase::Idle,
            queued: VecDeque::new(),
            tool_loop: self,
        };
        stream::unfold(state, RunState::advance).boxed()
    }
}

enum Phase {
    Idle,
    Generating {
        stream: ModelStream,
        text: String,
        calls: Vec<ToolCallRequest>,
    },
    ExecutingTools {
        pending: VecDeque<ToolCallRequest>,
        current: Option<ToolCallRequest>,
    },
    Finished,
}

struct RunState {
    tool_loop: ToolLoop,
    definitions: Vec<ToolDefinition>,
    messages: Vec<ChatMessage>,
    steps: usize,
    phase: Phase,
    queued: VecDeque<AgentEvent>,
}

impl RunState {
    async fn advance(mut self) -> Option<(Result<AgentEvent, AgentError>, Self)> {
        loop {
            if let Some(event) = self.queued.pop_front() {
                return Some((Ok(event), self));
            }
            match std::mem::replace(&mut self.phase, Phase::Finished) {
                Phase::Idle => {
                    self.steps += 1;
                    debug!(step = self.steps, "model turn");
                    let request = ModelRequest {
                        model: self.tool_loop.model_id.clone(),
                        messages: self.messages.clone(),
                        tools: self.definitions.clone(),
                    };
                    match self.tool_loop.model.stream_turn(request).await {
                        Ok(stream) => {
                            self.phase = Phase::Generating {
                                stream,
                                text: String::new(),
                                calls: Vec::new(),
                            };
                        }
                        Err(err) => {
                            warn!(step = self.steps, error = %err, "model turn failed");
                            let message = err.to_string();
                            let err = if self.steps > 1 {
                                AgentError::StreamFailure { message }
                            } else {
                                AgentError::Orchestration { message }
                            };
                            return Some((Err(err), self));
                        }
                    }
                }
                Phase::Generating {
                    mut stream,
                    mut text,
                    mut calls,
                } => match stream.next().await {
                    Some(Ok(ModelEvent::TextDelta(delta))) => {
                        text.push_str(&delta);
                        self.phase = Phase::Generating {
                            stream,
                            text,
                            calls,
                        };
                        return Some((Ok(AgentEvent::TextDelta { text: delta }), self));
                    }
                    Some(Ok(ModelEvent::ToolCall(call))) => {
                        calls.push(call);
                        self.phase = Phase::Generating {
                            stream,
                            text,
                            calls,
                        };
                    }
                    Some(Ok(ModelEvent::Finish { .. })) | None => self.end_turn(text, calls),
                    Some(Err(err)) => {
                        warn!(step = self.steps, error = %err, "model stream failed");
                        let err = AgentError::StreamFailure {
                            message: err.to_string(),
                        };
                        return Some((Err(err), self));
                    }
                },
                Phase::ExecutingTools {
                    mut pending,
                    current: None,
                } => match pending.pop_front() {
                    Some(call) => {
                        let event = AgentEvent::ToolCall {
                            call_id: call.call_id.clone(),
                            tool_name: call.tool_name.clone(),
                            input: call.input.clone(),
                        };
                        self.phase = Phase::ExecutingTools {
                            pending,
                            current: Some(call),
                        };
                        return Some((Ok(event), self));
                    }
                    None => self.end_step(),
                },
                Phase::ExecutingTools {
                    pending,
                    current: Some(call),
                } => {
                    let outcome = self.tool_loop.tools.dispatch(&call).await;
                    self.messages.push(ChatMessage::Tool {
                        call_id: call.call_id.clone(),
                        content: outcome.to_model_content(),
                    });
                    self.phase = Phase::ExecutingTools {
                        pending,
                        current: None,
                    };
                    return Some((Ok(outcome_event(call, outcome)), self));
                }
                Phase::Finished => return None,
            }
        }
    }

    fn end_turn(&mut self, text: String, calls: Vec<ToolCallRequest>) {
        self.messages.push(ChatMessage::Assistant {
            content: (!text.is_empty()).then_some(text),
            tool_calls: calls.clone(),
        });
        if calls.is_empty() {
            info!(steps = self.steps, "agent run finished");
            self.queued.push_back(AgentEvent::Finish {
                outcome: RunOutcome::Done,
                steps: self.steps,
            });
            self.phase = Phase::Finished;
            return;
        }
        debug!(step = self.steps, calls = calls.len(), "executing tool calls");
        self.phase = Phase::ExecutingTools {
            pending: calls.into(),
            current: None,
        };
    }

    fn end_step(&mut self) {
        if self.steps >= self.tool_loop.max_steps {
            info!(steps = self.steps, "agent run hit step budget");
            self.queued.push_back(AgentEvent::Finish {
                outcome: RunOutcome::StepBudgetExceeded,
                steps: self.steps,
            });
            self.phase = Phase::Finished;
        } else {
            self.phase = Phase::Idle;
        }
    }
}

fn outcome_event(call: ToolCallRequest, outcome: ToolOutcome) -> AgentEvent {
    match outcome {
        ToolOutcome::Output(output) => AgentEvent::ToolResult {
            call_id: call.call_id,
            tool_name: call.tool_name,
            output,
        },
        ToolOutcome::Failed(error) => AgentEvent::ToolError {
            call_id: Some(call.call_id),
            tool_name: Some(call.tool_name),
            error,
        },
        ToolOutcome::Denied(reason) => AgentEvent::ToolOutputDenied {
            call_id: call.call_id,
            tool_name: call.tool_name,
            reason,
        },
    }
}
