use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::ToSchema;

mod payload;

pub use payload::{cap_payload, MAX_SERIALIZED_LENGTH, TRUNCATION_MARKER};

/// How a finished agent run ended. Model/tool failures are not outcomes; they
/// surface as an error item on the event stream instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// The model answered without requesting further tool calls.
    Done,
    /// The step budget ran out while the model still wanted tools.
    StepBudgetExceeded,
}

/// Output of the tool loop, consumed once by the streaming adapter.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    TextDelta {
        text: String,
    },
    ToolCall {
        call_id: String,
        tool_name: String,
        input: Value,
    },
    ToolResult {
        call_id: String,
        tool_name: String,
        output: Value,
    },
    ToolError {
        call_id: Option<String>,
        tool_name: Option<String>,
        error: String,
    },
    ToolOutputDenied {
        call_id: String,
        tool_name: String,
        reason: String,
    },
    Finish {
        outcome: RunOutcome,
        steps: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TraceEvent {
    ToolCall {
        #[serde(rename = "callId")]
        call_id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
        #[schema(value_type = Object)]
        input: Value,
        timestamp: String,
    },
    ToolResult {
        #[serde(rename = "callId")]
        call_id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
        #[schema(value_type = Object)]
        output: Value,
        timestamp: String,
    },
    ToolError {
        #[serde(rename = "callId", default, skip_serializing_if = "Option::is_none")]
        call_id: Option<String>,
        #[serde(rename = "toolName", default, skip_serializing_if = "Option::is_none")]
        tool_name: Option<String>,
        error: String,
        timestamp: String,
    },
    ToolOutputDenied {
        #[serde(rename = "callId")]
        call_id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
        timestamp: String,
    },
}

impl TraceEvent {
    /// Mirrors a tool-related agent event into its trace form. Text deltas and
    /// the terminal finish marker are not traced.
    pub fn from_agent_event(event: &AgentEvent, timestamp: String) -> Option<Self> {
        match event {
            AgentEvent::ToolCall {
                call_id,
                tool_name,
                input,
            } => Some(TraceEvent::ToolCall {
                call_id: call_id.clone(),
                tool_name: tool_name.clone(),
                input: input.clone(),
                timestamp,
            }),
            AgentEvent::ToolResult {
                call_id,
                tool_name,
                output,
            } => Some(TraceEvent::ToolResult {
                call_id: call_id.clone(),
                tool_name: tool_name.clone(),
                output: output.clone(),
                timestamp,
            }),
            AgentEvent::ToolError {
                call_id,
                tool_name,
                error,
            } => Some(TraceEvent::ToolError {
                call_id: call_id.clone(),
                tool_name: tool_name.clone(),
                error: error.clone(),
                timestamp,
            }),
            AgentEvent::ToolOutputDenied {
                call_id, tool_name, ..
            } => Some(TraceEvent::ToolOutputDenied {
                call_id: call_id.clone(),
                tool_name: tool_name.clone(),
                timestamp,
            }),
            AgentEvent::TextDelta { .. } | AgentEvent::Finish { .. } => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TraceEvent::ToolCall { .. } => "tool-call",
            TraceEvent::ToolResult { .. } => "tool-result",
            TraceEvent::ToolError { .. } => "tool-error",
            TraceEvent::ToolOutputDenied { .. } => "tool-output-denied",
        }
    }

    pub fn tool_name(&self) -> Option<&str> {
        match self {
            TraceEvent::ToolCall { tool_name, .. }
            | TraceEvent::ToolResult { tool_name, .. }
            | TraceEvent::ToolOutputDenied { tool_name, .. } => Some(tool_name),
            TraceEvent::ToolError { tool_name, .. } => tool_name.as_deref(),
        }
    }

    /// Applies the payload cap to `tool-call` inputs and `tool-result`
    /// outputs. Other kinds are returned verbatim.
    pub fn capped(self) -> Self {
        match self {
            TraceEvent::ToolCall {
                call_id,
                tool_name,
                input,
                timestamp,
            } => TraceEvent::ToolCall {
                call_id,
                tool_name,
                input: cap_payload(input),
                timestamp,
            },
            TraceEvent::ToolResult {
                call_id,
                tool_name,
                output,
                timestamp,
            } => TraceEvent::ToolResult {
                call_id,
                tool_name,
                output: cap_payload(output),
                timestamp,
            },
            other => other,
        }
    }
}

/// One agent invocation as kept by the trace store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionTrace {
    pub id: String,
    pub prompt: String,
    pub model: String,
    pub sandbox_id: String,
    pub started_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    pub events: Vec<TraceEvent>,
}

impl ExecutionTrace {
    pub fn new(id: String, prompt: String, model: String, sandbox_id: String) -> Self {
        Self {
            id,
            prompt,
            model,
            sandbox_id,
            started_at: now_rfc3339(),
            finished_at: None,
            events: Vec::new(),
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.finished_at.is_none()
    }

    pub fn append(&mut self, event: TraceEvent) {
        self.events.push(event.capped());
    }

    /// Sets the finish timestamp. Returns `false` if it was already set.
    pub fn finish(&mut self) -> bool {
        if self.finished_at.is_some() {
            return false;
        }
        self.finished_at = Some(now_rfc3339());
        true
    }
}

pub fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}
