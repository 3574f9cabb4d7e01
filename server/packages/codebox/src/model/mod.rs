//! The language model as consumed by the tool loop: one streamed turn per
//! orchestrator step.

use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;
use thiserror::Error;

mod openai;
mod sse;

pub use openai::OpenAiCompatibleGateway;

pub type ModelStream = BoxStream<'static, Result<ModelEvent, ModelError>>;

#[derive(Debug, Clone, PartialEq)]
pub enum ModelEvent {
    TextDelta(String),
    ToolCall(ToolCallRequest),
    Finish { reason: FinishReason },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    pub call_id: String,
    pub tool_name: String,
    pub input: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    ToolCalls,
    Length,
    ContentFilter,
    Other(String),
}

impl FinishReason {
    pub fn parse(value: &str) -> Self {
        match value {
            "stop" => Self::Stop,
            "tool_calls" | "function_call" => Self::ToolCalls,
            "length" => Self::Length,
            "content_filter" => Self::ContentFilter,
            other => Self::Other(other.to_string()),
        }
    }
}

/// Conversation history replayed to the model on every step.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatMessage {
    System {
        content: String,
    },
    User {
        content: String,
    },
    Assistant {
        content: Option<String>,
        tool_calls: Vec<ToolCallRequest>,
    },
    Tool {
        call_id: String,
        content: String,
    },
}

/// A tool as advertised to the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDefinition {
    pub name: &'static str,
    pub description: &'static str,
    pub parameters: Value,
}

#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model gateway request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("model gateway returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid model stream payload: {0}")]
    Decode(String),
    #[error("model stream error: {0}")]
    Stream(String),
}

#[async_trait]
pub trait ModelGateway: Send + Sync + fmt::Debug {
    async fn stream_turn(&self, request: ModelRequest) -> Result<ModelStream, ModelError>;
}
