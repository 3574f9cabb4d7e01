//! Request-level error taxonomy shared by the codebox crates.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorType {
    Validation,
    Configuration,
    BackendUnavailable,
    Orchestration,
    StreamFailure,
    NotFound,
}

/// JSON body returned for every non-streaming failure: `{"error": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ErrorBody {
    pub error: String,
}

#[derive(Debug, Clone, Error)]
pub enum AgentError {
    #[error("{message}")]
    Validation { message: String },
    #[error("server is missing required configuration: {name}")]
    Configuration { name: String },
    #[error("sandbox backend unavailable: {message}")]
    BackendUnavailable { message: String },
    #[error("agent run failed: {message}")]
    Orchestration { message: String },
    #[error("stream failed: {message}")]
    StreamFailure { message: String },
    #[error("Trace not found.")]
    TraceNotFound { trace_id: String },
}

impl AgentError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn error_type(&self) -> ErrorType {
        match self {
            AgentError::Validation { .. } => ErrorType::Validation,
            AgentError::Configuration { .. } => ErrorType::Configuration,
            AgentError::BackendUnavailable { .. } => ErrorType::BackendUnavailable,
            AgentError::Orchestration { .. } => ErrorType::Orchestration,
            AgentError::StreamFailure { .. } => ErrorType::StreamFailure,
            AgentError::TraceNotFound { .. } => ErrorType::NotFound,
        }
    }

    /// HTTP status the router answers with when this error is raised before
    /// any response bytes were committed.
    pub fn status_code(&self) -> u16 {
        match self.error_type() {
            ErrorType::Validation => 400,
            ErrorType::NotFound => 404,
            ErrorType::Configuration
            | ErrorType::BackendUnavailable
            | ErrorType::Orchestration
            | ErrorType::StreamFailure => 500,
        }
    }

    pub fn to_error_body(&self) -> ErrorBody {
        ErrorBody {
            error: self.to_string(),
        }
    }
}
