use thiserror::Error;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("sandbox backend unavailable: {message}")]
    BackendUnavailable { message: String },
    #[error("sandbox command could not be started: {message}")]
    CommandFailed { message: String },
    #[error("sandbox lifetime of {timeout_ms}ms exceeded")]
    Timeout { timeout_ms: u64 },
    #[error("sandbox {sandbox_id} is already stopped")]
    Stopped { sandbox_id: String },
    #[error("unexpected sandbox response: {message}")]
    Protocol { message: String },
    #[error("sandbox transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
