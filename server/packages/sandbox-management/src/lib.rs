//! Lifecycle management for the disposable execution environments that
//! generated code runs in.

pub mod backend;
pub mod error;
pub mod http;
pub mod http_client;
pub mod process;
pub mod sandbox;

pub use backend::{CommandOutput, CommandSpec, RuntimeSpec, SandboxBackend, SandboxSession};
pub use error::SandboxError;
pub use http::HttpSandboxBackend;
pub use process::ProcessSandboxBackend;
pub use sandbox::Sandbox;
