use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::SandboxError;

pub const DEFAULT_RUNTIME: &str = "node22";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// What to allocate: a fixed runtime image and a hard wall-clock lifetime
/// enforced by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeSpec {
    pub runtime: String,
    pub timeout: Duration,
}

impl RuntimeSpec {
    pub fn new(runtime: impl Into<String>) -> Self {
        Self {
            runtime: runtime.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for RuntimeSpec {
    fn default() -> Self {
        Self::new(DEFAULT_RUNTIME)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<String>,
}

impl CommandSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.command)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Result of one command. A non-zero `exit_code` is data, not an error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[async_trait]
pub trait SandboxBackend: Send + Sync + fmt::Debug {
    async fn create(&self, spec: &RuntimeSpec) -> Result<Box<dyn SandboxSession>, SandboxError>;
}

/// A live environment allocated by a [`SandboxBackend`].
#[async_trait]
pub trait SandboxSession: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;

    fn working_dir(&self) -> &str;

    async fn run(&self, command: &CommandSpec) -> Result<CommandOutput, SandboxError>;

    async fn stop(&self) -> Result<(), SandboxError>;
}
