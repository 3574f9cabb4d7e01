use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::warn;

use crate::backend::{CommandOutput, CommandSpec, RuntimeSpec, SandboxBackend, SandboxSession};
use crate::error::SandboxError;

/// Runs commands as plain child processes inside a fresh temporary
/// directory. Provides no network or filesystem isolation; meant for local
/// development against a trusted model only.
#[derive(Debug, Clone, Default)]
pub struct ProcessSandboxBackend;

impl ProcessSandboxBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SandboxBackend for ProcessSandboxBackend {
    async fn create(&self, spec: &RuntimeSpec) -> Result<Box<dyn SandboxSession>, SandboxError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("codebox-");
        let dir = builder.tempdir().map_err(|err| SandboxError::BackendUnavailable {
            message: format!("failed to create sandbox directory: {err}"),
        })?;

        let name = dir
            .path()
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "codebox".to_string());
        warn!(
            sandbox_id = %name,
            runtime = %spec.runtime,
            "process sandbox backend provides no isolation"
        );

        Ok(Box::new(ProcessSandboxSession {
            id: name,
            working_dir: dir.path().to_string_lossy().to_string(),
            timeout: spec.timeout,
            deadline: Instant::now() + spec.timeout,
            dir: Mutex::new(Some(dir)),
        }))
    }
}

#[derive(Debug)]
struct ProcessSandboxSession {
    id: String,
    working_dir: String,
    timeout: Duration,
    deadline: Instant,
    dir: Mutex<Option<TempDir>>,
}

impl ProcessSandboxSession {
    fn resolve_cwd(&self, cwd: Option<&str>) -> PathBuf {
        let root = Path::new(&self.working_dir);
        match cwd {
            Some(cwd) if Path::new(cwd).starts_with(root) => PathBuf::from(cwd),
            Some(cwd) => root.join(cwd.trim_start_matches('/')),
            None => root.to_path_buf(),
        }
    }
}

#[async_trait]
impl SandboxSession for ProcessSandboxSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn working_dir(&self) -> &str {
        &self.working_dir
    }

    async fn run(&self, command: &CommandSpec) -> Result<CommandOutput, SandboxError> {
        let is_live = self
            .dir
            .lock()
            .map(|dir| dir.is_some())
            .unwrap_or(false);
        if !is_live {
            return Err(SandboxError::Stopped {
                sandbox_id: self.id.clone(),
            });
        }

        let remaining = self.deadline.saturating_duration_since(Instant::now());
        let timeout_ms = self.timeout.as_millis() as u64;
        if remaining.is_zero() {
            return Err(SandboxError::Timeout { timeout_ms });
        }

        let mut child = Command::new(&command.command);
        child
            .args(&command.args)
            .current_dir(self.resolve_cwd(command.cwd.as_deref()))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(remaining, child.output()).await {
            Ok(output) => output.map_err(|err| SandboxError::CommandFailed {
                message: format!("{}: {err}", command.command),
            })?,
            Err(_) => return Err(SandboxError::Timeout { timeout_ms }),
        };

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn stop(&self) -> Result<(), SandboxError> {
        let dir = match self.dir.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(dir) = dir {
            dir.close()?;
        }
        Ok(())
    }
}
