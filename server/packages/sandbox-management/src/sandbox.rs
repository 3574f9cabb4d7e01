use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::backend::{CommandOutput, CommandSpec, RuntimeSpec, SandboxBackend, SandboxSession};
use crate::error::SandboxError;

/// Request-scoped handle to one sandbox.
///
/// Clones share the same environment. `stop` tears it down at most once no
/// matter how many clones call it; if every clone is dropped before a stop,
/// the teardown is scheduled on the current tokio runtime.
#[derive(Debug, Clone)]
pub struct Sandbox {
    inner: Arc<SandboxInner>,
}

#[derive(Debug)]
struct SandboxInner {
    session: Arc<dyn SandboxSession>,
    stopped: AtomicBool,
}

impl Sandbox {
    pub async fn create(
        backend: &dyn SandboxBackend,
        spec: &RuntimeSpec,
    ) -> Result<Self, SandboxError> {
        let session = backend.create(spec).await?;
        info!(
            sandbox_id = session.id(),
            runtime = %spec.runtime,
            timeout_ms = spec.timeout.as_millis() as u64,
            "sandbox created"
        );
        Ok(Self::from_session(session))
    }

    pub fn from_session(session: Box<dyn SandboxSession>) -> Self {
        Self {
            inner: Arc::new(SandboxInner {
                session: Arc::from(session),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> &str {
        self.inner.session.id()
    }

    pub fn working_dir(&self) -> &str {
        self.inner.session.working_dir()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    pub async fn run(&self, command: CommandSpec) -> Result<CommandOutput, SandboxError> {
        if self.is_stopped() {
            return Err(SandboxError::Stopped {
                sandbox_id: self.id().to_string(),
            });
        }
        let command = if command.cwd.is_none() {
            command.cwd(self.working_dir())
        } else {
            command
        };
        debug!(sandbox_id = self.id(), command = %command, "sandbox command");
        let output = self.inner.session.run(&command).await?;
        debug!(
            sandbox_id = self.id(),
            exit_code = output.exit_code,
            "sandbox command finished"
        );
        Ok(output)
    }

    /// Tears the sandbox down. Only the first call reaches the backend;
    /// failures are logged and swallowed.
    pub async fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        stop_session(self.inner.session.as_ref()).await;
    }

    /// Same as [`Sandbox::stop`] without waiting for the backend.
    pub fn stop_in_background(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        spawn_stop(self.inner.session.clone());
    }
}

impl Drop for SandboxInner {
    fn drop(&mut self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!(
            sandbox_id = self.session.id(),
            "sandbox dropped without stop, scheduling teardown"
        );
        spawn_stop(self.session.clone());
    }
}

fn spawn_stop(session: Arc<dyn SandboxSession>) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                stop_session(session.as_ref()).await;
            });
        }
        Err(_) => {
            warn!(
                sandbox_id = session.id(),
                "no async runtime available, sandbox left to backend timeout"
            );
        }
    }
}

async fn stop_session(session: &dyn SandboxSession) {
    match session.stop().await {
        Ok(()) => info!(sandbox_id = session.id(), "sandbox stopped"),
        Err(err) => warn!(sandbox_id = session.id(), error = %err, "failed to stop sandbox"),
    }
}
