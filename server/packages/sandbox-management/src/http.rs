use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::backend::{CommandOutput, CommandSpec, RuntimeSpec, SandboxBackend, SandboxSession};
use crate::error::SandboxError;
use crate::http_client::client_builder;

const DEFAULT_WORKING_DIR: &str = "/workspace";

/// Client for a remote sandbox service.
///
/// Endpoints, all authenticated with a bearer token:
/// `POST /v1/sandboxes`, `POST /v1/sandboxes/{id}/commands`,
/// `POST /v1/sandboxes/{id}/stop`.
#[derive(Debug, Clone)]
pub struct HttpSandboxBackend {
    base_url: String,
    token: String,
    client: Client,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateSandboxRequest<'a> {
    runtime: &'a str,
    timeout_ms: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSandboxResponse {
    id: String,
    #[serde(default)]
    working_dir: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RunCommandRequest<'a> {
    cmd: &'a str,
    args: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    cwd: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunCommandResponse {
    exit_code: i32,
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
}

impl HttpSandboxBackend {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self, SandboxError> {
        let client = client_builder().build()?;
        Ok(Self::with_client(base_url, token, client))
    }

    pub fn with_client(base_url: impl Into<String>, token: impl Into<String>, client: Client) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            client,
        }
    }
}

#[async_trait]
impl SandboxBackend for HttpSandboxBackend {
    async fn create(&self, spec: &RuntimeSpec) -> Result<Box<dyn SandboxSession>, SandboxError> {
        let url = format!("{}/v1/sandboxes", self.base_url);
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.token)
            .json(&CreateSandboxRequest {
                runtime: &spec.runtime,
                timeout_ms: spec.timeout.as_millis() as u64,
            })
            .send()
            .await
            .map_err(|err| SandboxError::BackendUnavailable {
                message: err.to_string(),
            })?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(SandboxError::BackendUnavailable {
                message: format!("create failed {status}: {body}"),
            });
        }
        let created: CreateSandboxResponse =
            response.json().await.map_err(|err| SandboxError::Protocol {
                message: err.to_string(),
            })?;
        Ok(Box::new(HttpSandboxSession {
            id: created.id,
            working_dir: created
                .working_dir
                .unwrap_or_else(|| DEFAULT_WORKING_DIR.to_string()),
            base_url: self.base_url.clone(),
            token: self.token.clone(),
            client: self.client.clone(),
        }))
    }
}

#[derive(Debug)]
struct HttpSandboxSession {
    id: String,
    working_dir: String,
    base_url: String,
    token: String,
    client: Client,
}

#[async_trait]
impl SandboxSession for HttpSandboxSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn working_dir(&self) -> &str {
        &self.working_dir
    }

    async fn run(&self, command: &CommandSpec) -> Result<CommandOutput, SandboxError> {
        let url = format!("{}/v1/sandboxes/{}/commands", self.base_url, self.id);
        let response = self
            .client
            .post(url)
            .bearer_auth(&self.token)
            .json(&RunCommandRequest {
                cmd: &command.command,
                args: &command.args,
                cwd: command.cwd.as_deref(),
            })
            .send()
            .await?;
        match response.status() {
            status if status.is_success() => {}
            StatusCode::GONE => {
                return Err(SandboxError::Stopped {
                    sandbox_id: self.id.clone(),
                })
            }
            StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
                return Err(SandboxError::CommandFailed {
                    message: format!("command `{command}` timed out"),
                })
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                return Err(SandboxError::CommandFailed {
                    message: format!("command `{command}` failed {status}: {body}"),
                });
            }
        }
        let output: RunCommandResponse =
            response.json().await.map_err(|err| SandboxError::Protocol {
                message: err.to_string(),
            })?;
        Ok(CommandOutput {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.exit_code,
        })
    }

    async fn stop(&self) -> Result<(), SandboxError> {
        let url = format!("{}/v1/sandboxes/{}/stop", self.base_url, self.id);
        let response = self.client.post(url).bearer_auth(&self.token).send().await?;
        // Already gone counts as stopped.
        if response.status().is_success() || response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(SandboxError::Protocol {
            message: format!("stop failed {status}: {body}"),
        })
    }
}
