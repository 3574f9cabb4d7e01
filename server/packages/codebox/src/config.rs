use clap::{Parser, ValueEnum};
use codebox_error::AgentError;
use codebox_sandbox_management::backend::{RuntimeSpec, DEFAULT_RUNTIME};

pub const DEFAULT_MODEL: &str = "openai/gpt-4o-mini";
pub const DEFAULT_GATEWAY_URL: &str = "https://ai-gateway.vercel.sh/v1";
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 2468;

const GATEWAY_API_KEY_ENV: &str = "AI_GATEWAY_API_KEY";
const SANDBOX_URL_ENV: &str = "SANDBOX_API_URL";
const SANDBOX_TOKEN_ENV: &str = "SANDBOX_API_TOKEN";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SandboxBackendKind {
    /// Remote sandbox service over HTTP.
    Http,
    /// Local child processes in a temp directory. No isolation.
    Process,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Logfmt,
    Pretty,
}

#[derive(Debug, Parser)]
#[command(name = "codebox", bin_name = "codebox")]
#[command(about = "Answers prompts by letting a model run code in disposable sandboxes", version)]
pub struct Cli {
    #[arg(long, short = 'H', env = "CODEBOX_HOST", default_value = DEFAULT_HOST)]
    pub host: String,

    #[arg(long, short = 'p', env = "CODEBOX_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Model identifier passed to the gateway.
    #[arg(long, env = "CODEBOX_MODEL", default_value = DEFAULT_MODEL)]
    pub model: String,

    /// Base URL of an OpenAI-compatible chat completions gateway.
    #[arg(long, env = "AI_GATEWAY_BASE_URL", default_value = DEFAULT_GATEWAY_URL)]
    pub gateway_url: String,

    #[arg(long, env = GATEWAY_API_KEY_ENV, hide_env_values = true)]
    pub gateway_api_key: Option<String>,

    #[arg(long, env = "CODEBOX_SANDBOX_BACKEND", value_enum, default_value_t = SandboxBackendKind::Http)]
    pub sandbox_backend: SandboxBackendKind,

    #[arg(long, env = SANDBOX_URL_ENV)]
    pub sandbox_url: Option<String>,

    #[arg(long, env = SANDBOX_TOKEN_ENV, hide_env_values = true)]
    pub sandbox_token: Option<String>,

    #[arg(long, env = "CODEBOX_SANDBOX_RUNTIME", default_value = DEFAULT_RUNTIME)]
    pub sandbox_runtime: String,

    #[arg(long, env = "CODEBOX_LOG_FORMAT", value_enum, default_value_t = LogFormat::Logfmt)]
    pub log_format: LogFormat,

    /// Disable per-request HTTP logging.
    #[arg(long)]
    pub no_http_log: bool,
}

impl Cli {
    pub fn agent_config(&self) -> AgentConfig {
        AgentConfig {
            model: self.model.clone(),
            gateway_url: self.gateway_url.clone(),
            gateway_api_key: non_empty(self.gateway_api_key.as_deref()),
            sandbox_backend: self.sandbox_backend,
            sandbox_url: non_empty(self.sandbox_url.as_deref()),
            sandbox_token: non_empty(self.sandbox_token.as_deref()),
            runtime: RuntimeSpec::new(self.sandbox_runtime.clone()),
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Resolved settings for serving agent requests.
///
/// Credentials are optional here; [`AgentConfig::check_credentials`] runs per
/// request so a misconfigured server still starts and answers with an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentConfig {
    pub model: String,
    pub gateway_url: String,
    pub gateway_api_key: Option<String>,
    pub sandbox_backend: SandboxBackendKind,
    pub sandbox_url: Option<String>,
    pub sandbox_token: Option<String>,
    pub runtime: RuntimeSpec,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            gateway_url: DEFAULT_GATEWAY_URL.to_string(),
            gateway_api_key: None,
            sandbox_backend: SandboxBackendKind::Http,
            sandbox_url: None,
            sandbox_token: None,
            runtime: RuntimeSpec::default(),
        }
    }
}

impl AgentConfig {
    pub fn with_gateway_api_key(mut self, key: impl Into<String>) -> Self {
        self.gateway_api_key = Some(key.into());
        self
    }

    pub fn with_sandbox_backend(mut self, kind: SandboxBackendKind) -> Self {
        self.sandbox_backend = kind;
        self
    }

    pub fn with_sandbox_service(mut self, url: impl Into<String>, token: impl Into<String>) -> Self {
        self.sandbox_url = Some(url.into());
        self.sandbox_token = Some(token.into());
        self
    }

    pub fn check_credentials(&self) -> Result<(), AgentError> {
        let missing = |name: &str| AgentError::Configuration {
            name: name.to_string(),
        };
        if self.gateway_api_key.is_none() {
            return Err(missing(GATEWAY_API_KEY_ENV));
        }
        if self.sandbox_backend == SandboxBackendKind::Http {
            if self.sandbox_url.is_none() {
                return Err(missing(SANDBOX_URL_ENV));
            }
            if self.sandbox_token.is_none() {
                return Err(missing(SANDBOX_TOKEN_ENV));
            }
        }
        Ok(())
    }
}
