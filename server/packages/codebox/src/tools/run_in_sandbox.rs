use std::sync::OnceLock;

use codebox_sandbox_management::{CommandOutput, CommandSpec, Sandbox, SandboxError};
use schemars::JsonSchema;
use serde::Deserialize;
use tracing::{info, warn};

pub const MAX_CODE_CHARS: usize = 6000;
pub const MAX_PACKAGES: usize = 5;
pub const NO_OUTPUT_MESSAGE: &str = "Code executed successfully but produced no output.";

const PACKAGE_NAME_PATTERN: &str = "^[a-zA-Z0-9@/._-]+$";
static PACKAGE_NAME: OnceLock<Result<regress::Regex, String>> = OnceLock::new();

fn package_name_pattern() -> Result<&'static regress::Regex, String> {
    PACKAGE_NAME
        .get_or_init(|| {
            regress::Regex::new(PACKAGE_NAME_PATTERN)
                .map_err(|err| format!("package name pattern: {err}"))
        })
        .as_ref()
        .map_err(Clone::clone)
}

const NPM_INSTALL_FLAGS: [&str; 4] = [
    "--no-audit",
    "--no-fund",
    "--no-progress",
    "--loglevel=error",
];

#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct RunInSandboxInput {
    /// Node.js source to execute. Print the answer with console.log.
    #[schemars(length(min = 1, max = 6000))]
    pub code: String,
    /// npm packages to install before running, e.g. "lodash" or "@scope/pkg".
    #[serde(default)]
    #[schemars(length(max = 5))]
    pub packages: Option<Vec<String>>,
}

impl RunInSandboxInput {
    pub fn validate(&self) -> Result<(), String> {
        let code_chars = self.code.chars().count();
        if code_chars == 0 {
            return Err("code must not be empty".to_string());
        }
        if code_chars > MAX_CODE_CHARS {
            return Err(format!("code must be at most {MAX_CODE_CHARS} characters"));
        }
        let packages = self.packages();
        if packages.len() > MAX_PACKAGES {
            return Err(format!("at most {MAX_PACKAGES} packages may be installed"));
        }
        if packages.is_empty() {
            return Ok(());
        }
        let pattern = package_name_pattern()?;
        match packages
            .iter()
            .find(|name| pattern.find(name).is_none())
        {
            Some(name) => Err(format!("invalid package name: {name}")),
            None => Ok(()),
        }
    }

    pub fn packages(&self) -> &[String] {
        self.packages.as_deref().unwrap_or_default()
    }
}

/// Executes model-written scripts in the request's sandbox.
///
/// Every failure comes back as text for the model to read; nothing here
/// returns an error to the tool loop.
#[derive(Debug, Clone)]
pub struct SandboxRunner {
    sandbox: Sandbox,
}

impl SandboxRunner {
    pub fn new(sandbox: Sandbox) -> Self {
        Self { sandbox }
    }

    pub async fn run(&self, input: &RunInSandboxInput) -> String {
        let packages = input.packages();
        if !packages.is_empty() {
            if let Err(message) = self.install(packages).await {
                return message;
            }
        }

        let script = CommandSpec::new("node").arg("-e").arg(&input.code);
        match self.sandbox.run(script).await {
            Ok(output) => render_output(&output),
            Err(err) => {
                warn!(sandbox_id = self.sandbox.id(), error = %err, "script did not run");
                format!("Execution error: {err}")
            }
        }
    }

    async fn install(&self, packages: &[String]) -> Result<(), String> {
        info!(
            sandbox_id = self.sandbox.id(),
            packages = %packages.join(" "),
            "installing packages"
        );
        let init = CommandSpec::new("npm").args(["init", "-y"]);
        check_install_step(self.sandbox.run(init).await)?;

        let install = CommandSpec::new("npm")
            .arg("install")
            .args(NPM_INSTALL_FLAGS)
            .args(packages.iter().cloned());
        check_install_step(self.sandbox.run(install).await)
    }
}

fn check_install_step(
    result: Result<CommandOutput, SandboxError>,
) -> Result<(), String> {
    match result {
        Ok(output) if output.success() => Ok(()),
        Ok(output) => {
            let detail = first_non_empty(&[&output.stderr, &output.stdout])
                .map(str::to_string)
                .unwrap_or_else(|| format!("npm exited with code {}", output.exit_code));
            Err(format!("Package installation failed: {detail}"))
        }
        Err(err) => Err(format!("Package installation failed: {err}")),
    }
}

fn render_output(output: &CommandOutput) -> String {
    if !output.success() {
        let detail = first_non_empty(&[&output.stderr, &output.stdout])
            .map(str::to_string)
            .unwrap_or_else(|| format!("process exited with code {}", output.exit_code));
        return format!("Execution error: {detail}");
    }
    first_non_empty(&[&output.stdout, &output.stderr])
        .unwrap_or(NO_OUTPUT_MESSAGE)
        .to_string()
}

fn first_non_empty<'a>(candidates: &[&'a String]) -> Option<&'a str> {
    candidates
        .iter()
        .copied()
        .map(|text| text.trim())
        .find(|text| !text.is_empty())
}
