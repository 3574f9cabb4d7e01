//! The fixed tool set offered to the model.

use std::fmt;

use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::model::{ToolCallRequest, ToolDefinition};

mod fetch_json;
mod run_in_sandbox;

pub use fetch_json::{FetchError, FetchJsonInput, FetchedJson, JsonFetcher, MAX_RESPONSE_CHARS};
pub use run_in_sandbox::{
    RunInSandboxInput, SandboxRunner, MAX_CODE_CHARS, MAX_PACKAGES, NO_OUTPUT_MESSAGE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolName {
    FetchJson,
    RunInSandbox,
}

impl ToolName {
    pub fn all() -> [ToolName; 2] {
        [ToolName::FetchJson, ToolName::RunInSandbox]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ToolName::FetchJson => "fetchJson",
            ToolName::RunInSandbox => "runInSandbox",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "fetchJson" => Some(ToolName::FetchJson),
            "runInSandbox" => Some(ToolName::RunInSandbox),
            _ => None,
        }
    }

    fn description(self) -> &'static str {
        match self {
            ToolName::FetchJson => {
                "Fetch JSON from a public http(s) URL. Private, loopback and link-local \
                 addresses are refused. Returns {url, status, data}."
            }
            ToolName::RunInSandbox => {
                "Run a Node.js script in an isolated, disposable sandbox and return its \
                 output. Print results with console.log. Optionally install up to 5 npm \
                 packages first."
            }
        }
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a tool call produced, from the model's point of view.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    Output(Value),
    Failed(String),
    /// The call was refused by policy before anything ran.
    Denied(String),
}

impl ToolOutcome {
    /// Text sent back to the model as the tool message.
    pub fn to_model_content(&self) -> String {
        match self {
            ToolOutcome::Output(Value::String(text)) => text.clone(),
            ToolOutcome::Output(value) => value.to_string(),
            ToolOutcome::Failed(message) => format!("Error: {message}"),
            ToolOutcome::Denied(message) => format!("Denied: {message}"),
        }
    }
}

/// Tools bound to one request's sandbox.
#[derive(Debug, Clone)]
pub struct ToolSet {
    fetcher: JsonFetcher,
    runner: SandboxRunner,
}

impl ToolSet {
    pub fn new(fetcher: JsonFetcher, runner: SandboxRunner) -> Self {
        Self { fetcher, runner }
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        ToolName::all()
            .into_iter()
            .map(|name| ToolDefinition {
                name: name.as_str(),
                description: name.description(),
                parameters: match name {
                    ToolName::FetchJson => input_schema::<FetchJsonInput>(),
                    ToolName::RunInSandbox => input_schema::<RunInSandboxInput>(),
                },
            })
            .collect()
    }

    pub async fn dispatch(&self, call: &ToolCallRequest) -> ToolOutcome {
        let Some(name) = ToolName::parse(&call.tool_name) else {
            warn!(tool = %call.tool_name, "model requested unknown tool");
            return ToolOutcome::Failed(format!("unknown tool: {}", call.tool_name));
        };
        debug!(tool = %name, call_id = %call.call_id, "dispatching tool call");
        match name {
            ToolName::FetchJson => {
                let input: FetchJsonInput = match parse_input(name, &call.input) {
                    Ok(input) => input,
                    Err(outcome) => return outcome,
                };
                match self.fetcher.fetch(&input.url).await {
                    Ok(fetched) => ToolOutcome::Output(fetched.into_value()),
                    Err(err @ FetchError::RequestDenied { .. }) => {
                        ToolOutcome::Denied(err.to_string())
                    }
                    Err(err) => ToolOutcome::Failed(err.to_string()),
                }
            }
            ToolName::RunInSandbox => {
                let input: RunInSandboxInput = match parse_input(name, &call.input) {
                    Ok(input) => input,
                    Err(outcome) => return outcome,
                };
                if let Err(message) = input.validate() {
                    return ToolOutcome::Failed(format!("invalid input for {name}: {message}"));
                }
                ToolOutcome::Output(Value::String(self.runner.run(&input).await))
            }
        }
    }
}

fn parse_input<T: DeserializeOwned>(name: ToolName, input: &Value) -> Result<T, ToolOutcome> {
    serde_json::from_value(input.clone())
        .map_err(|err| ToolOutcome::Failed(format!("invalid input for {name}: {err}")))
}

fn input_schema<T: JsonSchema>() -> Value {
    let schema = schemars::schema_for!(T);
    let mut value = serde_json::to_value(schema).unwrap_or_else(|_| {
        serde_json::json!({ "type": "object" })
    });
    if let Some(object) = value.as_object_mut() {
        object.remove("$schema");
        object.remove("title");
    }
    value
}
