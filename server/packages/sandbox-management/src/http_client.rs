use std::env;

use reqwest::ClientBuilder;

const NO_SYSTEM_PROXY_ENV: &str = "CODEBOX_NO_SYSTEM_PROXY";
const USER_AGENT: &str = concat!("codebox/", env!("CARGO_PKG_VERSION"));

fn is_enabled(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Base builder for every outbound client: sandbox service, model gateway and
/// the JSON fetch tool. Set `CODEBOX_NO_SYSTEM_PROXY=1` to ignore proxy
/// settings from the environment.
pub fn client_builder() -> ClientBuilder {
    let builder = reqwest::Client::builder().user_agent(USER_AGENT);
    let no_proxy = env::var(NO_SYSTEM_PROXY_ENV)
        .map(|value| is_enabled(&value))
        .unwrap_or(false);
    if no_proxy {
        builder.no_proxy()
    } else {
        builder
    }
}
