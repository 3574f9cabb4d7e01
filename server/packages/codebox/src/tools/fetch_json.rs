use std::time::Duration;

use codebox_sandbox_management::http_client::client_builder;
use futures::StreamExt;
use reqwest::header::ACCEPT;
use reqwest::redirect::Policy;
use reqwest::Client;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::net_filter;

pub const MAX_RESPONSE_CHARS: usize = 200_000;
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_REDIRECTS: usize = 5;

#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct FetchJsonInput {
    /// Absolute http(s) URL that returns JSON.
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FetchedJson {
    pub url: String,
    pub status: u16,
    pub data: Value,
}

impl FetchedJson {
    pub fn into_value(self) -> Value {
        serde_json::json!({
            "url": self.url,
            "status": self.status,
            "data": self.data,
        })
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid url {url}: {message}")]
    InvalidUrl { url: String, message: String },
    #[error("request blocked by network policy: {url}")]
    RequestDenied { url: String },
    #[error("request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("upstream responded with status {status}")]
    UpstreamError { status: u16 },
    #[error("response exceeds {limit} characters")]
    ResponseTooLarge { limit: usize },
    #[error("response is not valid JSON: {message}")]
    InvalidJson { message: String },
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

/// GETs JSON documents on behalf of the model.
///
/// Every URL, including each redirect hop, goes through the same allow
/// policy. A refused hop stops redirect handling, which then surfaces as a
/// non-2xx upstream status.
#[derive(Debug, Clone)]
pub struct JsonFetcher {
    client: Client,
    policy: fn(&Url) -> bool,
    timeout: Duration,
}

impl JsonFetcher {
    pub fn new() -> Result<Self, FetchError> {
        Self::with_policy(net_filter::is_allowed_url)
    }

    pub fn with_policy(policy: fn(&Url) -> bool) -> Result<Self, FetchError> {
        let redirect = Policy::custom(move |attempt| {
            if attempt.previous().len() >= MAX_REDIRECTS {
                attempt.error("too many redirects")
            } else if policy(attempt.url()) {
                attempt.follow()
            } else {
                warn!(url = %attempt.url(), "redirect blocked by network policy");
                attempt.stop()
            }
        });
        let client = client_builder().redirect(redirect).build()?;
        Ok(Self {
            client,
            policy,
            timeout: FETCH_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn fetch(&self, raw_url: &str) -> Result<FetchedJson, FetchError> {
        let url = Url::parse(raw_url).map_err(|err| FetchError::InvalidUrl {
            url: raw_url.to_string(),
            message: err.to_string(),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(FetchError::InvalidUrl {
                url: raw_url.to_string(),
                message: format!("unsupported scheme {}", url.scheme()),
            });
        }
        if !(self.policy)(&url) {
            warn!(url = %url, "fetch blocked by network policy");
            return Err(FetchError::RequestDenied {
                url: raw_url.to_string(),
            });
        }

        match tokio::time::timeout(self.timeout, self.get(url)).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout {
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        }
    }

    async fn get(&self, url: Url) -> Result<FetchedJson, FetchError> {
        debug!(url = %url, "fetching json");
        let response = self
            .client
            .get(url.clone())
            .header(ACCEPT, "application/json")
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|err| self.transport_error(err))?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::UpstreamError {
                status: status.as_u16(),
            });
        }

        // Bytes bound the download early; the character count decides.
        let byte_limit = MAX_RESPONSE_CHARS * 4;
        let mut body = Vec::new();
        let mut chunks = response.bytes_stream();
        while let Some(chunk) = chunks.next().await {
            let chunk = chunk.map_err(|err| self.transport_error(err))?;
            body.extend_from_slice(&chunk);
            if body.len() > byte_limit {
                return Err(FetchError::ResponseTooLarge {
                    limit: MAX_RESPONSE_CHARS,
                });
            }
        }
        let text = String::from_utf8_lossy(&body);
        if text.chars().count() > MAX_RESPONSE_CHARS {
            return Err(FetchError::ResponseTooLarge {
                limit: MAX_RESPONSE_CHARS,
            });
        }
        let data: Value = serde_json::from_str(&text).map_err(|err| FetchError::InvalidJson {
            message: err.to_string(),
        })?;

        Ok(FetchedJson {
            url: url.to_string(),
            status: status.as_u16(),
            data,
        })
    }

    fn transport_error(&self, err: reqwest::Error) -> FetchError {
        if err.is_timeout() {
            return FetchError::Timeout {
                timeout_ms: self.timeout.as_millis() as u64,
            };
        }
        FetchError::Transport(err)
    }
}
