//! URL fetcher tool.
//!
//! Network failures here are tool errors, not transient instance errors:
//! an unreachable user-supplied URL is something the agent should see and
//! work around, not something the executor should retry into a failed
//! instance.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use relay_sdk::EngineError;

use super::{parse_args, Tool};

/// Response bodies are truncated to keep the agent context bounded.
const MAX_BODY_CHARS: usize = 16_384;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

pub struct FetchUrl {
    client: reqwest::Client,
}

impl FetchUrl {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for FetchUrl {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Deserialize)]
struct FetchUrlArgs {
    url: String,
}

#[async_trait]
impl Tool for FetchUrl {
    fn name(&self) -> &str {
        "fetch_url"
    }

    fn description(&self) -> &str {
        "Fetch a URL over HTTP(S) and return its status and body text"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "url": { "type": "string", "description": "http:// or https:// URL" }
            },
            "required": ["url"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, args: Value) -> Result<Value, EngineError> {
        let args: FetchUrlArgs = parse_args(self.name(), args)?;

        if !args.url.starts_with("http://") && !args.url.starts_with("https://") {
            return Err(EngineError::tool(
                self.name(),
                format!("unsupported URL scheme in '{}'", args.url),
            ));
        }

        let response = self
            .client
            .get(&args.url)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| EngineError::tool(self.name(), format!("request failed: {e}")))?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| EngineError::tool(self.name(), format!("failed to read body: {e}")))?;

        let truncated = body.len() > MAX_BODY_CHARS;
        let body: String = body.chars().take(MAX_BODY_CHARS).collect();

        Ok(json!({
            "status": status,
            "body": body,
            "truncated": truncated,
        }))
    }
}
