//! Engine configuration from the environment.
//!
//! `.env` files are honored via dotenv in main. Only the store URL is
//! strictly required to boot; a missing internal key or model key fails
//! the affected instance at runtime instead, mirroring how the workflow
//! treats missing secrets as non-retriable.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use relay_sdk::EngineError;

use crate::retry::RetryPolicy;
use crate::workflows::process_message::WorkflowSettings;

const DEFAULT_MODEL: &str = "claude-3-5-sonnet-latest";

#[derive(Debug, Clone)]
pub struct Config {
    pub store_base_url: String,
    pub internal_key: Option<String>,
    pub model_api_key: Option<String>,
    pub model_base_url: Option<String>,
    pub model: String,
    pub max_iterations: u32,
    pub history_limit: usize,
    pub debounce_ms: u64,
    pub journal_path: PathBuf,
    pub retry: RetryPolicy,
}

impl Config {
    pub fn from_env() -> Result<Self, EngineError> {
        let store_base_url = required("RELAY_STORE_URL")?;

        Ok(Self {
            store_base_url,
            internal_key: optional("RELAY_INTERNAL_KEY"),
            model_api_key: optional("ANTHROPIC_API_KEY"),
            model_base_url: optional("RELAY_MODEL_URL"),
            model: optional("RELAY_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            max_iterations: parsed("RELAY_MAX_ITERATIONS", 10)?,
            history_limit: parsed("RELAY_HISTORY_LIMIT", 20)?,
            debounce_ms: parsed("RELAY_DEBOUNCE_MS", 0)?,
            journal_path: optional("RELAY_JOURNAL_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("relay.db")),
            retry: RetryPolicy::default()
                .with_max_attempts(parsed("RELAY_RETRY_MAX_ATTEMPTS", 4)?),
        })
    }

    pub fn workflow_settings(&self) -> WorkflowSettings {
        WorkflowSettings {
            internal_key: self.internal_key.clone(),
            max_iterations: self.max_iterations,
            history_limit: self.history_limit,
            debounce: Duration::from_millis(self.debounce_ms),
            ..WorkflowSettings::default()
        }
    }
}

fn optional(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn required(name: &str) -> Result<String, EngineError> {
    optional(name).ok_or_else(|| EngineError::Config(format!("{name} is not set")))
}

fn parsed<T: FromStr>(name: &str, default: T) -> Result<T, EngineError> {
    match optional(name) {
        Some(raw) => raw
            .parse()
            .map_err(|_| EngineError::Config(format!("{name} has an invalid value: '{raw}'"))),
        None => Ok(default),
    }
}
