use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use relay::config::Config;
use relay::engine::Engine;
use relay::journal::Journal;
use relay::store::HttpProjectStore;
use relay::tools::builtin_registry;
use relay::workflows::process_message::ProcessMessage;
use relay_llm::HttpModelClient;
use relay_sdk::IngressEvent;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;

    let journal = Arc::new(Journal::open(&config.journal_path)?);
    journal.initialize_schema()?;

    let store = Arc::new(HttpProjectStore::new(
        &config.store_base_url,
        config.internal_key.clone(),
    ));
    let mut model = HttpModelClient::new(config.model_api_key.clone(), &config.model);
    if let Some(base_url) = &config.model_base_url {
        model = model.with_base_url(base_url);
    }
    let model = Arc::new(model);
    let tools = Arc::new(builtin_registry(store.clone())?);

    let engine = Engine::new(journal, config.retry.clone()).register(Arc::new(
        ProcessMessage::new(store, model, tools, config.workflow_settings()),
    ));

    let recovered = engine.recover().await?;
    if recovered > 0 {
        tracing::info!(count = recovered, "resumed instances from the journal");
    }

    tracing::info!(
        store = %config.store_base_url,
        model = %config.model,
        "relay ready, reading events from stdin"
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<IngressEvent>(line) {
            Ok(event) => {
                if let Err(err) = engine.ingest(event).await {
                    tracing::error!(error = %err, "failed to ingest event");
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "ignoring malformed event line");
            }
        }
    }

    Ok(())
}
