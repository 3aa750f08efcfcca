//! Conversation title generation.
//!
//! A single tool-less model call, gated on the title still being the
//! placeholder the client creates conversations with. The whole thing is
//! best-effort: the user's message response must complete whether or not
//! a title materialized, so every error except cancellation is swallowed.

use std::sync::Arc;

use relay_llm::{ChatMessage, ChatRequest, ModelClient};
use relay_sdk::{Conversation, EngineError, ProjectStore};

use crate::executor::StepContext;

/// Title new conversations are created with.
pub const TITLE_PLACEHOLDER: &str = "New Conversation";

const TITLE_MAX_CHARS: usize = 60;
const TITLE_SYSTEM_PROMPT: &str = "You name conversations. Reply with a very short title \
     (at most six words) for a conversation that starts with the user's message. \
     Reply with the title only, no quotes, no punctuation at the end.";

pub struct TitleGenerator {
    model: Arc<dyn ModelClient>,
    store: Arc<dyn ProjectStore>,
}

impl TitleGenerator {
    pub fn new(model: Arc<dyn ModelClient>, store: Arc<dyn ProjectStore>) -> Self {
        Self { model, store }
    }

    /// Generate and save a title if the conversation still carries the
    /// placeholder. Returns an error only for cancellation; anything else
    /// is logged and swallowed.
    pub async fn maybe_generate(
        &self,
        ctx: &StepContext,
        conversation: &Conversation,
        user_message: &str,
    ) -> Result<(), EngineError> {
        if conversation.title != TITLE_PLACEHOLDER {
            return Ok(());
        }

        match self.generate(ctx, conversation, user_message).await {
            Ok(()) => Ok(()),
            Err(EngineError::Cancelled) => Err(EngineError::Cancelled),
            Err(err) => {
                tracing::warn!(
                    conversation = %conversation.id,
                    error = %err,
                    "title generation failed, continuing without a title"
                );
                Ok(())
            }
        }
    }

    async fn generate(
        &self,
        ctx: &StepContext,
        conversation: &Conversation,
        user_message: &str,
    ) -> Result<(), EngineError> {
        let prompt = if user_message.is_empty() {
            "(the user sent an empty message)".to_string()
        } else {
            user_message.to_string()
        };

        let title: String = ctx
            .run("title/generate", || {
                let model = Arc::clone(&self.model);
                let prompt = prompt.clone();
                async move {
                    let request = ChatRequest::new(vec![ChatMessage::user_text(prompt)])
                        .with_system(TITLE_SYSTEM_PROMPT)
                        .with_max_tokens(64);
                    let response = model
                        .complete(request)
                        .await
                        .map_err(|e| EngineError::ModelRejected(e.to_string()))?;
                    let raw = response
                        .content
                        .iter()
                        .find_map(|block| match block {
                            relay_llm::ContentBlock::Text { text } => Some(text.as_str()),
                            _ => None,
                        })
                        .ok_or_else(|| {
                            EngineError::ModelRejected("model returned no title text".to_string())
                        })?;
                    Ok(clean_title(raw))
                }
            })
            .await?;

        ctx.run("title/save", || {
            self.store
                .patch_conversation_title(&conversation.id, &title)
        })
        .await?;

        tracing::info!(conversation = %conversation.id, title = %title, "conversation titled");
        Ok(())
    }
}

fn clean_title(raw: &str) -> String {
    let trimmed = raw.trim().trim_matches('"').trim();
    let mut title: String = trimmed.chars().take(TITLE_MAX_CHARS).collect();
    if title.is_empty() {
        title = TITLE_PLACEHOLDER.to_string();
    }
    title
}
