//! The message-processing workflow.
//!
//! Triggered by `message/sent`, cancelled by a `message/cancel` carrying
//! the same message id. The body fetches conversation context, optionally
//! titles the conversation, hands control to the agent network and writes
//! the final text back to the store. The two compensations keep the
//! outward-visible message out of a stuck `processing` state.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use relay_llm::{ChatMessage, ModelClient};
use relay_sdk::{
    Conversation, EngineError, IngressEvent, MessageRole, MessageSentEvent, MessageStatus,
    ProjectStore, StoredMessage,
};

use crate::executor::StepContext;
use crate::router::AgentNetwork;
use crate::tools::ToolRegistry;
use crate::workflows::title::TitleGenerator;
use crate::workflows::WorkflowDefinition;

pub const DEFINITION_ID: &str = "process-message";

/// Written to the assistant message when the instance fails, so clients
/// never poll a processing message forever.
pub const FAILURE_NOTICE: &str =
    "Something went wrong while processing this message. Please try again.";

#[derive(Debug, Clone)]
pub struct WorkflowSettings {
    pub internal_key: Option<String>,
    pub max_iterations: u32,
    pub history_limit: usize,
    /// Optional settle time before processing starts; zero skips the step.
    pub debounce: Duration,
    pub max_tokens: u32,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            internal_key: None,
            max_iterations: 10,
            history_limit: 20,
            debounce: Duration::ZERO,
            max_tokens: 4096,
        }
    }
}

pub struct ProcessMessage {
    store: Arc<dyn ProjectStore>,
    model: Arc<dyn ModelClient>,
    tools: Arc<ToolRegistry>,
    titles: TitleGenerator,
    settings: WorkflowSettings,
}

impl ProcessMessage {
    pub fn new(
        store: Arc<dyn ProjectStore>,
        model: Arc<dyn ModelClient>,
        tools: Arc<ToolRegistry>,
        settings: WorkflowSettings,
    ) -> Self {
        let titles = TitleGenerator::new(Arc::clone(&model), Arc::clone(&store));
        Self {
            store,
            model,
            tools,
            titles,
            settings,
        }
    }
}

#[async_trait]
impl WorkflowDefinition for ProcessMessage {
    fn id(&self) -> &str {
        DEFINITION_ID
    }

    fn trigger_from(&self, event: &IngressEvent) -> Option<Value> {
        match event {
            IngressEvent::MessageSent(sent) => serde_json::to_value(sent).ok(),
            _ => None,
        }
    }

    fn correlation_key(&self, trigger: &Value) -> Option<String> {
        trigger
            .get("messageId")
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    fn cancels_on(&self, event: &IngressEvent, correlation_key: &str) -> bool {
        matches!(event, IngressEvent::MessageCancel(cancel) if cancel.message_id == correlation_key)
    }

    async fn run(&self, ctx: &StepContext, trigger: &Value) -> Result<Value, EngineError> {
        let event: MessageSentEvent = serde_json::from_value(trigger.clone())?;

        if self.settings.internal_key.is_none() {
            return Err(EngineError::Config("missing internal key".to_string()));
        }

        if !self.settings.debounce.is_zero() {
            ctx.sleep("wait-before-processing", self.settings.debounce)
                .await?;
        }

        let message: StoredMessage = ctx
            .run("get-message", || self.store.message(&event.message_id))
            .await?;

        let conversation: Conversation = ctx
            .run("get-conversation", || {
                self.store.conversation(&message.conversation_id)
            })
            .await?;

        let history: Vec<StoredMessage> = ctx
            .run("get-recent-messages", || {
                self.store
                    .recent_messages(&conversation.id, self.settings.history_limit)
            })
            .await?;

        // History arrives newest first; the first usable user entry is
        // the message that started this run.
        let latest_user = history
            .iter()
            .find(|m| m.role == MessageRole::User && !m.content.is_empty())
            .map(|m| m.content.clone())
            .unwrap_or_default();

        self.titles
            .maybe_generate(ctx, &conversation, &latest_user)
            .await?;

        let transcript = build_transcript(&history, &message.id);
        let network = AgentNetwork::new(
            Arc::clone(&self.model),
            Arc::clone(&self.tools),
            self.settings.max_iterations,
            self.settings.max_tokens,
        );
        let final_text = network
            .run(ctx, &system_prompt(&message.project_id), transcript)
            .await?;

        ctx.run("finalize-message", || {
            self.store
                .patch_message(&event.message_id, &final_text, MessageStatus::Completed)
        })
        .await?;

        Ok(json!({
            "messageId": event.message_id,
            "content": final_text,
        }))
    }

    async fn on_failure(&self, trigger: &Value, error: &EngineError) {
        let event: MessageSentEvent = match serde_json::from_value(trigger.clone()) {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!(error = %err, "failure handler got an unreadable trigger");
                return;
            }
        };

        tracing::error!(
            message = %event.message_id,
            error = %error,
            "marking message failed"
        );
        if let Err(err) = self
            .store
            .patch_message(&event.message_id, FAILURE_NOTICE, MessageStatus::Completed)
            .await
        {
            // Best effort only: the instance stays Failed either way.
            tracing::error!(
                message = %event.message_id,
                error = %err,
                "compensating write failed"
            );
        }
    }

    async fn on_cancelled(&self, trigger: &Value) {
        let event: MessageSentEvent = match serde_json::from_value(trigger.clone()) {
            Ok(event) => event,
            Err(_) => return,
        };

        // Status only: whatever content the agent got to stays visible.
        if let Err(err) = self
            .store
            .patch_message_status(&event.message_id, MessageStatus::Cancelled)
            .await
        {
            tracing::warn!(
                message = %event.message_id,
                error = %err,
                "failed to mark message cancelled"
            );
        }
    }
}

/// Chronological transcript for the agent, excluding the message being
/// generated, anything still processing, and empty entries.
fn build_transcript(history: &[StoredMessage], target_message_id: &str) -> Vec<ChatMessage> {
    let mut transcript: Vec<ChatMessage> = history
        .iter()
        .rev()
        .filter(|m| m.id != target_message_id)
        .filter(|m| m.status != Some(MessageStatus::Processing))
        .filter(|m| !m.content.is_empty())
        .map(|m| match m.role {
            MessageRole::User => ChatMessage::user_text(m.content.clone()),
            MessageRole::Assistant => ChatMessage::assistant_text(m.content.clone()),
        })
        .collect();

    if transcript.is_empty() {
        transcript.push(ChatMessage::user_text(
            "(the user sent a message with no content)",
        ));
    }
    transcript
}

fn system_prompt(project_id: &str) -> String {
    format!(
        "You are a coding assistant working inside project {project_id}. \
         You can read, list, create, rename, update and delete the project's \
         files with the provided tools, and fetch URLs for reference. \
         Use tools to inspect the project before changing it. When the work \
         is done, reply with a short summary of what you did and nothing else."
    )
}
