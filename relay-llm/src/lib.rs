//! Model client for the relay agent loop.
//!
//! Speaks an Anthropic-style messages API: content blocks in, content
//! blocks out, with tool definitions attached to each request. The engine
//! only depends on the [`ModelClient`] trait, so tests substitute a
//! scripted implementation.

mod client;
mod error;
mod types;

pub use client::HttpModelClient;
pub use error::LlmError;
pub use types::{
    ChatMessage, ChatRequest, ChatResponse, ContentBlock, Role, StopReason, ToolDefinition,
};

use async_trait::async_trait;

/// One round-trip to the model.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, LlmError>;
}
