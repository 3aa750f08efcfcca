//! Shared data model and collaborator contracts for the relay engine.
//!
//! Everything in this crate is transport-agnostic: the engine, the store
//! client, the tools and the tests all speak these types. The engine crate
//! owns execution; this crate owns the vocabulary.

// Re-export async trait for convenience
pub use async_trait::async_trait;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub type MessageId = String;
pub type ConversationId = String;
pub type ProjectId = String;
pub type FileId = String;

// ============================================================================
// Ingress events
// ============================================================================

/// Events accepted by the engine, tagged the way the upstream emitter
/// names them on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "data")]
pub enum IngressEvent {
    #[serde(rename = "message/sent")]
    MessageSent(MessageSentEvent),
    #[serde(rename = "message/cancel")]
    MessageCancel(MessageCancelEvent),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSentEvent {
    pub message_id: MessageId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageCancelEvent {
    pub message_id: MessageId,
}

// ============================================================================
// Workflow instances and steps
// ============================================================================

/// Lifecycle of one durable execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Pending,
    Running,
    Sleeping,
    Cancelling,
    Completed,
    Failed,
    Cancelled,
}

impl InstanceState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Validate a lifecycle transition. Equal states are always allowed so
    /// that replay after a crash can re-assert the stored state.
    pub fn can_transition_to(&self, next: InstanceState) -> bool {
        use InstanceState::*;

        if *self == next {
            return true;
        }

        match (self, next) {
            (Pending, Running) | (Pending, Cancelling) => true,
            (Running, Sleeping) | (Running, Cancelling) => true,
            (Running, Completed) | (Running, Failed) | (Running, Cancelled) => true,
            (Sleeping, Running) | (Sleeping, Cancelling) | (Sleeping, Cancelled) => true,
            // The step in flight when cancellation arrived is allowed to
            // finish, so a cancelling instance may still land on any
            // terminal state.
            (Cancelling, Cancelled) | (Cancelling, Completed) | (Cancelling, Failed) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Sleeping => "sleeping",
            Self::Cancelling => "cancelling",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "sleeping" => Some(Self::Sleeping),
            "cancelling" => Some(Self::Cancelling),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One durable execution of a workflow definition for one trigger event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: Uuid,
    pub definition_id: String,
    pub correlation_key: String,
    pub state: InstanceState,
    pub trigger: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Completed,
    Failed,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A named, memoized unit of work within an instance. A completed record's
/// result is immutable and is returned verbatim on replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,
    pub status: StepStatus,
    pub result: Option<Value>,
    pub attempts: u32,
    pub last_error: Option<String>,
}

/// How an instance ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TerminalOutcome {
    Completed(Value),
    Failed(String),
    Cancelled,
}

// ============================================================================
// Agent iteration model
// ============================================================================

/// One tagged output of an agent invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputSegment {
    Text {
        role: String,
        content: String,
    },
    ToolCall {
        id: String,
        tool_name: String,
        args: Value,
    },
    ToolResult {
        id: String,
        tool_name: String,
        output: Value,
        is_error: bool,
    },
}

/// Everything one agent invocation produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentResult {
    pub outputs: Vec<OutputSegment>,
}

impl AgentResult {
    pub fn has_text(&self) -> bool {
        self.outputs
            .iter()
            .any(|s| matches!(s, OutputSegment::Text { .. }))
    }

    pub fn has_tool_calls(&self) -> bool {
        self.outputs
            .iter()
            .any(|s| matches!(s, OutputSegment::ToolCall { .. }))
    }

    /// The termination rule: a turn counts as final only when it carries
    /// text and no tool call. Text alongside tool calls keeps the loop
    /// going, since some models narrate while calling tools.
    pub fn is_final(&self) -> bool {
        self.has_text() && !self.has_tool_calls()
    }

    pub fn first_text(&self) -> Option<&str> {
        self.outputs.iter().find_map(|s| match s {
            OutputSegment::Text { content, .. } => Some(content.as_str()),
            _ => None,
        })
    }

    pub fn tool_calls(&self) -> Vec<(&str, &str, &Value)> {
        self.outputs
            .iter()
            .filter_map(|s| match s {
                OutputSegment::ToolCall {
                    id,
                    tool_name,
                    args,
                } => Some((id.as_str(), tool_name.as_str(), args)),
                _ => None,
            })
            .collect()
    }
}

/// Accumulated state of the agent loop. `results` is append-only; the
/// router only ever decides on the last element.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentIterationState {
    pub iteration: u32,
    pub results: Vec<AgentResult>,
}

impl AgentIterationState {
    pub fn push(&mut self, result: AgentResult) {
        self.results.push(result);
        self.iteration += 1;
    }

    pub fn last(&self) -> Option<&AgentResult> {
        self.results.last()
    }

    /// Most recent text segment across all iterations, newest first. Used
    /// for the forced stop at the iteration bound.
    pub fn best_text(&self) -> Option<&str> {
        self.results.iter().rev().find_map(|r| r.first_text())
    }
}

// ============================================================================
// Store entities (externally owned, referenced not owned)
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Processing,
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub project_id: ProjectId,
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<MessageStatus>,
    /// Milliseconds since the epoch, as the store records it.
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: ConversationId,
    pub project_id: ProjectId,
    pub title: String,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    File,
    Folder,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectFile {
    pub id: FileId,
    pub project_id: ProjectId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<FileId>,
    pub name: String,
    pub kind: FileKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessage {
    pub conversation_id: ConversationId,
    pub project_id: ProjectId,
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<MessageStatus>,
}

/// The external project/file/conversation store. Every call is authorized
/// by a shared internal key presented by the implementation; calls missing
/// or mismatching the key fail closed.
#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn conversation(&self, conversation_id: &str) -> Result<Conversation, EngineError>;

    async fn message(&self, message_id: &str) -> Result<StoredMessage, EngineError>;

    /// The newest `limit` messages of a conversation. The caller filters
    /// out processing and empty-content entries before building context.
    async fn recent_messages(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, EngineError>;

    async fn create_message(&self, message: NewMessage) -> Result<MessageId, EngineError>;

    async fn patch_message(
        &self,
        message_id: &str,
        content: &str,
        status: MessageStatus,
    ) -> Result<(), EngineError>;

    /// Status-only patch; the existing content is left untouched.
    async fn patch_message_status(
        &self,
        message_id: &str,
        status: MessageStatus,
    ) -> Result<(), EngineError>;

    async fn patch_conversation_title(
        &self,
        conversation_id: &str,
        title: &str,
    ) -> Result<(), EngineError>;

    async fn file(&self, file_id: &str) -> Result<ProjectFile, EngineError>;

    /// Folder-first, then name-ordered listing of one folder level.
    async fn folder_contents(
        &self,
        project_id: &str,
        parent_id: Option<&str>,
    ) -> Result<Vec<ProjectFile>, EngineError>;

    async fn create_file(
        &self,
        project_id: &str,
        parent_id: Option<&str>,
        name: &str,
        content: &str,
    ) -> Result<FileId, EngineError>;

    async fn create_folder(
        &self,
        project_id: &str,
        parent_id: Option<&str>,
        name: &str,
    ) -> Result<FileId, EngineError>;

    async fn rename_entry(&self, file_id: &str, new_name: &str) -> Result<(), EngineError>;

    /// Recursive over descendants; the store also drops any attached
    /// binary storage object.
    async fn delete_entry(&self, file_id: &str) -> Result<(), EngineError>;

    async fn update_file(&self, file_id: &str, content: &str) -> Result<(), EngineError>;
}

// ============================================================================
// Error taxonomy
// ============================================================================

/// Coarse error classes the executor schedules on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retried with backoff inside the step executor.
    Transient,
    /// Fails the instance immediately, no retry.
    NonRetriable,
    /// A tool handler's domain error; surfaced to the agent, the loop
    /// continues and the instance is not failed.
    Tool,
    /// Not an error: a distinct terminal path bypassing the failure handler.
    Cancellation,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("missing or invalid configuration: {0}")]
    Config(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("{0} not found")]
    NotFound(String),

    #[error("store rejected request ({status}): {message}")]
    StoreRejected { status: u16, message: String },

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("model rejected request: {0}")]
    ModelRejected(String),

    #[error("tool '{tool}' failed: {message}")]
    Tool { tool: String, message: String },

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("journal error: {0}")]
    Journal(String),

    #[error("cancelled")]
    Cancelled,
}

impl EngineError {
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Tool {
            tool: tool.into(),
            message: message.into(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::StoreUnavailable(_) | Self::ModelUnavailable(_) => ErrorClass::Transient,
            Self::Tool { .. } => ErrorClass::Tool,
            Self::Cancelled => ErrorClass::Cancellation,
            _ => ErrorClass::NonRetriable,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Decode a step's stored result back into the caller's type.
pub fn decode_step_result<T: DeserializeOwned>(value: Value) -> Result<T, EngineError> {
    serde_json::from_value(value).map_err(EngineError::from)
}
