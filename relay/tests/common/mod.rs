//! In-memory collaborators for engine tests: a project store with call
//! recording and failure injection, and a scripted model client.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio::sync::Notify;

use relay::engine::Engine;
use relay::journal::Journal;
use relay::retry::RetryPolicy;
use relay::tools::builtin_registry;
use relay::workflows::process_message::{ProcessMessage, WorkflowSettings};
use relay_llm::{ChatRequest, ChatResponse, ContentBlock, LlmError, ModelClient, StopReason};
use relay_sdk::{
    async_trait, Conversation, EngineError, FileId, FileKind, MessageId, MessageRole,
    MessageStatus, NewMessage, ProjectFile, ProjectStore, StoredMessage,
};

// ============================================================================
// Store fake
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum PatchRecord {
    Content {
        message_id: String,
        content: String,
        status: MessageStatus,
    },
    Status {
        message_id: String,
        status: MessageStatus,
    },
    Title {
        conversation_id: String,
        title: String,
    },
}

#[derive(Default)]
struct Inner {
    conversations: HashMap<String, Conversation>,
    messages: HashMap<String, StoredMessage>,
    files: HashMap<String, ProjectFile>,
    patches: Vec<PatchRecord>,
    next_id: u32,
}

/// A gate that lets a test pause the store inside `recent_messages`.
pub struct Gate {
    pub entered: Arc<Notify>,
    pub release: Arc<Notify>,
}

impl Gate {
    pub fn new() -> (Arc<Notify>, Arc<Notify>, Self) {
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        (
            entered.clone(),
            release.clone(),
            Self { entered, release },
        )
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    recent_gate: Mutex<Option<Gate>>,
    pub conversation_not_found: AtomicBool,
    pub files_unauthorized: AtomicBool,
    pub message_calls: AtomicU32,
    pub conversation_calls: AtomicU32,
    pub recent_calls: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_conversation(&self, conversation: Conversation) {
        self.inner
            .lock()
            .unwrap()
            .conversations
            .insert(conversation.id.clone(), conversation);
    }

    pub fn insert_message(&self, message: StoredMessage) {
        self.inner
            .lock()
            .unwrap()
            .messages
            .insert(message.id.clone(), message);
    }

    pub fn insert_file(&self, file: ProjectFile) {
        self.inner
            .lock()
            .unwrap()
            .files
            .insert(file.id.clone(), file);
    }

    pub fn set_recent_gate(&self, gate: Gate) {
        *self.recent_gate.lock().unwrap() = Some(gate);
    }

    pub fn patches(&self) -> Vec<PatchRecord> {
        self.inner.lock().unwrap().patches.clone()
    }

    pub fn content_patches(&self) -> Vec<PatchRecord> {
        self.patches()
            .into_iter()
            .filter(|p| matches!(p, PatchRecord::Content { .. }))
            .collect()
    }

    pub fn stored_message(&self, id: &str) -> Option<StoredMessage> {
        self.inner.lock().unwrap().messages.get(id).cloned()
    }

    pub fn stored_conversation(&self, id: &str) -> Option<Conversation> {
        self.inner.lock().unwrap().conversations.get(id).cloned()
    }

    fn check_file_auth(&self) -> Result<(), EngineError> {
        if self.files_unauthorized.load(Ordering::SeqCst) {
            Err(EngineError::Unauthorized)
        } else {
            Ok(())
        }
    }

    fn fresh_id(&self, prefix: &str) -> String {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        format!("{prefix}{}", inner.next_id)
    }
}

#[async_trait]
impl ProjectStore for MemoryStore {
    async fn conversation(&self, conversation_id: &str) -> Result<Conversation, EngineError> {
        self.conversation_calls.fetch_add(1, Ordering::SeqCst);
        if self.conversation_not_found.load(Ordering::SeqCst) {
            return Err(EngineError::NotFound("conversation".to_string()));
        }
        self.inner
            .lock()
            .unwrap()
            .conversations
            .get(conversation_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound("conversation".to_string()))
    }

    async fn message(&self, message_id: &str) -> Result<StoredMessage, EngineError> {
        self.message_calls.fetch_add(1, Ordering::SeqCst);
        self.inner
            .lock()
            .unwrap()
            .messages
            .get(message_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound("message".to_string()))
    }

    async fn recent_messages(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, EngineError> {
        self.recent_calls.fetch_add(1, Ordering::SeqCst);

        let gate = self.recent_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.entered.notify_one();
            gate.release.notified().await;
        }

        let mut messages: Vec<StoredMessage> = self
            .inner
            .lock()
            .unwrap()
            .messages
            .values()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect();
        // Newest first, as the contract says.
        messages.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        messages.truncate(limit);
        Ok(messages)
    }

    async fn create_message(&self, message: NewMessage) -> Result<MessageId, EngineError> {
        let id = self.fresh_id("m");
        let mut inner = self.inner.lock().unwrap();
        let updated_at = inner.next_id as i64;
        inner.messages.insert(
            id.clone(),
            StoredMessage {
                id: id.clone(),
                conversation_id: message.conversation_id,
                project_id: message.project_id,
                role: message.role,
                content: message.content,
                status: message.status,
                updated_at,
            },
        );
        Ok(id)
    }

    async fn patch_message(
        &self,
        message_id: &str,
        content: &str,
        status: MessageStatus,
    ) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(message) = inner.messages.get_mut(message_id) {
            message.content = content.to_string();
            message.status = Some(status);
        }
        inner.patches.push(PatchRecord::Content {
            message_id: message_id.to_string(),
            content: content.to_string(),
            status,
        });
        Ok(())
    }

    async fn patch_message_status(
        &self,
        message_id: &str,
        status: MessageStatus,
    ) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(message) = inner.messages.get_mut(message_id) {
            message.status = Some(status);
        }
        inner.patches.push(PatchRecord::Status {
            message_id: message_id.to_string(),
            status,
        });
        Ok(())
    }

    async fn patch_conversation_title(
        &self,
        conversation_id: &str,
        title: &str,
    ) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(conversation) = inner.conversations.get_mut(conversation_id) {
            conversation.title = title.to_string();
        }
        inner.patches.push(PatchRecord::Title {
            conversation_id: conversation_id.to_string(),
            title: title.to_string(),
        });
        Ok(())
    }

    async fn file(&self, file_id: &str) -> Result<ProjectFile, EngineError> {
        self.check_file_auth()?;
        self.inner
            .lock()
            .unwrap()
            .files
            .get(file_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound("file".to_string()))
    }

    async fn folder_contents(
        &self,
        project_id: &str,
        parent_id: Option<&str>,
    ) -> Result<Vec<ProjectFile>, EngineError> {
        self.check_file_auth()?;
        let mut entries: Vec<ProjectFile> = self
            .inner
            .lock()
            .unwrap()
            .files
            .values()
            .filter(|f| f.project_id == project_id && f.parent_id.as_deref() == parent_id)
            .cloned()
            .collect();
        // Folders first, then names.
        entries.sort_by(|a, b| match (a.kind, b.kind) {
            (FileKind::Folder, FileKind::File) => std::cmp::Ordering::Less,
            (FileKind::File, FileKind::Folder) => std::cmp::Ordering::Greater,
            _ => a.name.cmp(&b.name),
        });
        Ok(entries)
    }

    async fn create_file(
        &self,
        project_id: &str,
        parent_id: Option<&str>,
        name: &str,
        content: &str,
    ) -> Result<FileId, EngineError> {
        self.check_file_auth()?;
        let duplicate = self.inner.lock().unwrap().files.values().any(|f| {
            f.project_id == project_id
                && f.parent_id.as_deref() == parent_id
                && f.name == name
                && f.kind == FileKind::File
        });
        if duplicate {
            return Err(EngineError::StoreRejected {
                status: 409,
                message: "file already exists".to_string(),
            });
        }
        let id = self.fresh_id("f");
        self.insert_file(ProjectFile {
            id: id.clone(),
            project_id: project_id.to_string(),
            parent_id: parent_id.map(str::to_string),
            name: name.to_string(),
            kind: FileKind::File,
            content: Some(content.to_string()),
            updated_at: 0,
        });
        Ok(id)
    }

    async fn create_folder(
        &self,
        project_id: &str,
        parent_id: Option<&str>,
        name: &str,
    ) -> Result<FileId, EngineError> {
        self.check_file_auth()?;
        let duplicate = self.inner.lock().unwrap().files.values().any(|f| {
            f.project_id == project_id
                && f.parent_id.as_deref() == parent_id
                && f.name == name
                && f.kind == FileKind::Folder
        });
        if duplicate {
            return Err(EngineError::StoreRejected {
                status: 409,
                message: "folder already exists".to_string(),
            });
        }
        let id = self.fresh_id("f");
        self.insert_file(ProjectFile {
            id: id.clone(),
            project_id: project_id.to_string(),
            parent_id: parent_id.map(str::to_string),
            name: name.to_string(),
            kind: FileKind::Folder,
            content: None,
            updated_at: 0,
        });
        Ok(id)
    }

    async fn rename_entry(&self, file_id: &str, new_name: &str) -> Result<(), EngineError> {
        self.check_file_auth()?;
        let mut inner = self.inner.lock().unwrap();
        let file = inner
            .files
            .get_mut(file_id)
            .ok_or_else(|| EngineError::NotFound("file".to_string()))?;
        file.name = new_name.to_string();
        Ok(())
    }

    async fn delete_entry(&self, file_id: &str) -> Result<(), EngineError> {
        self.check_file_auth()?;
        let mut inner = self.inner.lock().unwrap();
        if !inner.files.contains_key(file_id) {
            return Err(EngineError::NotFound("file".to_string()));
        }
        // Recursive over descendants.
        let mut doomed = vec![file_id.to_string()];
        let mut index = 0;
        while index < doomed.len() {
            let parent = doomed[index].clone();
            let children: Vec<String> = inner
                .files
                .values()
                .filter(|f| f.parent_id.as_deref() == Some(parent.as_str()))
                .map(|f| f.id.clone())
                .collect();
            doomed.extend(children);
            index += 1;
        }
        for id in doomed {
            inner.files.remove(&id);
        }
        Ok(())
    }

    async fn update_file(&self, file_id: &str, content: &str) -> Result<(), EngineError> {
        self.check_file_auth()?;
        let mut inner = self.inner.lock().unwrap();
        let file = inner
            .files
            .get_mut(file_id)
            .ok_or_else(|| EngineError::NotFound("file".to_string()))?;
        file.content = Some(content.to_string());
        Ok(())
    }
}

// ============================================================================
// Model fake
// ============================================================================

pub struct ScriptedModel {
    script: Mutex<VecDeque<Result<ChatResponse, LlmError>>>,
    pub requests: Mutex<Vec<ChatRequest>>,
    pub calls: AtomicU32,
}

impl ScriptedModel {
    pub fn new(turns: Vec<Result<ChatResponse, LlmError>>) -> Self {
        Self {
            script: Mutex::new(turns.into()),
            requests: Mutex::new(Vec::new()),
            calls: AtomicU32::new(0),
        }
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn recorded_requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, LlmError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .expect("scripted model exhausted")
    }
}

pub fn text_turn(text: &str) -> Result<ChatResponse, LlmError> {
    Ok(ChatResponse::text(text))
}

pub fn tool_turn(id: &str, name: &str, args: Value) -> Result<ChatResponse, LlmError> {
    Ok(ChatResponse {
        content: vec![ContentBlock::ToolUse {
            id: id.to_string(),
            name: name.to_string(),
            input: args,
        }],
        stop_reason: StopReason::ToolUse,
    })
}

pub fn mixed_turn(text: &str, id: &str, name: &str, args: Value) -> Result<ChatResponse, LlmError> {
    Ok(ChatResponse {
        content: vec![
            ContentBlock::Text {
                text: text.to_string(),
            },
            ContentBlock::ToolUse {
                id: id.to_string(),
                name: name.to_string(),
                input: args,
            },
        ],
        stop_reason: StopReason::ToolUse,
    })
}

pub fn transient_turn() -> Result<ChatResponse, LlmError> {
    Err(LlmError::Api {
        status: 503,
        message: "overloaded".to_string(),
    })
}

pub fn rejected_turn() -> Result<ChatResponse, LlmError> {
    Err(LlmError::Api {
        status: 400,
        message: "bad request".to_string(),
    })
}

// ============================================================================
// Assembly helpers
// ============================================================================

pub const TARGET_MESSAGE: &str = "M1";
pub const CONVERSATION: &str = "c1";
pub const PROJECT: &str = "p1";

/// A conversation with one completed user message and the processing
/// assistant message the trigger points at.
pub fn seeded_store(title: &str) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store.insert_conversation(Conversation {
        id: CONVERSATION.to_string(),
        project_id: PROJECT.to_string(),
        title: title.to_string(),
        updated_at: 1,
    });
    store.insert_message(StoredMessage {
        id: "m0".to_string(),
        conversation_id: CONVERSATION.to_string(),
        project_id: PROJECT.to_string(),
        role: MessageRole::User,
        content: "add a readme file".to_string(),
        status: None,
        updated_at: 10,
    });
    store.insert_message(StoredMessage {
        id: TARGET_MESSAGE.to_string(),
        conversation_id: CONVERSATION.to_string(),
        project_id: PROJECT.to_string(),
        role: MessageRole::Assistant,
        content: String::new(),
        status: Some(MessageStatus::Processing),
        updated_at: 20,
    });
    store
}

pub fn settings() -> WorkflowSettings {
    WorkflowSettings {
        internal_key: Some("test-key".to_string()),
        ..WorkflowSettings::default()
    }
}

pub fn sent_trigger() -> Value {
    json!({ "messageId": TARGET_MESSAGE })
}

pub fn build_engine(
    store: Arc<MemoryStore>,
    model: Arc<ScriptedModel>,
    settings: WorkflowSettings,
    retry: RetryPolicy,
) -> Engine {
    let journal = Journal::in_memory().expect("journal");
    journal.initialize_schema().expect("schema");
    build_engine_with_journal(Arc::new(journal), store, model, settings, retry)
}

pub fn build_engine_with_journal(
    journal: Arc<Journal>,
    store: Arc<MemoryStore>,
    model: Arc<ScriptedModel>,
    settings: WorkflowSettings,
    retry: RetryPolicy,
) -> Engine {
    let tools = Arc::new(builtin_registry(store.clone()).expect("registry"));
    Engine::new(journal, retry).register(Arc::new(ProcessMessage::new(
        store, model, tools, settings,
    )))
}
