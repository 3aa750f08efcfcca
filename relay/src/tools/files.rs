//! File capabilities backed by the project store.
//!
//! These are thin, typed adapters: argument structs mirror the schemas,
//! duplicate-name and not-found responses from the store come back as
//! tool errors, and every mutation reaches the store as a single-entity
//! patch.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use relay_sdk::{EngineError, ProjectStore};

use super::{domain_to_tool, parse_args, Tool};

pub struct ReadFile {
    store: Arc<dyn ProjectStore>,
}

impl ReadFile {
    pub fn new(store: Arc<dyn ProjectStore>) -> Self {
        Self { store }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadFileArgs {
    file_id: String,
}

#[async_trait]
impl Tool for ReadFile {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a file's content by its id"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "fileId": { "type": "string", "description": "Id of the file to read" }
            },
            "required": ["fileId"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, args: Value) -> Result<Value, EngineError> {
        let args: ReadFileArgs = parse_args(self.name(), args)?;
        let file = self
            .store
            .file(&args.file_id)
            .await
            .map_err(|e| domain_to_tool(self.name(), e))?;
        Ok(json!({
            "id": file.id,
            "name": file.name,
            "kind": file.kind,
            "content": file.content.unwrap_or_default(),
        }))
    }
}

pub struct ListFolder {
    store: Arc<dyn ProjectStore>,
}

impl ListFolder {
    pub fn new(store: Arc<dyn ProjectStore>) -> Self {
        Self { store }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListFolderArgs {
    project_id: String,
    #[serde(default)]
    parent_id: Option<String>,
}

#[async_trait]
impl Tool for ListFolder {
    fn name(&self) -> &str {
        "list_folder"
    }

    fn description(&self) -> &str {
        "List the files and folders directly under a folder (or the project root)"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "projectId": { "type": "string" },
                "parentId": {
                    "type": "string",
                    "description": "Folder to list; omit for the project root"
                }
            },
            "required": ["projectId"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, args: Value) -> Result<Value, EngineError> {
        let args: ListFolderArgs = parse_args(self.name(), args)?;
        let entries = self
            .store
            .folder_contents(&args.project_id, args.parent_id.as_deref())
            .await
            .map_err(|e| domain_to_tool(self.name(), e))?;
        let listing: Vec<Value> = entries
            .iter()
            .map(|entry| {
                json!({
                    "id": entry.id,
                    "name": entry.name,
                    "kind": entry.kind,
                })
            })
            .collect();
        Ok(json!({ "entries": listing }))
    }
}

pub struct UpdateFile {
    store: Arc<dyn ProjectStore>,
}

impl UpdateFile {
    pub fn new(store: Arc<dyn ProjectStore>) -> Self {
        Self { store }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateFileArgs {
    file_id: String,
    content: String,
}

#[async_trait]
impl Tool for UpdateFile {
    fn name(&self) -> &str {
        "update_file"
    }

    fn description(&self) -> &str {
        "Replace a file's content"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "fileId": { "type": "string" },
                "content": { "type": "string" }
            },
            "required": ["fileId", "content"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, args: Value) -> Result<Value, EngineError> {
        let args: UpdateFileArgs = parse_args(self.name(), args)?;
        self.store
            .update_file(&args.file_id, &args.content)
            .await
            .map_err(|e| domain_to_tool(self.name(), e))?;
        Ok(json!({ "updated": args.file_id }))
    }
}

pub struct CreateFile {
    store: Arc<dyn ProjectStore>,
}

impl CreateFile {
    pub fn new(store: Arc<dyn ProjectStore>) -> Self {
        Self { store }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateFileArgs {
    project_id: String,
    #[serde(default)]
    parent_id: Option<String>,
    name: String,
    content: String,
}

#[async_trait]
impl Tool for CreateFile {
    fn name(&self) -> &str {
        "create_file"
    }

    fn description(&self) -> &str {
        "Create a new file. Fails if a file with the same name exists in the parent folder."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "projectId": { "type": "string" },
                "parentId": { "type": "string" },
                "name": { "type": "string" },
                "content": { "type": "string" }
            },
            "required": ["projectId", "name", "content"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, args: Value) -> Result<Value, EngineError> {
        let args: CreateFileArgs = parse_args(self.name(), args)?;
        let id = self
            .store
            .create_file(
                &args.project_id,
                args.parent_id.as_deref(),
                &args.name,
                &args.content,
            )
            .await
            .map_err(|e| domain_to_tool(self.name(), e))?;
        Ok(json!({ "created": id, "name": args.name }))
    }
}

pub struct CreateFolder {
    store: Arc<dyn ProjectStore>,
}

impl CreateFolder {
    pub fn new(store: Arc<dyn ProjectStore>) -> Self {
        Self { store }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateFolderArgs {
    project_id: String,
    #[serde(default)]
    parent_id: Option<String>,
    name: String,
}

#[async_trait]
impl Tool for CreateFolder {
    fn name(&self) -> &str {
        "create_folder"
    }

    fn description(&self) -> &str {
        "Create a new folder. Fails if a folder with the same name exists in the parent."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "projectId": { "type": "string" },
                "parentId": { "type": "string" },
                "name": { "type": "string" }
            },
            "required": ["projectId", "name"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, args: Value) -> Result<Value, EngineError> {
        let args: CreateFolderArgs = parse_args(self.name(), args)?;
        let id = self
            .store
            .create_folder(&args.project_id, args.parent_id.as_deref(), &args.name)
            .await
            .map_err(|e| domain_to_tool(self.name(), e))?;
        Ok(json!({ "created": id, "name": args.name }))
    }
}

pub struct RenameEntry {
    store: Arc<dyn ProjectStore>,
}

impl RenameEntry {
    pub fn new(store: Arc<dyn ProjectStore>) -> Self {
        Self { store }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RenameEntryArgs {
    file_id: String,
    new_name: String,
}

#[async_trait]
impl Tool for RenameEntry {
    fn name(&self) -> &str {
        "rename_entry"
    }

    fn description(&self) -> &str {
        "Rename a file or folder"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "fileId": { "type": "string" },
                "newName": { "type": "string" }
            },
            "required": ["fileId", "newName"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, args: Value) -> Result<Value, EngineError> {
        let args: RenameEntryArgs = parse_args(self.name(), args)?;
        self.store
            .rename_entry(&args.file_id, &args.new_name)
            .await
            .map_err(|e| domain_to_tool(self.name(), e))?;
        Ok(json!({ "renamed": args.file_id, "name": args.new_name }))
    }
}

pub struct DeleteEntry {
    store: Arc<dyn ProjectStore>,
}

impl DeleteEntry {
    pub fn new(store: Arc<dyn ProjectStore>) -> Self {
        Self { store }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteEntryArgs {
    file_id: String,
}

#[async_trait]
impl Tool for DeleteEntry {
    fn name(&self) -> &str {
        "delete_entry"
    }

    fn description(&self) -> &str {
        "Delete a file, or a folder and everything under it"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "fileId": { "type": "string" }
            },
            "required": ["fileId"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, args: Value) -> Result<Value, EngineError> {
        let args: DeleteEntryArgs = parse_args(self.name(), args)?;
        self.store
            .delete_entry(&args.file_id)
            .await
            .map_err(|e| domain_to_tool(self.name(), e))?;
        Ok(json!({ "deleted": args.file_id }))
    }
}
