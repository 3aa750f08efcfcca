//! Schema-validated capabilities the agent may invoke.
//!
//! Tools are dispatched exclusively from inside a memoized step, so a
//! tool's side effect happens at most once per successful execution even
//! across replay. A handler's domain error is surfaced back to the agent
//! as an error tool-result; only authorization and transient failures
//! escape to the instance level.

pub mod fetch;
pub mod files;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use jsonschema::JSONSchema;
use serde_json::Value;

use relay_llm::ToolDefinition;
use relay_sdk::{EngineError, ProjectStore};

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema for the tool's arguments.
    fn input_schema(&self) -> Value;

    async fn execute(&self, args: Value) -> Result<Value, EngineError>;
}

struct RegisteredTool {
    tool: Arc<dyn Tool>,
    schema: JSONSchema,
    definition: ToolDefinition,
}

/// Name-keyed table of tools with their compiled input schemas.
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), EngineError> {
        let raw_schema = tool.input_schema();
        let schema = JSONSchema::compile(&raw_schema).map_err(|e| {
            EngineError::Config(format!("invalid schema for tool '{}': {e}", tool.name()))
        })?;
        let definition = ToolDefinition {
            name: tool.name().to_string(),
            description: tool.description().to_string(),
            input_schema: raw_schema,
        };
        tracing::debug!(tool = %definition.name, "registered tool");
        self.tools.insert(
            definition.name.clone(),
            RegisteredTool {
                tool,
                schema,
                definition,
            },
        );
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Tool definitions in a stable order, for the model request.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut definitions: Vec<ToolDefinition> = self
            .tools
            .values()
            .map(|entry| entry.definition.clone())
            .collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        definitions
    }

    /// Validate and execute one tool call. Unknown names and schema
    /// violations come back as tool errors so the agent can adapt.
    pub async fn dispatch(&self, name: &str, args: &Value) -> Result<Value, EngineError> {
        let entry = self
            .tools
            .get(name)
            .ok_or_else(|| EngineError::tool(name, "unknown tool"))?;

        if let Err(errors) = entry.schema.validate(args) {
            let detail = errors
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            return Err(EngineError::tool(name, format!("invalid arguments: {detail}")));
        }

        entry.tool.execute(args.clone()).await
    }
}

/// The standard tool set: file capabilities bound to the store, plus the
/// URL fetcher.
pub fn builtin_registry(store: Arc<dyn ProjectStore>) -> Result<ToolRegistry, EngineError> {
    let mut registry = ToolRegistry::new();
    registry.register(Arc::new(files::ReadFile::new(store.clone())))?;
    registry.register(Arc::new(files::ListFolder::new(store.clone())))?;
    registry.register(Arc::new(files::UpdateFile::new(store.clone())))?;
    registry.register(Arc::new(files::CreateFile::new(store.clone())))?;
    registry.register(Arc::new(files::CreateFolder::new(store.clone())))?;
    registry.register(Arc::new(files::RenameEntry::new(store.clone())))?;
    registry.register(Arc::new(files::DeleteEntry::new(store)))?;
    registry.register(Arc::new(fetch::FetchUrl::new()))?;
    Ok(registry)
}

/// Downgrade store domain errors into tool errors. Authorization,
/// configuration and transient failures keep their class and escape to
/// the instance level.
pub(crate) fn domain_to_tool(tool: &str, err: EngineError) -> EngineError {
    match err {
        EngineError::NotFound(what) => EngineError::tool(tool, format!("{what} not found")),
        EngineError::StoreRejected { message, .. } => EngineError::tool(tool, message),
        other => other,
    }
}

/// Parse schema-validated arguments into a typed struct.
pub(crate) fn parse_args<T: serde::de::DeserializeOwned>(
    tool: &str,
    args: Value,
) -> Result<T, EngineError> {
    serde_json::from_value(args)
        .map_err(|e| EngineError::tool(tool, format!("invalid arguments: {e}")))
}
