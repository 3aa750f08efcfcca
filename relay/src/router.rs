//! The agent network router.
//!
//! One state machine governs loop termination: invoke the model, decide
//! on the newest result, either finalize or execute the tool calls and go
//! again, up to the iteration bound. Every model invocation and every
//! tool call is its own memoized step, so a replayed instance walks the
//! same path without repeating side effects.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use relay_llm::{ChatMessage, ChatRequest, ChatResponse, ContentBlock, LlmError, ModelClient};
use relay_sdk::{AgentIterationState, AgentResult, EngineError, ErrorClass, OutputSegment};

use crate::executor::StepContext;
use crate::tools::ToolRegistry;

/// Returned when the bound forces a stop and no iteration produced text.
pub const FORCED_STOP_FALLBACK: &str =
    "I wasn't able to put together a final answer, but the work above has been applied.";

pub struct AgentNetwork {
    model: Arc<dyn ModelClient>,
    tools: Arc<ToolRegistry>,
    max_iterations: u32,
    max_tokens: u32,
}

/// A tool step's persisted outcome. Domain errors are part of the result
/// (the agent sees them and adapts), so they memoize like any success.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ToolStepOutcome {
    output: Value,
    is_error: bool,
}

impl AgentNetwork {
    pub fn new(
        model: Arc<dyn ModelClient>,
        tools: Arc<ToolRegistry>,
        max_iterations: u32,
        max_tokens: u32,
    ) -> Self {
        Self {
            model,
            tools,
            max_iterations,
            max_tokens,
        }
    }

    /// Drive the loop to a final text.
    pub async fn run(
        &self,
        ctx: &StepContext,
        system_prompt: &str,
        mut transcript: Vec<ChatMessage>,
    ) -> Result<String, EngineError> {
        let mut state = AgentIterationState::default();
        let definitions = self.tools.definitions();

        for iteration in 0..self.max_iterations {
            let request = ChatRequest::new(transcript.clone())
                .with_system(system_prompt)
                .with_tools(definitions.clone())
                .with_max_tokens(self.max_tokens);

            let result: AgentResult = ctx
                .run(&format!("agent-call-{iteration}"), || {
                    let model = Arc::clone(&self.model);
                    let request = request.clone();
                    async move {
                        model
                            .complete(request)
                            .await
                            .map(response_to_result)
                            .map_err(model_error)
                    }
                })
                .await?;

            transcript.push(assistant_message(&result));
            state.push(result.clone());

            if result.is_final() {
                let text = result.first_text().unwrap_or_default().to_string();
                tracing::info!(iteration = iteration + 1, "agent loop finished with text turn");
                return Ok(text);
            }

            // Continue: run every tool call through a memoized step and
            // feed the results into the next invocation's context.
            let mut result_blocks = Vec::new();
            let mut result_segments = Vec::new();
            for (index, (call_id, tool_name, args)) in result.tool_calls().into_iter().enumerate()
            {
                let step_name = format!("tool-{iteration}-{index}-{tool_name}");
                let outcome: ToolStepOutcome = ctx
                    .run(&step_name, || {
                        let args = args.clone();
                        let tool_name = tool_name.to_string();
                        async move {
                            match self.tools.dispatch(&tool_name, &args).await {
                                Ok(output) => Ok(ToolStepOutcome {
                                    output,
                                    is_error: false,
                                }),
                                Err(err) if err.class() == ErrorClass::Tool => {
                                    tracing::warn!(tool = %tool_name, error = %err, "tool reported an error");
                                    Ok(ToolStepOutcome {
                                        output: Value::String(err.to_string()),
                                        is_error: true,
                                    })
                                }
                                Err(err) => Err(err),
                            }
                        }
                    })
                    .await?;

                result_blocks.push(ContentBlock::ToolResult {
                    tool_use_id: call_id.to_string(),
                    content: outcome.output.to_string(),
                    is_error: outcome.is_error,
                });
                result_segments.push(OutputSegment::ToolResult {
                    id: call_id.to_string(),
                    tool_name: tool_name.to_string(),
                    output: outcome.output,
                    is_error: outcome.is_error,
                });
            }

            if let Some(last) = state.results.last_mut() {
                last.outputs.extend(result_segments);
            }
            if !result_blocks.is_empty() {
                transcript.push(ChatMessage::tool_results(result_blocks));
            }
        }

        // Bound reached without an unambiguous text turn: finalize with
        // the best text seen anywhere, newest first.
        let text = state
            .best_text()
            .unwrap_or(FORCED_STOP_FALLBACK)
            .to_string();
        tracing::warn!(
            max_iterations = self.max_iterations,
            "agent loop hit the iteration bound, forcing stop"
        );
        Ok(text)
    }
}

/// Map a model turn into the router's segment vocabulary.
fn response_to_result(response: ChatResponse) -> AgentResult {
    let outputs = response
        .content
        .into_iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } => Some(OutputSegment::Text {
                role: "assistant".to_string(),
                content: text,
            }),
            ContentBlock::ToolUse { id, name, input } => Some(OutputSegment::ToolCall {
                id,
                tool_name: name,
                args: input,
            }),
            // The model never sends tool results; ignore defensively.
            ContentBlock::ToolResult { .. } => None,
        })
        .collect();
    AgentResult { outputs }
}

/// Rebuild the assistant turn for the transcript from a (possibly
/// replayed) result.
fn assistant_message(result: &AgentResult) -> ChatMessage {
    let blocks = result
        .outputs
        .iter()
        .filter_map(|segment| match segment {
            OutputSegment::Text { content, .. } => Some(ContentBlock::Text {
                text: content.clone(),
            }),
            OutputSegment::ToolCall {
                id,
                tool_name,
                args,
            } => Some(ContentBlock::ToolUse {
                id: id.clone(),
                name: tool_name.clone(),
                input: args.clone(),
            }),
            OutputSegment::ToolResult { .. } => None,
        })
        .collect();
    ChatMessage::assistant_blocks(blocks)
}

fn model_error(err: LlmError) -> EngineError {
    match err {
        LlmError::MissingApiKey => {
            EngineError::Config("no model API key configured".to_string())
        }
        LlmError::AuthFailed => EngineError::Unauthorized,
        err if err.is_transient() => EngineError::ModelUnavailable(err.to_string()),
        err => EngineError::ModelRejected(err.to_string()),
    }
}
