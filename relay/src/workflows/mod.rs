//! Workflow definitions.
//!
//! A definition binds a trigger to a durable body built from the step
//! primitives, plus the compensations that run on the two terminal paths
//! that need them. Failure and cancellation are disjoint: `on_failure`
//! never runs for a cancelled instance and vice versa.

pub mod process_message;
pub mod title;

use async_trait::async_trait;
use serde_json::Value;

use relay_sdk::{EngineError, IngressEvent};

use crate::executor::StepContext;

#[async_trait]
pub trait WorkflowDefinition: Send + Sync {
    fn id(&self) -> &str;

    /// The trigger payload if this event starts an instance of this
    /// definition; `None` for events it does not react to.
    fn trigger_from(&self, event: &IngressEvent) -> Option<Value>;

    /// The correlation key for a trigger payload, used to match later
    /// cancellation events against this instance.
    fn correlation_key(&self, trigger: &Value) -> Option<String>;

    /// Whether an ingress event cancels an instance carrying the given
    /// correlation key.
    fn cancels_on(&self, event: &IngressEvent, correlation_key: &str) -> bool;

    /// The durable body. Every suspension point goes through `ctx`.
    async fn run(&self, ctx: &StepContext, trigger: &Value) -> Result<Value, EngineError>;

    /// Invoked exactly once when the instance ends Failed. Best effort:
    /// its own errors are logged, never retried.
    async fn on_failure(&self, trigger: &Value, error: &EngineError);

    /// Invoked once when the instance ends Cancelled. Best effort.
    async fn on_cancelled(&self, _trigger: &Value) {}
}
