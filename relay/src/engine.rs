//! The durable execution engine.
//!
//! Owns the journal, the registered definitions and the correlation
//! table. Instances execute concurrently and independently; within one
//! instance, steps are strictly sequential because the body runs on a
//! single task with a single `StepContext`. The engine itself is cheap to
//! clone, all state lives behind shared handles.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use relay_sdk::{EngineError, IngressEvent, InstanceState, TerminalOutcome, WorkflowInstance};

use crate::correlator::{Correlator, InstanceHandle};
use crate::executor::StepContext;
use crate::journal::Journal;
use crate::retry::RetryPolicy;
use crate::workflows::WorkflowDefinition;

#[derive(Clone)]
pub struct Engine {
    journal: Arc<Journal>,
    correlator: Arc<Correlator>,
    definitions: Arc<HashMap<String, Arc<dyn WorkflowDefinition>>>,
    retry: RetryPolicy,
}

impl Engine {
    pub fn new(journal: Arc<Journal>, retry: RetryPolicy) -> Self {
        Self {
            journal,
            correlator: Arc::new(Correlator::new()),
            definitions: Arc::new(HashMap::new()),
            retry,
        }
    }

    /// Register a definition. Call before the engine is shared.
    pub fn register(mut self, definition: Arc<dyn WorkflowDefinition>) -> Self {
        Arc::make_mut(&mut self.definitions).insert(definition.id().to_string(), definition);
        self
    }

    pub fn journal(&self) -> &Arc<Journal> {
        &self.journal
    }

    /// Route an ingress event: cancellations correlate against running
    /// instances, trigger events start new ones.
    pub async fn ingest(&self, event: IngressEvent) -> Result<(), EngineError> {
        if matches!(event, IngressEvent::MessageCancel(_)) {
            self.cancel_matching(&event);
            return Ok(());
        }

        let mut started = 0;
        for definition in self.definitions.values() {
            if let Some(trigger) = definition.trigger_from(&event) {
                self.submit(definition.id(), trigger)?;
                started += 1;
            }
        }
        if started == 0 {
            tracing::debug!("event matched no registered definition");
        }
        Ok(())
    }

    /// Create an instance and run it on a background task.
    pub fn submit(&self, definition_id: &str, trigger: Value) -> Result<Uuid, EngineError> {
        let definition = self.definition(definition_id)?;
        let correlation_key = definition.correlation_key(&trigger).unwrap_or_default();
        let instance = self
            .journal
            .create_instance(definition_id, &correlation_key, &trigger)?;
        let id = instance.id;

        let engine = self.clone();
        tokio::spawn(async move {
            if let Err(err) = engine.run_instance(definition, instance).await {
                tracing::error!(instance = %id, error = %err, "instance bookkeeping failed");
            }
        });

        Ok(id)
    }

    /// Create an instance and drive it to a terminal state inline.
    pub async fn execute(
        &self,
        definition_id: &str,
        trigger: Value,
    ) -> Result<TerminalOutcome, EngineError> {
        let definition = self.definition(definition_id)?;
        let correlation_key = definition.correlation_key(&trigger).unwrap_or_default();
        let instance = self
            .journal
            .create_instance(definition_id, &correlation_key, &trigger)?;
        self.run_instance(definition, instance).await
    }

    /// Resume executions interrupted by a crash. Instances that were
    /// already Cancelling are finalized as Cancelled; everything else
    /// replays from its step log.
    pub async fn recover(&self) -> Result<usize, EngineError> {
        let open = self.journal.non_terminal_instances()?;
        let count = open.len();

        for instance in open {
            let definition = match self.definitions.get(&instance.definition_id) {
                Some(definition) => Arc::clone(definition),
                None => {
                    tracing::warn!(
                        instance = %instance.id,
                        definition = %instance.definition_id,
                        "skipping recovery of unknown definition"
                    );
                    continue;
                }
            };

            if instance.state == InstanceState::Cancelling {
                self.journal
                    .set_instance_state(instance.id, InstanceState::Cancelled)?;
                definition.on_cancelled(&instance.trigger).await;
                tracing::info!(instance = %instance.id, "finalized cancelling instance after restart");
                continue;
            }

            tracing::info!(
                instance = %instance.id,
                definition = %instance.definition_id,
                "replaying instance after restart"
            );
            let engine = self.clone();
            tokio::spawn(async move {
                if let Err(err) = engine.run_instance(definition, instance).await {
                    tracing::error!(error = %err, "instance bookkeeping failed during recovery");
                }
            });
        }

        Ok(count)
    }

    /// Correlate a cancellation event against the running instances.
    /// Returns how many instances it reached; zero matches is a no-op.
    pub fn cancel_matching(&self, event: &IngressEvent) -> usize {
        let matches = self.correlator.matching(|handle| {
            self.definitions
                .get(&handle.definition_id)
                .is_some_and(|definition| definition.cancels_on(event, &handle.correlation_key))
        });

        if matches.is_empty() {
            tracing::debug!("cancellation event matched no running instance");
            return 0;
        }

        let mut cancelled = 0;
        for handle in matches {
            // Fire the token first so a step boundary reached mid-write
            // already observes the cancellation.
            handle.cancel.cancel();
            match self
                .journal
                .set_instance_state(handle.instance_id, InstanceState::Cancelling)
            {
                Ok(()) => {
                    cancelled += 1;
                    tracing::info!(
                        instance = %handle.instance_id,
                        key = %handle.correlation_key,
                        "cancelling instance"
                    );
                }
                Err(err) => {
                    // The instance raced into a terminal state; nothing to do.
                    tracing::debug!(
                        instance = %handle.instance_id,
                        error = %err,
                        "cancel raced terminal state"
                    );
                }
            }
        }
        cancelled
    }

    fn definition(&self, id: &str) -> Result<Arc<dyn WorkflowDefinition>, EngineError> {
        self.definitions
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::Config(format!("unknown workflow definition '{id}'")))
    }

    async fn run_instance(
        &self,
        definition: Arc<dyn WorkflowDefinition>,
        instance: WorkflowInstance,
    ) -> Result<TerminalOutcome, EngineError> {
        let token = CancellationToken::new();
        self.correlator.register(InstanceHandle {
            instance_id: instance.id,
            definition_id: instance.definition_id.clone(),
            correlation_key: instance.correlation_key.clone(),
            cancel: token.clone(),
        });

        let outcome = self.drive(definition.as_ref(), &instance, token).await;

        self.correlator.deregister(instance.id);
        outcome
    }

    async fn drive(
        &self,
        definition: &dyn WorkflowDefinition,
        instance: &WorkflowInstance,
        token: CancellationToken,
    ) -> Result<TerminalOutcome, EngineError> {
        self.journal
            .set_instance_state(instance.id, InstanceState::Running)?;

        let ctx = StepContext::new(
            instance.id,
            Arc::clone(&self.journal),
            token,
            self.retry.clone(),
        );

        match definition.run(&ctx, &instance.trigger).await {
            Ok(value) => {
                self.journal
                    .set_instance_state(instance.id, InstanceState::Completed)?;
                tracing::info!(instance = %instance.id, "instance completed");
                Ok(TerminalOutcome::Completed(value))
            }
            Err(EngineError::Cancelled) => {
                self.journal
                    .set_instance_state(instance.id, InstanceState::Cancelled)?;
                // Cancellation and failure are disjoint terminal paths:
                // the failure handler is not invoked here.
                definition.on_cancelled(&instance.trigger).await;
                tracing::info!(instance = %instance.id, "instance cancelled");
                Ok(TerminalOutcome::Cancelled)
            }
            Err(err) => {
                self.journal
                    .set_instance_state(instance.id, InstanceState::Failed)?;
                tracing::error!(instance = %instance.id, error = %err, "instance failed");
                definition.on_failure(&instance.trigger, &err).await;
                Ok(TerminalOutcome::Failed(err.to_string()))
            }
        }
    }
}
