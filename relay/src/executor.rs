//! Step primitives exposed to a running workflow body.
//!
//! `run` and `sleep` are the only suspension points a definition gets.
//! Both are memoized against the journal, both observe cancellation at
//! their boundary, and neither interrupts a body that is already in
//! flight.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use relay_sdk::{decode_step_result, EngineError, InstanceState};

use crate::journal::Journal;
use crate::retry::RetryPolicy;

/// Handle to one instance's durable execution, passed into the workflow
/// body. Steps of one instance run strictly sequentially: the context is
/// only ever used from the instance's own task.
pub struct StepContext {
    instance_id: Uuid,
    journal: Arc<Journal>,
    cancel: CancellationToken,
    retry: RetryPolicy,
}

impl StepContext {
    pub fn new(
        instance_id: Uuid,
        journal: Arc<Journal>,
        cancel: CancellationToken,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            instance_id,
            journal,
            cancel,
            retry,
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Execute a named step at most once.
    ///
    /// If a completed record for `name` exists, its stored result is
    /// returned without invoking the body. Otherwise the body runs —
    /// retried with backoff on transient errors up to the policy's bound —
    /// and the record is persisted before this call returns. That ordering
    /// is the crash-recovery contract: dying before the persist means the
    /// body replays, dying after means it is skipped.
    pub async fn run<T, F, Fut>(&self, name: &str, mut body: F) -> Result<T, EngineError>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, EngineError>>,
    {
        if self.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        if let Some(stored) = self.journal.completed_result(self.instance_id, name)? {
            tracing::debug!(step = name, "replaying memoized step result");
            return decode_step_result(stored);
        }

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match body().await {
                Ok(value) => {
                    let stored = serde_json::to_value(&value)?;
                    self.journal
                        .record_step_completed(self.instance_id, name, &stored, attempt)?;
                    tracing::debug!(step = name, attempt, "step completed");
                    return Ok(value);
                }
                Err(err) if err.is_transient() && self.retry.should_retry(attempt) => {
                    self.journal.record_step_attempt(
                        self.instance_id,
                        name,
                        attempt,
                        &err.to_string(),
                    )?;
                    let delay = self.retry.delay_for_attempt(attempt);
                    tracing::warn!(
                        step = name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient step failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    self.journal.record_step_failed(
                        self.instance_id,
                        name,
                        attempt,
                        &err.to_string(),
                    )?;
                    return Err(err);
                }
            }
        }
    }

    /// Suspend the instance without holding a worker thread.
    ///
    /// Memoized like any step, so a replayed instance does not sleep
    /// twice. The instance is marked Sleeping while suspended; a
    /// cancellation wakes the timer early and surfaces at this boundary.
    pub async fn sleep(&self, name: &str, duration: Duration) -> Result<(), EngineError> {
        if self.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        if self
            .journal
            .completed_result(self.instance_id, name)?
            .is_some()
        {
            tracing::debug!(step = name, "sleep already elapsed, skipping");
            return Ok(());
        }

        self.journal
            .set_instance_state(self.instance_id, InstanceState::Sleeping)?;
        tracing::debug!(step = name, ms = duration.as_millis() as u64, "instance sleeping");

        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.cancel.cancelled() => return Err(EngineError::Cancelled),
        }

        if self.cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        // The correlator may have flipped the instance to Cancelling
        // between the timer firing and this write; treat that as the
        // cancellation it is.
        if let Err(err) = self
            .journal
            .set_instance_state(self.instance_id, InstanceState::Running)
        {
            if self.cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            return Err(err);
        }

        self.journal.record_step_completed(
            self.instance_id,
            name,
            &serde_json::Value::Null,
            1,
        )?;
        Ok(())
    }
}
