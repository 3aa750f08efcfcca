//! Cancellation by event correlation.
//!
//! Every running instance registers a handle keyed by its correlation key.
//! When a cancellation event arrives, the table is scanned synchronously;
//! each match is flipped to Cancelling and its token fired, which stops
//! further steps from starting. The step in flight is left alone.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct InstanceHandle {
    pub instance_id: Uuid,
    pub definition_id: String,
    pub correlation_key: String,
    pub cancel: CancellationToken,
}

#[derive(Default)]
pub struct Correlator {
    handles: Mutex<HashMap<Uuid, InstanceHandle>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handle: InstanceHandle) {
        self.handles
            .lock()
            .unwrap()
            .insert(handle.instance_id, handle);
    }

    pub fn deregister(&self, instance_id: Uuid) {
        self.handles.lock().unwrap().remove(&instance_id);
    }

    pub fn running_count(&self) -> usize {
        self.handles.lock().unwrap().len()
    }

    /// Handles whose definition/correlation pair satisfies `predicate`.
    /// Tokens are cloned out so the caller can fire them without holding
    /// the table lock.
    pub fn matching(
        &self,
        predicate: impl Fn(&InstanceHandle) -> bool,
    ) -> Vec<InstanceHandle> {
        self.handles
            .lock()
            .unwrap()
            .values()
            .filter(|handle| predicate(handle))
            .cloned()
            .collect()
    }
}
