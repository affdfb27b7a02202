//! Suspension points where a workflow waits on a human (spec Section 4.7):
//! `merge` steps with `require_review: true`, and `agent` steps whose
//! termination object asks a question.
//!
//! Each suspended workflow registers a oneshot sender here; resolving it
//! (via the RPC surface) wakes the Interpreter task blocked on the receiver.

use coven_core::{Id, ReviewDecision};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::oneshot;

#[derive(Debug, thiserror::Error)]
pub enum ReviewGateError {
    #[error("no pending gate for workflow {0}")]
    NoPendingGate(Id),
    #[error("gate for workflow {0} was already resolved or dropped")]
    AlreadyResolved(Id),
}

pub type Result<T> = std::result::Result<T, ReviewGateError>;

/// A human's resolution of a `merge` step's review gate.
#[derive(Debug, Clone)]
pub struct MergeResolution {
    pub decision: ReviewDecision,
    pub reason: Option<String>,
}

/// A human's answer to a workflow's `awaiting_input` question.
#[derive(Debug, Clone)]
pub struct InputResolution {
    pub answer: String,
}

/// In-memory map of suspended workflows to the oneshot channel that will
/// wake their Interpreter task. Cleared on resolution; rebuilt for any
/// workflow the daemon finds in `awaiting_review`/`awaiting_input` on
/// restart, which must re-register before the RPC surface can resolve it.
#[derive(Default)]
pub struct ReviewGates {
    merge_gates: Mutex<HashMap<Id, oneshot::Sender<MergeResolution>>>,
    input_gates: Mutex<HashMap<Id, oneshot::Sender<InputResolution>>>,
}

impl ReviewGates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a merge gate and return the receiver the Interpreter should
    /// await.
    pub fn register_merge(&self, workflow_id: Id) -> oneshot::Receiver<MergeResolution> {
        let (tx, rx) = oneshot::channel();
        self.merge_gates.lock().expect("lock poisoned").insert(workflow_id, tx);
        rx
    }

    pub fn register_input(&self, workflow_id: Id) -> oneshot::Receiver<InputResolution> {
        let (tx, rx) = oneshot::channel();
        self.input_gates.lock().expect("lock poisoned").insert(workflow_id, tx);
        rx
    }

    pub fn resolve_merge(&self, workflow_id: &Id, resolution: MergeResolution) -> Result<()> {
        let tx = self
            .merge_gates
            .lock()
            .expect("lock poisoned")
            .remove(workflow_id)
            .ok_or_else(|| ReviewGateError::NoPendingGate(workflow_id.clone()))?;
        tx.send(resolution).map_err(|_| ReviewGateError::AlreadyResolved(workflow_id.clone()))
    }

    pub fn resolve_input(&self, workflow_id: &Id, resolution: InputResolution) -> Result<()> {
        let tx = self
            .input_gates
            .lock()
            .expect("lock poisoned")
            .remove(workflow_id)
            .ok_or_else(|| ReviewGateError::NoPendingGate(workflow_id.clone()))?;
        tx.send(resolution).map_err(|_| ReviewGateError::AlreadyResolved(workflow_id.clone()))
    }

    pub fn has_pending_merge(&self, workflow_id: &Id) -> bool {
        self.merge_gates.lock().expect("lock poisoned").contains_key(workflow_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_then_resolve_merge_gate_wakes_waiter() {
        let gates = ReviewGates::new();
        let workflow_id = Id::new();
        let rx = gates.register_merge(workflow_id.clone());

        gates
            .resolve_merge(&workflow_id, MergeResolution { decision: ReviewDecision::Approve, reason: None })
            .unwrap();

        let resolution = rx.await.unwrap();
        assert_eq!(resolution.decision, ReviewDecision::Approve);
    }

    #[test]
    fn resolve_without_pending_gate_errors() {
        let gates = ReviewGates::new();
        let err = gates
            .resolve_merge(&Id::new(), MergeResolution { decision: ReviewDecision::Approve, reason: None })
            .unwrap_err();
        assert!(matches!(err, ReviewGateError::NoPendingGate(_)));
    }

    #[test]
    fn has_pending_merge_reflects_registration() {
        let gates = ReviewGates::new();
        let workflow_id = Id::new();
        assert!(!gates.has_pending_merge(&workflow_id));
        let _rx = gates.register_merge(workflow_id.clone());
        assert!(gates.has_pending_merge(&workflow_id));
    }
}
