//! Event Bus payload shapes (C5). See spec Section 4.5 and Section 6.2.
//!
//! Each event carries `workflow_id`, `task_id`, a monotonic per-workflow
//! `seq`, a `timestamp`, and a kind-specific payload. Session- and
//! task-scoped events (not tied to one workflow) leave `workflow_id` unset.

use serde::{Deserialize, Serialize};

use crate::context::StepPathEntry;
use crate::types::Id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SessionStarted,
    SessionStopped,
    WorkflowStarted,
    WorkflowStepStarted,
    WorkflowStepCompleted,
    WorkflowLoopIteration,
    WorkflowPendingMerge,
    WorkflowAwaitingInput,
    WorkflowCompleted,
    WorkflowFailed,
    WorkflowBlocked,
    WorkflowCancelled,
    AgentOutput,
    AgentFailed,
    TaskCreated,
    TaskUpdated,
    TaskClosed,
    StateSnapshot,
    Heartbeat,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SessionStarted => "session.started",
            Self::SessionStopped => "session.stopped",
            Self::WorkflowStarted => "workflow.started",
            Self::WorkflowStepStarted => "workflow.step.started",
            Self::WorkflowStepCompleted => "workflow.step.completed",
            Self::WorkflowLoopIteration => "workflow.loop.iteration",
            Self::WorkflowPendingMerge => "workflow.pending_merge",
            Self::WorkflowAwaitingInput => "workflow.awaiting_input",
            Self::WorkflowCompleted => "workflow.completed",
            Self::WorkflowFailed => "workflow.failed",
            Self::WorkflowBlocked => "workflow.blocked",
            Self::WorkflowCancelled => "workflow.cancelled",
            Self::AgentOutput => "agent.output",
            Self::AgentFailed => "agent.failed",
            Self::TaskCreated => "task.created",
            Self::TaskUpdated => "task.updated",
            Self::TaskClosed => "task.closed",
            Self::StateSnapshot => "state.snapshot",
            Self::Heartbeat => "heartbeat",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStartedPayload {
    pub target_branch: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStartedPayload {
    pub workflow_id: Id,
    pub task_id: Id,
    pub grimoire: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStepStartedPayload {
    pub step_path: Vec<StepPathEntry>,
    pub kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStepCompletedPayload {
    pub step_path: Vec<StepPathEntry>,
    pub status: String,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowLoopIterationPayload {
    pub loop_path: Vec<StepPathEntry>,
    pub iteration: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowAwaitingInputPayload {
    pub question_id: String,
    pub text: String,
    #[serde(default)]
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowTerminalPayload {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOutputPayload {
    pub workflow_id: Id,
    pub line: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentFailedPayload {
    pub workflow_id: Id,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEventPayload {
    pub task_id: Id,
    pub fields: serde_json::Value,
}

/// A typed event published on the bus. `workflow_id`/`task_id` are absent
/// for events not scoped to a single workflow (e.g. `session.started`,
/// `heartbeat`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    #[serde(default)]
    pub workflow_id: Option<Id>,
    #[serde(default)]
    pub task_id: Option<Id>,
    /// Monotonic per-workflow sequence number (spec Section 4.5). Zero for
    /// events not scoped to a workflow.
    pub seq: u64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(kind: EventKind, seq: u64, payload: impl Serialize) -> serde_json::Result<Self> {
        Ok(Self {
            kind,
            workflow_id: None,
            task_id: None,
            seq,
            timestamp: chrono::Utc::now(),
            payload: serde_json::to_value(payload)?,
        })
    }

    pub fn with_workflow(mut self, workflow_id: Id) -> Self {
        self.workflow_id = Some(workflow_id);
        self
    }

    pub fn with_task(mut self, task_id: Id) -> Self {
        self.task_id = Some(task_id);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kind_as_str_matches_spec_naming() {
        assert_eq!(EventKind::WorkflowStarted.as_str(), "workflow.started");
        assert_eq!(
            EventKind::WorkflowStepCompleted.as_str(),
            "workflow.step.completed"
        );
        assert_eq!(
            EventKind::WorkflowPendingMerge.as_str(),
            "workflow.pending_merge"
        );
        assert_eq!(EventKind::AgentOutput.as_str(), "agent.output");
        assert_eq!(EventKind::TaskClosed.as_str(), "task.closed");
        assert_eq!(EventKind::Heartbeat.as_str(), "heartbeat");
    }

    #[test]
    fn event_carries_workflow_and_task_ids_when_scoped() {
        let payload = WorkflowStartedPayload {
            workflow_id: Id::from_string("wf-1"),
            task_id: Id::from_string("task-1"),
            grimoire: "implement-bead".into(),
        };
        let event = Event::new(EventKind::WorkflowStarted, 1, payload)
            .unwrap()
            .with_workflow(Id::from_string("wf-1"))
            .with_task(Id::from_string("task-1"));
        assert_eq!(event.workflow_id, Some(Id::from_string("wf-1")));
        assert_eq!(event.payload["grimoire"], "implement-bead");
    }

    #[test]
    fn heartbeat_event_has_no_workflow_scope() {
        let event = Event::new(EventKind::Heartbeat, 0, serde_json::json!({})).unwrap();
        assert!(event.workflow_id.is_none());
        assert!(event.task_id.is_none());
    }

    #[test]
    fn step_completed_payload_round_trips() {
        let payload = WorkflowStepCompletedPayload {
            step_path: vec![StepPathEntry::new("implement")],
            status: "success".into(),
            duration_ms: 250,
        };
        let event = Event::new(EventKind::WorkflowStepCompleted, 3, &payload).unwrap();
        let back: WorkflowStepCompletedPayload =
            serde_json::from_value(event.payload.clone()).unwrap();
        assert_eq!(back.status, "success");
        assert_eq!(back.duration_ms, 250);
    }
}
