//! Persisted journal record shapes (C4). See spec Section 3 and Section 4.4.
//!
//! One append-only journal per workflow; records are self-describing and
//! small. A record is flushed before the corresponding in-memory state
//! change is observable outside the Interpreter (`covend::storage` owns the
//! actual durability mechanics; this module only owns the record shape).

use serde::{Deserialize, Serialize};

use crate::context::StepPathEntry;
use crate::types::{Id, WorkflowStatus};

/// The kind of a journal record (spec Section 3, Section 4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalKind {
    WorkflowStart,
    StepStart,
    StepEnd,
    LoopIteration,
    WorkflowPause,
    WorkflowResume,
    WorkflowEnd,
}

impl JournalKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WorkflowStart => "workflow.start",
            Self::StepStart => "step.start",
            Self::StepEnd => "step.end",
            Self::LoopIteration => "loop.iteration",
            Self::WorkflowPause => "workflow.pause",
            Self::WorkflowResume => "workflow.resume",
            Self::WorkflowEnd => "workflow.end",
        }
    }
}

/// One append-only journal entry for a workflow.
///
/// `payload` carries enough to rebuild Context on restart: inputs,
/// outputs, current step path, and status (spec Section 4.4 recovery).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalRecord {
    /// Monotonic, per-workflow sequence number.
    pub seq: u64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub kind: JournalKind,
    pub payload: serde_json::Value,
}

/// Payload for [`JournalKind::WorkflowStart`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStartPayload {
    pub workflow_id: Id,
    pub task_id: Id,
    pub grimoire_name: String,
    pub worktree_path: String,
    pub target_branch: String,
}

/// Payload for [`JournalKind::StepStart`] and [`JournalKind::StepEnd`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepTransitionPayload {
    pub step_path: Vec<StepPathEntry>,
    pub kind: String,
    #[serde(default)]
    pub outcome: Option<String>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
}

/// Payload for [`JournalKind::LoopIteration`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopIterationPayload {
    pub loop_path: Vec<StepPathEntry>,
    pub iteration: u32,
}

/// Payload for [`JournalKind::WorkflowPause`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowPausePayload {
    pub status: WorkflowStatus,
    #[serde(default)]
    pub question_id: Option<String>,
}

/// Payload for [`JournalKind::WorkflowResume`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResumePayload {
    #[serde(default)]
    pub decision_reason: Option<String>,
}

/// Payload for [`JournalKind::WorkflowEnd`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEndPayload {
    pub status: WorkflowStatus,
    #[serde(default)]
    pub reason: Option<String>,
}

impl JournalRecord {
    pub fn new(seq: u64, kind: JournalKind, payload: impl Serialize) -> serde_json::Result<Self> {
        Ok(Self {
            seq,
            timestamp: chrono::Utc::now(),
            kind,
            payload: serde_json::to_value(payload)?,
        })
    }

    /// A record is terminal iff it is a `workflow.end` with a terminal
    /// status (spec Section 8, invariant 3: no record follows `workflow.end`).
    pub fn is_terminal(&self) -> bool {
        self.kind == JournalKind::WorkflowEnd
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn journal_kind_as_str_matches_spec_naming() {
        assert_eq!(JournalKind::WorkflowStart.as_str(), "workflow.start");
        assert_eq!(JournalKind::StepStart.as_str(), "step.start");
        assert_eq!(JournalKind::StepEnd.as_str(), "step.end");
        assert_eq!(JournalKind::LoopIteration.as_str(), "loop.iteration");
        assert_eq!(JournalKind::WorkflowPause.as_str(), "workflow.pause");
        assert_eq!(JournalKind::WorkflowResume.as_str(), "workflow.resume");
        assert_eq!(JournalKind::WorkflowEnd.as_str(), "workflow.end");
    }

    #[test]
    fn new_record_serializes_arbitrary_payload() {
        let payload = WorkflowStartPayload {
            workflow_id: Id::from_string("wf-1"),
            task_id: Id::from_string("task-1"),
            grimoire_name: "implement-bead".into(),
            worktree_path: "/tmp/wt".into(),
            target_branch: "main".into(),
        };
        let record = JournalRecord::new(1, JournalKind::WorkflowStart, payload).unwrap();
        assert_eq!(record.seq, 1);
        assert_eq!(record.payload["grimoire_name"], "implement-bead");
        assert!(!record.is_terminal());
    }

    #[test]
    fn workflow_end_record_is_terminal() {
        let payload = WorkflowEndPayload {
            status: WorkflowStatus::Completed,
            reason: None,
        };
        let record = JournalRecord::new(5, JournalKind::WorkflowEnd, payload).unwrap();
        assert!(record.is_terminal());
    }

    #[test]
    fn step_transition_payload_round_trips() {
        let payload = StepTransitionPayload {
            step_path: vec![StepPathEntry::new("implement")],
            kind: "agent".into(),
            outcome: Some("success".into()),
            duration_ms: Some(120),
        };
        let json = serde_json::to_value(&payload).unwrap();
        let back: StepTransitionPayload = serde_json::from_value(json).unwrap();
        assert_eq!(back.step_path.len(), 1);
        assert_eq!(back.outcome.as_deref(), Some("success"));
    }
}
