//! Core domain types shared by every Coven crate.
//!
//! See spec Section 3 (Data Model) and Section 6.3 (task store contract).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque, time-ordered identifier used for tasks and workflows.
///
/// Backed by a UUIDv7 so identifiers sort by creation order without a
/// separate `created_at` comparison.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(String);

impl Id {
    /// Generate a new identifier.
    pub fn new() -> Self {
        Self(uuid::Uuid::now_v7().to_string())
    }

    /// Wrap an existing identifier string (used when rehydrating from storage).
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl Default for Id {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Id {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Task type, as declared by the task store (spec Section 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Task,
    Feature,
    Bug,
    Epic,
}

impl TaskType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Feature => "feature",
            Self::Bug => "bug",
            Self::Epic => "epic",
        }
    }
}

/// Task status as tracked by the task store (spec Section 6.3).
///
/// Valid transitions: `open -> in_progress -> {pending_merge, blocked,
/// closed, open (release)}`; `pending_merge -> {closed, blocked}`;
/// `blocked -> {open, closed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Open,
    InProgress,
    PendingMerge,
    Blocked,
    Closed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::PendingMerge => "pending_merge",
            Self::Blocked => "blocked",
            Self::Closed => "closed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "open" => Some(Self::Open),
            "in_progress" => Some(Self::InProgress),
            "pending_merge" => Some(Self::PendingMerge),
            "blocked" => Some(Self::Blocked),
            "closed" => Some(Self::Closed),
            _ => None,
        }
    }
}

/// A task snapshot as held by the engine (spec Section 3).
///
/// The engine never mutates a task directly; every field change goes
/// through the task store contract (Section 6.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Id,
    pub title: String,
    pub body: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    /// 0 = highest priority, 4 = lowest.
    pub priority: u8,
    pub labels: Vec<String>,
    pub status: TaskStatus,
    /// Agent/session id currently holding the claim, empty if unclaimed.
    pub claimed_by: Option<String>,
    pub parent_id: Option<Id>,
    pub dependencies: Vec<Id>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Task {
    /// A task is eligible for the scheduler iff open, unclaimed, and every
    /// dependency is closed (spec Section 3 invariant). Dependency closure
    /// itself is checked by the caller against the task store, since this
    /// type only holds a snapshot.
    pub fn is_open_and_unclaimed(&self) -> bool {
        self.status == TaskStatus::Open && self.claimed_by.is_none()
    }
}

/// Workflow-level status (spec Section 4.3 state machine).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    AwaitingInput,
    AwaitingReview,
    Completed,
    Failed,
    Blocked,
    Cancelled,
}

impl WorkflowStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::AwaitingInput => "awaiting_input",
            Self::AwaitingReview => "awaiting_review",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "awaiting_input" => Some(Self::AwaitingInput),
            "awaiting_review" => Some(Self::AwaitingReview),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "blocked" => Some(Self::Blocked),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Terminal statuses never re-enter the interpreter.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Blocked | Self::Cancelled)
    }
}

/// Per-step terminal outcome recorded in the Workflow Context (spec Section 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    Success,
    Failed,
    Skipped,
}

impl StepOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

/// `on_fail` policy for `script` and `agent` steps (spec Section 4.2.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFail {
    /// Default: the workflow fails immediately.
    Abort,
    /// Failure is recorded but the interpreter advances.
    Continue,
    /// Symmetric with `on_success: exit_loop`. The spec leaves this as an
    /// open question (Section 9) and directs unknown-value rejection rather
    /// than guessing; Coven resolves it by supporting the value explicitly
    /// (see DESIGN.md).
    ExitLoop,
}

impl Default for OnFail {
    fn default() -> Self {
        Self::Abort
    }
}

/// `on_success` policy for `script`/`agent` steps (spec Section 4.2.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnSuccess {
    Continue,
    ExitLoop,
}

impl Default for OnSuccess {
    fn default() -> Self {
        Self::Continue
    }
}

/// `on_max_iterations` policy for `loop` steps (spec Section 4.2.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnMaxIterations {
    Exit,
    Block,
}

/// A human decision on a `merge` step awaiting review (spec Section 4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    Approve,
    Reject,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_round_trips_through_display_and_from_string() {
        let id = Id::new();
        let rebuilt = Id::from_string(id.to_string());
        assert_eq!(id, rebuilt);
    }

    #[test]
    fn id_serde_is_transparent_string() {
        let id = Id::from_string("0190.example");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"0190.example\"");
        let back: Id = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn task_status_round_trips_through_str() {
        for s in ["open", "in_progress", "pending_merge", "blocked", "closed"] {
            assert_eq!(TaskStatus::from_str(s).unwrap().as_str(), s);
        }
        assert!(TaskStatus::from_str("bogus").is_none());
    }

    #[test]
    fn workflow_status_terminal_classification() {
        assert!(WorkflowStatus::Completed.is_terminal());
        assert!(WorkflowStatus::Failed.is_terminal());
        assert!(WorkflowStatus::Blocked.is_terminal());
        assert!(WorkflowStatus::Cancelled.is_terminal());
        assert!(!WorkflowStatus::Running.is_terminal());
        assert!(!WorkflowStatus::AwaitingReview.is_terminal());
        assert!(!WorkflowStatus::AwaitingInput.is_terminal());
    }

    #[test]
    fn on_fail_defaults_to_abort() {
        assert_eq!(OnFail::default(), OnFail::Abort);
    }

    #[test]
    fn on_success_defaults_to_continue() {
        assert_eq!(OnSuccess::default(), OnSuccess::Continue);
    }

    #[test]
    fn task_eligibility_requires_open_and_unclaimed() {
        let now = chrono::Utc::now();
        let mut task = Task {
            id: Id::new(),
            title: "t".into(),
            body: String::new(),
            task_type: TaskType::Task,
            priority: 2,
            labels: vec![],
            status: TaskStatus::Open,
            claimed_by: None,
            parent_id: None,
            dependencies: vec![],
            created_at: now,
        };
        assert!(task.is_open_and_unclaimed());
        task.claimed_by = Some("agent-1".into());
        assert!(!task.is_open_and_unclaimed());
        task.claimed_by = None;
        task.status = TaskStatus::Blocked;
        assert!(!task.is_open_and_unclaimed());
    }
}
