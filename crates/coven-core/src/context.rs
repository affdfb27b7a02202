//! Workflow Context (C1): the in-memory bundle of task snapshot, step
//! outputs, and loop position used to render templates and decide
//! conditionals. See spec Section 3 and Section 4.3 (step-path mechanics).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::types::{Id, StepOutcome, Task, WorkflowStatus};

/// One entry in the step-path stack: the step's name, and the loop
/// iteration it ran under, if any (spec Section 4.3).
///
/// The stack is what gets journaled so a restart can resume execution
/// precisely without a tree of owning pointers (spec Section 9).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepPathEntry {
    pub step_name: String,
    pub iteration: Option<u32>,
}

impl StepPathEntry {
    pub fn new(step_name: impl Into<String>) -> Self {
        Self {
            step_name: step_name.into(),
            iteration: None,
        }
    }

    pub fn with_iteration(step_name: impl Into<String>, iteration: u32) -> Self {
        Self {
            step_name: step_name.into(),
            iteration: Some(iteration),
        }
    }
}

/// The terminal result of one step, as stored under its `output` name
/// (spec Section 3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutput {
    pub status: StepOutcome,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub duration_ms: u64,
    /// Structured payload from an `agent` step's terminal JSON object
    /// (spec Section 4.2.2), referenceable as `.<output>.outputs.<key>`.
    #[serde(default)]
    pub structured: Option<serde_json::Value>,
}

impl StepOutput {
    pub fn success(&self) -> bool {
        self.status == StepOutcome::Success
    }

    pub fn failed(&self) -> bool {
        self.status == StepOutcome::Failed
    }
}

/// Per-workflow in-memory context with a durable shadow (spec Section 3).
///
/// Created when the Scheduler claims a task; destroyed only after status
/// reaches a terminal value and worktree cleanup completes (owned
/// exclusively by its Interpreter for that lifetime).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Context {
    pub workflow_id: Id,
    pub task: Task,
    pub grimoire_name: String,
    pub worktree_path: String,
    pub target_branch: String,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub current_step_path: Vec<StepPathEntry>,
    pub outputs: HashMap<String, StepOutput>,
    /// The immediately preceding sibling's result in the enclosing
    /// container. `None` at the start of a grimoire or loop iteration
    /// (spec Section 3 invariant: entering a loop iteration resets
    /// `previous` to undefined until the first nested step completes).
    pub previous: Option<StepOutput>,
    pub status: WorkflowStatus,
}

impl Context {
    pub fn new(
        workflow_id: Id,
        task: Task,
        grimoire_name: impl Into<String>,
        worktree_path: impl Into<String>,
        target_branch: impl Into<String>,
    ) -> Self {
        Self {
            workflow_id,
            task,
            grimoire_name: grimoire_name.into(),
            worktree_path: worktree_path.into(),
            target_branch: target_branch.into(),
            started_at: chrono::Utc::now(),
            current_step_path: Vec::new(),
            outputs: HashMap::new(),
            previous: None,
            status: WorkflowStatus::Running,
        }
    }

    /// Record a step's terminal result. `previous` is updated to this
    /// result so the next sibling in the same container sees it; the
    /// output is also stored under its declared name for `.{name}.*`
    /// lookups.
    pub fn record_output(&mut self, output_name: &str, output: StepOutput) {
        self.previous = Some(output.clone());
        self.outputs.insert(output_name.to_string(), output);
    }

    /// Entering a fresh loop iteration resets `previous` (spec Section 3).
    pub fn enter_loop_iteration(&mut self) {
        self.previous = None;
    }

    pub fn push_step(&mut self, entry: StepPathEntry) {
        self.current_step_path.push(entry);
    }

    pub fn pop_step(&mut self) -> Option<StepPathEntry> {
        self.current_step_path.pop()
    }
}
