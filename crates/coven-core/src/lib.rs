pub mod config;
pub mod context;
pub mod events;
pub mod grimoire;
pub mod journal;
pub mod template;
pub mod types;

pub use config::{Config, ConfigError, MergeStrategy, QueuePolicy};
pub use context::{Context, StepOutput, StepPathEntry};
pub use events::{Event, EventKind};
pub use grimoire::{AgentStep, Grimoire, GrimoireError, LoopStep, MergeStep, ScriptStep, Step, StepKind};
pub use journal::{JournalKind, JournalRecord};
pub use template::{render, TemplateError};
pub use types::{
    Id, OnFail, OnMaxIterations, OnSuccess, ReviewDecision, StepOutcome, Task, TaskStatus,
    TaskType, WorkflowStatus,
};
