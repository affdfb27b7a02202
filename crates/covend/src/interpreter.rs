//! The Interpreter (C1): walks a grimoire's step tree against a Workflow
//! Context, executing script/agent/loop/merge steps and journaling every
//! transition. See spec Section 4.1-4.3.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use coven_core::config::Config;
use coven_core::{
    render, AgentStep, Context, EventKind, Grimoire, JournalKind, JournalRecord, LoopStep,
    MergeStep, OnFail, OnMaxIterations, OnSuccess, ReviewDecision, ScriptStep, Step, StepKind,
    StepOutcome, StepOutput, StepPathEntry, TaskStatus, WorkflowStatus,
};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::event_bus::EventBus;
use crate::grimoire_loader;
use crate::review_gate::{InputResolution, MergeResolution, ReviewGates};
use crate::storage::Storage;
use crate::{agent_process, git, script_exec};

#[derive(Debug, Error)]
pub enum InterpreterError {
    #[error("template error: {0}")]
    Template(#[from] coven_core::TemplateError),
    #[error("loader error: {0}")]
    Loader(#[from] grimoire_loader::LoaderError),
    #[error("storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),
    #[error("git error: {0}")]
    Git(#[from] git::GitError),
    #[error("workflow cancelled")]
    Cancelled,
    #[error("step {step} timed out")]
    Timeout { step: String },
    #[error("review gate for workflow was dropped before resolution")]
    GateDropped,
}

pub type Result<T> = std::result::Result<T, InterpreterError>;

/// What a finished container of steps (the grimoire body, or one loop body)
/// tells its caller to do next.
enum StepFlow {
    Continue,
    ExitLoop,
    /// A step failed with `on_fail: abort` (spec Section 4.2.3): the
    /// workflow ends `failed`.
    Abort(String),
    /// A loop exhausted `max_iterations` under `block`, or a merge step was
    /// rejected or hit a conflict (spec Section 4.2.4, §7 `ErrConflict`):
    /// the workflow ends `blocked`, distinct from an outright failure.
    Blocked(String),
}

pub struct Interpreter {
    pub storage: Arc<Storage>,
    pub events: Arc<EventBus>,
    pub gates: Arc<ReviewGates>,
    pub config: Config,
    pub workspace_root: std::path::PathBuf,
    /// Concurrency slot for this workflow, released while parked on a
    /// review gate and reacquired on resume (spec Section 9: suspension
    /// latency should not hold a scheduler slot, only the worktree).
    pub semaphore: Arc<Semaphore>,
    pub slot: Mutex<Option<OwnedSemaphorePermit>>,
}

impl Interpreter {
    /// Drive one workflow from its current position to a terminal status,
    /// or until `cancel` fires. Safe to call again after a restart: it
    /// resumes from `context.current_step_path` rather than the top.
    pub async fn run(
        &self,
        mut context: Context,
        grimoire: &Grimoire,
        cancel: CancellationToken,
    ) -> Result<Context> {
        let worktree_path = std::path::PathBuf::from(&context.worktree_path);

        let flow = self.execute_steps(&grimoire.steps, &mut context, &worktree_path, &cancel).await;

        let (status, reason) = match flow {
            Ok(StepFlow::Continue | StepFlow::ExitLoop) => (WorkflowStatus::Completed, None),
            Ok(StepFlow::Abort(reason)) => (WorkflowStatus::Failed, Some(reason)),
            Ok(StepFlow::Blocked(reason)) => (WorkflowStatus::Blocked, Some(reason)),
            Err(InterpreterError::Cancelled) => (WorkflowStatus::Cancelled, None),
            Err(e) => (WorkflowStatus::Failed, Some(e.to_string())),
        };

        if !context.status.is_terminal() {
            context.status = status;
            self.journal(&context, JournalKind::WorkflowEnd, coven_core::journal::WorkflowEndPayload {
                status,
                reason: reason.clone(),
            })
            .await?;
            self.storage.update_workflow_context(&context).await?;

            let kind = match status {
                WorkflowStatus::Completed => EventKind::WorkflowCompleted,
                WorkflowStatus::Blocked => EventKind::WorkflowBlocked,
                WorkflowStatus::Cancelled => EventKind::WorkflowCancelled,
                _ => EventKind::WorkflowFailed,
            };
            let _ = self
                .events
                .publish_workflow(kind, &context.workflow_id, &context.task.id, serde_json::json!({"reason": reason}))
                .await;
        }

        Ok(context)
    }

    /// Execute a container of steps in sequence. Returns how the *caller*
    /// (grimoire body or enclosing loop) should react.
    fn execute_steps<'a>(
        &'a self,
        steps: &'a [Step],
        context: &'a mut Context,
        worktree_path: &'a Path,
        cancel: &'a CancellationToken,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<StepFlow>> + 'a>> {
        Box::pin(async move {
            for step in steps {
                if cancel.is_cancelled() {
                    return Err(InterpreterError::Cancelled);
                }

                if let Some(when) = &step.when {
                    let rendered = render(when, context)?;
                    if !coven_core::template::is_truthy(&rendered) {
                        context.record_output(
                            step.output_name(),
                            StepOutput { status: StepOutcome::Skipped, exit_code: None, stdout: String::new(), duration_ms: 0, structured: None },
                        );
                        continue;
                    }
                }

                // Loop steps own their step-path entries per iteration
                // (`retry-loop[2]`, not `retry-loop` wrapping `retry-loop[2]`),
                // so they skip the generic single-entry push below.
                let flow = if let StepKind::Loop(l) = &step.kind {
                    self.run_loop_step(step, l, context, worktree_path, cancel).await?
                } else {
                    context.push_step(StepPathEntry::new(step.name.clone()));
                    self.journal_step_start(context, &step.kind).await?;
                    self.events
                        .publish_workflow(
                            EventKind::WorkflowStepStarted,
                            &context.workflow_id,
                            &context.task.id,
                            coven_core::events::WorkflowStepStartedPayload {
                                step_path: context.current_step_path.clone(),
                                kind: step_kind_name(&step.kind).to_string(),
                            },
                        )
                        .await
                        .ok();

                    let flow = match &step.kind {
                        StepKind::Script(s) => self.run_script_step(step, s, context, worktree_path, cancel).await?,
                        StepKind::Agent(a) => self.run_agent_step(step, a, context, worktree_path, cancel).await?,
                        StepKind::Merge(m) => self.run_merge_step(step, m, context, worktree_path, cancel).await?,
                        StepKind::Loop(_) => unreachable!("handled above"),
                    };
                    context.pop_step();
                    flow
                };

                match flow {
                    StepFlow::Continue => {}
                    other => return Ok(other),
                }
            }
            Ok(StepFlow::Continue)
        })
    }

    async fn run_script_step(
        &self,
        step: &Step,
        script: &ScriptStep,
        context: &mut Context,
        worktree_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<StepFlow> {
        let command = render(&script.command, context)?;
        let timeout = step.timeout.map_or(Duration::from_secs(self.config.agent_timeout_sec), |d| d.0);

        let outcome = tokio::select! {
            result = script_exec::run(&command, worktree_path, timeout) => result.map_err(|e| match e {
                script_exec::ScriptError::Timeout(_) => InterpreterError::Timeout { step: step.name.clone() },
                other => InterpreterError::Git(git::GitError::CommandFailed(other.to_string())),
            })?,
            () = cancel.cancelled() => return Err(InterpreterError::Cancelled),
        };

        let output = StepOutput {
            status: if outcome.success() { StepOutcome::Success } else { StepOutcome::Failed },
            exit_code: Some(outcome.exit_code),
            stdout: outcome.stdout,
            duration_ms: outcome.duration_ms,
            structured: None,
        };
        self.finish_step(context, step, &output).await?;

        Ok(self.decide_flow(output.success(), script.on_fail, script.on_success))
    }

    async fn run_agent_step(
        &self,
        step: &Step,
        agent: &AgentStep,
        context: &mut Context,
        worktree_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<StepFlow> {
        let spell_source = if agent.is_inline() {
            agent.spell.clone()
        } else {
            grimoire_loader::load_spell(&self.config.spells_dir, &agent.spell)?
        };
        let rendered = render(&spell_source, context)?;
        let timeout = step.timeout.map_or(Duration::from_secs(self.config.agent_timeout_sec), |d| d.0);

        let events = Arc::clone(&self.events);
        let workflow_id = context.workflow_id.clone();
        let task_id = context.task.id.clone();
        let base_context = context.clone();

        let outcome = agent_process::run(
            &self.config.agent_command,
            &self.config.agent_args,
            &rendered,
            worktree_path,
            timeout,
            cancel,
            move |line: &str| {
                let events = Arc::clone(&events);
                let workflow_id = workflow_id.clone();
                let task_id = task_id.clone();
                let line = line.to_string();
                tokio::spawn(async move {
                    let _ = events
                        .publish_workflow(
                            EventKind::AgentOutput,
                            &workflow_id,
                            &task_id,
                            coven_core::events::AgentOutputPayload { workflow_id: workflow_id.clone(), line },
                        )
                        .await;
                });
            },
            |question: agent_process::AgentQuestion| {
                let mut snapshot = base_context.clone();
                async move {
                    snapshot.status = WorkflowStatus::AwaitingInput;
                    let _ = self.storage.update_workflow_context(&snapshot).await;
                    let question_payload = serde_json::json!({
                        "id": question.id,
                        "text": question.text,
                        "options": question.options,
                    });
                    let _ = self.storage.set_workflow_question(&snapshot.workflow_id, Some(&question_payload)).await;
                    let _ = self
                        .journal(
                            &snapshot,
                            JournalKind::WorkflowPause,
                            coven_core::journal::WorkflowPausePayload {
                                status: snapshot.status,
                                question_id: Some(question.id.clone()),
                            },
                        )
                        .await;
                    self.events
                        .publish_workflow(
                            EventKind::WorkflowAwaitingInput,
                            &snapshot.workflow_id,
                            &snapshot.task.id,
                            coven_core::events::WorkflowAwaitingInputPayload {
                                question_id: question.id.clone(),
                                text: question.text.clone(),
                                options: question.options.clone(),
                            },
                        )
                        .await
                        .ok();

                    // Same rationale as the merge review gate: don't hold a
                    // scheduler slot for human answer latency.
                    let held_slot = self.slot.lock().await.take();
                    drop(held_slot);

                    let rx = self.gates.register_input(snapshot.workflow_id.clone());
                    let resolution = rx.await.unwrap_or(InputResolution { answer: String::new() });

                    if let Ok(permit) = self.semaphore.clone().acquire_owned().await {
                        *self.slot.lock().await = Some(permit);
                    }

                    snapshot.status = WorkflowStatus::Running;
                    let _ = self.storage.update_workflow_context(&snapshot).await;
                    let _ = self.storage.set_workflow_question(&snapshot.workflow_id, None).await;
                    let _ = self
                        .journal(
                            &snapshot,
                            JournalKind::WorkflowResume,
                            coven_core::journal::WorkflowResumePayload { decision_reason: None },
                        )
                        .await;

                    resolution.answer
                }
            },
        )
        .await
        .map_err(|e| match e {
            agent_process::AgentError::Cancelled => InterpreterError::Cancelled,
            agent_process::AgentError::Timeout(_) => InterpreterError::Timeout { step: step.name.clone() },
            other => InterpreterError::Git(git::GitError::CommandFailed(other.to_string())),
        })?;

        let output = StepOutput {
            status: if outcome.success() { StepOutcome::Success } else { StepOutcome::Failed },
            exit_code: Some(outcome.exit_code),
            stdout: outcome.stdout,
            duration_ms: outcome.duration_ms,
            structured: outcome.termination.clone(),
        };
        self.finish_step(context, step, &output).await?;

        Ok(self.decide_flow(outcome.success(), agent.on_fail, agent.on_success))
    }

    async fn run_loop_step(
        &self,
        step: &Step,
        loop_step: &LoopStep,
        context: &mut Context,
        worktree_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<StepFlow> {
        let mut iteration = 0u32;
        loop {
            if iteration >= loop_step.max_iterations {
                return Ok(match loop_step.on_max_iterations {
                    OnMaxIterations::Exit => StepFlow::Continue,
                    OnMaxIterations::Block => StepFlow::Blocked(format!(
                        "loop {:?} exceeded max_iterations ({})",
                        step.name, loop_step.max_iterations
                    )),
                });
            }

            context.push_step(StepPathEntry::with_iteration(step.name.clone(), iteration));
            context.enter_loop_iteration();
            self.events
                .publish_workflow(
                    EventKind::WorkflowLoopIteration,
                    &context.workflow_id,
                    &context.task.id,
                    coven_core::events::WorkflowLoopIterationPayload {
                        loop_path: context.current_step_path.clone(),
                        iteration,
                    },
                )
                .await
                .ok();

            let flow = self.execute_steps(&loop_step.steps, context, worktree_path, cancel).await?;
            context.pop_step();

            match flow {
                StepFlow::Continue => {
                    iteration += 1;
                }
                StepFlow::ExitLoop => return Ok(StepFlow::Continue),
                other @ (StepFlow::Abort(_) | StepFlow::Blocked(_)) => return Ok(other),
            }
        }
    }

    async fn run_merge_step(
        &self,
        step: &Step,
        merge: &MergeStep,
        context: &mut Context,
        _worktree_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<StepFlow> {
        if merge.require_review {
            context.status = WorkflowStatus::AwaitingReview;
            self.storage.update_workflow_context(context).await?;
            self.journal(context, JournalKind::WorkflowPause, coven_core::journal::WorkflowPausePayload {
                status: context.status,
                question_id: None,
            })
            .await?;
            self.events
                .publish_workflow(EventKind::WorkflowPendingMerge, &context.workflow_id, &context.task.id, serde_json::json!({}))
                .await
                .ok();
            self.storage.update_task_status(&context.task.id, TaskStatus::PendingMerge).await?;

            // Release the scheduler slot for the duration of the wait; a
            // human's review latency should not block other workflows from
            // claiming tasks.
            let held_slot = self.slot.lock().await.take();
            drop(held_slot);

            let rx = self.gates.register_merge(context.workflow_id.clone());
            let resolution: MergeResolution = tokio::select! {
                r = rx => r.map_err(|_| InterpreterError::GateDropped)?,
                () = cancel.cancelled() => return Err(InterpreterError::Cancelled),
            };

            if let Ok(permit) = self.semaphore.clone().acquire_owned().await {
                *self.slot.lock().await = Some(permit);
            }

            context.status = WorkflowStatus::Running;
            self.journal(context, JournalKind::WorkflowResume, coven_core::journal::WorkflowResumePayload {
                decision_reason: resolution.reason.clone(),
            })
            .await?;

            if resolution.decision == ReviewDecision::Reject {
                return Ok(StepFlow::Blocked(
                    resolution.reason.unwrap_or_else(|| "merge rejected by reviewer".to_string()),
                ));
            }
        }

        let run_branch = self.storage.get_workflow(&context.workflow_id).await?.run_branch;
        match git::merge_to_target(
            &self.workspace_root,
            &run_branch,
            &context.target_branch,
            &context.target_branch,
            self.config.merge_strategy,
        ) {
            Ok(()) => {}
            Err(git::GitError::MergeConflict(reason)) => return Ok(StepFlow::Blocked(reason)),
            Err(e) => return Err(e.into()),
        }
        self.storage.update_task_status(&context.task.id, TaskStatus::Closed).await?;
        self.events.publish_task(EventKind::TaskClosed, &context.task.id, serde_json::json!({})).await.ok();

        let output = StepOutput {
            status: StepOutcome::Success,
            exit_code: Some(0),
            stdout: String::new(),
            duration_ms: 0,
            structured: None,
        };
        self.finish_step(context, step, &output).await?;

        Ok(StepFlow::Continue)
    }

    fn decide_flow(&self, success: bool, on_fail: OnFail, on_success: OnSuccess) -> StepFlow {
        if success {
            match on_success {
                OnSuccess::Continue => StepFlow::Continue,
                OnSuccess::ExitLoop => StepFlow::ExitLoop,
            }
        } else {
            match on_fail {
                OnFail::Abort => StepFlow::Abort("step failed".to_string()),
                OnFail::Continue => StepFlow::Continue,
                OnFail::ExitLoop => StepFlow::ExitLoop,
            }
        }
    }

    async fn finish_step(&self, context: &mut Context, step: &Step, output: &StepOutput) -> Result<()> {
        context.record_output(step.output_name(), output.clone());
        self.journal(context, JournalKind::StepEnd, coven_core::journal::StepTransitionPayload {
            step_path: context.current_step_path.clone(),
            kind: "step".to_string(),
            outcome: Some(output.status.as_str().to_string()),
            duration_ms: Some(output.duration_ms),
        })
        .await?;
        self.events
            .publish_workflow(
                EventKind::WorkflowStepCompleted,
                &context.workflow_id,
                &context.task.id,
                coven_core::events::WorkflowStepCompletedPayload {
                    step_path: context.current_step_path.clone(),
                    status: output.status.as_str().to_string(),
                    duration_ms: output.duration_ms,
                },
            )
            .await
            .ok();
        self.storage.update_workflow_context(context).await?;
        Ok(())
    }

    async fn journal_step_start(&self, context: &Context, kind: &StepKind) -> Result<()> {
        self.journal(context, JournalKind::StepStart, coven_core::journal::StepTransitionPayload {
            step_path: context.current_step_path.clone(),
            kind: step_kind_name(kind).to_string(),
            outcome: None,
            duration_ms: None,
        })
        .await
    }

    async fn journal(&self, context: &Context, kind: JournalKind, payload: impl serde::Serialize) -> Result<()> {
        let seq = self.storage.next_journal_seq(&context.workflow_id).await?;
        let record = JournalRecord::new(seq, kind, payload).expect("journal payload always serializes");
        self.storage.append_journal_record(&context.workflow_id, &record).await?;
        Ok(())
    }
}

fn step_kind_name(kind: &StepKind) -> &'static str {
    match kind {
        StepKind::Script(_) => "script",
        StepKind::Agent(_) => "agent",
        StepKind::Loop(_) => "loop",
        StepKind::Merge(_) => "merge",
    }
}

/// End-to-end scenarios from spec Section 8 (S1-S6), driving a real
/// `Interpreter` against temp-directory git repos rather than mocking the
/// pieces it's made of.
#[cfg(test)]
mod tests {
    use super::*;
    use coven_core::{Id, Task, TaskType};
    use std::path::PathBuf;
    use std::process::Command;
    use tempfile::TempDir;
    use tokio::sync::Semaphore;

    fn git(dir: &Path, args: &[&str]) {
        let status = Command::new("git").args(args).current_dir(dir).status().unwrap();
        assert!(status.success(), "git {args:?} failed");
    }

    fn test_task() -> Task {
        Task {
            id: Id::new(),
            title: "scenario task".to_string(),
            body: String::new(),
            task_type: TaskType::Task,
            priority: 2,
            labels: vec![],
            status: TaskStatus::InProgress,
            claimed_by: Some("test-session".to_string()),
            parent_id: None,
            dependencies: vec![],
            created_at: chrono::Utc::now(),
        }
    }

    async fn new_harness(workflow_id: Id, grimoire_name: &str) -> (TempDir, Interpreter, Arc<Storage>, Arc<ReviewGates>, Context) {
        let dir = TempDir::new().unwrap();
        git(dir.path(), &["init"]);
        git(dir.path(), &["config", "user.email", "test@test.com"]);
        git(dir.path(), &["config", "user.name", "Test"]);
        std::fs::write(dir.path().join("README.md"), "seed").unwrap();
        git(dir.path(), &["add", "."]);
        git(dir.path(), &["commit", "-m", "seed"]);

        let storage = Storage::new(&dir.path().join("state.db")).await.unwrap();
        storage.migrate_embedded().await.unwrap();
        let storage = Arc::new(storage);
        let events = Arc::new(EventBus::new(Arc::clone(&storage)));
        let gates = Arc::new(ReviewGates::new());

        let mut config = Config::default();
        config.worktree_path_template = "../{{ repo }}.{{ branch | sanitize }}".to_string();
        config.agent_timeout_sec = 5;

        let handle = crate::worktree::prepare(dir.path(), &config, workflow_id.as_ref()).unwrap();

        let task = test_task();
        storage.insert_task(&task).await.unwrap();

        let context = Context::new(workflow_id, task, grimoire_name, handle.worktree_path.display().to_string(), handle.base_branch.clone());
        storage.insert_workflow(&context, &handle.run_branch).await.unwrap();

        let interpreter = Interpreter {
            storage: Arc::clone(&storage),
            events,
            gates: Arc::clone(&gates),
            config,
            workspace_root: dir.path().to_path_buf(),
            semaphore: Arc::new(Semaphore::new(1)),
            slot: Mutex::new(None),
        };

        (dir, interpreter, storage, gates, context)
    }

    /// S1: a skip-conditional step never runs, everything after it does.
    #[tokio::test]
    async fn s1_skip_conditional_step_is_skipped() {
        let yaml = r#"
name: skip-conditional
timeout: "1m"
steps:
  - name: set-flag
    type: script
    command: "echo true"
    output: flag_result
  - name: conditional-skip
    type: script
    command: "echo SHOULD_NOT_RUN"
    when: "{{not .flag_result}}"
  - name: always-runs
    type: script
    command: "echo ALWAYS_RUNS"
"#;
        let grimoire = Grimoire::parse("skip-conditional", yaml).unwrap();
        let (_dir, interpreter, _storage, _gates, context) = new_harness(Id::new(), "skip-conditional").await;

        let result = interpreter.run(context, &grimoire, CancellationToken::new()).await.unwrap();

        assert_eq!(result.status, WorkflowStatus::Completed);
        let skipped = result.outputs.get("conditional-skip").unwrap();
        assert_eq!(skipped.status, StepOutcome::Skipped);
        for output in result.outputs.values() {
            assert!(!output.stdout.contains("SHOULD_NOT_RUN"));
        }
        assert!(result.outputs.get("always-runs").unwrap().stdout.contains("ALWAYS_RUNS"));
    }

    /// S2: `.previous.success`/`not .previous.success` gate the two
    /// follow-on steps so exactly one of them runs.
    #[tokio::test]
    async fn s2_previous_success_gates_following_steps() {
        let yaml = r#"
name: previous-gating
timeout: "1m"
steps:
  - name: maybe-fail
    type: script
    command: "exit 0"
  - name: on-success
    type: script
    command: "echo PREVIOUS_SUCCEEDED"
    when: "{{.previous.success}}"
  - name: on-failure
    type: script
    command: "echo PREVIOUS_FAILED"
    when: "{{not .previous.success}}"
"#;
        let grimoire = Grimoire::parse("previous-gating", yaml).unwrap();
        let (_dir, interpreter, _storage, _gates, context) = new_harness(Id::new(), "previous-gating").await;

        let result = interpreter.run(context, &grimoire, CancellationToken::new()).await.unwrap();

        assert_eq!(result.status, WorkflowStatus::Completed);
        assert_eq!(result.outputs.get("maybe-fail").unwrap().status, StepOutcome::Success);
        assert!(result.outputs.get("on-success").unwrap().stdout.contains("PREVIOUS_SUCCEEDED"));
        assert_eq!(result.outputs.get("on-failure").unwrap().status, StepOutcome::Skipped);
    }

    /// S3: a loop exits early via `on_success: exit_loop` once its body
    /// signals done, rather than running to `max_iterations`.
    #[tokio::test]
    async fn s3_exit_loop_stops_the_loop_early() {
        let yaml = r#"
name: exit-loop
timeout: "1m"
steps:
  - name: retry-loop
    type: loop
    max_iterations: 5
    on_max_iterations: block
    steps:
      - name: bump-counter
        type: script
        command: "c=$(cat counter 2>/dev/null || echo 0); c=$((c+1)); echo $c > counter; if [ $c -ge 2 ]; then echo true; else echo false; fi"
      - name: stop-if-done
        type: script
        command: "echo done"
        when: "{{.bump-counter}}"
        on_success: exit_loop
"#;
        let grimoire = Grimoire::parse("exit-loop", yaml).unwrap();
        let (_dir, interpreter, _storage, _gates, context) = new_harness(Id::new(), "exit-loop").await;
        let worktree_path = PathBuf::from(&context.worktree_path);

        let result = interpreter.run(context, &grimoire, CancellationToken::new()).await.unwrap();

        assert_eq!(result.status, WorkflowStatus::Completed);
        let counter = std::fs::read_to_string(worktree_path.join("counter")).unwrap();
        assert_eq!(counter.trim(), "2", "loop body should have run exactly twice");
    }

    /// S4: exhausting `max_iterations` under `block` ends the workflow
    /// `blocked`, not `failed`.
    #[tokio::test]
    async fn s4_max_iterations_block_yields_blocked_workflow() {
        let yaml = r#"
name: max-iterations-block
timeout: "1m"
steps:
  - name: always-fails
    type: loop
    max_iterations: 3
    on_max_iterations: block
    steps:
      - name: attempt
        type: script
        command: "exit 1"
        on_fail: continue
"#;
        let grimoire = Grimoire::parse("max-iterations-block", yaml).unwrap();
        let (_dir, interpreter, storage, _gates, context) = new_harness(Id::new(), "max-iterations-block").await;

        let result = interpreter.run(context, &grimoire, CancellationToken::new()).await.unwrap();

        assert_eq!(result.status, WorkflowStatus::Blocked);
        let row = storage.get_workflow(&result.workflow_id).await.unwrap();
        assert_eq!(storage.get_task(&row.context.task.id).await.unwrap().status, TaskStatus::InProgress);
    }

    /// S5a: an approved merge review resolves and completes the workflow.
    #[tokio::test]
    async fn s5_approved_merge_completes_the_workflow() {
        let yaml = r#"
name: merge-approve
timeout: "1m"
steps:
  - name: make-change
    type: script
    command: "echo changed > change.txt && git add change.txt && git commit -m 'add change'"
  - name: merge
    type: merge
    require_review: true
"#;
        let grimoire = Grimoire::parse("merge-approve", yaml).unwrap();
        let workflow_id = Id::new();
        let (dir, interpreter, storage, gates, context) = new_harness(workflow_id.clone(), "merge-approve").await;

        let run = tokio::spawn(async move {
            let _dir = dir;
            interpreter.run(context, &grimoire, CancellationToken::new()).await
        });

        wait_for_status(&storage, &workflow_id, WorkflowStatus::AwaitingReview).await;
        gates.resolve_merge(&workflow_id, MergeResolution { decision: ReviewDecision::Approve, reason: None }).unwrap();

        let result = run.await.unwrap().unwrap();
        assert_eq!(result.status, WorkflowStatus::Completed);
        assert_eq!(storage.get_task(&result.task.id).await.unwrap().status, TaskStatus::Closed);
    }

    /// S5b: a rejected merge review ends the workflow `blocked`, preserving
    /// the reviewer's reason, without ever merging.
    #[tokio::test]
    async fn s5_rejected_merge_blocks_the_workflow() {
        let yaml = r#"
name: merge-reject
timeout: "1m"
steps:
  - name: make-change
    type: script
    command: "echo changed > change.txt && git add change.txt && git commit -m 'add change'"
  - name: merge
    type: merge
    require_review: true
"#;
        let grimoire = Grimoire::parse("merge-reject", yaml).unwrap();
        let workflow_id = Id::new();
        let (dir, interpreter, storage, gates, context) = new_harness(workflow_id.clone(), "merge-reject").await;

        let run = tokio::spawn(async move {
            let _dir = dir;
            interpreter.run(context, &grimoire, CancellationToken::new()).await
        });

        wait_for_status(&storage, &workflow_id, WorkflowStatus::AwaitingReview).await;
        gates
            .resolve_merge(&workflow_id, MergeResolution { decision: ReviewDecision::Reject, reason: Some("needs fix".to_string()) })
            .unwrap();

        let result = run.await.unwrap().unwrap();
        assert_eq!(result.status, WorkflowStatus::Blocked);
        // A rejected merge never reaches `git::merge_to_target`, so the
        // task is left pending_merge by run_merge_step and the blocked
        // mapping to a task status is the scheduler's job, not the
        // interpreter's.
        assert_eq!(storage.get_task(&result.task.id).await.unwrap().status, TaskStatus::PendingMerge);
    }

    /// S6: a step that outruns its own `timeout` fails the workflow and
    /// never runs what comes after it.
    #[tokio::test]
    async fn s6_step_timeout_fails_the_workflow() {
        let yaml = r#"
name: step-timeout
timeout: "1m"
steps:
  - name: fast-step
    type: script
    command: "echo fast"
  - name: slow-step
    type: script
    command: "sleep 10"
    timeout: "1s"
  - name: after-timeout
    type: script
    command: "echo AFTER_TIMEOUT"
"#;
        let grimoire = Grimoire::parse("step-timeout", yaml).unwrap();
        let (_dir, interpreter, _storage, _gates, context) = new_harness(Id::new(), "step-timeout").await;

        let result = interpreter.run(context, &grimoire, CancellationToken::new()).await.unwrap();

        assert_eq!(result.status, WorkflowStatus::Failed);
        assert!(result.outputs.get("fast-step").unwrap().stdout.contains("fast"));
        assert!(!result.outputs.contains_key("after-timeout"));
    }

    async fn wait_for_status(storage: &Storage, workflow_id: &Id, status: WorkflowStatus) {
        for _ in 0..200 {
            if storage.get_workflow(workflow_id).await.unwrap().context.status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("workflow {workflow_id} never reached {status:?}");
    }
}
