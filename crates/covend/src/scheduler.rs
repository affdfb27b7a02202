//! Claim-loop scheduler (C1). Polls the task store for eligible tasks,
//! claims one at a time under the configured queue policy, and hands each
//! claimed task off to its own Interpreter run under a concurrency
//! semaphore. See spec Section 5.1 (claim loop) and Section 5.2
//! (concurrency).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use coven_core::config::QueuePolicy;
use coven_core::{Context, Id, Task, TaskStatus, WorkflowStatus};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::event_bus::EventBus;
use crate::grimoire_loader::{self, LoaderError};
use crate::interpreter::{Interpreter, InterpreterError};
use crate::review_gate::ReviewGates;
use crate::storage::{Storage, StorageError};
use crate::worktree::{self, WorktreeError};

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("worktree error: {0}")]
    Worktree(#[from] WorktreeError),
    #[error("loader error: {0}")]
    Loader(#[from] LoaderError),
    #[error("interpreter error: {0}")]
    Interpreter(#[from] InterpreterError),
    #[error("git error: {0}")]
    Git(#[from] crate::git::GitError),
    #[error("branch not found: {0}")]
    BranchNotFound(String),
    #[error("a session is already active")]
    SessionAlreadyActive,
    #[error("no active session")]
    NoActiveSession,
    #[error("task {0} is not claimable")]
    TaskNotClaimable(Id),
    #[error("no in-flight workflow for task {0}")]
    NoInFlightWorkflow(Id),
    #[error("scheduler is shutting down")]
    Shutdown,
    #[error("workflow {0} is not in a retryable (failed/blocked) state")]
    WorkflowNotRetryable(Id),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

/// The engine's single active session: a chosen merge target branch that
/// every claimed task's worktree forks from and merges back into (spec
/// Section 6.1 `start_session`/`stop_session`).
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: Id,
    pub target_branch: String,
}

/// Which grimoire a claimed task runs under. Coven ships one default;
/// a future task type could route to a different grimoire by name.
fn grimoire_for_task(_task: &Task) -> &'static str {
    "implement-bead"
}

pub struct Scheduler {
    storage: Arc<Storage>,
    events: Arc<EventBus>,
    gates: Arc<ReviewGates>,
    config: coven_core::Config,
    workspace_root: PathBuf,
    semaphore: Arc<Semaphore>,
    claim_lock: Mutex<()>,
    active: Mutex<HashMap<Id, CancellationToken>>,
    active_by_task: Mutex<HashMap<Id, Id>>,
    session: Mutex<Option<SessionInfo>>,
}

impl Scheduler {
    pub fn new(
        storage: Arc<Storage>,
        events: Arc<EventBus>,
        gates: Arc<ReviewGates>,
        config: coven_core::Config,
        workspace_root: PathBuf,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_agents.max(1)));
        Self {
            storage,
            events,
            gates,
            config,
            workspace_root,
            semaphore,
            claim_lock: Mutex::new(()),
            active: Mutex::new(HashMap::new()),
            active_by_task: Mutex::new(HashMap::new()),
            session: Mutex::new(None),
        }
    }

    /// Request cancellation of a running workflow (spec Section 6.1 `workflow.cancel`).
    pub async fn cancel_workflow(&self, workflow_id: &Id) -> bool {
        if let Some(token) = self.active.lock().await.get(workflow_id) {
            token.cancel();
            true
        } else {
            false
        }
    }

    pub async fn active_session(&self) -> Option<SessionInfo> {
        self.session.lock().await.clone()
    }

    /// Open the session: pin the merge target branch for the claim loop and
    /// any explicitly started task (spec Section 6.1 `start_session`).
    pub async fn start_session(&self, target_branch: String) -> Result<Id> {
        let mut guard = self.session.lock().await;
        if guard.is_some() {
            return Err(SchedulerError::SessionAlreadyActive);
        }
        if !crate::git::branch_exists(&self.workspace_root, &target_branch)? {
            return Err(SchedulerError::BranchNotFound(target_branch));
        }
        let id = Id::new();
        *guard = Some(SessionInfo { id: id.clone(), target_branch });
        Ok(id)
    }

    /// Close the session (spec Section 6.1 `stop_session`). In-flight
    /// workflows are left running; the claim loop simply stops picking up
    /// new tasks until a session is reopened.
    pub async fn stop_session(&self) -> Result<()> {
        let mut guard = self.session.lock().await;
        if guard.take().is_none() {
            return Err(SchedulerError::NoActiveSession);
        }
        Ok(())
    }

    /// Explicitly start a specific task outside the autonomous claim loop
    /// (spec Section 6.1 `start_task`).
    pub async fn start_task(self: &Arc<Self>, task_id: &Id, shutdown: CancellationToken) -> Result<Id> {
        let session = self.session.lock().await.clone().ok_or(SchedulerError::NoActiveSession)?;

        let task = self.storage.get_task(task_id).await?;
        if !task.is_open_and_unclaimed() {
            return Err(SchedulerError::TaskNotClaimable(task_id.clone()));
        }
        let claimant = format!("coven-{}", Id::new());
        self.storage.claim_task(task_id, &claimant).await.map_err(|e| match e {
            StorageError::ClaimRace(_) => SchedulerError::TaskNotClaimable(task_id.clone()),
            other => other.into(),
        })?;

        let Ok(permit) = self.semaphore.clone().acquire_owned().await else {
            return Err(SchedulerError::Shutdown);
        };
        let workflow_id = Id::new();
        let cancel = shutdown.child_token();
        self.active.lock().await.insert(workflow_id.clone(), cancel.clone());
        self.active_by_task.lock().await.insert(task_id.clone(), workflow_id.clone());

        let scheduler = Arc::clone(self);
        let wf_id = workflow_id.clone();
        let wf_task = task.clone();
        let target_branch = session.target_branch.clone();
        tokio::spawn(async move {
            if let Err(e) = scheduler.run_workflow_with_branch(wf_id.clone(), wf_task.clone(), cancel, permit, Some(target_branch)).await {
                error!(task_id = %wf_task.id, workflow_id = %wf_id, error = %e, "workflow failed to run");
                let _ = scheduler.storage.update_task_status(&wf_task.id, TaskStatus::Blocked).await;
            }
            scheduler.active.lock().await.remove(&wf_id);
            scheduler.active_by_task.lock().await.remove(&wf_task.id);
        });

        Ok(workflow_id)
    }

    /// Allocate a fresh workflow id and a fresh worktree for a task whose
    /// previous workflow ended `failed` or `blocked` (spec Section 6.1
    /// `retry_workflow`, Section 7 propagation policy).
    pub async fn retry_workflow(self: &Arc<Self>, workflow_id: &Id, shutdown: CancellationToken) -> Result<Id> {
        let row = self.storage.get_workflow(workflow_id).await?;
        if !matches!(row.context.status, WorkflowStatus::Failed | WorkflowStatus::Blocked) {
            return Err(SchedulerError::WorkflowNotRetryable(workflow_id.clone()));
        }

        let task_id = row.context.task.id.clone();
        self.storage.release_claim(&task_id).await?;
        let claimant = format!("coven-{}", Id::new());
        self.storage.claim_task(&task_id, &claimant).await?;
        let task = self.storage.get_task(&task_id).await?;

        let Ok(permit) = self.semaphore.clone().acquire_owned().await else {
            return Err(SchedulerError::Shutdown);
        };
        let new_workflow_id = Id::new();
        let cancel = shutdown.child_token();
        self.active.lock().await.insert(new_workflow_id.clone(), cancel.clone());
        self.active_by_task.lock().await.insert(task_id.clone(), new_workflow_id.clone());

        let scheduler = Arc::clone(self);
        let wf_id = new_workflow_id.clone();
        let branch = row.context.target_branch.clone();
        tokio::spawn(async move {
            if let Err(e) =
                scheduler.run_workflow_with_branch(wf_id.clone(), task.clone(), cancel, permit, Some(branch)).await
            {
                error!(task_id = %task.id, workflow_id = %wf_id, error = %e, "retried workflow failed to run");
                let _ = scheduler.storage.update_task_status(&task.id, TaskStatus::Blocked).await;
            }
            scheduler.active.lock().await.remove(&wf_id);
            scheduler.active_by_task.lock().await.remove(&task.id);
        });

        Ok(new_workflow_id)
    }

    /// Cancel the in-flight workflow for a task, if any (spec Section 6.1
    /// `stop_task`).
    pub async fn stop_task(&self, task_id: &Id) -> Result<()> {
        let workflow_id =
            self.active_by_task.lock().await.get(task_id).cloned().ok_or_else(|| SchedulerError::NoInFlightWorkflow(task_id.clone()))?;
        if !self.cancel_workflow(&workflow_id).await {
            return Err(SchedulerError::NoInFlightWorkflow(task_id.clone()));
        }
        Ok(())
    }

    /// Re-register review gates for any workflow the daemon finds suspended
    /// on restart. The `awaiting_review`/`awaiting_input` status survives in
    /// storage, but the in-memory oneshot channel it was suspended on does
    /// not, so a resolution arriving before this runs would find no gate
    /// (spec Section 4.7).
    pub async fn resume_suspended_workflows(&self) -> Result<()> {
        for workflow_id in self.storage.list_active_workflow_ids().await? {
            let row = self.storage.get_workflow(&workflow_id).await?;
            if row.context.status == WorkflowStatus::AwaitingReview {
                let _rx = self.gates.register_merge(workflow_id);
            } else if row.context.status == WorkflowStatus::AwaitingInput {
                let _rx = self.gates.register_input(workflow_id);
            }
        }
        Ok(())
    }

    /// Drive the claim loop until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.poll_interval_sec.max(1)));
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                () = shutdown.cancelled() => {
                    info!("scheduler shutting down");
                    return;
                }
            }

            self.sweep_stale_claims().await;

            if self.semaphore.available_permits() == 0 {
                continue;
            }

            let Some(session) = self.active_session().await else {
                continue;
            };

            match self.claim_next_task().await {
                Ok(Some(task)) => {
                    let scheduler = Arc::clone(&self);
                    let cancel = shutdown.child_token();
                    let target_branch = session.target_branch.clone();
                    tokio::spawn(async move {
                        scheduler.run_claimed_task(task, cancel, Some(target_branch)).await;
                    });
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "claim attempt failed"),
            }
        }
    }

    /// Reclaim tasks whose workflow stopped advancing without reaching a
    /// terminal status (spec Section 7 `ErrStaleClaim`): a crashed
    /// Interpreter, or one wedged past its step's own timeout, left its
    /// task claimed with nobody able to finish it.
    async fn sweep_stale_claims(&self) {
        let stale = match self.storage.list_stale_workflows(Duration::from_secs(self.config.claim_timeout_sec)).await {
            Ok(ids) => ids,
            Err(e) => {
                warn!(error = %e, "stale-claim sweep failed to list workflows");
                return;
            }
        };

        for workflow_id in stale {
            if let Some(token) = self.active.lock().await.remove(&workflow_id) {
                token.cancel();
            }

            let row = match self.storage.get_workflow(&workflow_id).await {
                Ok(row) => row,
                Err(e) => {
                    warn!(%workflow_id, error = %e, "stale-claim sweep could not load workflow");
                    continue;
                }
            };
            let mut context = row.context;
            if context.status.is_terminal() {
                continue;
            }

            warn!(%workflow_id, task_id = %context.task.id, "reclaiming stale claim");

            if let Err(e) = self.storage.release_claim(&context.task.id).await {
                warn!(%workflow_id, error = %e, "failed to release stale task claim");
            }
            self.active_by_task.lock().await.remove(&context.task.id);

            context.status = WorkflowStatus::Failed;
            if let Err(e) = self.storage.update_workflow_context(&context).await {
                warn!(%workflow_id, error = %e, "failed to persist stale-claim terminal status");
                continue;
            }

            if let Ok(seq) = self.storage.next_journal_seq(&workflow_id).await {
                if let Ok(record) = coven_core::JournalRecord::new(
                    seq,
                    coven_core::JournalKind::WorkflowEnd,
                    coven_core::journal::WorkflowEndPayload { status: context.status, reason: Some("stale_claim".to_string()) },
                ) {
                    let _ = self.storage.append_journal_record(&workflow_id, &record).await;
                }
            }

            self.events
                .publish_workflow(
                    coven_core::EventKind::WorkflowFailed,
                    &workflow_id,
                    &context.task.id,
                    serde_json::json!({"reason": "stale_claim"}),
                )
                .await
                .ok();
        }
    }

    /// Atomically claim the next eligible task under the configured
    /// `queue_policy`. The mutex only serializes local callers; the
    /// storage layer's conditional UPDATE is the actual race-proof
    /// boundary (spec Section 5.1).
    async fn claim_next_task(&self) -> Result<Option<Task>> {
        let _guard = self.claim_lock.lock().await;
        let mut eligible = self.storage.list_eligible_tasks().await?;
        if eligible.is_empty() {
            return Ok(None);
        }
        match self.config.queue_policy {
            QueuePolicy::Fifo => eligible.sort_by_key(|t| t.created_at),
            QueuePolicy::Priority => eligible.sort_by_key(|t| (t.priority, t.created_at)),
        }

        for task in eligible {
            let claimant = format!("coven-{}", Id::new());
            match self.storage.claim_task(&task.id, &claimant).await {
                Ok(()) => return Ok(Some(task)),
                Err(StorageError::ClaimRace(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }

    async fn run_claimed_task(self: Arc<Self>, task: Task, cancel: CancellationToken, target_branch: Option<String>) {
        let Ok(permit) = self.semaphore.clone().acquire_owned().await else {
            return;
        };

        let workflow_id = Id::new();
        self.active.lock().await.insert(workflow_id.clone(), cancel.clone());
        self.active_by_task.lock().await.insert(task.id.clone(), workflow_id.clone());

        if let Err(e) = self.run_workflow_with_branch(workflow_id.clone(), task.clone(), cancel, permit, target_branch).await {
            error!(task_id = %task.id, workflow_id = %workflow_id, error = %e, "workflow failed to run");
            let _ = self.storage.update_task_status(&task.id, TaskStatus::Blocked).await;
        }

        self.active.lock().await.remove(&workflow_id);
        self.active_by_task.lock().await.remove(&task.id);
    }

    /// Prepare a worktree, load the task's grimoire, and drive it through
    /// the Interpreter to a terminal status. Worktree cleanup always runs,
    /// regardless of outcome (spec Section 4.6). `permit` is handed to the
    /// Interpreter, which releases and reacquires it around review-gate
    /// suspension (spec Section 9). `target_branch` overrides
    /// `config.base_branch` for this workflow's worktree when a session
    /// has pinned one.
    async fn run_workflow_with_branch(
        &self,
        workflow_id: Id,
        task: Task,
        cancel: CancellationToken,
        permit: tokio::sync::OwnedSemaphorePermit,
        target_branch: Option<String>,
    ) -> Result<()> {
        let mut config = self.config.clone();
        if let Some(branch) = target_branch {
            config.base_branch = Some(branch);
        }
        let handle = worktree::prepare(&self.workspace_root, &config, workflow_id.as_ref())?;
        let grimoire_name = grimoire_for_task(&task);
        let grimoire = grimoire_loader::load_grimoire(&self.config.grimoires_dir, grimoire_name)?;

        let context = Context::new(
            workflow_id.clone(),
            task.clone(),
            grimoire_name,
            handle.worktree_path.display().to_string(),
            handle.base_branch.clone(),
        );
        self.storage.insert_workflow(&context, &handle.run_branch).await?;
        self.events
            .publish_workflow(
                coven_core::EventKind::WorkflowStarted,
                &workflow_id,
                &task.id,
                coven_core::events::WorkflowStartedPayload {
                    workflow_id: workflow_id.clone(),
                    task_id: task.id.clone(),
                    grimoire: grimoire_name.to_string(),
                },
            )
            .await
            .ok();

        let interpreter = Interpreter {
            storage: Arc::clone(&self.storage),
            events: Arc::clone(&self.events),
            gates: Arc::clone(&self.gates),
            config: self.config.clone(),
            workspace_root: self.workspace_root.clone(),
            semaphore: Arc::clone(&self.semaphore),
            slot: Mutex::new(Some(permit)),
        };

        let outcome = interpreter.run(context, &grimoire, cancel).await;

        if self.config.worktree_cleanup {
            worktree::cleanup(&self.workspace_root, &handle);
        }

        let context = outcome?;
        self.apply_terminal_task_status(&context).await;
        Ok(())
    }

    /// Map a workflow's terminal status onto its task row (spec Section
    /// 4.6 step 4). A `merge` step that actually runs already closes the
    /// task itself; this covers every terminal path that never reaches
    /// one: a grimoire with no merge step completing, an aborted or
    /// blocked workflow, and a cancellation.
    async fn apply_terminal_task_status(&self, context: &Context) {
        let result = match context.status {
            WorkflowStatus::Completed => {
                self.storage.update_task_status(&context.task.id, TaskStatus::Closed).await
            }
            WorkflowStatus::Failed | WorkflowStatus::Blocked => {
                self.storage.update_task_status(&context.task.id, TaskStatus::Blocked).await
            }
            WorkflowStatus::Cancelled => self.storage.release_claim(&context.task.id).await,
            WorkflowStatus::Running | WorkflowStatus::AwaitingReview | WorkflowStatus::AwaitingInput => return,
        };
        if let Err(e) = result {
            warn!(
                workflow_id = %context.workflow_id,
                task_id = %context.task.id,
                error = %e,
                "failed to apply terminal task status"
            );
        }
    }
}
