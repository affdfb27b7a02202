//! SQLite storage for tasks, workflow state, and the event/journal logs.
//!
//! See spec Section 3 (Data Model), Section 4.4 (Journal), Section 6.3
//! (task store contract).

use chrono::{DateTime, Utc};
use coven_core::{
    Context, Id, JournalKind, JournalRecord, StepOutput, StepPathEntry, Task, TaskStatus,
    TaskType, WorkflowStatus,
};
use sqlx::{sqlite::SqlitePoolOptions, Pool, Row, Sqlite};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

const TASKS_COLUMNS: &str =
    "id, title, body, type, priority, labels_json, status, claimed_by, parent_id, dependencies_json, created_at";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("task not found: {0}")]
    TaskNotFound(String),
    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),
    #[error("task {0} is not open or is already claimed")]
    ClaimRace(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// A workflow's durable row, reassembled into a [`Context`] plus the fields
/// the Context itself doesn't carry (run branch, timestamps).
pub struct WorkflowRow {
    pub context: Context,
    pub run_branch: String,
    pub question: Option<serde_json::Value>,
}

pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = SqlitePoolOptions::new().max_connections(5).connect(&db_url).await?;

        sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;

        Ok(Self { pool })
    }

    /// Run embedded migrations. Errors from re-applying an already-applied
    /// migration (duplicate column, table exists) are tolerated so the same
    /// migration set can run against a live database on every startup.
    pub async fn migrate_embedded(&self) -> Result<()> {
        let migrations = [include_str!("../../../migrations/0001_init.sql")];

        for migration_sql in migrations {
            let cleaned: String = migration_sql
                .lines()
                .filter(|line| !line.trim().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n");

            for statement in cleaned.split(';') {
                let trimmed = statement.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match sqlx::query(trimmed).execute(&self.pool).await {
                    Ok(_) => {}
                    Err(e) => {
                        let msg = e.to_string();
                        if !msg.contains("duplicate column") && !msg.contains("already exists") {
                            return Err(e.into());
                        }
                    }
                }
            }
        }
        Ok(())
    }

    // --- Task store (spec Section 6.3) ---

    pub async fn insert_task(&self, task: &Task) -> Result<()> {
        sqlx::query(
            "INSERT INTO tasks (id, title, body, type, priority, labels_json, status, claimed_by, parent_id, dependencies_json, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        )
        .bind(task.id.as_ref())
        .bind(&task.title)
        .bind(&task.body)
        .bind(task.task_type.as_str())
        .bind(i64::from(task.priority))
        .bind(serde_json::to_string(&task.labels)?)
        .bind(task.status.as_str())
        .bind(&task.claimed_by)
        .bind(task.parent_id.as_ref().map(|id| id.to_string()))
        .bind(serde_json::to_string(&task.dependencies)?)
        .bind(task.created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_task(&self, id: &Id) -> Result<Task> {
        let query = format!("SELECT {TASKS_COLUMNS} FROM tasks WHERE id = ?1");
        let row = sqlx::query(&query)
            .bind(id.as_ref())
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::TaskNotFound(id.to_string()))?;
        Self::row_to_task(&row)
    }

    /// List tasks eligible for scheduling: `open`, unclaimed, ordered by
    /// priority then age (spec Section 5.1).
    pub async fn list_eligible_tasks(&self) -> Result<Vec<Task>> {
        let query = format!(
            "SELECT {TASKS_COLUMNS} FROM tasks WHERE status = 'open' AND claimed_by IS NULL \
             ORDER BY priority ASC, created_at ASC"
        );
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_task).collect()
    }

    pub async fn list_tasks(&self) -> Result<Vec<Task>> {
        let query = format!("SELECT {TASKS_COLUMNS} FROM tasks ORDER BY created_at ASC");
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_task).collect()
    }

    /// Atomically claim a task: succeeds only if it is still `open` and
    /// unclaimed (spec Section 5.1, ErrClaimRace). The `claim_lock` mutex in
    /// the scheduler still serializes callers, but this statement is the
    /// actual race-proof boundary.
    pub async fn claim_task(&self, id: &Id, claimant: &str) -> Result<()> {
        let result = sqlx::query(
            "UPDATE tasks SET status = 'in_progress', claimed_by = ?1 \
             WHERE id = ?2 AND status = 'open' AND claimed_by IS NULL",
        )
        .bind(claimant)
        .bind(id.as_ref())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::ClaimRace(id.to_string()));
        }
        Ok(())
    }

    pub async fn update_task_status(&self, id: &Id, status: TaskStatus) -> Result<()> {
        let result = sqlx::query("UPDATE tasks SET status = ?1 WHERE id = ?2")
            .bind(status.as_str())
            .bind(id.as_ref())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::TaskNotFound(id.to_string()));
        }
        Ok(())
    }

    pub async fn release_claim(&self, id: &Id) -> Result<()> {
        sqlx::query("UPDATE tasks SET status = 'open', claimed_by = NULL WHERE id = ?1")
            .bind(id.as_ref())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    fn row_to_task(row: &sqlx::sqlite::SqliteRow) -> Result<Task> {
        let labels_json: String = row.try_get("labels_json")?;
        let dependencies_json: String = row.try_get("dependencies_json")?;
        let parent_id: Option<String> = row.try_get("parent_id")?;
        let created_at: i64 = row.try_get("created_at")?;
        let status: String = row.try_get("status")?;
        let task_type: String = row.try_get("type")?;
        let priority: i64 = row.try_get("priority")?;

        Ok(Task {
            id: Id::from_string(row.try_get::<String, _>("id")?),
            title: row.try_get("title")?,
            body: row.try_get("body")?,
            task_type: match task_type.as_str() {
                "feature" => coven_core::TaskType::Feature,
                "bug" => coven_core::TaskType::Bug,
                "epic" => coven_core::TaskType::Epic,
                _ => TaskType::Task,
            },
            priority: priority as u8,
            labels: serde_json::from_str(&labels_json)?,
            status: TaskStatus::from_str(&status).unwrap_or(TaskStatus::Open),
            claimed_by: row.try_get("claimed_by")?,
            parent_id: parent_id.map(Id::from_string),
            dependencies: serde_json::from_str(&dependencies_json)?,
            created_at: DateTime::<Utc>::from_timestamp_millis(created_at).unwrap_or_else(Utc::now),
        })
    }

    // --- Workflow state (spec Section 3, 4.3) ---

    pub async fn insert_workflow(&self, context: &Context, run_branch: &str) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        sqlx::query(
            "INSERT INTO workflows (id, task_id, grimoire_name, worktree_path, target_branch, run_branch, status, \
             current_step_path_json, outputs_json, previous_json, started_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        )
        .bind(context.workflow_id.as_ref())
        .bind(context.task.id.as_ref())
        .bind(&context.grimoire_name)
        .bind(&context.worktree_path)
        .bind(&context.target_branch)
        .bind(run_branch)
        .bind(context.status.as_str())
        .bind(serde_json::to_string(&context.current_step_path)?)
        .bind(serde_json::to_string(&context.outputs)?)
        .bind(context.previous.as_ref().map(serde_json::to_string).transpose()?)
        .bind(context.started_at.timestamp_millis())
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Persist the mutable parts of a Context after a step transition
    /// (spec Section 4.4: this write is covered by the same flush as the
    /// journal record for the same transition).
    pub async fn update_workflow_context(&self, context: &Context) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let ended_at = if context.status.is_terminal() { Some(now) } else { None };
        let result = sqlx::query(
            "UPDATE workflows SET status = ?1, current_step_path_json = ?2, outputs_json = ?3, \
             previous_json = ?4, updated_at = ?5, ended_at = COALESCE(?6, ended_at) WHERE id = ?7",
        )
        .bind(context.status.as_str())
        .bind(serde_json::to_string(&context.current_step_path)?)
        .bind(serde_json::to_string(&context.outputs)?)
        .bind(context.previous.as_ref().map(serde_json::to_string).transpose()?)
        .bind(now)
        .bind(ended_at)
        .bind(context.workflow_id.as_ref())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::WorkflowNotFound(context.workflow_id.to_string()));
        }
        Ok(())
    }

    pub async fn set_workflow_question(&self, workflow_id: &Id, question: Option<&serde_json::Value>) -> Result<()> {
        sqlx::query("UPDATE workflows SET question_json = ?1 WHERE id = ?2")
            .bind(question.map(serde_json::Value::to_string))
            .bind(workflow_id.as_ref())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_workflow(&self, id: &Id) -> Result<WorkflowRow> {
        let row = sqlx::query(
            "SELECT w.id, w.task_id, w.grimoire_name, w.worktree_path, w.target_branch, w.run_branch, \
             w.status, w.current_step_path_json, w.outputs_json, w.previous_json, w.question_json, w.started_at \
             FROM workflows w WHERE w.id = ?1",
        )
        .bind(id.as_ref())
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StorageError::WorkflowNotFound(id.to_string()))?;

        let task_id: String = row.try_get("task_id")?;
        let task = self.get_task(&Id::from_string(task_id)).await?;

        let step_path_json: String = row.try_get("current_step_path_json")?;
        let outputs_json: String = row.try_get("outputs_json")?;
        let previous_json: Option<String> = row.try_get("previous_json")?;
        let question_json: Option<String> = row.try_get("question_json")?;
        let status: String = row.try_get("status")?;
        let started_at: i64 = row.try_get("started_at")?;

        let current_step_path: Vec<StepPathEntry> = serde_json::from_str(&step_path_json)?;
        let outputs: HashMap<String, StepOutput> = serde_json::from_str(&outputs_json)?;
        let previous: Option<StepOutput> = previous_json.map(|s| serde_json::from_str(&s)).transpose()?;

        let context = Context {
            workflow_id: id.clone(),
            task,
            grimoire_name: row.try_get("grimoire_name")?,
            worktree_path: row.try_get("worktree_path")?,
            target_branch: row.try_get("target_branch")?,
            started_at: DateTime::<Utc>::from_timestamp_millis(started_at).unwrap_or_else(Utc::now),
            current_step_path,
            outputs,
            previous,
            status: WorkflowStatus::from_str(&status).unwrap_or(WorkflowStatus::Running),
        };

        Ok(WorkflowRow {
            context,
            run_branch: row.try_get("run_branch")?,
            question: question_json.map(|s| serde_json::from_str(&s)).transpose()?,
        })
    }

    pub async fn list_active_workflow_ids(&self) -> Result<Vec<Id>> {
        let rows = sqlx::query(
            "SELECT id FROM workflows WHERE status NOT IN ('completed', 'failed', 'blocked', 'cancelled')",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|r| Ok(Id::from_string(r.try_get::<String, _>("id")?))).collect()
    }

    /// All workflow ids, oldest first (spec Section 6.1 `list_workflows`).
    pub async fn list_workflow_ids(&self) -> Result<Vec<Id>> {
        let rows = sqlx::query("SELECT id FROM workflows ORDER BY started_at ASC").fetch_all(&self.pool).await?;
        rows.iter().map(|r| Ok(Id::from_string(r.try_get::<String, _>("id")?))).collect()
    }

    pub async fn count_running_workflows(&self) -> Result<usize> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM workflows WHERE status = 'running'")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.0 as usize)
    }

    /// Workflows still open whose last write predates `claim_timeout`
    /// (spec Section 5.2/7 `ErrStaleClaim`): a crashed Interpreter, or one
    /// stuck past its step timeout, left its task claimed with nobody
    /// advancing it.
    pub async fn list_stale_workflows(&self, claim_timeout: Duration) -> Result<Vec<Id>> {
        let threshold = Utc::now().timestamp_millis() - claim_timeout.as_millis() as i64;
        let rows = sqlx::query(
            "SELECT id FROM workflows WHERE status NOT IN ('completed', 'failed', 'blocked', 'cancelled') \
             AND updated_at < ?1",
        )
        .bind(threshold)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|r| Ok(Id::from_string(r.try_get::<String, _>("id")?))).collect()
    }

    // --- Journal (spec Section 4.4) ---

    pub async fn append_journal_record(&self, workflow_id: &Id, record: &JournalRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO journal_records (workflow_id, seq, timestamp, kind, payload_json) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(workflow_id.as_ref())
        .bind(record.seq as i64)
        .bind(record.timestamp.timestamp_millis())
        .bind(record.kind.as_str())
        .bind(serde_json::to_string(&record.payload)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn next_journal_seq(&self, workflow_id: &Id) -> Result<u64> {
        let row: (Option<i64>,) =
            sqlx::query_as("SELECT MAX(seq) FROM journal_records WHERE workflow_id = ?1")
                .bind(workflow_id.as_ref())
                .fetch_one(&self.pool)
                .await?;
        Ok(row.0.map_or(0, |s| s as u64 + 1))
    }

    pub async fn list_journal_records(&self, workflow_id: &Id) -> Result<Vec<JournalRecord>> {
        let rows = sqlx::query(
            "SELECT seq, timestamp, kind, payload_json FROM journal_records WHERE workflow_id = ?1 ORDER BY seq ASC",
        )
        .bind(workflow_id.as_ref())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<JournalRecord> {
                let seq: i64 = row.try_get("seq")?;
                let timestamp: i64 = row.try_get("timestamp")?;
                let kind: String = row.try_get("kind")?;
                let payload_json: String = row.try_get("payload_json")?;
                Ok(JournalRecord {
                    seq: seq as u64,
                    timestamp: DateTime::<Utc>::from_timestamp_millis(timestamp).unwrap_or_else(Utc::now),
                    kind: journal_kind_from_str(&kind),
                    payload: serde_json::from_str(&payload_json)?,
                })
            })
            .collect()
    }

    // --- Event log (spec Section 4.5, 6.2) ---

    pub async fn insert_event(&self, event: &coven_core::Event) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO events (workflow_id, task_id, kind, timestamp, payload_json) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(event.workflow_id.as_ref().map(Id::as_ref))
        .bind(event.task_id.as_ref().map(Id::as_ref))
        .bind(event.kind.as_str())
        .bind(event.timestamp.timestamp_millis())
        .bind(serde_json::to_string(&event.payload)?)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn list_events_since(&self, since_seq: i64) -> Result<Vec<coven_core::Event>> {
        let rows = sqlx::query(
            "SELECT seq, workflow_id, task_id, kind, timestamp, payload_json FROM events WHERE seq > ?1 ORDER BY seq ASC",
        )
        .bind(since_seq)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<coven_core::Event> {
                let seq: i64 = row.try_get("seq")?;
                let workflow_id: Option<String> = row.try_get("workflow_id")?;
                let task_id: Option<String> = row.try_get("task_id")?;
                let kind: String = row.try_get("kind")?;
                let timestamp: i64 = row.try_get("timestamp")?;
                let payload_json: String = row.try_get("payload_json")?;
                Ok(coven_core::Event {
                    kind: event_kind_from_str(&kind),
                    workflow_id: workflow_id.map(Id::from_string),
                    task_id: task_id.map(Id::from_string),
                    seq: seq as u64,
                    timestamp: DateTime::<Utc>::from_timestamp_millis(timestamp).unwrap_or_else(Utc::now),
                    payload: serde_json::from_str(&payload_json)?,
                })
            })
            .collect()
    }
}

fn journal_kind_from_str(s: &str) -> JournalKind {
    match s {
        "step.start" => JournalKind::StepStart,
        "step.end" => JournalKind::StepEnd,
        "loop.iteration" => JournalKind::LoopIteration,
        "workflow.pause" => JournalKind::WorkflowPause,
        "workflow.resume" => JournalKind::WorkflowResume,
        "workflow.end" => JournalKind::WorkflowEnd,
        _ => JournalKind::WorkflowStart,
    }
}

fn event_kind_from_str(s: &str) -> coven_core::EventKind {
    use coven_core::EventKind::*;
    match s {
        "session.started" => SessionStarted,
        "session.stopped" => SessionStopped,
        "workflow.started" => WorkflowStarted,
        "workflow.step.started" => WorkflowStepStarted,
        "workflow.step.completed" => WorkflowStepCompleted,
        "workflow.loop.iteration" => WorkflowLoopIteration,
        "workflow.pending_merge" => WorkflowPendingMerge,
        "workflow.awaiting_input" => WorkflowAwaitingInput,
        "workflow.failed" => WorkflowFailed,
        "workflow.blocked" => WorkflowBlocked,
        "workflow.cancelled" => WorkflowCancelled,
        "agent.output" => AgentOutput,
        "agent.failed" => AgentFailed,
        "task.created" => TaskCreated,
        "task.updated" => TaskUpdated,
        "task.closed" => TaskClosed,
        "state.snapshot" => StateSnapshot,
        "heartbeat" => Heartbeat,
        _ => WorkflowCompleted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coven_core::TaskType;
    use tempfile::TempDir;

    async fn test_storage() -> (TempDir, Storage) {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(&dir.path().join("test.db")).await.unwrap();
        storage.migrate_embedded().await.unwrap();
        (dir, storage)
    }

    fn sample_task() -> Task {
        Task {
            id: Id::new(),
            title: "Do the thing".into(),
            body: String::new(),
            task_type: TaskType::Task,
            priority: 2,
            labels: vec![],
            status: TaskStatus::Open,
            claimed_by: None,
            parent_id: None,
            dependencies: vec![],
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn insert_and_fetch_task_round_trips() {
        let (_dir, storage) = test_storage().await;
        let task = sample_task();
        storage.insert_task(&task).await.unwrap();
        let fetched = storage.get_task(&task.id).await.unwrap();
        assert_eq!(fetched.title, task.title);
        assert_eq!(fetched.status, TaskStatus::Open);
    }

    #[tokio::test]
    async fn claim_task_is_race_proof() {
        let (_dir, storage) = test_storage().await;
        let task = sample_task();
        storage.insert_task(&task).await.unwrap();

        storage.claim_task(&task.id, "wf-1").await.unwrap();
        let second = storage.claim_task(&task.id, "wf-2").await;
        assert!(matches!(second, Err(StorageError::ClaimRace(_))));
    }

    #[tokio::test]
    async fn list_eligible_tasks_excludes_claimed() {
        let (_dir, storage) = test_storage().await;
        let open = sample_task();
        let mut claimed = sample_task();
        claimed.status = TaskStatus::InProgress;
        claimed.claimed_by = Some("wf-1".into());

        storage.insert_task(&open).await.unwrap();
        storage.insert_task(&claimed).await.unwrap();

        let eligible = storage.list_eligible_tasks().await.unwrap();
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].id, open.id);
    }

    #[tokio::test]
    async fn workflow_context_round_trips_through_storage() {
        let (_dir, storage) = test_storage().await;
        let task = sample_task();
        storage.insert_task(&task).await.unwrap();
        storage.claim_task(&task.id, "wf-1").await.unwrap();

        let mut claimed_task = task.clone();
        claimed_task.status = TaskStatus::InProgress;
        claimed_task.claimed_by = Some("wf-1".into());

        let context = Context::new(Id::from_string("wf-1"), claimed_task, "implement-bead", "/tmp/wt", "main");
        storage.insert_workflow(&context, "coven/wf-1").await.unwrap();

        let fetched = storage.get_workflow(&context.workflow_id).await.unwrap();
        assert_eq!(fetched.context.grimoire_name, "implement-bead");
        assert_eq!(fetched.run_branch, "coven/wf-1");
    }

    #[tokio::test]
    async fn journal_records_persist_in_seq_order() {
        let (_dir, storage) = test_storage().await;
        let workflow_id = Id::from_string("wf-1");
        let task = sample_task();
        storage.insert_task(&task).await.unwrap();
        let context = Context::new(workflow_id.clone(), task, "g", "/tmp/wt", "main");
        storage.insert_workflow(&context, "coven/wf-1").await.unwrap();

        let r1 = JournalRecord::new(0, JournalKind::WorkflowStart, serde_json::json!({})).unwrap();
        let r2 = JournalRecord::new(1, JournalKind::StepStart, serde_json::json!({})).unwrap();
        storage.append_journal_record(&workflow_id, &r1).await.unwrap();
        storage.append_journal_record(&workflow_id, &r2).await.unwrap();

        let records = storage.list_journal_records(&workflow_id).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].seq, 0);
        assert_eq!(records[1].kind, JournalKind::StepStart);
    }
}
