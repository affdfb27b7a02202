//! Output rendering for covenctl.
//!
//! Formats workflow and health information for terminal display.

use coven_core::{Context, WorkflowStatus};

use crate::client::{HealthResponse, WorkflowSummary};

pub fn print_session_started(session_id: &str, target_branch: &str) {
    println!("Session started: {}", session_id);
    println!("  Target branch: {}", target_branch);
}

pub fn print_task_started(workflow_id: &str) {
    println!("Workflow started: {}", workflow_id);
}

pub fn print_workflow_retried(workflow_id: &str) {
    println!("Workflow re-queued as: {}", workflow_id);
}

pub fn print_workflow_list(workflows: &[WorkflowSummary]) {
    if workflows.is_empty() {
        println!("No workflows found.");
        return;
    }

    println!("{:<36}  {:<36}  {:<20}  {:<16}  {}", "WORKFLOW", "TASK", "GRIMOIRE", "STATUS", "STEP");
    println!("{}", "-".repeat(130));

    for wf in workflows {
        println!(
            "{:<36}  {:<36}  {:<20}  {:<16}  {}",
            wf.workflow_id,
            wf.task_id,
            truncate(&wf.grimoire, 20),
            format_status(wf.status),
            wf.current_step.as_deref().unwrap_or("-"),
        );
    }

    println!();
    println!("{} workflow(s)", workflows.len());
}

pub fn print_workflow_detail(context: &Context) {
    println!("Workflow: {}", context.workflow_id);
    println!();
    println!("  Task:           {}", context.task.id);
    println!("  Grimoire:       {}", context.grimoire_name);
    println!("  Status:         {}", format_status(context.status));
    println!("  Worktree:       {}", context.worktree_path);
    println!("  Target Branch:  {}", context.target_branch);
    println!("  Started:        {}", context.started_at.format("%Y-%m-%d %H:%M:%S"));

    if !context.current_step_path.is_empty() {
        let path: Vec<String> = context
            .current_step_path
            .iter()
            .map(|e| match e.iteration {
                Some(i) => format!("{}[{}]", e.step_name, i),
                None => e.step_name.clone(),
            })
            .collect();
        println!("  Current Step:   {}", path.join(" / "));
    }

    if !context.outputs.is_empty() {
        println!();
        println!("  Step Outputs:");
        let mut names: Vec<&String> = context.outputs.keys().collect();
        names.sort();
        for name in names {
            println!("    {}: {:?}", name, context.outputs[name]);
        }
    }
}

pub fn print_health(health: &HealthResponse) {
    println!("status:  {}", health.status);
    println!("version: {}", health.version);
    println!("uptime:  {}s", health.uptime_secs);
}

fn format_status(status: WorkflowStatus) -> &'static str {
    match status {
        WorkflowStatus::Running => "RUNNING",
        WorkflowStatus::AwaitingReview => "AWAITING_REVIEW",
        WorkflowStatus::AwaitingInput => "AWAITING_INPUT",
        WorkflowStatus::Completed => "COMPLETED",
        WorkflowStatus::Failed => "FAILED",
        WorkflowStatus::Blocked => "BLOCKED",
        WorkflowStatus::Cancelled => "CANCELLED",
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        format!("{}...", &s[..max_len.saturating_sub(3)])
    }
}
