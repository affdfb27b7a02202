//! covenctl - CLI client for covend.
//!
//! Local control plane client for the workflow daemon (spec Section 6.7).

mod client;
mod render;

use clap::{Parser, Subcommand};
use client::{Client, ClientError};

#[global_allocator]
static ALLOC: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// CLI client for the covend workflow daemon.
#[derive(Parser)]
#[command(name = "covenctl")]
#[command(about = "Control plane for the covend workflow daemon")]
#[command(version)]
struct Cli {
    /// Daemon address (default: http://127.0.0.1:7700)
    #[arg(long, global = true, env = "COVEND_ADDR")]
    addr: Option<String>,

    /// Auth token for the daemon API
    #[arg(long, global = true, env = "COVEND_TOKEN")]
    token: Option<String>,

    /// Emit machine-readable JSON instead of human-readable text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Session lifecycle
    #[command(subcommand)]
    Session(SessionCommand),
    /// Per-task control
    #[command(subcommand)]
    Task(TaskCommand),
    /// Workflow inspection and control
    #[command(subcommand)]
    Workflow(WorkflowCommand),
    /// Merge review gate resolution
    #[command(subcommand)]
    Merge(MergeCommand),
    /// Answer a pending question
    #[command(subcommand)]
    Question(QuestionCommand),
    /// Check daemon health
    Health,
}

#[derive(Subcommand)]
enum SessionCommand {
    /// Start a session targeting the given branch
    Start {
        /// Branch the session's claimed tasks will base worktrees on
        target_branch: String,
    },
    /// Stop the active session
    Stop,
}

#[derive(Subcommand)]
enum TaskCommand {
    /// Claim and start a specific task
    Start {
        task_id: String,
    },
    /// Stop the in-flight workflow for a task
    Stop {
        task_id: String,
    },
}

#[derive(Subcommand)]
enum WorkflowCommand {
    /// List all workflows
    List,
    /// Show full detail for a workflow
    Get {
        workflow_id: String,
    },
    /// Re-queue a failed or blocked workflow
    Retry {
        workflow_id: String,
    },
    /// Cancel an in-flight workflow
    Cancel {
        workflow_id: String,
    },
}

#[derive(Subcommand)]
enum MergeCommand {
    /// Approve a pending merge review
    Approve {
        workflow_id: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Reject a pending merge review
    Reject {
        workflow_id: String,
        #[arg(long)]
        reason: String,
    },
}

#[derive(Subcommand)]
enum QuestionCommand {
    /// Answer a pending question raised by an agent step
    Answer {
        workflow_id: String,
        question_id: String,
        response: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let json = cli.json;

    let addr = cli.addr.unwrap_or_else(|| "http://127.0.0.1:7700".to_string());
    let client = Client::new(&addr, cli.token.as_deref());

    let requires_daemon = !matches!(cli.command, Command::Health);
    if requires_daemon {
        if let Err(e) = client.wait_for_ready().await {
            report_error(&e, json);
        }
    }

    let result = dispatch(&client, cli.command, json).await;
    if let Err(e) = result {
        report_error(&e, json);
    }
}

fn report_error(e: &ClientError, json: bool) -> ! {
    if json {
        println!("{}", serde_json::json!({ "error": e.to_string() }));
    } else {
        eprintln!("error: {}", e);
    }
    std::process::exit(e.exit_code());
}

async fn dispatch(client: &Client, command: Command, json: bool) -> Result<(), ClientError> {
    match command {
        Command::Session(SessionCommand::Start { target_branch }) => {
            let resp = client.start_session(&target_branch).await?;
            if json {
                println!("{}", serde_json::to_string(&serde_json::json!({ "session_id": resp.session_id }))?);
            } else {
                render::print_session_started(&resp.session_id, &target_branch);
            }
            Ok(())
        }
        Command::Session(SessionCommand::Stop) => {
            client.stop_session().await?;
            if !json {
                println!("Session stopped");
            }
            Ok(())
        }
        Command::Task(TaskCommand::Start { task_id }) => {
            let resp = client.start_task(&task_id).await?;
            if json {
                println!("{}", serde_json::to_string(&serde_json::json!({ "workflow_id": resp.workflow_id }))?);
            } else {
                render::print_task_started(&resp.workflow_id);
            }
            Ok(())
        }
        Command::Task(TaskCommand::Stop { task_id }) => {
            client.stop_task(&task_id).await?;
            if !json {
                println!("Task {} stopped", task_id);
            }
            Ok(())
        }
        Command::Workflow(WorkflowCommand::List) => {
            let workflows = client.list_workflows().await?;
            if json {
                println!("{}", serde_json::to_string(&workflows)?);
            } else {
                render::print_workflow_list(&workflows);
            }
            Ok(())
        }
        Command::Workflow(WorkflowCommand::Get { workflow_id }) => {
            let context = client.get_workflow(&workflow_id).await?;
            if json {
                println!("{}", serde_json::to_string(&context)?);
            } else {
                render::print_workflow_detail(&context);
            }
            Ok(())
        }
        Command::Workflow(WorkflowCommand::Retry { workflow_id }) => {
            let resp = client.retry_workflow(&workflow_id).await?;
            if json {
                println!("{}", serde_json::to_string(&serde_json::json!({ "workflow_id": resp.workflow_id }))?);
            } else {
                render::print_workflow_retried(&resp.workflow_id);
            }
            Ok(())
        }
        Command::Workflow(WorkflowCommand::Cancel { workflow_id }) => {
            client.cancel_workflow(&workflow_id).await?;
            if !json {
                println!("Workflow {} cancelled", workflow_id);
            }
            Ok(())
        }
        Command::Merge(MergeCommand::Approve { workflow_id, reason }) => {
            client.approve_merge(&workflow_id, reason.as_deref()).await?;
            if !json {
                println!("Workflow {} approved", workflow_id);
            }
            Ok(())
        }
        Command::Merge(MergeCommand::Reject { workflow_id, reason }) => {
            client.reject_merge(&workflow_id, &reason).await?;
            if !json {
                println!("Workflow {} rejected", workflow_id);
            }
            Ok(())
        }
        Command::Question(QuestionCommand::Answer { workflow_id, question_id, response }) => {
            client.answer_question(&workflow_id, &question_id, &response).await?;
            if !json {
                println!("Question {} answered", question_id);
            }
            Ok(())
        }
        Command::Health => {
            let health = client.health().await?;
            if json {
                println!("{}", serde_json::to_string(&health)?);
            } else {
                render::print_health(&health);
            }
            Ok(())
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        ClientError::InvalidResponse(e.to_string())
    }
}
