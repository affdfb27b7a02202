//! Sub-agent subprocess supervision (C2). See spec Section 4.2.2 and 6.5.
//!
//! An `agent` step spawns `agent_command` with the rendered spell piped on
//! stdin, streams stdout line-by-line onto the event bus as `agent.output`,
//! and parses a single trailing JSON object off the tail of stdout as the
//! step's structured termination payload. Anything before that object is
//! treated as transcript, not as a protocol violation.

use std::future::Future;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A mid-stream question raised by the agent (spec Section 6.5): `{"type":
/// "question", "id", "text", "options"?}`. Distinct from the terminal
/// object, which carries `success` instead of `type`.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct AgentQuestion {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub options: Vec<String>,
}

fn parse_question(line: &str) -> Option<AgentQuestion> {
    let value: serde_json::Value = serde_json::from_str(line.trim()).ok()?;
    if value.get("type").and_then(|t| t.as_str()) != Some("question") {
        return None;
    }
    serde_json::from_value(value).ok()
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("io error spawning agent: {0}")]
    Io(#[from] std::io::Error),
    #[error("agent command not found: {0}")]
    NotFound(String),
    #[error("agent timed out after {0}s")]
    Timeout(u64),
    #[error("agent was cancelled")]
    Cancelled,
    #[error("agent exited with code {0}, no termination object found")]
    NoTerminationObject(i32),
}

pub type Result<T> = std::result::Result<T, AgentError>;

/// The terminal result of one agent invocation (spec Section 4.2.2).
#[derive(Debug, Clone)]
pub struct AgentOutcome {
    pub exit_code: i32,
    pub stdout: String,
    /// The trailing JSON object parsed from stdout, if the agent emitted one.
    pub termination: Option<serde_json::Value>,
    pub duration_ms: u64,
}

impl AgentOutcome {
    /// An agent step succeeds iff the process exited zero and, when a
    /// termination object is present, its `success` field (default true) is
    /// not explicitly `false` (spec Section 4.2.2).
    pub fn success(&self) -> bool {
        if self.exit_code != 0 {
            return false;
        }
        match &self.termination {
            Some(v) => v.get("success").and_then(|s| s.as_bool()).unwrap_or(true),
            None => true,
        }
    }
}

/// Run `agent_command agent_args... <spell on stdin>` in `working_dir`,
/// streaming each stdout line to `on_line`, until the process exits, the
/// timeout elapses, or `cancel` fires.
///
/// When a line parses as a question object, `on_question` is awaited for
/// the answer and the result is written back to the agent's stdin before
/// reading resumes (spec Section 6.5).
pub async fn run<F, Fut>(
    agent_command: &str,
    agent_args: &[String],
    spell: &str,
    working_dir: &Path,
    timeout_duration: Duration,
    cancel: &CancellationToken,
    mut on_line: impl FnMut(&str) + Send,
    mut on_question: F,
) -> Result<AgentOutcome>
where
    F: FnMut(AgentQuestion) -> Fut + Send,
    Fut: Future<Output = String> + Send,
{
    let start = std::time::Instant::now();

    let mut cmd = Command::new(agent_command);
    cmd.args(agent_args)
        .current_dir(working_dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!(agent_command, working_dir = %working_dir.display(), "spawning agent subprocess");

    let mut child = cmd.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            AgentError::NotFound(agent_command.to_string())
        } else {
            AgentError::Io(e)
        }
    })?;

    let mut stdin = child.stdin.take().expect("piped stdin");
    stdin.write_all(spell.as_bytes()).await?;
    stdin.write_all(b"\n").await?;

    let stdout = child.stdout.take().expect("piped stdout");
    let mut lines = BufReader::new(stdout).lines();
    let mut collected = String::new();

    // stdin stays open: a question mid-stream is answered by writing the
    // response back on the same handle, not by re-spawning the process.
    let read_and_wait = async {
        while let Ok(Some(line)) = lines.next_line().await {
            on_line(&line);
            collected.push_str(&line);
            collected.push('\n');

            if let Some(question) = parse_question(&line) {
                let answer = on_question(question).await;
                stdin.write_all(answer.as_bytes()).await?;
                stdin.write_all(b"\n").await?;
            }
        }
        child.wait().await
    };

    tokio::select! {
        result = timeout(timeout_duration, read_and_wait) => {
            let status = match result {
                Ok(status) => status?,
                Err(_) => {
                    warn!(agent_command, timeout_sec = timeout_duration.as_secs(), "agent timed out");
                    return Err(AgentError::Timeout(timeout_duration.as_secs()));
                }
            };
            let exit_code = status.code().unwrap_or(-1);
            let termination = extract_trailing_json(&collected);
            if termination.is_none() && exit_code != 0 {
                return Err(AgentError::NoTerminationObject(exit_code));
            }
            Ok(AgentOutcome {
                exit_code,
                stdout: collected,
                termination,
                duration_ms: start.elapsed().as_millis() as u64,
            })
        }
        () = cancel.cancelled() => {
            Err(AgentError::Cancelled)
        }
    }
}

/// Parse the last JSON object appearing in `output`, scanning backward for a
/// balanced `{...}` span (spec Section 6.5: the termination object is the
/// last complete JSON value on stdout, not necessarily the last line).
fn extract_trailing_json(output: &str) -> Option<serde_json::Value> {
    let bytes = output.as_bytes();
    let close = bytes.iter().rposition(|&b| b == b'}')?;

    let mut depth: i32 = 0;
    let mut in_string = false;
    let mut escape = false;
    let mut open = None;

    for i in (0..=close).rev() {
        let c = bytes[i] as char;
        if in_string {
            if escape {
                escape = false;
            } else if c == '\\' {
                escape = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '}' => depth += 1,
            '{' => {
                depth -= 1;
                if depth == 0 {
                    open = Some(i);
                    break;
                }
            }
            _ => {}
        }
    }

    let open = open?;
    serde_json::from_str(&output[open..=close]).ok()
}
