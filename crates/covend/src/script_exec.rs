//! Execution of `script` steps: a templated shell command run in the
//! workflow's worktree (spec Section 4.2.1).

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("script timed out after {0}s")]
    Timeout(u64),
}

pub type Result<T> = std::result::Result<T, ScriptError>;

#[derive(Debug, Clone)]
pub struct ScriptOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub duration_ms: u64,
}

impl ScriptOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Run `command` through `sh -c` in `working_dir`, capturing combined
/// stdout/stderr (spec Section 4.2.1: script steps have no structured
/// termination object, only exit code and text).
pub async fn run(command: &str, working_dir: &Path, timeout_duration: Duration) -> Result<ScriptOutcome> {
    let start = std::time::Instant::now();

    let child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let output = match timeout(timeout_duration, child.wait_with_output()).await {
        Ok(result) => result?,
        Err(_) => return Err(ScriptError::Timeout(timeout_duration.as_secs())),
    };

    let stdout_text = String::from_utf8_lossy(&output.stdout);
    let stderr_text = String::from_utf8_lossy(&output.stderr);
    let combined = if output.stderr.is_empty() {
        stdout_text.to_string()
    } else {
        format!("{stdout_text}\n--- stderr ---\n{stderr_text}")
    };

    Ok(ScriptOutcome {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: combined,
        duration_ms: start.elapsed().as_millis() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn successful_command_reports_zero_exit() {
        let dir = TempDir::new().unwrap();
        let outcome = run("echo hello", dir.path(), Duration::from_secs(5)).await.unwrap();
        assert!(outcome.success());
        assert!(outcome.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn failing_command_reports_nonzero_exit() {
        let dir = TempDir::new().unwrap();
        let outcome = run("exit 3", dir.path(), Duration::from_secs(5)).await.unwrap();
        assert!(!outcome.success());
        assert_eq!(outcome.exit_code, 3);
    }

    #[tokio::test]
    async fn long_running_command_times_out() {
        let dir = TempDir::new().unwrap();
        let result = run("sleep 5", dir.path(), Duration::from_millis(50)).await;
        assert!(matches!(result, Err(ScriptError::Timeout(_))));
    }
}
