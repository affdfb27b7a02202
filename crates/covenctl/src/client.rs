//! HTTP client for covend.
//!
//! Communicates with covend via its local RPC surface (spec Section 6.1).

use coven_core::{Context, WorkflowStatus};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("daemon not running at {addr}\n  → start with: covend\n  → or set COVEND_ADDR if using a different address")]
    ConnectionFailed { addr: String },

    #[error("HTTP error: {status} - {message}")]
    HttpError { status: u16, message: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("unauthorized: check COVEND_TOKEN env var or --token flag")]
    Unauthorized,

    #[error("daemon not ready after {timeout_ms}ms at {addr}\n  → ensure covend is running\n  → check COVEND_TOKEN if auth is enabled")]
    DaemonNotReady { addr: String, timeout_ms: u64 },
}

impl ClientError {
    /// Maps to the exit codes in spec Section 6.7.
    pub fn exit_code(&self) -> i32 {
        match self {
            ClientError::NotFound(_) => 4,
            ClientError::InvalidState(_) => 3,
            ClientError::ConnectionFailed { .. } | ClientError::DaemonNotReady { .. } => 5,
            ClientError::HttpError { status, .. } if *status == 404 => 4,
            ClientError::HttpError { status, .. } if *status == 409 => 3,
            _ => 5,
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() {
            let addr = e.url().map(|u| u.to_string()).unwrap_or_else(|| "unknown".to_string());
            ClientError::ConnectionFailed { addr }
        } else {
            ClientError::HttpError { status: e.status().map(|s| s.as_u16()).unwrap_or(0), message: e.to_string() }
        }
    }
}

#[derive(Debug, Serialize)]
struct StartSessionRequest {
    target_branch: String,
}

#[derive(Debug, Deserialize)]
pub struct StartSessionResponse {
    pub session_id: String,
}

#[derive(Debug, Deserialize)]
pub struct StartTaskResponse {
    pub workflow_id: String,
}

#[derive(Debug, Deserialize)]
pub struct RetryWorkflowResponse {
    pub workflow_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub workflow_id: String,
    pub task_id: String,
    pub grimoire: String,
    pub status: WorkflowStatus,
    pub current_step: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ListWorkflowsResponse {
    pub workflows: Vec<WorkflowSummary>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: String,
}

/// Default total timeout for the daemon readiness probe.
const DEFAULT_READY_TIMEOUT_MS: u64 = 5000;
const INITIAL_BACKOFF_MS: u64 = 200;

/// HTTP client for covend.
pub struct Client {
    base_url: String,
    token: Option<String>,
    http: reqwest::Client,
}

impl Client {
    pub fn new(base_url: &str, token: Option<&str>) -> Self {
        Self { base_url: base_url.trim_end_matches('/').to_string(), token: token.map(String::from), http: reqwest::Client::new() }
    }

    pub fn addr(&self) -> &str {
        &self.base_url
    }

    pub async fn check_health(&self) -> Result<bool, ClientError> {
        let url = format!("{}/health", self.base_url);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        Ok(response.status().is_success())
    }

    /// Wait for the daemon to become ready, with exponential backoff
    /// starting at 200ms over a 5s window (mirrors the teacher's readiness
    /// probe posture).
    pub async fn wait_for_ready(&self) -> Result<(), ClientError> {
        self.wait_for_ready_with_timeout(DEFAULT_READY_TIMEOUT_MS).await
    }

    pub async fn wait_for_ready_with_timeout(&self, timeout_ms: u64) -> Result<(), ClientError> {
        let start = std::time::Instant::now();
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            match self.check_health().await {
                Ok(true) => return Ok(()),
                Ok(false) | Err(_) => {
                    let elapsed = start.elapsed().as_millis() as u64;
                    if elapsed >= timeout_ms {
                        return Err(ClientError::DaemonNotReady { addr: self.base_url.clone(), timeout_ms });
                    }
                    eprintln!("waiting for daemon at {} (retrying in {}ms)", self.base_url, backoff_ms);
                    let remaining = timeout_ms.saturating_sub(elapsed);
                    let sleep_ms = backoff_ms.min(remaining);
                    tokio::time::sleep(std::time::Duration::from_millis(sleep_ms)).await;
                    backoff_ms = backoff_ms.saturating_mul(2);
                }
            }
        }
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(token) = &self.token {
            if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", token)) {
                headers.insert(AUTHORIZATION, value);
            }
        }
        headers
    }

    async fn handle_error(&self, response: reqwest::Response) -> ClientError {
        let status = response.status().as_u16();
        if status == 401 {
            return ClientError::Unauthorized;
        }
        if status == 404 {
            return ClientError::NotFound("resource not found".to_string());
        }
        if status == 409 {
            let message = response.json::<ErrorResponse>().await.map(|e| e.error).unwrap_or_else(|_| "conflicting state".to_string());
            return ClientError::InvalidState(message);
        }
        let message = response.json::<ErrorResponse>().await.map(|e| e.error).unwrap_or_else(|_| "unknown error".to_string());
        ClientError::HttpError { status, message }
    }

    pub async fn start_session(&self, target_branch: &str) -> Result<StartSessionResponse, ClientError> {
        let url = format!("{}/sessions", self.base_url);
        let response = self.http.post(&url).headers(self.headers()).json(&StartSessionRequest { target_branch: target_branch.to_string() }).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        response.json().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    pub async fn stop_session(&self) -> Result<(), ClientError> {
        let url = format!("{}/sessions/stop", self.base_url);
        let response = self.http.post(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        Ok(())
    }

    pub async fn start_task(&self, task_id: &str) -> Result<StartTaskResponse, ClientError> {
        let url = format!("{}/tasks/{}/start", self.base_url, task_id);
        let response = self.http.post(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        response.json().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    pub async fn stop_task(&self, task_id: &str) -> Result<(), ClientError> {
        let url = format!("{}/tasks/{}/stop", self.base_url, task_id);
        let response = self.http.post(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        Ok(())
    }

    pub async fn list_workflows(&self) -> Result<Vec<WorkflowSummary>, ClientError> {
        let url = format!("{}/workflows", self.base_url);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        let body: ListWorkflowsResponse = response.json().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))?;
        Ok(body.workflows)
    }

    pub async fn get_workflow(&self, workflow_id: &str) -> Result<Context, ClientError> {
        let url = format!("{}/workflows/{}", self.base_url, workflow_id);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        response.json().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    pub async fn retry_workflow(&self, workflow_id: &str) -> Result<RetryWorkflowResponse, ClientError> {
        let url = format!("{}/workflows/{}/retry", self.base_url, workflow_id);
        let response = self.http.post(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        response.json().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }

    pub async fn cancel_workflow(&self, workflow_id: &str) -> Result<(), ClientError> {
        let url = format!("{}/workflows/{}/cancel", self.base_url, workflow_id);
        let response = self.http.post(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        Ok(())
    }

    pub async fn approve_merge(&self, workflow_id: &str, reason: Option<&str>) -> Result<(), ClientError> {
        let url = format!("{}/workflows/{}/approve", self.base_url, workflow_id);
        let response = self.http.post(&url).headers(self.headers()).json(&serde_json::json!({ "reason": reason })).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        Ok(())
    }

    pub async fn reject_merge(&self, workflow_id: &str, reason: &str) -> Result<(), ClientError> {
        let url = format!("{}/workflows/{}/reject", self.base_url, workflow_id);
        let response = self.http.post(&url).headers(self.headers()).json(&serde_json::json!({ "reason": reason })).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        Ok(())
    }

    pub async fn answer_question(&self, workflow_id: &str, question_id: &str, response_text: &str) -> Result<(), ClientError> {
        let url = format!("{}/workflows/{}/answer", self.base_url, workflow_id);
        let response = self.http.post(&url).headers(self.headers()).json(&serde_json::json!({ "question_id": question_id, "response": response_text })).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        Ok(())
    }

    pub async fn health(&self) -> Result<HealthResponse, ClientError> {
        let url = format!("{}/health", self.base_url);
        let response = self.http.get(&url).headers(self.headers()).send().await?;
        if !response.status().is_success() {
            return Err(self.handle_error(response).await);
        }
        response.json().await.map_err(|e| ClientError::InvalidResponse(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_trims_trailing_slash() {
        let client = Client::new("http://localhost:7700/", None);
        assert_eq!(client.base_url, "http://localhost:7700");
    }

    #[test]
    fn client_stores_auth_token() {
        let client = Client::new("http://localhost:7700", Some("my-secret-token"));
        assert_eq!(client.token, Some("my-secret-token".to_string()));
    }

    #[test]
    fn client_headers_include_auth_when_token_set() {
        let client = Client::new("http://localhost:7700", Some("test-token"));
        let headers = client.headers();
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer test-token");
    }

    #[test]
    fn client_headers_omit_auth_when_no_token() {
        let client = Client::new("http://localhost:7700", None);
        let headers = client.headers();
        assert!(headers.get(AUTHORIZATION).is_none());
    }

    #[tokio::test]
    async fn check_health_fails_when_daemon_not_running() {
        let client = Client::new("http://127.0.0.1:19999", None);
        let result = client.check_health().await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn wait_for_ready_times_out_when_daemon_not_running() {
        let client = Client::new("http://127.0.0.1:19999", None);
        let result = client.wait_for_ready_with_timeout(100).await;
        match result {
            Err(ClientError::DaemonNotReady { addr, timeout_ms }) => {
                assert_eq!(addr, "http://127.0.0.1:19999");
                assert_eq!(timeout_ms, 100);
            }
            _ => panic!("expected DaemonNotReady error"),
        }
    }

    #[test]
    fn not_found_exit_code_is_4() {
        assert_eq!(ClientError::NotFound("x".into()).exit_code(), 4);
    }

    #[test]
    fn invalid_state_exit_code_is_3() {
        assert_eq!(ClientError::InvalidState("x".into()).exit_code(), 3);
    }

    #[test]
    fn connection_failed_exit_code_is_5() {
        assert_eq!(ClientError::ConnectionFailed { addr: "x".into() }.exit_code(), 5);
    }
}
