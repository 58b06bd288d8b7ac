//! JSON request and response bodies shared by the relay and its client.

use serde::{Deserialize, Serialize};

use crate::types::{ChatMessage, JobId, StaticReport, Trigger};

// ── Health ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
    #[serde(default)]
    pub queued_jobs: usize,
    #[serde(default)]
    pub running_jobs: usize,
    #[serde(default)]
    pub vscode_monitors: usize,
    #[serde(default)]
    pub auto_analyses: usize,
    #[serde(default)]
    pub conversations: usize,
    #[serde(default)]
    pub workers_in_flight: usize,
}

// ── Monitors ──

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConnectRequest {
    #[serde(default)]
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_path: Option<String>,
    #[serde(default)]
    pub auto_upload: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectResponse {
    pub status: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DisconnectRequest {
    #[serde(default)]
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisconnectResponse {
    pub status: String,
    #[serde(default)]
    pub stopped: usize,
}

// ── Analysis ──

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AnalyzeRequest {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default)]
    pub trigger: Trigger,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzeAccepted {
    pub analysis_id: JobId,
    pub message: String,
    pub status_url: String,
}

// ── Execution ──

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExecuteRequest {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    /// Analysis job accepted for the same code before execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis_id: Option<JobId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteAccepted {
    pub execution_id: JobId,
    pub static_analysis: StaticReport,
    pub status_url: String,
}

// ── Compare ──

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CompareRequest {
    #[serde(default)]
    pub code_a: String,
    #[serde(default)]
    pub code_b: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompareResponse {
    pub comparison: String,
}

// ── Chat ──

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChatRequest {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

// ── Errors ──

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}
