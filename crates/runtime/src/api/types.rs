//! HTTP façade request/response shapes

use serde::{Deserialize, Serialize};

use crate::agent::{AgentStep, RunStatus};

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub dataset_id: String,
    pub name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateSessionResponse {
    pub session_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ChatMessageRequest {
    pub session_id: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ChatMessageResponse {
    pub message_id: String,
    pub response: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
}

#[derive(Debug, Deserialize)]
pub struct AgentRunConstraints {
    pub max_steps: Option<u32>,
    pub max_tokens: Option<u64>,
    pub max_wall_seconds: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct StartAgentRunRequest {
    pub dataset_id: String,
    pub goal: String,
    pub constraints: Option<AgentRunConstraints>,
}

#[derive(Debug, Serialize)]
pub struct StartAgentRunResponse {
    pub agent_run_id: String,
    pub correlation_id: String,
    pub status: RunStatus,
}

#[derive(Debug, Serialize)]
pub struct RunStatusResponse {
    pub agent_run_id: String,
    pub goal: String,
    pub status: RunStatus,
    pub current_step: u32,
    pub total_steps: u32,
    pub progress_percentage: u8,
    pub tokens_used: u64,
    pub wall_seconds_remaining: Option<u64>,
    pub error: Option<String>,
    pub next_action: String,
    pub recent_steps: Vec<AgentStep>,
}

#[derive(Debug, Serialize)]
pub struct ControlResponse {
    pub ok: bool,
    pub status: RunStatus,
}

#[derive(Debug, Deserialize)]
pub struct FeedbackRequest {
    pub feedback: String,
    pub step_index: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct SandboxExecuteRequest {
    pub code: String,
    #[serde(default = "default_language")]
    pub language: String,
}

fn default_language() -> String {
    "python".to_string()
}

#[derive(Debug, Serialize)]
pub struct SandboxExecuteResponse {
    pub execution_id: String,
    pub status: crate::sandbox::ExecutionStatus,
    pub output: String,
    pub error: Option<String>,
    pub images: Vec<String>,
    pub execution_time_ms: u64,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub correlation_id: String,
}
