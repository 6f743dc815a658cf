//! Agent run and step types
//!
//! A run is a bounded, resumable attempt to achieve a goal: an ordered
//! plan of steps executed under step/token/wall budgets, with a durable
//! state machine that makes pause/resume/cancel plain state mutations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{CorrelationId, DatasetId, RunId, SessionId, UserId};

/// Lifecycle of a run.
///
/// ```text
///             start           run               finish
/// (none) ── planning ─────► running ──────────► completed
///                 │             ├── pause ──► paused ── resume ──► running
///                 │             ├── cancel ──► cancelled
///                 │             └── fatal  ──► failed
///                 └── plan error ──► failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Planning,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Terminal statuses fix `finished_at` and become immutable.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Planning => "planning",
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Lifecycle of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// Bounds for one run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Budget {
    pub max_steps: u32,
    pub max_tokens: u64,
    pub max_wall_seconds: u64,
}

impl Default for Budget {
    fn default() -> Self {
        Self {
            max_steps: 20,
            max_tokens: 100_000,
            max_wall_seconds: 1800,
        }
    }
}

/// Monotonic usage counters for one run.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RunUsage {
    pub tokens: u64,
    pub wall_ms: u64,
}

/// One planned step, before execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub index: u32,
    pub tool_name: String,
    pub description: String,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default)]
    pub expected_output: String,
}

/// A human-feedback record attached to the plan metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackNote {
    pub step_index: u32,
    pub text: String,
    pub at: DateTime<Utc>,
}

/// The generated (or fallback) plan for a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub name: String,
    pub steps: Vec<PlanStep>,
    pub estimated_duration: String,
    pub complexity: String,
    pub confidence: f32,
    /// Raw model output preserved when plan parsing fell back, for
    /// offline debugging. Never repaired or re-parsed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_output: Option<String>,
    #[serde(default)]
    pub human_feedback: Vec<FeedbackNote>,
}

/// One executed (or executing) step of a run. `(run, index)` is unique
/// and indexes are dense starting at 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStep {
    pub run: RunId,
    pub index: u32,
    pub thought: String,
    pub tool_name: String,
    pub parameters: Value,
    pub status: StepStatus,
    pub observation: Value,
    pub confidence: f32,
    pub tokens_used: u64,
    pub wall_ms: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub retries: u32,
    pub max_retries: u32,
    pub error: Option<String>,
}

/// A bounded agent run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRun {
    pub id: RunId,
    pub owner: UserId,
    pub session: SessionId,
    pub dataset: DatasetId,
    pub goal: String,
    pub plan: Plan,
    pub status: RunStatus,
    /// Completed step count; `current_step ≤ total_steps` always.
    pub current_step: u32,
    pub total_steps: u32,
    pub budget: Budget,
    pub usage: RunUsage,
    pub progress_percentage: u8,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub correlation_id: CorrelationId,
}

/// Snapshot returned to status callers: the run plus its tail of steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run: AgentRun,
    pub recent_steps: Vec<AgentStep>,
    /// Seconds left under the wall budget while running.
    pub wall_seconds_remaining: Option<u64>,
    pub next_action: String,
}
