//! HTTP façade handlers
//!
//! The caller is identified by the `x-user-id` header (a UUID); the
//! platform's authentication layer sits in front of this façade and is
//! out of scope here.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use std::sync::Arc;

use super::types::*;
use super::ApiError;
use crate::agent::Budget;
use crate::audit::AuditEntry;
use crate::types::{DatasetId, RunId, SessionId, UserId};
use crate::AnalyticsRuntime;

fn caller(headers: &HeaderMap) -> Result<UserId, ApiError> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| ApiError {
            status: StatusCode::UNAUTHORIZED,
            message: "missing or invalid x-user-id header".to_string(),
            correlation_id: crate::types::CorrelationId::new(),
        })
}

fn parse_id<T: std::str::FromStr>(raw: &str, what: &str) -> Result<T, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::bad_request(format!("invalid {}: {}", what, raw)))
}

pub async fn health(State(runtime): State<Arc<AnalyticsRuntime>>) -> Json<serde_json::Value> {
    let report = runtime.maintenance.health_check().await;
    Json(serde_json::json!({
        "status": if report.is_healthy() { "healthy" } else { "degraded" },
        "provider": runtime.llm.provider_name(),
        "checked_at": report.checked_at,
    }))
}

pub async fn create_session(
    State(runtime): State<Arc<AnalyticsRuntime>>,
    headers: HeaderMap,
    Json(request): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<CreateSessionResponse>), ApiError> {
    let user = caller(&headers)?;
    let dataset: DatasetId = parse_id(&request.dataset_id, "dataset_id")?;
    runtime.accountant.ensure(user);

    let session = runtime
        .sessions
        .create(user, dataset, request.name, None)
        .await
        .map_err(crate::types::RuntimeError::from)?;

    runtime.audit.record(
        AuditEntry::action(user, "create_session", "session", "session created")
            .with_resource(session.id.to_string())
            .with_correlation(crate::types::CorrelationId::new()),
    );
    Ok((
        StatusCode::CREATED,
        Json(CreateSessionResponse {
            session_id: session.id.to_string(),
        }),
    ))
}

pub async fn chat_message(
    State(runtime): State<Arc<AnalyticsRuntime>>,
    headers: HeaderMap,
    Json(request): Json<ChatMessageRequest>,
) -> Result<Json<ChatMessageResponse>, ApiError> {
    let user = caller(&headers)?;
    let session: SessionId = parse_id(&request.session_id, "session_id")?;

    let outcome = runtime
        .chat
        .process_message(user, session, &request.message, None)
        .await?;

    runtime.audit.record(
        AuditEntry::action(user, "chat_message", "chat_message", "chat turn processed")
            .with_resource(outcome.message_id.to_string())
            .with_correlation(crate::types::CorrelationId::new()),
    );
    Ok(Json(ChatMessageResponse {
        message_id: outcome.message_id.to_string(),
        response: outcome.response,
        input_tokens: outcome.input_tokens,
        output_tokens: outcome.output_tokens,
        cost: outcome.cost_micros,
    }))
}

pub async fn start_agent_run(
    State(runtime): State<Arc<AnalyticsRuntime>>,
    headers: HeaderMap,
    Json(request): Json<StartAgentRunRequest>,
) -> Result<Json<StartAgentRunResponse>, ApiError> {
    let user = caller(&headers)?;
    let dataset: DatasetId = parse_id(&request.dataset_id, "dataset_id")?;
    if request.goal.trim().is_empty() {
        return Err(ApiError::bad_request("goal must not be empty"));
    }
    runtime.accountant.ensure(user);

    let mut budget = Budget::default();
    if let Some(constraints) = &request.constraints {
        if let Some(max_steps) = constraints.max_steps {
            budget.max_steps = max_steps;
        }
        if let Some(max_tokens) = constraints.max_tokens {
            budget.max_tokens = max_tokens;
        }
        if let Some(max_wall_seconds) = constraints.max_wall_seconds {
            budget.max_wall_seconds = max_wall_seconds;
        }
    }

    let run = runtime
        .orchestrator
        .start(user, dataset, &request.goal, Some(budget))
        .await?;

    Ok(Json(StartAgentRunResponse {
        agent_run_id: run.id.to_string(),
        correlation_id: run.correlation_id.to_string(),
        status: run.status,
    }))
}

pub async fn agent_run_status(
    State(runtime): State<Arc<AnalyticsRuntime>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<RunStatusResponse>, ApiError> {
    let user = caller(&headers)?;
    let run_id: RunId = parse_id(&id, "run id")?;

    let snapshot = runtime
        .orchestrator
        .status(run_id, user)
        .await
        .map_err(crate::types::RuntimeError::from)?;
    Ok(Json(RunStatusResponse {
        agent_run_id: snapshot.run.id.to_string(),
        goal: snapshot.run.goal.clone(),
        status: snapshot.run.status,
        current_step: snapshot.run.current_step,
        total_steps: snapshot.run.total_steps,
        progress_percentage: snapshot.run.progress_percentage,
        tokens_used: snapshot.run.usage.tokens,
        wall_seconds_remaining: snapshot.wall_seconds_remaining,
        error: snapshot.run.error.clone(),
        next_action: snapshot.next_action,
        recent_steps: snapshot.recent_steps,
    }))
}

async fn control_response(
    runtime: &Arc<AnalyticsRuntime>,
    run_id: RunId,
    user: UserId,
    ok: bool,
) -> Result<Json<ControlResponse>, ApiError> {
    let snapshot = runtime
        .orchestrator
        .status(run_id, user)
        .await
        .map_err(crate::types::RuntimeError::from)?;
    Ok(Json(ControlResponse {
        ok,
        status: snapshot.run.status,
    }))
}

pub async fn pause_agent_run(
    State(runtime): State<Arc<AnalyticsRuntime>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<ControlResponse>, ApiError> {
    let user = caller(&headers)?;
    let run_id: RunId = parse_id(&id, "run id")?;
    let ok = runtime
        .orchestrator
        .pause(run_id, user)
        .await
        .map_err(crate::types::RuntimeError::from)?;
    control_response(&runtime, run_id, user, ok).await
}

pub async fn resume_agent_run(
    State(runtime): State<Arc<AnalyticsRuntime>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<ControlResponse>, ApiError> {
    let user = caller(&headers)?;
    let run_id: RunId = parse_id(&id, "run id")?;
    let ok = runtime
        .orchestrator
        .resume(run_id, user)
        .await
        .map_err(crate::types::RuntimeError::from)?;
    control_response(&runtime, run_id, user, ok).await
}

pub async fn cancel_agent_run(
    State(runtime): State<Arc<AnalyticsRuntime>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<ControlResponse>, ApiError> {
    let user = caller(&headers)?;
    let run_id: RunId = parse_id(&id, "run id")?;
    let ok = runtime
        .orchestrator
        .cancel(run_id, user)
        .await
        .map_err(crate::types::RuntimeError::from)?;
    control_response(&runtime, run_id, user, ok).await
}

pub async fn agent_run_feedback(
    State(runtime): State<Arc<AnalyticsRuntime>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(request): Json<FeedbackRequest>,
) -> Result<Json<ControlResponse>, ApiError> {
    let user = caller(&headers)?;
    let run_id: RunId = parse_id(&id, "run id")?;
    if request.feedback.trim().is_empty() {
        return Err(ApiError::bad_request("feedback must not be empty"));
    }
    let ok = runtime
        .orchestrator
        .feedback(run_id, user, &request.feedback, request.step_index)
        .await
        .map_err(crate::types::RuntimeError::from)?;
    control_response(&runtime, run_id, user, ok).await
}

pub async fn sandbox_execute(
    State(runtime): State<Arc<AnalyticsRuntime>>,
    headers: HeaderMap,
    Json(request): Json<SandboxExecuteRequest>,
) -> Result<Json<SandboxExecuteResponse>, ApiError> {
    let user = caller(&headers)?;
    if request.code.trim().is_empty() {
        return Err(ApiError::bad_request("code must not be empty"));
    }

    let record = runtime
        .sandbox
        .execute(user, None, &request.language, &request.code, None)
        .await;

    runtime.audit.record(AuditEntry {
        success: record.status == crate::sandbox::ExecutionStatus::Completed,
        ..AuditEntry::action(
            user,
            "sandbox_execution",
            "sandbox_execution",
            format!("executed {} code in sandbox", record.language),
        )
        .with_resource(record.id.to_string())
        .with_correlation(crate::types::CorrelationId::new())
    });

    Ok(Json(SandboxExecuteResponse {
        execution_id: record.id.to_string(),
        status: record.status,
        output: record.output,
        error: record.error,
        images: Vec::new(),
        execution_time_ms: record.wall_ms,
    }))
}
