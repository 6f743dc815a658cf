//! HTTP façade
//!
//! Thin routing layer over the runtime components. Errors map to status
//! codes per the component taxonomy; anything unclassified becomes a 500
//! carrying a correlation id traceable in the audit log.

pub mod routes;
pub mod types;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::types::{
    AgentError, CorrelationId, LlmError, LlmErrorKind, RuntimeError, SandboxError, SessionError,
    StoreError, ToolError,
};
use crate::AnalyticsRuntime;

/// Build the router over a fully-assembled runtime.
pub fn router(runtime: Arc<AnalyticsRuntime>) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/sessions", post(routes::create_session))
        .route("/chat/messages", post(routes::chat_message))
        .route("/agent/run", post(routes::start_agent_run))
        .route("/agent/run/:id/status", get(routes::agent_run_status))
        .route("/agent/run/:id/pause", post(routes::pause_agent_run))
        .route("/agent/run/:id/resume", post(routes::resume_agent_run))
        .route("/agent/run/:id/cancel", post(routes::cancel_agent_run))
        .route("/agent/run/:id/feedback", post(routes::agent_run_feedback))
        .route("/sandbox/execute", post(routes::sandbox_execute))
        .layer(
            tower::ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(runtime)
}

/// Façade error: a runtime error plus the correlation id surfaced to the
/// caller for post-hoc tracing.
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub correlation_id: CorrelationId,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            correlation_id: CorrelationId::new(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(types::ErrorResponse {
            error: self.message,
            correlation_id: self.correlation_id.to_string(),
        });
        (self.status, body).into_response()
    }
}

impl From<RuntimeError> for ApiError {
    fn from(error: RuntimeError) -> Self {
        let status = status_for(&error);
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %error, "unhandled error at facade");
        }
        Self {
            status,
            message: error.to_string(),
            correlation_id: CorrelationId::new(),
        }
    }
}

fn status_for(error: &RuntimeError) -> StatusCode {
    match error {
        RuntimeError::Session(SessionError::NotFound(_))
        | RuntimeError::Session(SessionError::DatasetNotFound(_))
        | RuntimeError::Agent(AgentError::NotFound(_)) => StatusCode::NOT_FOUND,

        RuntimeError::Session(SessionError::StateConflict(_))
        | RuntimeError::Agent(AgentError::StateConflict { .. }) => StatusCode::CONFLICT,

        RuntimeError::Session(SessionError::IntegrityViolation(_)) => StatusCode::FORBIDDEN,

        RuntimeError::Tool(ToolError::UnknownTool(_)) => StatusCode::NOT_FOUND,
        RuntimeError::Tool(ToolError::InvalidInput { .. })
        | RuntimeError::Tool(ToolError::InvalidSchema { .. })
        | RuntimeError::Tool(ToolError::PreconditionFailed(_)) => StatusCode::BAD_REQUEST,

        RuntimeError::Sandbox(e) if e.is_policy() => StatusCode::BAD_REQUEST,

        RuntimeError::Llm(LlmError::QuotaExceeded(_)) => StatusCode::TOO_MANY_REQUESTS,
        RuntimeError::Llm(LlmError::NoProviderAvailable) => StatusCode::SERVICE_UNAVAILABLE,
        RuntimeError::Llm(e) => match e.kind() {
            LlmErrorKind::RateLimited | LlmErrorKind::QuotaExceeded => {
                StatusCode::TOO_MANY_REQUESTS
            }
            LlmErrorKind::BadRequest | LlmErrorKind::PolicyViolation => StatusCode::BAD_REQUEST,
            LlmErrorKind::Unauthenticated => StatusCode::UNAUTHORIZED,
            LlmErrorKind::Forbidden => StatusCode::FORBIDDEN,
            LlmErrorKind::ProviderServerError => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        },

        RuntimeError::Accounting(_) => StatusCode::TOO_MANY_REQUESTS,

        RuntimeError::Storage(StoreError::NotFound(_)) => StatusCode::NOT_FOUND,
        RuntimeError::Storage(StoreError::Unavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
        RuntimeError::Vector(crate::types::VectorError::StoreUnavailable(_)) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        RuntimeError::Vector(crate::types::VectorError::InvalidEmbedding { .. }) => {
            StatusCode::BAD_REQUEST
        }

        RuntimeError::Configuration(_) => StatusCode::BAD_REQUEST,
        RuntimeError::Sandbox(SandboxError::NotFound(_)) => StatusCode::NOT_FOUND,

        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
