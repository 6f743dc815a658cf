//! Error taxonomy for the analytics runtime
//!
//! Each component owns an error enum; everything converges into
//! [`RuntimeError`] at the supervisor and HTTP layers.

use thiserror::Error;

use super::{DatasetId, NoteId, RunId, SessionId, UserId};

/// Main runtime error type
#[derive(Error, Debug, Clone)]
pub enum RuntimeError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] crate::config::ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Vector store error: {0}")]
    Vector(#[from] VectorError),

    #[error("Accounting error: {0}")]
    Accounting(#[from] AccountingError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("Audit error: {0}")]
    Audit(#[from] AuditError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Backing-store errors (key-value, blob, relational collaborators)
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    #[error("Backing store unavailable: {0}")]
    Unavailable(String),

    #[error("Key not found: {0}")]
    NotFound(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),

    #[error("I/O failure: {0}")]
    Io(String),
}

impl StoreError {
    /// Whether the caller may retry the operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Vector store errors
#[derive(Error, Debug, Clone)]
pub enum VectorError {
    #[error("Backing store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Invalid embedding: {reason}")]
    InvalidEmbedding { reason: String },

    #[error("Vector note not found: {0}")]
    NotFound(NoteId),

    #[error("Embedding service failed: {0}")]
    EmbeddingFailed(String),
}

/// Token accounting errors
#[derive(Error, Debug, Clone)]
pub enum AccountingError {
    #[error("Token quota exceeded for user {user}: used {used} + requested {requested} > quota {quota}")]
    QuotaExceeded {
        user: UserId,
        used: u64,
        requested: u64,
        quota: u64,
    },

    #[error("User not found: {0}")]
    UserNotFound(UserId),

    #[error("Backing store unavailable: {0}")]
    StoreUnavailable(String),
}

/// Categorized LLM call failures, mapped from provider diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum LlmErrorKind {
    RateLimited,
    BadRequest,
    Unauthenticated,
    Forbidden,
    ProviderServerError,
    QuotaExceeded,
    PolicyViolation,
    ParseFailure,
    Unknown,
}

impl LlmErrorKind {
    /// Kinds worth another attempt after backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmErrorKind::RateLimited | LlmErrorKind::ProviderServerError
        )
    }

    /// Map an HTTP status from a provider into an error kind.
    pub fn from_status(status: u16) -> Self {
        match status {
            400 => LlmErrorKind::BadRequest,
            401 => LlmErrorKind::Unauthenticated,
            403 => LlmErrorKind::Forbidden,
            429 => LlmErrorKind::RateLimited,
            500..=599 => LlmErrorKind::ProviderServerError,
            _ => LlmErrorKind::Unknown,
        }
    }
}

impl std::fmt::Display for LlmErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LlmErrorKind::RateLimited => "rate_limited",
            LlmErrorKind::BadRequest => "bad_request",
            LlmErrorKind::Unauthenticated => "unauthenticated",
            LlmErrorKind::Forbidden => "forbidden",
            LlmErrorKind::ProviderServerError => "provider_server_error",
            LlmErrorKind::QuotaExceeded => "quota_exceeded",
            LlmErrorKind::PolicyViolation => "policy_violation",
            LlmErrorKind::ParseFailure => "parse_failure",
            LlmErrorKind::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// LLM wrapper errors
#[derive(Error, Debug, Clone)]
pub enum LlmError {
    #[error("No LLM provider available")]
    NoProviderAvailable,

    #[error("Provider call failed ({kind}): {detail}")]
    Provider { kind: LlmErrorKind, detail: String },

    #[error("Token quota exceeded")]
    QuotaExceeded(#[from] AccountingError),

    #[error("Response extraction failed: {0}")]
    ParseFailure(String),
}

impl LlmError {
    pub fn kind(&self) -> LlmErrorKind {
        match self {
            LlmError::NoProviderAvailable => LlmErrorKind::Unknown,
            LlmError::Provider { kind, .. } => *kind,
            LlmError::QuotaExceeded(_) => LlmErrorKind::QuotaExceeded,
            LlmError::ParseFailure(_) => LlmErrorKind::ParseFailure,
        }
    }
}

/// Sandbox executor errors
#[derive(Error, Debug, Clone)]
pub enum SandboxError {
    #[error("Invalid syntax: {0}")]
    InvalidSyntax(String),

    #[error("Forbidden import: {0}")]
    ForbiddenImport(String),

    #[error("Forbidden call: {0}")]
    ForbiddenCall(String),

    #[error("Dangerous pattern detected: {0}")]
    DangerousPattern(String),

    #[error("Execution timed out after {elapsed_ms} ms (limit {limit_ms} ms)")]
    Timeout { elapsed_ms: u64, limit_ms: u64 },

    #[error("Memory limit exceeded: peak {peak_mb} MB (limit {limit_mb} MB)")]
    MemoryExceeded { peak_mb: u64, limit_mb: u64 },

    #[error("Output limit exceeded: {bytes} bytes (limit {limit} bytes)")]
    OutputExceeded { bytes: u64, limit: u64 },

    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("Failed to spawn interpreter: {0}")]
    SpawnFailed(String),

    #[error("Execution not found: {0}")]
    NotFound(String),
}

impl SandboxError {
    /// Policy errors reject the code before a child process is spawned.
    pub fn is_policy(&self) -> bool {
        matches!(
            self,
            SandboxError::InvalidSyntax(_)
                | SandboxError::ForbiddenImport(_)
                | SandboxError::ForbiddenCall(_)
                | SandboxError::DangerousPattern(_)
        )
    }
}

/// Tool registry errors
#[derive(Error, Debug, Clone)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Invalid parameters: {}", errors.join("; "))]
    InvalidInput { errors: Vec<String> },

    #[error("Invalid parameter schema for tool {tool}: {reason}")]
    InvalidSchema { tool: String, reason: String },

    #[error("Dataset precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("Tool {tool} failed: {reason}")]
    HandlerFailed { tool: String, reason: String },
}

/// Session store errors
#[derive(Error, Debug, Clone)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(SessionId),

    #[error("Dataset not found: {0}")]
    DatasetNotFound(DatasetId),

    #[error("Integrity violation: {0}")]
    IntegrityViolation(String),

    #[error("State conflict: {0}")]
    StateConflict(String),

    #[error("Backing store unavailable: {0}")]
    StoreUnavailable(String),
}

/// Agent orchestrator errors
#[derive(Error, Debug, Clone)]
pub enum AgentError {
    #[error("Agent run not found: {0}")]
    NotFound(RunId),

    #[error("State conflict on run {run}: {reason}")]
    StateConflict { run: RunId, reason: String },

    #[error("Failed to start run: {0}")]
    StartFailed(String),

    #[error("Tool dispatch failed: {0}")]
    Dispatch(#[from] ToolError),
}

/// Audit log errors
#[derive(Error, Debug, Clone)]
pub enum AuditError {
    #[error("Audit write failed: {0}")]
    WriteFailed(String),
}
