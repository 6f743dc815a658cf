//! Durable entities shared across runtime components
//!
//! These mirror the relational collaborator's rows. Components hold id
//! references between entities rather than in-memory back-pointers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::{DatasetId, MessageId, ResultId, SessionId, UserId};

/// A platform user with per-month token accounting state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    /// Tokens consumed in the current accounting month.
    pub used_tokens: u64,
    /// Monthly token quota.
    pub quota_tokens: u64,
    /// Start of the current accounting month.
    pub last_reset_at: DateTime<Utc>,
    /// Per-user storage ceiling in bytes.
    pub storage_cap_bytes: u64,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(username: impl Into<String>, quota_tokens: u64) -> Self {
        let now = Utc::now();
        Self {
            id: UserId::new(),
            username: username.into(),
            used_tokens: 0,
            quota_tokens,
            last_reset_at: now,
            storage_cap_bytes: 1024 * 1024 * 1024,
            created_at: now,
        }
    }
}

/// Inferred column type of a tabular dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnKind {
    Numeric,
    Categorical,
    Datetime,
    Text,
    Boolean,
}

impl std::fmt::Display for ColumnKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ColumnKind::Numeric => "numeric",
            ColumnKind::Categorical => "categorical",
            ColumnKind::Datetime => "datetime",
            ColumnKind::Text => "text",
            ColumnKind::Boolean => "boolean",
        };
        write!(f, "{}", s)
    }
}

/// A single column of a registered dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetColumn {
    pub name: String,
    pub kind: ColumnKind,
}

/// An immutable, content-addressed tabular artifact owned by one user.
///
/// `(owner, content_hash)` is unique: re-registering identical content
/// returns the existing dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    pub id: DatasetId,
    pub owner: UserId,
    pub name: String,
    /// Origin format, e.g. "csv" or "xlsx".
    pub origin_format: String,
    /// Hex-encoded SHA-256 of the columnar payload.
    pub content_hash: String,
    /// Blob-store path of the columnar file.
    pub storage_path: String,
    pub row_count: u64,
    pub column_count: u64,
    pub columns: Vec<DatasetColumn>,
    pub created_at: DateTime<Utc>,
}

impl Dataset {
    /// Short human-readable description used in prompt assembly.
    pub fn describe(&self) -> String {
        let types: Vec<String> = self
            .columns
            .iter()
            .map(|c| format!("{}: {}", c.name, c.kind))
            .collect();
        format!(
            "Dataset: {}\nRows: {}\nColumns: {}\nColumn types: {{{}}}",
            self.name,
            self.row_count,
            self.column_count,
            types.join(", ")
        )
    }

    pub fn column(&self, name: &str) -> Option<&DatasetColumn> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// Shape of an analysis result payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputType {
    Table,
    Chart,
    Text,
}

/// Output of one tool invocation, stored inside a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub id: ResultId,
    pub owner: UserId,
    pub session: SessionId,
    pub tool_name: String,
    pub output_type: OutputType,
    /// Tool-shaped payload; tabular results carry a `data` row array,
    /// textual results a `text` field.
    pub data: serde_json::Value,
    pub wall_ms: u64,
    pub created_at: DateTime<Utc>,
}

/// Who authored a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
    System,
}

/// One turn of the conversation inside a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: MessageId,
    pub owner: UserId,
    pub session: SessionId,
    pub role: ChatRole,
    pub content: String,
    pub token_count: u64,
    pub created_at: DateTime<Utc>,
}

/// Key-value preference bag attached to a session.
pub type Preferences = HashMap<String, serde_json::Value>;
