//! Vector note types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{DatasetId, NoteId, UserId};

/// Visibility scope of a vector note.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteScope {
    /// Visible only when searching alongside the referenced dataset.
    Dataset,
    /// Visible to all of the owner's queries.
    Global,
}

impl std::fmt::Display for NoteScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NoteScope::Dataset => write!(f, "dataset"),
            NoteScope::Global => write!(f, "global"),
        }
    }
}

/// What kind of content a note carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteContentType {
    DatasetMetadata,
    AnalysisSummary,
    ToolDocumentation,
    Insight,
}

/// An embedded note stored in the vector index.
///
/// Invariants: `scope == Dataset` implies `dataset_ref` is present,
/// `scope == Global` implies it is absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorNote {
    pub id: NoteId,
    pub owner: UserId,
    pub scope: NoteScope,
    pub dataset_ref: Option<DatasetId>,
    pub content_type: NoteContentType,
    pub title: String,
    pub text: String,
    /// Confidence in the note's content, within [0, 1].
    pub confidence: f32,
    pub usage_count: u64,
    pub last_accessed: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl VectorNote {
    pub fn new(
        owner: UserId,
        scope: NoteScope,
        dataset_ref: Option<DatasetId>,
        content_type: NoteContentType,
        title: impl Into<String>,
        text: impl Into<String>,
        confidence: f32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: NoteId::new(),
            owner,
            scope,
            dataset_ref,
            content_type,
            title: title.into(),
            text: text.into(),
            confidence: confidence.clamp(0.0, 1.0),
            usage_count: 0,
            last_accessed: now,
            created_at: now,
        }
    }
}

/// Persisted record shape: the note, its embedding, and the dimension.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorRecord {
    pub data: VectorNote,
    pub embedding: Vec<f32>,
    pub dimension: usize,
}

/// One ranked search result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub note: VectorNote,
    pub similarity: f32,
}

/// Aggregate statistics over the index.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VectorStats {
    pub total_notes: usize,
    pub dataset_scoped: usize,
    pub global_scoped: usize,
}
