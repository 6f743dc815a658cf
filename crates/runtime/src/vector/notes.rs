//! Note lifecycle on top of the vector store
//!
//! Turns raw text into stored notes: content is normalized and PII-masked
//! before embedding, and convenience indexers cover the three content
//! sources the platform produces (dataset metadata, analysis summaries,
//! tool documentation).

use std::sync::Arc;

use regex::Regex;

use super::{Embedder, NoteContentType, NoteScope, SearchHit, VectorNote, VectorStore};
use crate::types::{AnalysisResult, Dataset, OutputType, UserId, VectorError};

/// Longest text retained for embedding.
const MAX_NOTE_TEXT: usize = 8192;

/// Creates and searches notes through a shared embedder.
pub struct NoteManager {
    store: Arc<VectorStore>,
    embedder: Arc<dyn Embedder>,
    email_pattern: Regex,
    phone_pattern: Regex,
    card_pattern: Regex,
}

impl NoteManager {
    pub fn new(store: Arc<VectorStore>, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            store,
            embedder,
            email_pattern: Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}")
                .expect("static regex"),
            phone_pattern: Regex::new(r"\+?\d[\d\s().-]{7,}\d").expect("static regex"),
            card_pattern: Regex::new(r"\b(?:\d[ -]?){13,19}\b").expect("static regex"),
        }
    }

    /// Create, embed, and store a note from raw text.
    pub async fn create_note(
        &self,
        owner: UserId,
        scope: NoteScope,
        dataset_ref: Option<crate::types::DatasetId>,
        content_type: NoteContentType,
        title: &str,
        text: &str,
        confidence: f32,
    ) -> Result<VectorNote, VectorError> {
        if title.trim().is_empty() || text.trim().is_empty() {
            return Err(VectorError::InvalidEmbedding {
                reason: "note title and text must be non-empty".to_string(),
            });
        }

        let cleaned = self.mask_pii(&preprocess(text));
        let note = VectorNote::new(
            owner,
            scope,
            dataset_ref,
            content_type,
            title,
            cleaned.clone(),
            confidence,
        );
        let embedding = self.embedder.embed(&cleaned).await?;
        self.store.put(&note, embedding).await?;
        Ok(note)
    }

    /// Search by text: embed the query and delegate to the store.
    pub async fn search_text(
        &self,
        query: &str,
        scope: NoteScope,
        dataset_ref: Option<crate::types::DatasetId>,
        owner: Option<UserId>,
        top_k: usize,
        threshold: f32,
    ) -> Result<Vec<SearchHit>, VectorError> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let embedding = self.embedder.embed(query).await?;
        self.store
            .search(&embedding, scope, dataset_ref, owner, top_k, threshold)
            .await
    }

    /// Index a dataset's metadata as a dataset-scoped note.
    pub async fn index_dataset(
        &self,
        dataset: &Dataset,
        owner: UserId,
    ) -> Result<VectorNote, VectorError> {
        let summary = format!(
            "{}\nFormat: {}\nContent hash: {}",
            dataset.describe(),
            dataset.origin_format,
            dataset.content_hash
        );
        self.create_note(
            owner,
            NoteScope::Dataset,
            Some(dataset.id),
            NoteContentType::DatasetMetadata,
            &format!("Dataset: {}", dataset.name),
            &summary,
            1.0,
        )
        .await
    }

    /// Index an analysis result summary, scoped to the dataset it ran on.
    pub async fn index_analysis_result(
        &self,
        result: &AnalysisResult,
        dataset: &Dataset,
    ) -> Result<VectorNote, VectorError> {
        let excerpt = match result.output_type {
            OutputType::Text => result
                .data
                .get("text")
                .and_then(|t| t.as_str())
                .unwrap_or_default()
                .chars()
                .take(500)
                .collect::<String>(),
            _ => serde_json::to_string(&result.data)
                .unwrap_or_default()
                .chars()
                .take(500)
                .collect::<String>(),
        };
        let summary = format!(
            "Analysis with {} on dataset {}\n{}",
            result.tool_name, dataset.name, excerpt
        );
        self.create_note(
            result.owner,
            NoteScope::Dataset,
            Some(dataset.id),
            NoteContentType::AnalysisSummary,
            &format!("{} on {}", result.tool_name, dataset.name),
            &summary,
            0.9,
        )
        .await
    }

    /// Index a tool's documentation as a global note owned by `owner`.
    pub async fn index_tool_documentation(
        &self,
        owner: UserId,
        tool_name: &str,
        description: &str,
        parameter_names: &[String],
    ) -> Result<VectorNote, VectorError> {
        let text = format!(
            "Tool: {}\nDescription: {}\nParameters: {}",
            tool_name,
            description,
            parameter_names.join(", ")
        );
        self.create_note(
            owner,
            NoteScope::Global,
            None,
            NoteContentType::ToolDocumentation,
            &format!("Tool: {}", tool_name),
            &text,
            1.0,
        )
        .await
    }

    /// Replace contact identifiers and card-like digit runs before the
    /// text reaches the embedding model or the store.
    fn mask_pii(&self, text: &str) -> String {
        let masked = self.email_pattern.replace_all(text, "[EMAIL]");
        let masked = self.card_pattern.replace_all(&masked, "[NUMBER]");
        self.phone_pattern.replace_all(&masked, "[PHONE]").into_owned()
    }
}

/// Collapse whitespace and cap length.
fn preprocess(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.len() > MAX_NOTE_TEXT {
        collapsed.chars().take(MAX_NOTE_TEXT).collect()
    } else {
        collapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VectorConfig;
    use crate::storage::InMemoryKvStore;
    use crate::vector::DeterministicEmbedder;

    fn manager() -> NoteManager {
        let store = Arc::new(VectorStore::new(
            Arc::new(InMemoryKvStore::new()),
            VectorConfig::default(),
        ));
        NoteManager::new(store, Arc::new(DeterministicEmbedder::new(384)))
    }

    #[tokio::test]
    async fn create_and_search_roundtrip() {
        let manager = manager();
        let owner = UserId::new();
        let note = manager
            .create_note(
                owner,
                NoteScope::Global,
                None,
                NoteContentType::Insight,
                "revenue trend",
                "quarterly revenue is trending upward",
                0.8,
            )
            .await
            .unwrap();

        let hits = manager
            .search_text(
                "quarterly revenue is trending upward",
                NoteScope::Global,
                None,
                Some(owner),
                5,
                0.9,
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].note.id, note.id);
    }

    #[tokio::test]
    async fn masks_contact_identifiers() {
        let manager = manager();
        let owner = UserId::new();
        let note = manager
            .create_note(
                owner,
                NoteScope::Global,
                None,
                NoteContentType::Insight,
                "contact",
                "reach alice@example.com or +1 (555) 010-9999",
                0.5,
            )
            .await
            .unwrap();
        assert!(!note.text.contains("alice@example.com"));
        assert!(note.text.contains("[EMAIL]"));
        assert!(note.text.contains("[PHONE]"));
    }

    #[tokio::test]
    async fn indexers_scope_their_notes_correctly() {
        let manager = manager();
        let owner = UserId::new();
        let dataset = Dataset {
            id: crate::types::DatasetId::new(),
            owner,
            name: "sales".to_string(),
            origin_format: "csv".to_string(),
            content_hash: "abc".to_string(),
            storage_path: "datasets/x/abc".to_string(),
            row_count: 10,
            column_count: 1,
            columns: vec![],
            created_at: chrono::Utc::now(),
        };

        let meta = manager.index_dataset(&dataset, owner).await.unwrap();
        assert_eq!(meta.scope, NoteScope::Dataset);
        assert_eq!(meta.dataset_ref, Some(dataset.id));
        assert_eq!(meta.content_type, NoteContentType::DatasetMetadata);

        let doc = manager
            .index_tool_documentation(
                owner,
                "correlation_analysis",
                "Pairwise correlations",
                &["columns".to_string(), "method".to_string()],
            )
            .await
            .unwrap();
        assert_eq!(doc.scope, NoteScope::Global);
        assert!(doc.text.contains("columns, method"));
    }

    #[tokio::test]
    async fn rejects_empty_input() {
        let manager = manager();
        let owner = UserId::new();
        assert!(manager
            .create_note(
                owner,
                NoteScope::Global,
                None,
                NoteContentType::Insight,
                " ",
                "body",
                0.5,
            )
            .await
            .is_err());
    }
}
