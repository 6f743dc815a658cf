//! Prompt assembly and token counting
//!
//! Prompts are assembled in a fixed order: output contract, dataset
//! description, recent chat turns, analysis-result excerpt, RAG context,
//! then the current request. Input tokens are counted before dispatch.

use tiktoken_rs::CoreBPE;

use crate::types::{AnalysisResult, ChatMessage, ChatRole, Dataset, OutputType};

/// Tabular rows included from an analysis-result excerpt.
const MAX_EXCERPT_ROWS: usize = 5;
/// Characters included from a free-text analysis result.
const MAX_EXCERPT_CHARS: usize = 500;

/// Fixed preamble instructing the model how to format executable output.
const OUTPUT_CONTRACT: &str = "\
CODE EXECUTION REQUIREMENTS:
1. Wrap any Python code in a fenced block tagged `python`. Each block is \
executed independently, so include imports and data preparation in every \
block.
2. Outside code fences, write plain-text commentary only: no emojis, no \
status markers, no execution-status sections. Simple markdown tables are \
allowed.
3. Do not place prose inside a code fence; fenced content must be \
directly executable.";

/// Counts tokens with the cl100k_base encoding, degrading to a
/// character-based estimate if the encoder cannot be constructed.
pub struct TokenCounter {
    bpe: Option<CoreBPE>,
}

impl TokenCounter {
    pub fn new() -> Self {
        let bpe = match tiktoken_rs::cl100k_base() {
            Ok(bpe) => Some(bpe),
            Err(e) => {
                tracing::warn!(error = %e, "token encoder unavailable, using estimate");
                None
            }
        };
        Self { bpe }
    }

    pub fn count(&self, text: &str) -> u64 {
        match &self.bpe {
            Some(bpe) => bpe.encode_with_special_tokens(text).len() as u64,
            None => (text.chars().count() as u64).div_ceil(4),
        }
    }
}

impl Default for TokenCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything that can contribute to an assembled prompt.
#[derive(Default)]
pub struct PromptParts<'a> {
    pub dataset: Option<&'a Dataset>,
    pub context_messages: &'a [ChatMessage],
    pub analysis_result: Option<&'a AnalysisResult>,
    pub rag_context: Option<&'a str>,
}

/// Assemble the full prompt in contract order.
pub fn assemble(request: &str, parts: &PromptParts<'_>, max_context_messages: usize) -> String {
    let mut sections: Vec<String> = vec![OUTPUT_CONTRACT.to_string()];

    if let Some(dataset) = parts.dataset {
        sections.push(format!("Dataset context:\n{}", dataset.describe()));
    }

    if !parts.context_messages.is_empty() {
        let recent = parts
            .context_messages
            .iter()
            .rev()
            .take(max_context_messages)
            .collect::<Vec<_>>()
            .into_iter()
            .rev();
        let turns: Vec<String> = recent
            .map(|m| {
                let role = match m.role {
                    ChatRole::User => "user",
                    ChatRole::Assistant => "assistant",
                    ChatRole::System => "system",
                };
                format!("{}: {}", role, m.content)
            })
            .collect();
        sections.push(format!("Previous conversation:\n{}", turns.join("\n")));
    }

    if let Some(result) = parts.analysis_result {
        sections.push(analysis_excerpt(result));
    }

    if let Some(rag) = parts.rag_context {
        if !rag.trim().is_empty() {
            sections.push(format!("Relevant context from the knowledge base:\n{}", rag));
        }
    }

    sections.push(format!("Current request: {}", request));
    sections.join("\n\n")
}

/// Bounded excerpt of an analysis result: at most five tabular rows or
/// five hundred characters of free text.
fn analysis_excerpt(result: &AnalysisResult) -> String {
    let mut excerpt = format!(
        "Analysis result context:\nTool: {}\nOutput type: {:?}",
        result.tool_name, result.output_type
    );
    match result.output_type {
        OutputType::Table => {
            let rows = result
                .data
                .get("data")
                .and_then(|d| d.as_array())
                .map(|rows| {
                    rows.iter()
                        .take(MAX_EXCERPT_ROWS)
                        .cloned()
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default();
            if !rows.is_empty() {
                let rendered = serde_json::to_string(&rows).unwrap_or_default();
                excerpt.push_str(&format!("\nData (first rows): {}", rendered));
            }
        }
        OutputType::Text => {
            let text = result
                .data
                .get("text")
                .and_then(|t| t.as_str())
                .unwrap_or_default();
            if !text.is_empty() {
                let clipped: String = text.chars().take(MAX_EXCERPT_CHARS).collect();
                excerpt.push_str(&format!("\nText: {}", clipped));
            }
        }
        OutputType::Chart => {}
    }
    excerpt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ResultId, SessionId, UserId};

    fn table_result(rows: usize) -> AnalysisResult {
        let data: Vec<serde_json::Value> = (0..rows)
            .map(|i| serde_json::json!({ "row": i }))
            .collect();
        AnalysisResult {
            id: ResultId::new(),
            owner: UserId::new(),
            session: SessionId::new(),
            tool_name: "descriptive_statistics".to_string(),
            output_type: OutputType::Table,
            data: serde_json::json!({ "data": data }),
            wall_ms: 10,
            created_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn sections_appear_in_contract_order() {
        let parts = PromptParts {
            rag_context: Some("prior finding"),
            ..Default::default()
        };
        let prompt = assemble("summarize age", &parts, 10);
        let contract_at = prompt.find("CODE EXECUTION REQUIREMENTS").unwrap();
        let rag_at = prompt.find("prior finding").unwrap();
        let request_at = prompt.find("Current request").unwrap();
        assert!(contract_at < rag_at && rag_at < request_at);
    }

    #[test]
    fn table_excerpt_caps_rows() {
        let result = table_result(20);
        let excerpt = analysis_excerpt(&result);
        assert!(excerpt.contains("\"row\":4"));
        assert!(!excerpt.contains("\"row\":5"));
    }

    #[test]
    fn context_messages_keep_only_most_recent() {
        let owner = UserId::new();
        let session = SessionId::new();
        let messages: Vec<ChatMessage> = (0..15)
            .map(|i| ChatMessage {
                id: crate::types::MessageId::new(),
                owner,
                session,
                role: ChatRole::User,
                content: format!("turn-{}", i),
                token_count: 1,
                created_at: chrono::Utc::now(),
            })
            .collect();
        let parts = PromptParts {
            context_messages: &messages,
            ..Default::default()
        };
        let prompt = assemble("next", &parts, 10);
        assert!(!prompt.contains("turn-4"));
        assert!(prompt.contains("turn-5"));
        assert!(prompt.contains("turn-14"));
    }

    #[test]
    fn token_counter_counts_something() {
        let counter = TokenCounter::new();
        assert!(counter.count("hello world, this is a prompt") > 3);
        assert_eq!(counter.count(""), 0);
    }
}
