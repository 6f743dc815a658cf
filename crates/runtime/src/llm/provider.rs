//! LLM provider contract and reply extraction
//!
//! Providers return a [`ProviderReply`] sum type covering the response
//! shapes seen in the wild; a single extraction function prefers the most
//! specific variant and degrades defensively.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{LlmError, LlmErrorKind};

/// One candidate completion in a multi-candidate reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyCandidate {
    /// Text parts under the candidate's content.
    pub parts: Vec<String>,
    /// Provider-reported finish reason, if any.
    pub finish_reason: Option<String>,
}

/// The shapes an LLM reply can take.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ProviderReply {
    /// A direct text field.
    PlainText(String),
    /// A flat list of text parts.
    Parts(Vec<String>),
    /// Candidate completions, each carrying content parts.
    Candidates(Vec<ReplyCandidate>),
    /// A structured provider error with diagnostics preserved.
    Error {
        kind: LlmErrorKind,
        detail: String,
    },
}

impl ProviderReply {
    /// Extract the reply text, preferring the most specific variant.
    pub fn extract_text(self) -> Result<String, LlmError> {
        match self {
            ProviderReply::PlainText(text) if !text.trim().is_empty() => Ok(text),
            ProviderReply::PlainText(_) => Err(LlmError::ParseFailure(
                "provider returned empty text".to_string(),
            )),
            ProviderReply::Parts(parts) => {
                let joined = parts
                    .iter()
                    .filter(|p| !p.trim().is_empty())
                    .cloned()
                    .collect::<Vec<_>>()
                    .join("\n");
                if joined.is_empty() {
                    Err(LlmError::ParseFailure(
                        "provider returned no non-empty parts".to_string(),
                    ))
                } else {
                    Ok(joined)
                }
            }
            ProviderReply::Candidates(candidates) => {
                for candidate in &candidates {
                    let joined = candidate
                        .parts
                        .iter()
                        .filter(|p| !p.trim().is_empty())
                        .cloned()
                        .collect::<Vec<_>>()
                        .join("\n");
                    if !joined.is_empty() {
                        return Ok(joined);
                    }
                }
                let reasons: Vec<String> = candidates
                    .iter()
                    .filter_map(|c| c.finish_reason.clone())
                    .collect();
                Err(LlmError::ParseFailure(format!(
                    "no candidate yielded text (finish reasons: {})",
                    if reasons.is_empty() {
                        "none".to_string()
                    } else {
                        reasons.join(", ")
                    }
                )))
            }
            ProviderReply::Error { kind, detail } => Err(LlmError::Provider { kind, detail }),
        }
    }
}

/// A single LLM back-end.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Short provider name used in logs and generation records.
    fn name(&self) -> &'static str;

    /// Cheap health probe used by the selection policy at init.
    async fn probe(&self) -> Result<(), LlmError>;

    /// Run one completion over an assembled prompt.
    async fn generate(&self, prompt: &str) -> Result<ProviderReply, LlmError>;
}
