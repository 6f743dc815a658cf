//! Remote LLM provider
//!
//! Speaks a Gemini-style `models/{model}:generateContent` REST API. The
//! candidate-shaped response is mapped into [`ProviderReply::Candidates`]
//! without assuming any optional field is present.

use async_trait::async_trait;
use std::time::Duration;

use super::provider::{LlmProvider, ProviderReply, ReplyCandidate};
use crate::types::{LlmError, LlmErrorKind};

pub struct RemoteProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
}

impl RemoteProvider {
    pub fn new(
        base_url: impl Into<String>,
        model: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into(),
            model: model.into(),
            api_key: api_key.into(),
        }
    }

    fn generate_url(&self) -> String {
        format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url.trim_end_matches('/'),
            self.model,
            self.api_key
        )
    }

    fn models_url(&self) -> String {
        format!(
            "{}/models?key={}",
            self.base_url.trim_end_matches('/'),
            self.api_key
        )
    }

    /// Walk `candidates → content → parts → text` without trusting any
    /// level of the shape.
    fn parse_candidates(value: &serde_json::Value) -> Vec<ReplyCandidate> {
        let Some(candidates) = value.get("candidates").and_then(|c| c.as_array()) else {
            return Vec::new();
        };
        candidates
            .iter()
            .map(|candidate| {
                let parts = candidate
                    .get("content")
                    .and_then(|c| c.get("parts"))
                    .and_then(|p| p.as_array())
                    .map(|parts| {
                        parts
                            .iter()
                            .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                ReplyCandidate {
                    parts,
                    finish_reason: candidate
                        .get("finishReason")
                        .and_then(|f| f.as_str())
                        .map(str::to_string),
                }
            })
            .collect()
    }
}

#[async_trait]
impl LlmProvider for RemoteProvider {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn probe(&self) -> Result<(), LlmError> {
        let response = self
            .client
            .get(self.models_url())
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| LlmError::Provider {
                kind: LlmErrorKind::Unknown,
                detail: format!("remote provider unreachable: {}", e),
            })?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(LlmError::Provider {
                kind: LlmErrorKind::from_status(response.status().as_u16()),
                detail: format!("remote provider probe returned {}", response.status()),
            })
        }
    }

    async fn generate(&self, prompt: &str) -> Result<ProviderReply, LlmError> {
        let body = serde_json::json!({
            "contents": [{ "parts": [{ "text": prompt }] }],
        });

        let response = self
            .client
            .post(self.generate_url())
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Provider {
                kind: LlmErrorKind::Unknown,
                detail: e.to_string(),
            })?;

        let status = response.status();
        let value: serde_json::Value = response.json().await.map_err(|e| LlmError::Provider {
            kind: LlmErrorKind::ParseFailure,
            detail: e.to_string(),
        })?;

        if !status.is_success() {
            let detail = value
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(|m| m.as_str())
                .unwrap_or("no error detail")
                .to_string();
            // Provider-declared quota exhaustion arrives as 429 with a
            // RESOURCE_EXHAUSTED status string.
            let status_label = value
                .get("error")
                .and_then(|e| e.get("status"))
                .and_then(|s| s.as_str())
                .unwrap_or_default();
            let kind = if status_label == "RESOURCE_EXHAUSTED" && status.as_u16() != 429 {
                LlmErrorKind::QuotaExceeded
            } else {
                LlmErrorKind::from_status(status.as_u16())
            };
            return Ok(ProviderReply::Error {
                kind,
                detail: format!("{}: {}", status, detail),
            });
        }

        // A 200 with a prompt-level block carries no candidates.
        if let Some(block) = value
            .get("promptFeedback")
            .and_then(|f| f.get("blockReason"))
            .and_then(|b| b.as_str())
        {
            return Ok(ProviderReply::Error {
                kind: LlmErrorKind::PolicyViolation,
                detail: format!("prompt blocked: {}", block),
            });
        }

        // Prefer a direct text field when present, then candidates.
        if let Some(text) = value.get("text").and_then(|t| t.as_str()) {
            if !text.trim().is_empty() {
                return Ok(ProviderReply::PlainText(text.to_string()));
            }
        }
        Ok(ProviderReply::Candidates(Self::parse_candidates(&value)))
    }
}
