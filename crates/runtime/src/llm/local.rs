//! Local LLM provider
//!
//! Speaks the Ollama-style REST API of a locally hosted model server.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use super::provider::{LlmProvider, ProviderReply};
use crate::types::{LlmError, LlmErrorKind};

pub struct LocalProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

impl LocalProvider {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            base_url: base_url.into(),
            model: model.into(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl LlmProvider for LocalProvider {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn probe(&self) -> Result<(), LlmError> {
        let response = self
            .client
            .get(self.endpoint("/api/tags"))
            .timeout(Duration::from_secs(3))
            .send()
            .await
            .map_err(|e| LlmError::Provider {
                kind: LlmErrorKind::Unknown,
                detail: format!("local provider unreachable: {}", e),
            })?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(LlmError::Provider {
                kind: LlmErrorKind::from_status(response.status().as_u16()),
                detail: format!("local provider probe returned {}", response.status()),
            })
        }
    }

    async fn generate(&self, prompt: &str) -> Result<ProviderReply, LlmError> {
        let body = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
        });

        let response = self
            .client
            .post(self.endpoint("/api/generate"))
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Provider {
                kind: LlmErrorKind::Unknown,
                detail: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Ok(ProviderReply::Error {
                kind: LlmErrorKind::from_status(status.as_u16()),
                detail: format!("{}: {}", status, detail),
            });
        }

        let parsed: GenerateResponse = response.json().await.map_err(|e| LlmError::Provider {
            kind: LlmErrorKind::ParseFailure,
            detail: e.to_string(),
        })?;
        Ok(ProviderReply::PlainText(parsed.response))
    }
}
