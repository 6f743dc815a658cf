//! LLM wrapper
//!
//! Provider-abstracted call path: selection policy at init, prompt
//! assembly, a token-quota gate before dispatch, bounded retry with
//! backoff for transient provider failures, and post-hoc output
//! accounting.

pub mod chat;
pub mod local;
pub mod prompt;
pub mod provider;
pub mod remote;

pub use chat::ChatService;
pub use local::LocalProvider;
pub use prompt::{PromptParts, TokenCounter};
pub use provider::{LlmProvider, ProviderReply, ReplyCandidate};
pub use remote::RemoteProvider;

use std::sync::Arc;
use std::time::Duration;

use crate::accounting::TokenAccountant;
use crate::config::{LlmConfig, ProviderChoice};
use crate::types::{AccountingError, LlmError, UserId};

/// Backoff schedule for retryable provider failures: two extra attempts.
const RETRY_DELAYS: [Duration; 2] = [Duration::from_secs(1), Duration::from_secs(4)];

/// One completed generation with its accounting.
#[derive(Debug, Clone)]
pub struct Generation {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_micros: f64,
    pub provider: &'static str,
    pub wall_ms: u64,
}

/// A generation request before prompt assembly.
pub struct GenerateRequest<'a> {
    pub prompt: &'a str,
    pub user: UserId,
    pub parts: PromptParts<'a>,
}

impl<'a> GenerateRequest<'a> {
    pub fn bare(prompt: &'a str, user: UserId) -> Self {
        Self {
            prompt,
            user,
            parts: PromptParts::default(),
        }
    }
}

/// Provider-abstracted LLM call path.
pub struct LlmRouter {
    provider: Arc<dyn LlmProvider>,
    accountant: Arc<TokenAccountant>,
    counter: TokenCounter,
    config: LlmConfig,
}

impl LlmRouter {
    /// Select and initialize a provider.
    ///
    /// Policy: an explicitly chosen provider wins if its probe passes;
    /// otherwise remote is preferred when credentials are present and
    /// healthy, then local if reachable; with nothing available the
    /// router fails fast.
    pub async fn initialize(
        config: LlmConfig,
        accountant: Arc<TokenAccountant>,
    ) -> Result<Self, LlmError> {
        let provider = Self::select_provider(&config).await?;
        tracing::info!(provider = provider.name(), "LLM provider selected");
        Ok(Self {
            provider,
            accountant,
            counter: TokenCounter::new(),
            config,
        })
    }

    /// Build a router around an already-constructed provider. Used by
    /// tests and by embedders of the runtime that manage providers
    /// themselves.
    pub fn with_provider(
        provider: Arc<dyn LlmProvider>,
        accountant: Arc<TokenAccountant>,
        config: LlmConfig,
    ) -> Self {
        Self {
            provider,
            accountant,
            counter: TokenCounter::new(),
            config,
        }
    }

    async fn select_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
        match config.provider {
            ProviderChoice::Remote => {
                if let Some(provider) = Self::try_remote(config).await {
                    return Ok(provider);
                }
            }
            ProviderChoice::Local => {
                if let Some(provider) = Self::try_local(config).await {
                    return Ok(provider);
                }
            }
            ProviderChoice::Auto => {}
        }

        if let Some(provider) = Self::try_remote(config).await {
            return Ok(provider);
        }
        if let Some(provider) = Self::try_local(config).await {
            return Ok(provider);
        }
        Err(LlmError::NoProviderAvailable)
    }

    async fn try_remote(config: &LlmConfig) -> Option<Arc<dyn LlmProvider>> {
        let api_key = config.remote_api_key.as_deref()?;
        let provider = RemoteProvider::new(
            &config.remote_url,
            &config.remote_model,
            api_key,
            config.request_timeout,
        );
        match provider.probe().await {
            Ok(()) => Some(Arc::new(provider)),
            Err(e) => {
                tracing::warn!(error = %e, "remote provider probe failed");
                None
            }
        }
    }

    async fn try_local(config: &LlmConfig) -> Option<Arc<dyn LlmProvider>> {
        let provider = LocalProvider::new(
            &config.local_url,
            &config.local_model,
            config.request_timeout,
        );
        match provider.probe().await {
            Ok(()) => Some(Arc::new(provider)),
            Err(e) => {
                tracing::warn!(error = %e, "local provider probe failed");
                None
            }
        }
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    pub fn config(&self) -> &LlmConfig {
        &self.config
    }

    pub fn count_tokens(&self, text: &str) -> u64 {
        self.counter.count(text)
    }

    /// Assemble, gate on quota, dispatch with retry, and record usage.
    pub async fn generate(&self, request: GenerateRequest<'_>) -> Result<Generation, LlmError> {
        let full_prompt = prompt::assemble(
            request.prompt,
            &request.parts,
            self.config.max_context_messages,
        );
        let input_tokens = self.counter.count(&full_prompt);

        if !self.accountant.can_consume(request.user, input_tokens) {
            let usage = self.accountant.usage(request.user);
            return Err(LlmError::QuotaExceeded(AccountingError::QuotaExceeded {
                user: request.user,
                used: usage.used_tokens,
                requested: input_tokens,
                quota: usage.quota_tokens,
            }));
        }

        let started = std::time::Instant::now();
        let text = self.call_with_retry(&full_prompt).await?;
        let wall_ms = started.elapsed().as_millis() as u64;

        let output_tokens = self.counter.count(&text);
        let cost_micros = (input_tokens as f64 / 1000.0) * self.config.input_token_cost
            + (output_tokens as f64 / 1000.0) * self.config.output_token_cost;

        self.accountant
            .record(request.user, input_tokens, output_tokens, cost_micros)?;

        tracing::debug!(
            provider = self.provider.name(),
            input_tokens,
            output_tokens,
            wall_ms,
            "generation completed"
        );

        Ok(Generation {
            text,
            input_tokens,
            output_tokens,
            cost_micros,
            provider: self.provider.name(),
            wall_ms,
        })
    }

    /// Dispatch with at most two additional attempts on retryable kinds.
    async fn call_with_retry(&self, prompt: &str) -> Result<String, LlmError> {
        let mut attempt = 0usize;
        loop {
            let outcome = match self.provider.generate(prompt).await {
                Ok(reply) => reply.extract_text(),
                Err(e) => Err(e),
            };
            match outcome {
                Ok(text) => return Ok(text),
                Err(e) if e.kind().is_retryable() && attempt < RETRY_DELAYS.len() => {
                    tracing::warn!(
                        attempt = attempt + 1,
                        error = %e,
                        "retryable provider failure, backing off"
                    );
                    tokio::time::sleep(RETRY_DELAYS[attempt]).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AccountingConfig;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedProvider {
        calls: AtomicUsize,
        replies: Vec<ProviderReply>,
    }

    #[async_trait]
    impl LlmProvider for ScriptedProvider {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn probe(&self) -> Result<(), LlmError> {
            Ok(())
        }

        async fn generate(&self, _prompt: &str) -> Result<ProviderReply, LlmError> {
            let i = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.replies[i.min(self.replies.len() - 1)].clone())
        }
    }

    fn router(replies: Vec<ProviderReply>, quota: u64) -> (LlmRouter, Arc<TokenAccountant>) {
        let accountant = Arc::new(TokenAccountant::new(AccountingConfig {
            monthly_quota_tokens: quota,
        }));
        let provider = Arc::new(ScriptedProvider {
            calls: AtomicUsize::new(0),
            replies,
        });
        let router = LlmRouter::with_provider(provider, Arc::clone(&accountant), LlmConfig::default());
        (router, accountant)
    }

    #[tokio::test]
    async fn generate_records_usage() {
        let (router, accountant) = router(
            vec![ProviderReply::PlainText("the mean age is 41.2".to_string())],
            100_000,
        );
        let user = UserId::new();
        let generation = router
            .generate(GenerateRequest::bare("summarize age", user))
            .await
            .unwrap();
        assert_eq!(generation.text, "the mean age is 41.2");
        assert!(generation.input_tokens > 0);
        assert!(generation.output_tokens > 0);
        let usage = accountant.usage(user);
        assert_eq!(
            usage.used_tokens,
            generation.input_tokens + generation.output_tokens
        );
    }

    #[tokio::test]
    async fn quota_gate_blocks_before_dispatch() {
        let (router, _) = router(
            vec![ProviderReply::PlainText("never reached".to_string())],
            1,
        );
        let user = UserId::new();
        let result = router
            .generate(GenerateRequest::bare("a long enough prompt", user))
            .await;
        assert!(matches!(result, Err(LlmError::QuotaExceeded(_))));
    }

    #[tokio::test]
    async fn retries_rate_limits_then_succeeds() {
        let (router, _) = router(
            vec![
                ProviderReply::Error {
                    kind: crate::types::LlmErrorKind::RateLimited,
                    detail: "429".to_string(),
                },
                ProviderReply::PlainText("second try".to_string()),
            ],
            100_000,
        );
        let user = UserId::new();
        tokio::time::pause();
        let pending = router.generate(GenerateRequest::bare("hello", user));
        tokio::pin!(pending);
        // Advance through the 1s backoff.
        loop {
            tokio::select! {
                result = &mut pending => {
                    assert_eq!(result.unwrap().text, "second try");
                    break;
                }
                _ = tokio::time::advance(Duration::from_millis(500)) => {}
            }
        }
    }

    #[tokio::test]
    async fn non_retryable_errors_surface_immediately() {
        let (router, _) = router(
            vec![ProviderReply::Error {
                kind: crate::types::LlmErrorKind::Unauthenticated,
                detail: "401".to_string(),
            }],
            100_000,
        );
        let user = UserId::new();
        let result = router.generate(GenerateRequest::bare("hello", user)).await;
        match result {
            Err(LlmError::Provider { kind, .. }) => {
                assert_eq!(kind, crate::types::LlmErrorKind::Unauthenticated)
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
