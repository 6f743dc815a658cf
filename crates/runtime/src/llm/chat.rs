//! Chat message flow
//!
//! The single-call path: persist the user's turn, assemble context from
//! the session, generate, and persist the assistant's turn with its
//! token accounting.

use std::sync::Arc;

use super::{GenerateRequest, LlmRouter, PromptParts};
use crate::datasets::DatasetRegistry;
use crate::session::SessionStore;
use crate::types::{
    ChatMessage, ChatRole, MessageId, RuntimeError, SessionId, UserId,
};

/// Result of one processed chat message.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ChatOutcome {
    pub message_id: MessageId,
    pub response: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_micros: f64,
}

/// Conversational entry point over the LLM router.
pub struct ChatService {
    router: Arc<LlmRouter>,
    sessions: Arc<SessionStore>,
    datasets: Arc<DatasetRegistry>,
}

impl ChatService {
    pub fn new(
        router: Arc<LlmRouter>,
        sessions: Arc<SessionStore>,
        datasets: Arc<DatasetRegistry>,
    ) -> Self {
        Self {
            router,
            sessions,
            datasets,
        }
    }

    /// Process one user message inside a session.
    pub async fn process_message(
        &self,
        user: UserId,
        session_id: SessionId,
        text: &str,
        rag_context: Option<&str>,
    ) -> Result<ChatOutcome, RuntimeError> {
        let session = self.sessions.get(session_id, user)?;
        let dataset = self.datasets.get(session.primary_dataset);
        let context = self.sessions.recent_messages(
            session_id,
            user,
            self.router.config().max_context_messages,
        )?;

        // Persist the user's turn before generation so a failed call
        // still leaves the conversation intact.
        let user_turn = ChatMessage {
            id: MessageId::new(),
            owner: user,
            session: session_id,
            role: ChatRole::User,
            content: text.to_string(),
            token_count: self.router.count_tokens(text),
            created_at: chrono::Utc::now(),
        };
        self.sessions.append_message(user_turn).await?;

        let generation = self
            .router
            .generate(GenerateRequest {
                prompt: text,
                user,
                parts: PromptParts {
                    dataset: dataset.as_ref(),
                    context_messages: &context,
                    analysis_result: None,
                    rag_context,
                },
            })
            .await?;

        let assistant_turn = ChatMessage {
            id: MessageId::new(),
            owner: user,
            session: session_id,
            role: ChatRole::Assistant,
            content: generation.text.clone(),
            token_count: generation.output_tokens,
            created_at: chrono::Utc::now(),
        };
        let message_id = self.sessions.append_message(assistant_turn).await?;

        Ok(ChatOutcome {
            message_id,
            response: generation.text,
            input_tokens: generation.input_tokens,
            output_tokens: generation.output_tokens,
            cost_micros: generation.cost_micros,
        })
    }
}
