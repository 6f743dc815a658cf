//! Datalyst Analytics Runtime
//!
//! Core execution substrate for the conversational analytics platform:
//! a bounded agent orchestrator, a sandboxed code executor, a scoped
//! vector store, the provider-abstracted LLM call path, and the
//! background maintenance supervisor, wired together by a single
//! top-level [`AnalyticsRuntime`] constructed at process start.

pub mod accounting;
pub mod agent;
pub mod api;
pub mod audit;
pub mod config;
pub mod datasets;
pub mod llm;
pub mod maintenance;
pub mod sandbox;
pub mod session;
pub mod storage;
pub mod tools;
pub mod types;
pub mod vector;

pub use accounting::TokenAccountant;
pub use agent::{AgentOrchestrator, AgentRun, Budget, Planner, RunSnapshot, RunStatus};
pub use audit::{AuditEntry, AuditLog, AuditQuery};
pub use config::Config;
pub use datasets::{DatasetRegistry, DatasetUpload};
pub use llm::{ChatService, LlmProvider, LlmRouter, ProviderReply};
pub use maintenance::{Alert, AlertHandler, MaintenanceSupervisor};
pub use sandbox::{ExecutionRecord, ExecutionStatus, SandboxExecutor};
pub use session::{Session, SessionStore};
pub use storage::{BlobStore, FsBlobStore, InMemoryKvStore, KvStore};
pub use tools::{ParamSchema, ToolHandler, ToolInvocation, ToolOutput, ToolRegistry, ToolSpec};
pub use types::*;
pub use vector::{DeterministicEmbedder, Embedder, NoteManager, VectorStore};

use std::sync::Arc;

/// The assembled runtime: every long-lived component, owned in one
/// place, with capability handles passed into the components that need
/// them.
pub struct AnalyticsRuntime {
    config: Config,
    pub kv: Arc<dyn KvStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub datasets: Arc<DatasetRegistry>,
    pub sessions: Arc<SessionStore>,
    pub accountant: Arc<TokenAccountant>,
    pub vectors: Arc<VectorStore>,
    pub notes: Arc<NoteManager>,
    pub llm: Arc<LlmRouter>,
    pub chat: Arc<ChatService>,
    pub sandbox: Arc<SandboxExecutor>,
    pub tools: Arc<ToolRegistry>,
    pub orchestrator: Arc<AgentOrchestrator>,
    pub maintenance: Arc<MaintenanceSupervisor>,
    pub audit: Arc<AuditLog>,
}

impl AnalyticsRuntime {
    /// Construct the full runtime: storage first, then the LLM provider
    /// (selection policy with health probes), then every component.
    pub async fn new(config: Config) -> Result<Arc<Self>, RuntimeError> {
        config.validate()?;
        let accountant = Arc::new(TokenAccountant::new(config.accounting.clone()));
        let llm = Arc::new(
            LlmRouter::initialize(config.llm.clone(), Arc::clone(&accountant)).await?,
        );
        Self::assemble(config, accountant, llm)
    }

    /// Construct the runtime around a caller-supplied provider, skipping
    /// the selection policy. Used by tests and embedders.
    pub fn with_provider(
        config: Config,
        provider: Arc<dyn LlmProvider>,
    ) -> Result<Arc<Self>, RuntimeError> {
        config.validate()?;
        let accountant = Arc::new(TokenAccountant::new(config.accounting.clone()));
        let llm = Arc::new(LlmRouter::with_provider(
            provider,
            Arc::clone(&accountant),
            config.llm.clone(),
        ));
        Self::assemble(config, accountant, llm)
    }

    fn assemble(
        config: Config,
        accountant: Arc<TokenAccountant>,
        llm: Arc<LlmRouter>,
    ) -> Result<Arc<Self>, RuntimeError> {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
        let blobs: Arc<dyn BlobStore> =
            Arc::new(FsBlobStore::new(config.storage.media_root.clone())?);

        let datasets = Arc::new(DatasetRegistry::new(Arc::clone(&blobs)));
        let sessions = Arc::new(SessionStore::new(
            Arc::clone(&datasets),
            Arc::clone(&kv),
            config.sessions.clone(),
        ));

        let vectors = Arc::new(VectorStore::new(Arc::clone(&kv), config.vector.clone()));
        let embedder: Arc<dyn Embedder> = match &config.vector.embedding_url {
            Some(url) => Arc::new(vector::HttpEmbedder::new(
                url,
                &config.vector.embedding_model,
                config.vector.dimension,
            )),
            None => Arc::new(DeterministicEmbedder::new(config.vector.dimension)),
        };
        let notes = Arc::new(NoteManager::new(Arc::clone(&vectors), embedder));

        let chat = Arc::new(ChatService::new(
            Arc::clone(&llm),
            Arc::clone(&sessions),
            Arc::clone(&datasets),
        ));
        let sandbox = Arc::new(SandboxExecutor::new(config.sandbox.clone()));
        let tools = Arc::new(ToolRegistry::new());
        let audit = Arc::new(AuditLog::new(config.audit.clone()));

        let planner = Planner::new(Arc::clone(&llm), Arc::clone(&notes));
        let orchestrator = Arc::new(AgentOrchestrator::new(
            planner,
            Arc::clone(&tools),
            Arc::clone(&notes),
            Arc::clone(&sessions),
            Arc::clone(&datasets),
            Arc::clone(&audit),
        ));

        let maintenance = Arc::new(
            MaintenanceSupervisor::new(
                config.maintenance.clone(),
                Arc::clone(&kv),
                Arc::clone(&blobs),
                Arc::clone(&sessions),
                Arc::clone(&vectors),
                Arc::clone(&sandbox),
                Arc::clone(&audit),
                Arc::clone(&accountant),
            )
            .with_media_root(config.storage.media_root.clone()),
        );

        tracing::info!(provider = llm.provider_name(), "analytics runtime assembled");
        Ok(Arc::new(Self {
            config,
            kv,
            blobs,
            datasets,
            sessions,
            accountant,
            vectors,
            notes,
            llm,
            chat,
            sandbox,
            tools,
            orchestrator,
            maintenance,
            audit,
        }))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Delete a dataset, cascading to its dataset-scoped vector notes.
    pub async fn delete_dataset(
        &self,
        user: UserId,
        dataset: DatasetId,
    ) -> Result<bool, RuntimeError> {
        self.datasets.get_owned(dataset, user)?;
        let notes_removed = self
            .vectors
            .clear(vector::NoteScope::Dataset, Some(dataset), None)
            .await?;
        let removed = self.datasets.delete(dataset).await?;
        tracing::info!(%dataset, notes_removed, "dataset deleted with scoped notes");
        Ok(removed)
    }

    /// Start the background maintenance workers.
    pub fn start_maintenance(self: &Arc<Self>) {
        self.maintenance.start();
    }

    /// Stop background workers. Components themselves hold no threads.
    pub fn shutdown(&self) {
        tracing::info!("analytics runtime shutting down");
        self.maintenance.stop();
    }
}
