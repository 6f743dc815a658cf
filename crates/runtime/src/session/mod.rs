//! Session store
//!
//! Sessions are durable workspaces tagged to a primary dataset. A small
//! projection of each session is cached in the key-value collaborator
//! with a TTL; every mutating call deletes the cache entry (write-through
//! invalidation).

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::config::SessionConfig;
use crate::datasets::DatasetRegistry;
use crate::storage::KvStore;
use crate::types::{
    AnalysisResult, ChatMessage, DatasetId, MessageId, Preferences, RunId, SessionError,
    SessionId, UserId,
};

/// A durable analysis workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub owner: UserId,
    pub name: String,
    pub primary_dataset: DatasetId,
    /// Additional datasets, in attach order.
    pub attached_datasets: Vec<DatasetId>,
    pub preferences: Preferences,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

/// Cached projection of a session for cheap status reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionProjection {
    pub id: SessionId,
    pub primary_dataset: DatasetId,
    pub attached_datasets: Vec<DatasetId>,
    pub preferences: Preferences,
    pub message_count: usize,
    pub result_count: usize,
    pub run_count: usize,
}

/// Aggregate counters for one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStats {
    pub id: SessionId,
    pub is_active: bool,
    pub dataset_count: usize,
    pub message_count: usize,
    pub result_count: usize,
    pub run_count: usize,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

/// Workspace store with per-user active caps and cascade deletes.
pub struct SessionStore {
    sessions: DashMap<SessionId, Session>,
    messages: DashMap<SessionId, Vec<ChatMessage>>,
    results: DashMap<SessionId, Vec<AnalysisResult>>,
    runs: DashMap<SessionId, Vec<RunId>>,
    datasets: Arc<DatasetRegistry>,
    cache: Arc<dyn KvStore>,
    config: SessionConfig,
}

impl SessionStore {
    pub fn new(
        datasets: Arc<DatasetRegistry>,
        cache: Arc<dyn KvStore>,
        config: SessionConfig,
    ) -> Self {
        Self {
            sessions: DashMap::new(),
            messages: DashMap::new(),
            results: DashMap::new(),
            runs: DashMap::new(),
            datasets,
            cache,
            config,
        }
    }

    fn cache_key(id: SessionId) -> String {
        format!("datalyst:cache:session:{}", id)
    }

    async fn invalidate_cache(&self, id: SessionId) {
        let _ = self.cache.delete(&Self::cache_key(id)).await;
    }

    /// Create a session tagged to `primary_dataset`. When the owner is at
    /// the active-session cap, the oldest active session is archived
    /// first.
    pub async fn create(
        &self,
        owner: UserId,
        primary_dataset: DatasetId,
        name: Option<String>,
        preferences: Option<Preferences>,
    ) -> Result<Session, SessionError> {
        let dataset = self.datasets.get_owned(primary_dataset, owner)?;

        let mut active = self.list_active(owner);
        while active.len() >= self.config.max_sessions_per_user {
            active.sort_by(|a, b| a.last_activity_at.cmp(&b.last_activity_at));
            let oldest = active.remove(0);
            tracing::info!(session = %oldest.id, "archiving oldest session at cap");
            self.archive(oldest.id, owner).await?;
        }

        let now = Utc::now();
        let session = Session {
            id: SessionId::new(),
            owner,
            name: name.unwrap_or_else(|| format!("Session - {}", dataset.name)),
            primary_dataset,
            attached_datasets: Vec::new(),
            preferences: preferences.unwrap_or_default(),
            is_active: true,
            created_at: now,
            last_activity_at: now,
        };
        self.sessions.insert(session.id, session.clone());
        Ok(session)
    }

    /// Fetch a session, enforcing ownership.
    pub fn get(&self, id: SessionId, owner: UserId) -> Result<Session, SessionError> {
        match self.sessions.get(&id) {
            Some(session) if session.owner == owner => Ok(session.clone()),
            Some(_) => Err(SessionError::IntegrityViolation(format!(
                "session {} does not belong to user {}",
                id, owner
            ))),
            None => Err(SessionError::NotFound(id)),
        }
    }

    /// Find the owner's most recent active session on a dataset, if any.
    pub fn find_active_for_dataset(
        &self,
        owner: UserId,
        dataset: DatasetId,
    ) -> Option<Session> {
        let mut candidates: Vec<Session> = self
            .sessions
            .iter()
            .filter(|s| s.owner == owner && s.is_active && s.primary_dataset == dataset)
            .map(|s| s.clone())
            .collect();
        candidates.sort_by(|a, b| b.last_activity_at.cmp(&a.last_activity_at));
        candidates.into_iter().next()
    }

    pub fn list_active(&self, owner: UserId) -> Vec<Session> {
        let mut sessions: Vec<Session> = self
            .sessions
            .iter()
            .filter(|s| s.owner == owner && s.is_active)
            .map(|s| s.clone())
            .collect();
        sessions.sort_by(|a, b| b.last_activity_at.cmp(&a.last_activity_at));
        sessions
    }

    fn mutate<F>(&self, id: SessionId, owner: UserId, apply: F) -> Result<Session, SessionError>
    where
        F: FnOnce(&mut Session) -> Result<(), SessionError>,
    {
        let mut entry = self
            .sessions
            .get_mut(&id)
            .ok_or(SessionError::NotFound(id))?;
        if entry.owner != owner {
            return Err(SessionError::IntegrityViolation(format!(
                "session {} does not belong to user {}",
                id, owner
            )));
        }
        apply(&mut entry)?;
        entry.last_activity_at = Utc::now();
        Ok(entry.clone())
    }

    /// Re-tag the session to a new primary dataset owned by the caller.
    pub async fn switch_primary(
        &self,
        id: SessionId,
        new_dataset: DatasetId,
        owner: UserId,
    ) -> Result<Session, SessionError> {
        self.datasets.get_owned(new_dataset, owner)?;
        let session = self.mutate(id, owner, |session| {
            session.attached_datasets.retain(|d| *d != new_dataset);
            session.primary_dataset = new_dataset;
            Ok(())
        })?;
        self.invalidate_cache(id).await;
        Ok(session)
    }

    pub async fn attach_dataset(
        &self,
        id: SessionId,
        dataset: DatasetId,
        owner: UserId,
    ) -> Result<Session, SessionError> {
        self.datasets.get_owned(dataset, owner)?;
        let session = self.mutate(id, owner, |session| {
            if session.primary_dataset == dataset || session.attached_datasets.contains(&dataset) {
                return Err(SessionError::StateConflict(format!(
                    "dataset {} already part of session",
                    dataset
                )));
            }
            session.attached_datasets.push(dataset);
            Ok(())
        })?;
        self.invalidate_cache(id).await;
        Ok(session)
    }

    pub async fn detach_dataset(
        &self,
        id: SessionId,
        dataset: DatasetId,
        owner: UserId,
    ) -> Result<Session, SessionError> {
        let session = self.mutate(id, owner, |session| {
            if session.primary_dataset == dataset {
                return Err(SessionError::StateConflict(
                    "cannot detach the primary dataset".to_string(),
                ));
            }
            let before = session.attached_datasets.len();
            session.attached_datasets.retain(|d| *d != dataset);
            if session.attached_datasets.len() == before {
                return Err(SessionError::StateConflict(format!(
                    "dataset {} not attached",
                    dataset
                )));
            }
            Ok(())
        })?;
        self.invalidate_cache(id).await;
        Ok(session)
    }

    /// Merge a preferences diff into the session's bag. A `null` value
    /// removes the key.
    pub async fn update_prefs(
        &self,
        id: SessionId,
        owner: UserId,
        diff: Preferences,
    ) -> Result<Session, SessionError> {
        let session = self.mutate(id, owner, |session| {
            for (key, value) in diff {
                if value.is_null() {
                    session.preferences.remove(&key);
                } else {
                    session.preferences.insert(key, value);
                }
            }
            Ok(())
        })?;
        self.invalidate_cache(id).await;
        Ok(session)
    }

    /// Soft-archive. Reversible with [`Self::unarchive`] until cleanup
    /// removes the session.
    pub async fn archive(&self, id: SessionId, owner: UserId) -> Result<(), SessionError> {
        self.mutate(id, owner, |session| {
            session.is_active = false;
            Ok(())
        })?;
        self.invalidate_cache(id).await;
        Ok(())
    }

    pub async fn unarchive(&self, id: SessionId, owner: UserId) -> Result<(), SessionError> {
        self.mutate(id, owner, |session| {
            session.is_active = true;
            Ok(())
        })?;
        self.invalidate_cache(id).await;
        Ok(())
    }

    /// Hard-delete the session and cascade to its children.
    pub async fn delete(&self, id: SessionId, owner: UserId) -> Result<(), SessionError> {
        // Ownership check before removal.
        self.get(id, owner)?;
        self.sessions.remove(&id);
        self.messages.remove(&id);
        self.results.remove(&id);
        self.runs.remove(&id);
        self.invalidate_cache(id).await;
        tracing::info!(session = %id, "session deleted with children");
        Ok(())
    }

    pub fn stats(&self, id: SessionId, owner: UserId) -> Result<SessionStats, SessionError> {
        let session = self.get(id, owner)?;
        Ok(SessionStats {
            id,
            is_active: session.is_active,
            dataset_count: 1 + session.attached_datasets.len(),
            message_count: self.messages.get(&id).map(|m| m.len()).unwrap_or(0),
            result_count: self.results.get(&id).map(|r| r.len()).unwrap_or(0),
            run_count: self.runs.get(&id).map(|r| r.len()).unwrap_or(0),
            created_at: session.created_at,
            last_activity_at: session.last_activity_at,
        })
    }

    /// Cached projection for cheap reads; repopulated on miss.
    pub async fn projection(&self, id: SessionId, owner: UserId) -> Result<SessionProjection, SessionError> {
        let key = Self::cache_key(id);
        if let Ok(Some(raw)) = self.cache.get(&key).await {
            if let Ok(projection) = serde_json::from_str(&raw) {
                return Ok(projection);
            }
        }

        let session = self.get(id, owner)?;
        let projection = SessionProjection {
            id,
            primary_dataset: session.primary_dataset,
            attached_datasets: session.attached_datasets.clone(),
            preferences: session.preferences.clone(),
            message_count: self.messages.get(&id).map(|m| m.len()).unwrap_or(0),
            result_count: self.results.get(&id).map(|r| r.len()).unwrap_or(0),
            run_count: self.runs.get(&id).map(|r| r.len()).unwrap_or(0),
        };
        if let Ok(raw) = serde_json::to_string(&projection) {
            let _ = self.cache.set(&key, &raw, Some(self.config.cache_ttl)).await;
        }
        Ok(projection)
    }

    // ── Children ─────────────────────────────────────────────────────

    pub async fn append_message(&self, message: ChatMessage) -> Result<MessageId, SessionError> {
        let id = message.session;
        self.get(id, message.owner)?;
        let message_id = message.id;
        self.messages.entry(id).or_default().push(message);
        self.touch(id);
        self.invalidate_cache(id).await;
        Ok(message_id)
    }

    pub fn recent_messages(
        &self,
        id: SessionId,
        owner: UserId,
        limit: usize,
    ) -> Result<Vec<ChatMessage>, SessionError> {
        self.get(id, owner)?;
        Ok(self
            .messages
            .get(&id)
            .map(|messages| {
                let skip = messages.len().saturating_sub(limit);
                messages[skip..].to_vec()
            })
            .unwrap_or_default())
    }

    pub async fn append_result(&self, result: AnalysisResult) -> Result<(), SessionError> {
        let id = result.session;
        self.get(id, result.owner)?;
        self.results.entry(id).or_default().push(result);
        self.touch(id);
        self.invalidate_cache(id).await;
        Ok(())
    }

    pub fn recent_results(
        &self,
        id: SessionId,
        owner: UserId,
        limit: usize,
    ) -> Result<Vec<AnalysisResult>, SessionError> {
        self.get(id, owner)?;
        Ok(self
            .results
            .get(&id)
            .map(|results| {
                let skip = results.len().saturating_sub(limit);
                results[skip..].to_vec()
            })
            .unwrap_or_default())
    }

    pub async fn record_run(&self, id: SessionId, owner: UserId, run: RunId) -> Result<(), SessionError> {
        self.get(id, owner)?;
        self.runs.entry(id).or_default().push(run);
        self.touch(id);
        self.invalidate_cache(id).await;
        Ok(())
    }

    pub fn session_runs(&self, id: SessionId, owner: UserId) -> Result<Vec<RunId>, SessionError> {
        self.get(id, owner)?;
        Ok(self.runs.get(&id).map(|r| r.clone()).unwrap_or_default())
    }

    fn touch(&self, id: SessionId) {
        if let Some(mut session) = self.sessions.get_mut(&id) {
            session.last_activity_at = Utc::now();
        }
    }

    // ── Maintenance hooks ───────────────────────────────────────────

    /// Delete sessions idle longer than `max_idle`, cascading children.
    /// Returns how many were removed.
    pub async fn cleanup_idle(&self, max_idle: Duration) -> usize {
        let cutoff = match chrono::Duration::from_std(max_idle)
            .ok()
            .and_then(|idle| Utc::now().checked_sub_signed(idle))
        {
            Some(cutoff) => cutoff,
            None => return 0,
        };
        let stale: Vec<(SessionId, UserId)> = self
            .sessions
            .iter()
            .filter(|s| s.last_activity_at < cutoff)
            .map(|s| (s.id, s.owner))
            .collect();
        let mut removed = 0;
        for (id, owner) in stale {
            if self.delete(id, owner).await.is_ok() {
                removed += 1;
            }
        }
        removed
    }

    /// Total session rows, active or archived. Integrity smoke for
    /// health checks.
    pub fn total_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Full JSON snapshot of a session and its children.
    pub fn export(&self, id: SessionId, owner: UserId) -> Result<serde_json::Value, SessionError> {
        let session = self.get(id, owner)?;
        Ok(serde_json::json!({
            "session": session,
            "messages": self.messages.get(&id).map(|m| m.clone()).unwrap_or_default(),
            "results": self.results.get(&id).map(|r| r.clone()).unwrap_or_default(),
            "agent_runs": self.runs.get(&id).map(|r| r.clone()).unwrap_or_default(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasets::DatasetUpload;
    use crate::storage::{FsBlobStore, InMemoryKvStore};
    use crate::types::{ColumnKind, DatasetColumn};

    async fn fixture() -> (SessionStore, UserId, DatasetId, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(DatasetRegistry::new(Arc::new(
            FsBlobStore::new(dir.path()).unwrap(),
        )));
        let owner = UserId::new();
        let dataset = registry
            .register(
                owner,
                DatasetUpload {
                    name: "people",
                    origin_format: "csv",
                    payload: b"age\n1\n",
                    row_count: 1,
                    columns: vec![DatasetColumn {
                        name: "age".to_string(),
                        kind: ColumnKind::Numeric,
                    }],
                },
            )
            .await
            .unwrap();
        let store = SessionStore::new(
            registry,
            Arc::new(InMemoryKvStore::new()),
            SessionConfig {
                max_sessions_per_user: 2,
                cache_ttl: Duration::from_secs(60),
            },
        );
        (store, owner, dataset.id, dir)
    }

    #[tokio::test]
    async fn create_enforces_dataset_ownership() {
        let (store, _, dataset, _dir) = fixture().await;
        let stranger = UserId::new();
        assert!(store.create(stranger, dataset, None, None).await.is_err());
    }

    #[tokio::test]
    async fn cap_archives_oldest_session() {
        let (store, owner, dataset, _dir) = fixture().await;
        let first = store.create(owner, dataset, None, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let _second = store.create(owner, dataset, None, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let _third = store.create(owner, dataset, None, None).await.unwrap();

        let active = store.list_active(owner);
        assert_eq!(active.len(), 2);
        assert!(active.iter().all(|s| s.id != first.id));
        // Archive is soft: the session still exists.
        assert!(!store.get(first.id, owner).unwrap().is_active);
    }

    #[tokio::test]
    async fn prefs_diff_merges_and_removes() {
        let (store, owner, dataset, _dir) = fixture().await;
        let session = store.create(owner, dataset, None, None).await.unwrap();

        let mut diff = Preferences::new();
        diff.insert("theme".to_string(), serde_json::json!("dark"));
        store.update_prefs(session.id, owner, diff).await.unwrap();

        let mut removal = Preferences::new();
        removal.insert("theme".to_string(), serde_json::Value::Null);
        let updated = store.update_prefs(session.id, owner, removal).await.unwrap();
        assert!(updated.preferences.is_empty());
    }

    #[tokio::test]
    async fn delete_cascades_children() {
        let (store, owner, dataset, _dir) = fixture().await;
        let session = store.create(owner, dataset, None, None).await.unwrap();
        store
            .append_message(ChatMessage {
                id: MessageId::new(),
                owner,
                session: session.id,
                role: crate::types::ChatRole::User,
                content: "hi".to_string(),
                token_count: 1,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        store.delete(session.id, owner).await.unwrap();
        assert!(matches!(
            store.get(session.id, owner),
            Err(SessionError::NotFound(_))
        ));
        assert!(store.messages.get(&session.id).is_none());
    }

    #[tokio::test]
    async fn export_includes_children_and_archive_is_reversible() {
        let (store, owner, dataset, _dir) = fixture().await;
        let session = store.create(owner, dataset, None, None).await.unwrap();
        store
            .append_result(AnalysisResult {
                id: crate::types::ResultId::new(),
                owner,
                session: session.id,
                tool_name: "descriptive_statistics".to_string(),
                output_type: crate::types::OutputType::Text,
                data: serde_json::json!({"text": "mean is 41.5"}),
                wall_ms: 3,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let export = store.export(session.id, owner).unwrap();
        assert_eq!(export["results"].as_array().unwrap().len(), 1);

        store.archive(session.id, owner).await.unwrap();
        assert!(store.list_active(owner).is_empty());
        store.unarchive(session.id, owner).await.unwrap();
        assert_eq!(store.list_active(owner).len(), 1);
    }

    #[tokio::test]
    async fn projection_is_cached_until_a_mutation() {
        let (store, owner, dataset, _dir) = fixture().await;
        let session = store.create(owner, dataset, None, None).await.unwrap();
        let first = store.projection(session.id, owner).await.unwrap();
        assert_eq!(first.message_count, 0);

        store
            .append_message(ChatMessage {
                id: MessageId::new(),
                owner,
                session: session.id,
                role: crate::types::ChatRole::User,
                content: "hello".to_string(),
                token_count: 1,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        // Write-through invalidation: the next read reflects the write.
        let second = store.projection(session.id, owner).await.unwrap();
        assert_eq!(second.message_count, 1);
    }

    #[tokio::test]
    async fn detach_refuses_primary() {
        let (store, owner, dataset, _dir) = fixture().await;
        let session = store.create(owner, dataset, None, None).await.unwrap();
        assert!(matches!(
            store.detach_dataset(session.id, dataset, owner).await,
            Err(SessionError::StateConflict(_))
        ));
    }
}
