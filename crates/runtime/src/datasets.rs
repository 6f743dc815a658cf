//! Content-addressed dataset registry
//!
//! Datasets are immutable once registered. `(owner, content_hash)` is
//! unique: re-registering identical content returns the existing record.

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::storage::BlobStore;
use crate::types::{Dataset, DatasetColumn, DatasetId, SessionError, StoreError, UserId};

/// Registration input for a new dataset.
pub struct DatasetUpload<'a> {
    pub name: &'a str,
    pub origin_format: &'a str,
    /// Columnar payload to be content-addressed and stored.
    pub payload: &'a [u8],
    pub row_count: u64,
    pub columns: Vec<DatasetColumn>,
}

/// In-process registry over the relational and blob collaborators.
pub struct DatasetRegistry {
    datasets: DashMap<DatasetId, Dataset>,
    /// `(owner, content_hash)` → dataset id, for idempotent registration.
    by_content: DashMap<(UserId, String), DatasetId>,
    blobs: Arc<dyn BlobStore>,
}

impl DatasetRegistry {
    pub fn new(blobs: Arc<dyn BlobStore>) -> Self {
        Self {
            datasets: DashMap::new(),
            by_content: DashMap::new(),
            blobs,
        }
    }

    /// Register a dataset, storing its payload under
    /// `datasets/{owner}/{content_hash}`. Identical content for the same
    /// owner returns the existing dataset.
    pub async fn register(
        &self,
        owner: UserId,
        upload: DatasetUpload<'_>,
    ) -> Result<Dataset, StoreError> {
        let content_hash = hex::encode(Sha256::digest(upload.payload));

        if let Some(existing) = self.by_content.get(&(owner, content_hash.clone())) {
            if let Some(dataset) = self.datasets.get(&existing) {
                tracing::debug!(dataset = %dataset.id, "re-upload matched existing content");
                return Ok(dataset.clone());
            }
        }

        let storage_path = format!("datasets/{}/{}", owner, content_hash);
        self.blobs.put(&storage_path, upload.payload).await?;

        let dataset = Dataset {
            id: DatasetId::new(),
            owner,
            name: upload.name.to_string(),
            origin_format: upload.origin_format.to_string(),
            content_hash: content_hash.clone(),
            storage_path,
            row_count: upload.row_count,
            column_count: upload.columns.len() as u64,
            columns: upload.columns,
            created_at: chrono::Utc::now(),
        };
        self.datasets.insert(dataset.id, dataset.clone());
        self.by_content.insert((owner, content_hash), dataset.id);
        Ok(dataset)
    }

    /// Insert a pre-built dataset record directly. Used when schema
    /// inference happens upstream of the registry.
    pub fn insert(&self, dataset: Dataset) {
        self.by_content
            .insert((dataset.owner, dataset.content_hash.clone()), dataset.id);
        self.datasets.insert(dataset.id, dataset);
    }

    pub fn get(&self, id: DatasetId) -> Option<Dataset> {
        self.datasets.get(&id).map(|d| d.clone())
    }

    /// Fetch a dataset, enforcing ownership.
    pub fn get_owned(&self, id: DatasetId, owner: UserId) -> Result<Dataset, SessionError> {
        match self.get(id) {
            Some(dataset) if dataset.owner == owner => Ok(dataset),
            Some(_) => Err(SessionError::IntegrityViolation(format!(
                "dataset {} does not belong to user {}",
                id, owner
            ))),
            None => Err(SessionError::DatasetNotFound(id)),
        }
    }

    pub fn list(&self, owner: UserId) -> Vec<Dataset> {
        let mut datasets: Vec<Dataset> = self
            .datasets
            .iter()
            .filter(|d| d.owner == owner)
            .map(|d| d.clone())
            .collect();
        datasets.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        datasets
    }

    /// Remove a dataset and its blob. The caller cascades dependent
    /// vector notes.
    pub async fn delete(&self, id: DatasetId) -> Result<bool, StoreError> {
        let Some((_, dataset)) = self.datasets.remove(&id) else {
            return Ok(false);
        };
        self.by_content.remove(&(dataset.owner, dataset.content_hash.clone()));
        let _ = self.blobs.delete(&dataset.storage_path).await;
        Ok(true)
    }
}
