//! Key-value store contract with TTL and set semantics
//!
//! Models the subset of a Redis-style store the runtime relies on:
//! string records with expiry, and sets used as scope indexes. Set
//! mutations are idempotent; parallel readers and writers are safe.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashSet;
use std::time::{Duration, Instant};

use crate::types::StoreError;

/// Key-value collaborator contract.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Fetch a record, honoring expiry.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Store a record, optionally with a TTL.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Atomically replace `key` only if its current value equals
    /// `expected`. Returns false when the value moved underneath the
    /// caller. The record's TTL is preserved.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        value: &str,
    ) -> Result<bool, StoreError>;

    /// Refresh a record's TTL. A missing key is not an error.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Remove a record. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Add a member to a set.
    async fn sadd(&self, key: &str, member: &str) -> Result<(), StoreError>;

    /// Remove a member from a set.
    async fn srem(&self, key: &str, member: &str) -> Result<(), StoreError>;

    /// All members of a set; empty when the set is absent.
    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Delete every record and set whose key starts with `prefix`.
    /// Returns the number of entries removed.
    async fn delete_prefix(&self, prefix: &str) -> Result<usize, StoreError>;

    /// Approximate bytes held across all live records.
    async fn total_bytes(&self) -> Result<u64, StoreError>;

    /// Drop expired records eagerly. Expiry is otherwise lazy on read.
    async fn purge_expired(&self) -> Result<usize, StoreError>;

    /// Cheap liveness probe used by health checks.
    async fn ping(&self) -> Result<(), StoreError>;
}

struct Record {
    value: String,
    expires_at: Option<Instant>,
}

impl Record {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// In-process key-value store with lazy TTL expiry.
#[derive(Default)]
pub struct InMemoryKvStore {
    records: DashMap<String, Record>,
    sets: DashMap<String, HashSet<String>>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        if let Some(record) = self.records.get(key) {
            if record.is_expired() {
                drop(record);
                self.records.remove(key);
                return Ok(None);
            }
            return Ok(Some(record.value.clone()));
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.records.insert(
            key.to_string(),
            Record {
                value: value.to_string(),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        value: &str,
    ) -> Result<bool, StoreError> {
        match self.records.get_mut(key) {
            Some(mut record) if !record.is_expired() && record.value == expected => {
                record.value = value.to_string();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        if let Some(mut record) = self.records.get_mut(key) {
            record.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.records.remove(key).is_some())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), StoreError> {
        self.sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<(), StoreError> {
        if let Some(mut set) = self.sets.get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .sets
            .get(key)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize, StoreError> {
        let record_keys: Vec<String> = self
            .records
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        let set_keys: Vec<String> = self
            .sets
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();

        let mut removed = 0;
        for key in record_keys {
            if self.records.remove(&key).is_some() {
                removed += 1;
            }
        }
        for key in set_keys {
            if self.sets.remove(&key).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn total_bytes(&self) -> Result<u64, StoreError> {
        let record_bytes: u64 = self
            .records
            .iter()
            .filter(|e| !e.value().is_expired())
            .map(|e| (e.key().len() + e.value().value.len()) as u64)
            .sum();
        let set_bytes: u64 = self
            .sets
            .iter()
            .map(|e| e.value().iter().map(|m| m.len() as u64).sum::<u64>())
            .sum();
        Ok(record_bytes + set_bytes)
    }

    async fn purge_expired(&self) -> Result<usize, StoreError> {
        let expired: Vec<String> = self
            .records
            .iter()
            .filter(|e| e.value().is_expired())
            .map(|e| e.key().clone())
            .collect();
        let count = expired.len();
        for key in expired {
            self.records.remove(&key);
        }
        Ok(count)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_roundtrip() {
        let store = InMemoryKvStore::new();
        store.set("a", "1", None).await.unwrap();
        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("1"));
        assert!(store.delete("a").await.unwrap());
        assert_eq!(store.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn ttl_expires_records() {
        let store = InMemoryKvStore::new();
        store
            .set("gone", "x", Some(Duration::from_millis(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.get("gone").await.unwrap(), None);
        assert_eq!(store.purge_expired().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn sets_are_idempotent() {
        let store = InMemoryKvStore::new();
        store.sadd("idx", "m1").await.unwrap();
        store.sadd("idx", "m1").await.unwrap();
        store.sadd("idx", "m2").await.unwrap();
        let mut members = store.smembers("idx").await.unwrap();
        members.sort();
        assert_eq!(members, vec!["m1", "m2"]);
        store.srem("idx", "m1").await.unwrap();
        store.srem("idx", "m1").await.unwrap();
        assert_eq!(store.smembers("idx").await.unwrap(), vec!["m2"]);
    }

    #[tokio::test]
    async fn compare_and_swap_detects_races() {
        let store = InMemoryKvStore::new();
        store.set("counter", "1", None).await.unwrap();
        assert!(store.compare_and_swap("counter", "1", "2").await.unwrap());
        assert!(!store.compare_and_swap("counter", "1", "3").await.unwrap());
        assert_eq!(store.get("counter").await.unwrap().as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn delete_prefix_scopes_removal() {
        let store = InMemoryKvStore::new();
        store.set("cache:a", "1", None).await.unwrap();
        store.set("cache:b", "2", None).await.unwrap();
        store.set("vector:c", "3", None).await.unwrap();
        let removed = store.delete_prefix("cache:").await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.get("vector:c").await.unwrap().as_deref(), Some("3"));
    }
}
