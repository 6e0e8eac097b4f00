//! In-process store backend.
//!
//! Used by tests and by single-process deployments that do not need state to
//! survive a restart. Every clone shares the same underlying data, so several
//! managers built over one `MemoryStore` behave like separate processes sharing
//! a database.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{KeyValueStore, Mutation, Precondition, StoreError, Transaction, Versioned};

#[derive(Debug, Default)]
struct Inner {
    records: HashMap<String, Versioned<serde_json::Value>>,
    sets: HashMap<String, Vec<String>>,
    last_version: i64,
}

impl Inner {
    fn check(&self, precondition: &Precondition) -> bool {
        match precondition {
            Precondition::Version { key, version } => self
                .records
                .get(key)
                .is_some_and(|record| record.version == *version),
            Precondition::Absent { key } => !self.records.contains_key(key),
        }
    }

    fn apply(&mut self, mutation: Mutation, version: i64) {
        match mutation {
            Mutation::Put { key, value } => {
                self.records.insert(key, Versioned { value, version });
            }
            Mutation::Delete { key } => {
                self.records.remove(&key);
            }
            Mutation::SetAdd { set, member } => {
                let members = self.sets.entry(set).or_default();
                if !members.contains(&member) {
                    members.push(member);
                }
            }
            Mutation::SetRemove { set, member } => {
                if let Some(members) = self.sets.get_mut(&set) {
                    members.retain(|m| m != &member);
                }
            }
        }
    }
}

/// Store backend holding everything in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned<serde_json::Value>>, StoreError> {
        Ok(self.inner.lock().await.records.get(key).cloned())
    }

    async fn get_many(
        &self,
        keys: &[String],
    ) -> Result<Vec<Option<Versioned<serde_json::Value>>>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(keys.iter().map(|k| inner.records.get(k).cloned()).collect())
    }

    async fn set_members(&self, set: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .inner
            .lock()
            .await
            .sets
            .get(set)
            .cloned()
            .unwrap_or_default())
    }

    async fn commit(&self, txn: Transaction) -> Result<i64, StoreError> {
        let mut inner = self.inner.lock().await;

        if let Some(failed) = txn.preconditions().iter().find(|p| !inner.check(p)) {
            return Err(StoreError::Conflict {
                key: failed.key().to_string(),
            });
        }

        inner.last_version += 1;
        let version = inner.last_version;
        for mutation in txn.mutations().iter().cloned() {
            inner.apply(mutation, version);
        }

        Ok(version)
    }
}
