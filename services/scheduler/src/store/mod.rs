//! Shared, versioned record store.
//!
//! Every scheduler process works against one backing store. Records are JSON
//! values tagged with a version; writers read a record, compute the next value
//! locally, and commit a [`Transaction`] that is conditioned on the versions they
//! read. A commit whose preconditions no longer hold fails with
//! [`StoreError::Conflict`] and changes nothing, and the caller re-runs the whole
//! read-compute-commit cycle through [`retry_on_conflict`].
//!
//! Besides records the store keeps named, insertion-ordered sets of keys. They
//! back the resource pool listing and the job indexes.

mod keys;
mod lock;
mod memory;
mod postgres;

pub use keys::Keys;
pub use lock::LeaseLock;
pub use memory::MemoryStore;
pub use postgres::PgStore;

use std::future::Future;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tracing::trace;

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A transaction precondition did not hold; nothing was written.
    #[error("write conflict on key '{key}'")]
    Conflict { key: String },

    /// The Postgres backend failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A record could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A record exists but does not have the expected shape.
    #[error("corrupt record '{key}': {message}")]
    Corrupt { key: String, message: String },
}

/// Errors that may be resolved by re-running the operation that produced them.
pub trait Retryable {
    /// Whether the error is a transient write conflict.
    fn is_conflict(&self) -> bool;
}

impl Retryable for StoreError {
    fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// A value read from the store together with the version it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: i64,
}

/// A condition checked atomically at commit time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    /// The record must still be at this version.
    Version { key: String, version: i64 },
    /// The record must not exist.
    Absent { key: String },
}

impl Precondition {
    pub fn key(&self) -> &str {
        match self {
            Precondition::Version { key, .. } | Precondition::Absent { key } => key,
        }
    }
}

/// A write applied atomically at commit time.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Put { key: String, value: serde_json::Value },
    Delete { key: String },
    SetAdd { set: String, member: String },
    SetRemove { set: String, member: String },
}

/// A batch of preconditions and mutations committed all-or-nothing.
#[derive(Debug, Clone, Default)]
pub struct Transaction {
    preconditions: Vec<Precondition>,
    mutations: Vec<Mutation>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `key` to still be at `version`.
    pub fn expect_version(&mut self, key: impl Into<String>, version: i64) -> &mut Self {
        self.preconditions.push(Precondition::Version {
            key: key.into(),
            version,
        });
        self
    }

    /// Require `key` not to exist.
    pub fn expect_absent(&mut self, key: impl Into<String>) -> &mut Self {
        self.preconditions.push(Precondition::Absent { key: key.into() });
        self
    }

    /// Require `key` to be exactly as observed: at `version` if it was read,
    /// absent otherwise.
    pub fn expect_observed(&mut self, key: impl Into<String>, version: Option<i64>) -> &mut Self {
        match version {
            Some(version) => self.expect_version(key, version),
            None => self.expect_absent(key),
        }
    }

    /// Write `value` as the new content of `key`.
    pub fn put<T: Serialize>(
        &mut self,
        key: impl Into<String>,
        value: &T,
    ) -> Result<&mut Self, StoreError> {
        self.mutations.push(Mutation::Put {
            key: key.into(),
            value: serde_json::to_value(value)?,
        });
        Ok(self)
    }

    pub fn delete(&mut self, key: impl Into<String>) -> &mut Self {
        self.mutations.push(Mutation::Delete { key: key.into() });
        self
    }

    pub fn set_add(&mut self, set: impl Into<String>, member: impl Into<String>) -> &mut Self {
        self.mutations.push(Mutation::SetAdd {
            set: set.into(),
            member: member.into(),
        });
        self
    }

    pub fn set_remove(&mut self, set: impl Into<String>, member: impl Into<String>) -> &mut Self {
        self.mutations.push(Mutation::SetRemove {
            set: set.into(),
            member: member.into(),
        });
        self
    }

    /// Add or remove `member` depending on `present`.
    pub fn set_membership(
        &mut self,
        set: impl Into<String>,
        member: impl Into<String>,
        present: bool,
    ) -> &mut Self {
        if present {
            self.set_add(set, member)
        } else {
            self.set_remove(set, member)
        }
    }

    pub fn preconditions(&self) -> &[Precondition] {
        &self.preconditions
    }

    pub fn mutations(&self) -> &[Mutation] {
        &self.mutations
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }
}

/// Backing store shared by all scheduler processes.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read one record.
    async fn get(&self, key: &str) -> Result<Option<Versioned<serde_json::Value>>, StoreError>;

    /// Read several records in a single consistent read. The result is aligned
    /// with `keys`.
    async fn get_many(
        &self,
        keys: &[String],
    ) -> Result<Vec<Option<Versioned<serde_json::Value>>>, StoreError>;

    /// Members of a set in insertion order.
    async fn set_members(&self, set: &str) -> Result<Vec<String>, StoreError>;

    /// Atomically check every precondition and apply every mutation.
    ///
    /// Returns the version assigned to the records written by this commit.
    async fn commit(&self, txn: Transaction) -> Result<i64, StoreError>;

    /// Check that the backend is reachable.
    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Read and decode one record.
pub async fn load<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str,
) -> Result<Option<Versioned<T>>, StoreError> {
    match store.get(key).await? {
        Some(Versioned { value, version }) => Ok(Some(Versioned {
            value: decode(key, value)?,
            version,
        })),
        None => Ok(None),
    }
}

/// Read and decode several records in one consistent read; missing keys are
/// skipped.
pub async fn load_many<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    keys: &[String],
) -> Result<Vec<Versioned<T>>, StoreError> {
    let raw = store.get_many(keys).await?;
    let mut out = Vec::with_capacity(raw.len());
    for (key, record) in keys.iter().zip(raw) {
        if let Some(Versioned { value, version }) = record {
            out.push(Versioned {
                value: decode(key, value)?,
                version,
            });
        }
    }
    Ok(out)
}

fn decode<T: DeserializeOwned>(key: &str, value: serde_json::Value) -> Result<T, StoreError> {
    serde_json::from_value(value).map_err(|e| StoreError::Corrupt {
        key: key.to_string(),
        message: e.to_string(),
    })
}

/// Run `attempt` until it finishes without a write conflict.
///
/// Each attempt must redo its reads; nothing computed by a conflicting attempt
/// is reused. There is no retry limit.
pub async fn retry_on_conflict<T, E, F, Fut>(mut attempt: F) -> Result<T, E>
where
    E: Retryable,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut conflicts: u64 = 0;
    loop {
        match attempt().await {
            Err(e) if e.is_conflict() => {
                conflicts += 1;
                trace!(conflicts, "Write conflict, retrying");
                tokio::task::yield_now().await;
            }
            other => return other,
        }
    }
}
