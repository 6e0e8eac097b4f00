//! Lease-based mutual exclusion on top of the shared store.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hydromaas_id::LockOwnerId;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{load, retry_on_conflict, KeyValueStore, StoreError, Transaction};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockRecord {
    owner: LockOwnerId,
    acquired_at: DateTime<Utc>,
}

/// A named lock held by at most one owner at a time.
///
/// A holder that disappears without releasing keeps the lock only until its
/// lease runs out; after that any other owner may take it over.
#[derive(Clone)]
pub struct LeaseLock {
    store: Arc<dyn KeyValueStore>,
    key: String,
    owner: LockOwnerId,
    lease: Duration,
}

impl LeaseLock {
    pub fn new(store: Arc<dyn KeyValueStore>, key: impl Into<String>, lease: Duration) -> Self {
        Self {
            store,
            key: key.into(),
            owner: LockOwnerId::new(),
            lease,
        }
    }

    pub fn owner(&self) -> LockOwnerId {
        self.owner
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    fn is_expired(&self, record: &LockRecord, now: DateTime<Utc>) -> bool {
        let held_for = now.signed_duration_since(record.acquired_at);
        held_for.to_std().is_ok_and(|held| held >= self.lease)
    }

    /// Try to take the lock once. Returns false if another owner holds an
    /// unexpired lease.
    pub async fn try_acquire(&self) -> Result<bool, StoreError> {
        retry_on_conflict(|| async {
            let current = load::<LockRecord>(self.store.as_ref(), &self.key).await?;
            let now = Utc::now();

            if let Some(held) = &current {
                if held.value.owner != self.owner && !self.is_expired(&held.value, now) {
                    return Ok(false);
                }
                if held.value.owner != self.owner {
                    warn!(
                        lock = %self.key,
                        previous_owner = %held.value.owner,
                        "Taking over expired lock lease"
                    );
                }
            }

            let mut txn = Transaction::new();
            txn.expect_observed(&self.key, current.as_ref().map(|c| c.version))
                .put(
                    &self.key,
                    &LockRecord {
                        owner: self.owner,
                        acquired_at: now,
                    },
                )?;
            self.store.commit(txn).await?;
            debug!(lock = %self.key, owner = %self.owner, "Lock acquired");
            Ok(true)
        })
        .await
    }

    /// Restart the lease of a lock this owner holds.
    ///
    /// Returns false if the lock is gone or another owner has taken it over;
    /// the caller no longer holds it and must stop acting under it.
    pub async fn renew(&self) -> Result<bool, StoreError> {
        retry_on_conflict(|| async {
            let Some(current) = load::<LockRecord>(self.store.as_ref(), &self.key).await? else {
                warn!(lock = %self.key, "Lock vanished while held");
                return Ok(false);
            };
            if current.value.owner != self.owner {
                warn!(lock = %self.key, holder = %current.value.owner, "Lock taken over");
                return Ok(false);
            }

            let mut txn = Transaction::new();
            txn.expect_version(&self.key, current.version).put(
                &self.key,
                &LockRecord {
                    owner: self.owner,
                    acquired_at: Utc::now(),
                },
            )?;
            self.store.commit(txn).await?;
            debug!(lock = %self.key, owner = %self.owner, "Lock lease renewed");
            Ok(true)
        })
        .await
    }

    /// Release the lock if this owner still holds it.
    pub async fn release(&self) -> Result<(), StoreError> {
        retry_on_conflict(|| async {
            let Some(current) = load::<LockRecord>(self.store.as_ref(), &self.key).await? else {
                return Ok(());
            };
            if current.value.owner != self.owner {
                warn!(lock = %self.key, holder = %current.value.owner, "Lock no longer held");
                return Ok(());
            }

            let mut txn = Transaction::new();
            txn.expect_version(&self.key, current.version).delete(&self.key);
            self.store.commit(txn).await?;
            debug!(lock = %self.key, owner = %self.owner, "Lock released");
            Ok(())
        })
        .await
    }
}
