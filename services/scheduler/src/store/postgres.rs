//! Postgres store backend.
//!
//! Records live in `kv_records`, set membership in `kv_set_members`, and every
//! commit draws one version from `kv_version_seq`. See
//! `migrations/0001_kv_store.sql`.

use std::collections::HashSet;

use async_trait::async_trait;
use sqlx::{postgres::PgRow, PgPool, Postgres, Row};
use tracing::debug;

use super::{KeyValueStore, Mutation, Precondition, StoreError, Transaction, Versioned};

/// Postgres unique-violation SQLSTATE.
const UNIQUE_VIOLATION: &str = "23505";

/// Store backend over a shared Postgres database.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn versioned(row: &PgRow) -> Result<Versioned<serde_json::Value>, sqlx::Error> {
    Ok(Versioned {
        value: row.try_get("value")?,
        version: row.try_get("version")?,
    })
}

async fn check_precondition(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    precondition: &Precondition,
) -> Result<bool, StoreError> {
    // Row locks make concurrent writers of the same key serialize here; the
    // loser re-reads the committed version and fails the check.
    let current: Option<i64> =
        sqlx::query_scalar("SELECT version FROM kv_records WHERE key = $1 FOR UPDATE")
            .bind(precondition.key())
            .fetch_optional(&mut **tx)
            .await?;

    Ok(match precondition {
        Precondition::Version { version, .. } => current == Some(*version),
        Precondition::Absent { .. } => current.is_none(),
    })
}

fn conflict_on_unique_violation(key: &str, e: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(ref db_err) = e {
        if db_err.code().as_deref() == Some(UNIQUE_VIOLATION) {
            return StoreError::Conflict {
                key: key.to_string(),
            };
        }
    }
    StoreError::Database(e)
}

#[async_trait]
impl KeyValueStore for PgStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned<serde_json::Value>>, StoreError> {
        let row = sqlx::query("SELECT value, version FROM kv_records WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.as_ref().map(versioned).transpose()?)
    }

    async fn get_many(
        &self,
        keys: &[String],
    ) -> Result<Vec<Option<Versioned<serde_json::Value>>>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        // One statement, one snapshot.
        let rows = sqlx::query("SELECT key, value, version FROM kv_records WHERE key = ANY($1)")
            .bind(keys)
            .fetch_all(&self.pool)
            .await?;

        let mut found = std::collections::HashMap::with_capacity(rows.len());
        for row in &rows {
            let key: String = row.try_get("key")?;
            found.insert(key, versioned(row)?);
        }

        Ok(keys.iter().map(|k| found.remove(k)).collect())
    }

    async fn set_members(&self, set: &str) -> Result<Vec<String>, StoreError> {
        let members = sqlx::query_scalar(
            "SELECT member FROM kv_set_members WHERE set_name = $1 ORDER BY position",
        )
        .bind(set)
        .fetch_all(&self.pool)
        .await?;

        Ok(members)
    }

    async fn commit(&self, txn: Transaction) -> Result<i64, StoreError> {
        let mut tx = self.pool.begin().await?;

        for precondition in txn.preconditions() {
            if !check_precondition(&mut tx, precondition).await? {
                tx.rollback().await?;
                debug!(key = %precondition.key(), "Precondition failed");
                return Err(StoreError::Conflict {
                    key: precondition.key().to_string(),
                });
            }
        }

        let version: i64 = sqlx::query_scalar("SELECT nextval('kv_version_seq')")
            .fetch_one(&mut *tx)
            .await?;

        // Keys that must not exist are inserted without an upsert so that two
        // writers racing past the absence check cannot both win.
        let must_be_new: HashSet<&str> = txn
            .preconditions()
            .iter()
            .filter_map(|p| match p {
                Precondition::Absent { key } => Some(key.as_str()),
                Precondition::Version { .. } => None,
            })
            .collect();

        for mutation in txn.mutations() {
            match mutation {
                Mutation::Put { key, value } if must_be_new.contains(key.as_str()) => {
                    sqlx::query("INSERT INTO kv_records (key, version, value) VALUES ($1, $2, $3)")
                        .bind(key)
                        .bind(version)
                        .bind(value)
                        .execute(&mut *tx)
                        .await
                        .map_err(|e| conflict_on_unique_violation(key, e))?;
                }
                Mutation::Put { key, value } => {
                    sqlx::query(
                        r#"
                        INSERT INTO kv_records (key, version, value)
                        VALUES ($1, $2, $3)
                        ON CONFLICT (key) DO UPDATE
                            SET version = EXCLUDED.version,
                                value = EXCLUDED.value,
                                updated_at = now()
                        "#,
                    )
                    .bind(key)
                    .bind(version)
                    .bind(value)
                    .execute(&mut *tx)
                    .await?;
                }
                Mutation::Delete { key } => {
                    sqlx::query("DELETE FROM kv_records WHERE key = $1")
                        .bind(key)
                        .execute(&mut *tx)
                        .await?;
                }
                Mutation::SetAdd { set, member } => {
                    sqlx::query(
                        r#"
                        INSERT INTO kv_set_members (set_name, member)
                        VALUES ($1, $2)
                        ON CONFLICT (set_name, member) DO NOTHING
                        "#,
                    )
                    .bind(set)
                    .bind(member)
                    .execute(&mut *tx)
                    .await?;
                }
                Mutation::SetRemove { set, member } => {
                    sqlx::query("DELETE FROM kv_set_members WHERE set_name = $1 AND member = $2")
                        .bind(set)
                        .bind(member)
                        .execute(&mut *tx)
                        .await?;
                }
            }
        }

        tx.commit().await?;
        Ok(version)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
