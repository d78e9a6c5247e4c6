//! Audit entry repository.
//!
//! The `sequence` column is the table's integer primary key, which gives
//! the gapless chain its unique constraint: two appenders computing the
//! same next sequence race, one wins, the other sees `Conflict` and
//! retries against the new tail.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use warden_storage::records::AuditEntryRecord;
use warden_storage::StorageError;

use crate::{map_sqlx_err, SqliteBackend};

/// A state mutation committed in the same transaction as an audit entry.
///
/// Operations that must never land without their audit record go through
/// this enum rather than a separate write, so a sequence conflict rolls
/// back both.
#[derive(Debug, Clone)]
pub enum CoupledWrite {
    /// Audit-only append.
    None,
    /// Mark a certificate revoked.
    RevokeCertificate {
        /// Certificate record id.
        id: Uuid,
        /// Revocation instant.
        revoked_at: DateTime<Utc>,
        /// Operator-supplied reason.
        reason: String,
    },
    /// Mark a lease revoked (clears the `revoking` claim).
    MarkLeaseRevoked {
        /// Lease id.
        lease_id: Uuid,
        /// Revocation instant.
        revoked_at: DateTime<Utc>,
    },
    /// Tombstone a secret.
    TombstoneSecret {
        /// Secret path.
        path: String,
        /// Tombstone instant.
        deleted_at: DateTime<Utc>,
    },
}

/// Read-only filter for audit export and search.
#[derive(Debug, Clone, Default)]
pub struct AuditSearchFilter {
    /// Earliest timestamp, inclusive (Unix seconds).
    pub from_time: Option<i64>,
    /// Latest timestamp, inclusive (Unix seconds).
    pub to_time: Option<i64>,
    /// Exact actor id.
    pub actor_id: Option<String>,
    /// Exact event kind.
    pub event_kind: Option<String>,
    /// Maximum rows returned.
    pub limit: Option<i64>,
}

fn entry_from_row(row: &SqliteRow) -> Result<AuditEntryRecord, StorageError> {
    Ok(AuditEntryRecord {
        sequence: row.try_get("sequence").map_err(map_sqlx_err)?,
        timestamp: row.try_get("timestamp").map_err(map_sqlx_err)?,
        event_kind: row.try_get("event_kind").map_err(map_sqlx_err)?,
        actor_type: row.try_get("actor_type").map_err(map_sqlx_err)?,
        actor_id: row.try_get("actor_id").map_err(map_sqlx_err)?,
        target: row.try_get("target").map_err(map_sqlx_err)?,
        outcome: row.try_get("outcome").map_err(map_sqlx_err)?,
        metadata_json: row.try_get("metadata_json").map_err(map_sqlx_err)?,
        previous_hash: row.try_get("previous_hash").map_err(map_sqlx_err)?,
        current_hash: row.try_get("current_hash").map_err(map_sqlx_err)?,
        signature: row.try_get("signature").map_err(map_sqlx_err)?,
    })
}

impl SqliteBackend {
    /// Returns the chain tail: `(sequence, current_hash)` of the newest
    /// entry, or `None` for an empty chain.
    pub async fn audit_tail(&self) -> Result<Option<(i64, String)>, StorageError> {
        let row: Option<(i64, String)> = sqlx::query_as(
            "SELECT sequence, current_hash FROM audit_entries ORDER BY sequence DESC LIMIT 1",
        )
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_err)?;

        Ok(row)
    }

    /// Appends an audit entry, committing `coupled` in the same
    /// transaction. A sequence collision rolls everything back and
    /// surfaces as `Conflict`.
    pub async fn insert_audit_entry(
        &self,
        entry: &AuditEntryRecord,
        coupled: &CoupledWrite,
    ) -> Result<(), StorageError> {
        let mut tx = self.pool().begin().await.map_err(map_sqlx_err)?;

        sqlx::query(
            r#"
            INSERT INTO audit_entries
                (sequence, timestamp, event_kind, actor_type, actor_id, target, outcome,
                 metadata_json, previous_hash, current_hash, signature)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(entry.sequence)
        .bind(entry.timestamp)
        .bind(&entry.event_kind)
        .bind(&entry.actor_type)
        .bind(&entry.actor_id)
        .bind(&entry.target)
        .bind(&entry.outcome)
        .bind(&entry.metadata_json)
        .bind(&entry.previous_hash)
        .bind(&entry.current_hash)
        .bind(&entry.signature)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        match coupled {
            CoupledWrite::None => {}
            CoupledWrite::RevokeCertificate {
                id,
                revoked_at,
                reason,
            } => {
                let result = sqlx::query(
                    "UPDATE certificates SET revoked = 1, revoked_at = ?, revocation_reason = ? \
                     WHERE id = ? AND revoked = 0",
                )
                .bind(revoked_at.timestamp())
                .bind(reason)
                .bind(id.to_string())
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_err)?;

                if result.rows_affected() == 0 {
                    return Err(StorageError::NotFound(format!(
                        "certificate {id} missing or already revoked"
                    )));
                }
            }
            CoupledWrite::MarkLeaseRevoked {
                lease_id,
                revoked_at,
            } => {
                let result = sqlx::query(
                    "UPDATE leases SET revoked = 1, revoking = 0, revoked_at = ? \
                     WHERE lease_id = ? AND revoked = 0",
                )
                .bind(revoked_at.timestamp())
                .bind(lease_id.to_string())
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_err)?;

                if result.rows_affected() == 0 {
                    return Err(StorageError::NotFound(format!(
                        "lease {lease_id} missing or already revoked"
                    )));
                }
            }
            CoupledWrite::TombstoneSecret { path, deleted_at } => {
                let result = sqlx::query(
                    "UPDATE secrets SET deleted_at = ?, updated_at = ? \
                     WHERE path = ? AND deleted_at IS NULL",
                )
                .bind(deleted_at.timestamp())
                .bind(deleted_at.timestamp())
                .bind(path)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_err)?;

                if result.rows_affected() == 0 {
                    return Err(StorageError::NotFound(format!(
                        "secret {path} missing or already deleted"
                    )));
                }
            }
        }

        tx.commit().await.map_err(map_sqlx_err)?;

        Ok(())
    }

    /// Streams entries in sequence order, starting after `after_sequence`.
    pub async fn list_audit_entries(
        &self,
        after_sequence: i64,
        limit: i64,
    ) -> Result<Vec<AuditEntryRecord>, StorageError> {
        let rows = sqlx::query(
            "SELECT * FROM audit_entries WHERE sequence > ? ORDER BY sequence LIMIT ?",
        )
        .bind(after_sequence)
        .bind(limit)
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_err)?;

        rows.iter().map(entry_from_row).collect()
    }

    /// Read-only filtered search over the chain, oldest first.
    pub async fn search_audit_entries(
        &self,
        filter: &AuditSearchFilter,
    ) -> Result<Vec<AuditEntryRecord>, StorageError> {
        let mut sql = String::from("SELECT * FROM audit_entries WHERE 1=1");
        if filter.from_time.is_some() {
            sql.push_str(" AND timestamp >= ?");
        }
        if filter.to_time.is_some() {
            sql.push_str(" AND timestamp <= ?");
        }
        if filter.actor_id.is_some() {
            sql.push_str(" AND actor_id = ?");
        }
        if filter.event_kind.is_some() {
            sql.push_str(" AND event_kind = ?");
        }
        sql.push_str(" ORDER BY sequence LIMIT ?");

        let mut query = sqlx::query(&sql);
        if let Some(t) = filter.from_time {
            query = query.bind(t);
        }
        if let Some(t) = filter.to_time {
            query = query.bind(t);
        }
        if let Some(actor) = &filter.actor_id {
            query = query.bind(actor);
        }
        if let Some(kind) = &filter.event_kind {
            query = query.bind(kind);
        }
        query = query.bind(filter.limit.unwrap_or(1000));

        let rows = query
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_err)?;

        rows.iter().map(entry_from_row).collect()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, SqliteBackend) {
        let tmp = TempDir::new().unwrap();
        let backend = SqliteBackend::open(tmp.path()).await.unwrap();
        (tmp, backend)
    }

    fn entry(sequence: i64, previous_hash: &str) -> AuditEntryRecord {
        AuditEntryRecord {
            sequence,
            timestamp: 1_700_000_000 + sequence,
            event_kind: "secret.read".to_string(),
            actor_type: "agent".to_string(),
            actor_id: "agent-1".to_string(),
            target: "db/prod".to_string(),
            outcome: "success".to_string(),
            metadata_json: "{}".to_string(),
            previous_hash: previous_hash.to_string(),
            current_hash: format!("hash-{sequence}"),
            signature: format!("sig-{sequence}"),
        }
    }

    #[tokio::test]
    async fn test_tail_and_append() {
        let (_tmp, backend) = setup().await;

        assert!(backend.audit_tail().await.unwrap().is_none());

        backend
            .insert_audit_entry(&entry(1, "GENESIS"), &CoupledWrite::None)
            .await
            .unwrap();
        backend
            .insert_audit_entry(&entry(2, "hash-1"), &CoupledWrite::None)
            .await
            .unwrap();

        let tail = backend.audit_tail().await.unwrap().unwrap();
        assert_eq!(tail, (2, "hash-2".to_string()));
    }

    #[tokio::test]
    async fn test_sequence_collision_conflicts() {
        let (_tmp, backend) = setup().await;

        backend
            .insert_audit_entry(&entry(1, "GENESIS"), &CoupledWrite::None)
            .await
            .unwrap();

        let result = backend
            .insert_audit_entry(&entry(1, "GENESIS"), &CoupledWrite::None)
            .await;
        assert!(matches!(result, Err(StorageError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_coupled_tombstone_rolls_back_on_conflict() {
        let (_tmp, backend) = setup().await;
        let now = Utc::now();

        backend
            .write_secret_version(
                "db/prod",
                warden_storage::records::SecretType::Static,
                b"ct",
                now,
            )
            .await
            .unwrap();

        backend
            .insert_audit_entry(&entry(1, "GENESIS"), &CoupledWrite::None)
            .await
            .unwrap();

        // Colliding sequence: the tombstone must not be applied.
        let result = backend
            .insert_audit_entry(
                &entry(1, "GENESIS"),
                &CoupledWrite::TombstoneSecret {
                    path: "db/prod".to_string(),
                    deleted_at: now,
                },
            )
            .await;
        assert!(matches!(result, Err(StorageError::Conflict(_))));

        let meta = backend.get_secret("db/prod").await.unwrap().unwrap();
        assert!(meta.deleted_at.is_none());

        // With a fresh sequence the coupled write lands.
        backend
            .insert_audit_entry(
                &entry(2, "hash-1"),
                &CoupledWrite::TombstoneSecret {
                    path: "db/prod".to_string(),
                    deleted_at: now,
                },
            )
            .await
            .unwrap();

        let meta = backend.get_secret("db/prod").await.unwrap().unwrap();
        assert!(meta.deleted_at.is_some());
    }

    #[tokio::test]
    async fn test_search_filters() {
        let (_tmp, backend) = setup().await;

        backend
            .insert_audit_entry(&entry(1, "GENESIS"), &CoupledWrite::None)
            .await
            .unwrap();
        let mut e2 = entry(2, "hash-1");
        e2.event_kind = "auth.login".to_string();
        e2.actor_id = "agent-2".to_string();
        backend
            .insert_audit_entry(&e2, &CoupledWrite::None)
            .await
            .unwrap();

        let filter = AuditSearchFilter {
            event_kind: Some("auth.login".to_string()),
            ..Default::default()
        };
        let found = backend.search_audit_entries(&filter).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].sequence, 2);

        let filter = AuditSearchFilter {
            actor_id: Some("agent-1".to_string()),
            ..Default::default()
        };
        let found = backend.search_audit_entries(&filter).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].sequence, 1);
    }

    #[tokio::test]
    async fn test_list_pages_in_order() {
        let (_tmp, backend) = setup().await;

        backend
            .insert_audit_entry(&entry(1, "GENESIS"), &CoupledWrite::None)
            .await
            .unwrap();
        backend
            .insert_audit_entry(&entry(2, "hash-1"), &CoupledWrite::None)
            .await
            .unwrap();
        backend
            .insert_audit_entry(&entry(3, "hash-2"), &CoupledWrite::None)
            .await
            .unwrap();

        let page = backend.list_audit_entries(0, 2).await.unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].sequence, 1);

        let page = backend.list_audit_entries(2, 2).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].sequence, 3);
    }
}
