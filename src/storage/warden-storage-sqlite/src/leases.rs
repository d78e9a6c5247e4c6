//! Lease repository.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use warden_storage::records::LeaseRecord;
use warden_storage::StorageError;

use crate::certificates::parse_uuid;
use crate::{from_ts, from_ts_opt, map_sqlx_err, SqliteBackend};

fn lease_from_row(row: &SqliteRow) -> Result<LeaseRecord, StorageError> {
    let lease_id: String = row.try_get("lease_id").map_err(map_sqlx_err)?;
    let issued_at: i64 = row.try_get("issued_at").map_err(map_sqlx_err)?;
    let expires_at: i64 = row.try_get("expires_at").map_err(map_sqlx_err)?;
    let revoked_at: Option<i64> = row.try_get("revoked_at").map_err(map_sqlx_err)?;

    Ok(LeaseRecord {
        lease_id: parse_uuid(&lease_id)?,
        entity_id: row.try_get("entity_id").map_err(map_sqlx_err)?,
        backend_kind: row.try_get("backend_kind").map_err(map_sqlx_err)?,
        backend_handle: row.try_get("backend_handle").map_err(map_sqlx_err)?,
        path: row.try_get("path").map_err(map_sqlx_err)?,
        issued_at: from_ts(issued_at)?,
        expires_at: from_ts(expires_at)?,
        max_ttl_seconds: row.try_get("max_ttl_seconds").map_err(map_sqlx_err)?,
        revoking: row.try_get::<i64, _>("revoking").map_err(map_sqlx_err)? != 0,
        revoked: row.try_get::<i64, _>("revoked").map_err(map_sqlx_err)? != 0,
        revoked_at: from_ts_opt(revoked_at)?,
    })
}

impl SqliteBackend {
    /// Inserts a new lease record.
    pub async fn insert_lease(&self, record: &LeaseRecord) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO leases
                (lease_id, entity_id, backend_kind, backend_handle, path, issued_at,
                 expires_at, max_ttl_seconds, revoking, revoked, revoked_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.lease_id.to_string())
        .bind(&record.entity_id)
        .bind(&record.backend_kind)
        .bind(&record.backend_handle)
        .bind(&record.path)
        .bind(record.issued_at.timestamp())
        .bind(record.expires_at.timestamp())
        .bind(record.max_ttl_seconds)
        .bind(i64::from(record.revoking))
        .bind(i64::from(record.revoked))
        .bind(record.revoked_at.map(|t| t.timestamp()))
        .execute(self.pool())
        .await
        .map_err(map_sqlx_err)?;

        Ok(())
    }

    /// Fetches a lease by id.
    pub async fn get_lease(&self, lease_id: Uuid) -> Result<Option<LeaseRecord>, StorageError> {
        let row = sqlx::query("SELECT * FROM leases WHERE lease_id = ?")
            .bind(lease_id.to_string())
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_err)?;

        row.as_ref().map(lease_from_row).transpose()
    }

    /// Moves a lease's expiry. The guard clauses keep the update inside the
    /// renewal window so a raced revocation cannot be resurrected.
    pub async fn update_lease_expiry(
        &self,
        lease_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "UPDATE leases SET expires_at = ? WHERE lease_id = ? AND revoked = 0 AND revoking = 0",
        )
        .bind(expires_at.timestamp())
        .bind(lease_id.to_string())
        .execute(self.pool())
        .await
        .map_err(map_sqlx_err)?;

        Ok(result.rows_affected() > 0)
    }

    /// Claims a lease for revocation. Exactly one caller wins the claim;
    /// everyone else sees `false` and skips the lease.
    pub async fn claim_lease_for_revocation(&self, lease_id: Uuid) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "UPDATE leases SET revoking = 1 WHERE lease_id = ? AND revoked = 0 AND revoking = 0",
        )
        .bind(lease_id.to_string())
        .execute(self.pool())
        .await
        .map_err(map_sqlx_err)?;

        Ok(result.rows_affected() > 0)
    }

    /// Releases a revocation claim without revoking (backend retry gave up
    /// transiently and the sweeper will pick the lease up again).
    pub async fn release_lease_claim(&self, lease_id: Uuid) -> Result<(), StorageError> {
        sqlx::query("UPDATE leases SET revoking = 0 WHERE lease_id = ? AND revoked = 0")
            .bind(lease_id.to_string())
            .execute(self.pool())
            .await
            .map_err(map_sqlx_err)?;

        Ok(())
    }

    /// Lists unrevoked, unclaimed leases due at or before `now`.
    pub async fn due_leases(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<LeaseRecord>, StorageError> {
        let rows = sqlx::query(
            "SELECT * FROM leases WHERE expires_at <= ? AND revoked = 0 AND revoking = 0 \
             ORDER BY expires_at LIMIT ?",
        )
        .bind(now.timestamp())
        .bind(limit)
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_err)?;

        rows.iter().map(lease_from_row).collect()
    }

    /// Lists leases, optionally for one entity, newest first.
    pub async fn list_leases(
        &self,
        entity_id: Option<&str>,
    ) -> Result<Vec<LeaseRecord>, StorageError> {
        let rows = match entity_id {
            Some(entity) => {
                sqlx::query("SELECT * FROM leases WHERE entity_id = ? ORDER BY issued_at DESC")
                    .bind(entity)
                    .fetch_all(self.pool())
                    .await
            }
            None => {
                sqlx::query("SELECT * FROM leases ORDER BY issued_at DESC")
                    .fetch_all(self.pool())
                    .await
            }
        }
        .map_err(map_sqlx_err)?;

        rows.iter().map(lease_from_row).collect()
    }

    /// Counts `(active, revoked)` leases as of `now`.
    pub async fn lease_stats(&self, now: DateTime<Utc>) -> Result<(i64, i64), StorageError> {
        let active: (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM leases WHERE revoked = 0 AND expires_at > ?")
                .bind(now.timestamp())
                .fetch_one(self.pool())
                .await
                .map_err(map_sqlx_err)?;

        let revoked: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM leases WHERE revoked = 1")
            .fetch_one(self.pool())
            .await
            .map_err(map_sqlx_err)?;

        Ok((active.0, revoked.0))
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, SqliteBackend) {
        let tmp = TempDir::new().unwrap();
        let backend = SqliteBackend::open(tmp.path()).await.unwrap();
        (tmp, backend)
    }

    fn sample(expires_in: Duration) -> LeaseRecord {
        let now = Utc::now();
        LeaseRecord {
            lease_id: Uuid::new_v4(),
            entity_id: "role:db-agent".to_string(),
            backend_kind: "ephemeral".to_string(),
            backend_handle: "cred-1".to_string(),
            path: "dynamic/db-ro".to_string(),
            issued_at: now,
            expires_at: now + expires_in,
            max_ttl_seconds: 3600,
            revoking: false,
            revoked: false,
            revoked_at: None,
        }
    }

    #[tokio::test]
    async fn test_lease_roundtrip() {
        let (_tmp, backend) = setup().await;

        let lease = sample(Duration::seconds(60));
        backend.insert_lease(&lease).await.unwrap();

        let loaded = backend.get_lease(lease.lease_id).await.unwrap().unwrap();
        assert_eq!(loaded.backend_handle, "cred-1");
        assert!(!loaded.revoked);
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let (_tmp, backend) = setup().await;

        let lease = sample(Duration::seconds(-5));
        backend.insert_lease(&lease).await.unwrap();

        assert!(backend
            .claim_lease_for_revocation(lease.lease_id)
            .await
            .unwrap());
        assert!(!backend
            .claim_lease_for_revocation(lease.lease_id)
            .await
            .unwrap());

        backend.release_lease_claim(lease.lease_id).await.unwrap();
        assert!(backend
            .claim_lease_for_revocation(lease.lease_id)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_due_leases_excludes_claimed() {
        let (_tmp, backend) = setup().await;

        let due = sample(Duration::seconds(-5));
        let live = sample(Duration::seconds(300));
        backend.insert_lease(&due).await.unwrap();
        backend.insert_lease(&live).await.unwrap();

        let found = backend.due_leases(Utc::now(), 10).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].lease_id, due.lease_id);

        backend
            .claim_lease_for_revocation(due.lease_id)
            .await
            .unwrap();
        let found = backend.due_leases(Utc::now(), 10).await.unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn test_renew_guard_blocks_revoked() {
        let (_tmp, backend) = setup().await;

        let lease = sample(Duration::seconds(60));
        backend.insert_lease(&lease).await.unwrap();

        backend
            .claim_lease_for_revocation(lease.lease_id)
            .await
            .unwrap();

        let renewed = backend
            .update_lease_expiry(lease.lease_id, Utc::now() + Duration::seconds(120))
            .await
            .unwrap();
        assert!(!renewed, "claimed lease must not be renewable");
    }

    #[tokio::test]
    async fn test_stats() {
        let (_tmp, backend) = setup().await;

        backend.insert_lease(&sample(Duration::seconds(60))).await.unwrap();
        let dead = sample(Duration::seconds(60));
        backend.insert_lease(&dead).await.unwrap();

        backend
            .insert_audit_entry(
                &warden_storage::records::AuditEntryRecord {
                    sequence: 1,
                    timestamp: 0,
                    event_kind: "lease.revoke".into(),
                    actor_type: "system".into(),
                    actor_id: "sweeper".into(),
                    target: dead.lease_id.to_string(),
                    outcome: "success".into(),
                    metadata_json: "{}".into(),
                    previous_hash: "GENESIS".into(),
                    current_hash: "h1".into(),
                    signature: "s1".into(),
                },
                &crate::CoupledWrite::MarkLeaseRevoked {
                    lease_id: dead.lease_id,
                    revoked_at: Utc::now(),
                },
            )
            .await
            .unwrap();

        let (active, revoked) = backend.lease_stats(Utc::now()).await.unwrap();
        assert_eq!((active, revoked), (1, 1));
    }
}
