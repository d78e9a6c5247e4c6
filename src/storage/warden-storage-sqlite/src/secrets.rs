//! Secrets repository: metadata rows plus immutable encrypted versions.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use warden_storage::records::{SecretRecord, SecretType, SecretVersionRecord};
use warden_storage::StorageError;

use crate::{from_ts, from_ts_opt, map_sqlx_err, names_from_json, names_to_json, SqliteBackend};

fn secret_from_row(row: &SqliteRow) -> Result<SecretRecord, StorageError> {
    let secret_type: String = row.try_get("secret_type").map_err(map_sqlx_err)?;
    let policies: String = row.try_get("policies").map_err(map_sqlx_err)?;
    let deleted_at: Option<i64> = row.try_get("deleted_at").map_err(map_sqlx_err)?;
    let created_at: i64 = row.try_get("created_at").map_err(map_sqlx_err)?;
    let updated_at: i64 = row.try_get("updated_at").map_err(map_sqlx_err)?;

    Ok(SecretRecord {
        path: row.try_get("path").map_err(map_sqlx_err)?,
        secret_type: SecretType::parse(&secret_type)
            .ok_or_else(|| StorageError::Serialization(format!("bad secret_type: {secret_type}")))?,
        current_version: row.try_get("current_version").map_err(map_sqlx_err)?,
        policies: names_from_json(&policies)?,
        deleted_at: from_ts_opt(deleted_at)?,
        created_at: from_ts(created_at)?,
        updated_at: from_ts(updated_at)?,
    })
}

fn version_from_row(row: &SqliteRow) -> Result<SecretVersionRecord, StorageError> {
    let created_at: i64 = row.try_get("created_at").map_err(map_sqlx_err)?;

    Ok(SecretVersionRecord {
        path: row.try_get("path").map_err(map_sqlx_err)?,
        version: row.try_get("version").map_err(map_sqlx_err)?,
        ciphertext: row.try_get("ciphertext").map_err(map_sqlx_err)?,
        created_at: from_ts(created_at)?,
    })
}

impl SqliteBackend {
    /// Fetches secret metadata.
    pub async fn get_secret(&self, path: &str) -> Result<Option<SecretRecord>, StorageError> {
        let row = sqlx::query("SELECT * FROM secrets WHERE path = ?")
            .bind(path)
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_err)?;

        row.as_ref().map(secret_from_row).transpose()
    }

    /// Writes a new encrypted version in one transaction: creates the
    /// metadata row if absent, bumps `current_version` to `max + 1`, clears
    /// any tombstone, and inserts the immutable version row. Returns the
    /// version written.
    pub async fn write_secret_version(
        &self,
        path: &str,
        secret_type: SecretType,
        ciphertext: &[u8],
        now: DateTime<Utc>,
    ) -> Result<i64, StorageError> {
        let mut tx = self.pool().begin().await.map_err(map_sqlx_err)?;

        let existing: Option<(i64,)> =
            sqlx::query_as("SELECT current_version FROM secrets WHERE path = ?")
                .bind(path)
                .fetch_optional(&mut *tx)
                .await
                .map_err(map_sqlx_err)?;

        let version = match existing {
            Some((current,)) => {
                let version = current + 1;
                sqlx::query(
                    "UPDATE secrets SET current_version = ?, deleted_at = NULL, updated_at = ? \
                     WHERE path = ?",
                )
                .bind(version)
                .bind(now.timestamp())
                .bind(path)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_err)?;
                version
            }
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO secrets
                        (path, secret_type, current_version, policies, deleted_at, created_at, updated_at)
                    VALUES (?, ?, 1, ?, NULL, ?, ?)
                    "#,
                )
                .bind(path)
                .bind(secret_type.as_str())
                .bind(names_to_json(&[])?)
                .bind(now.timestamp())
                .bind(now.timestamp())
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_err)?;
                1
            }
        };

        sqlx::query(
            "INSERT INTO secret_versions (path, version, ciphertext, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(path)
        .bind(version)
        .bind(ciphertext)
        .bind(now.timestamp())
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_err)?;

        tx.commit().await.map_err(map_sqlx_err)?;

        Ok(version)
    }

    /// Fetches one encrypted version.
    pub async fn get_secret_version(
        &self,
        path: &str,
        version: i64,
    ) -> Result<Option<SecretVersionRecord>, StorageError> {
        let row = sqlx::query("SELECT * FROM secret_versions WHERE path = ? AND version = ?")
            .bind(path)
            .bind(version)
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_err)?;

        row.as_ref().map(version_from_row).transpose()
    }

    /// Lists the versions stored at a path (payloads included), oldest first.
    pub async fn list_secret_versions(
        &self,
        path: &str,
    ) -> Result<Vec<SecretVersionRecord>, StorageError> {
        let rows = sqlx::query("SELECT * FROM secret_versions WHERE path = ? ORDER BY version")
            .bind(path)
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_err)?;

        rows.iter().map(version_from_row).collect()
    }

    /// Lists secret paths with a prefix, excluding tombstoned entries.
    pub async fn list_secret_paths(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let pattern = format!("{prefix}%");

        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT path FROM secrets WHERE path LIKE ? AND deleted_at IS NULL ORDER BY path",
        )
        .bind(&pattern)
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_err)?;

        Ok(rows.into_iter().map(|(p,)| p).collect())
    }

    /// Replaces the policy bindings on a secret.
    pub async fn set_secret_policies(
        &self,
        path: &str,
        policies: &[String],
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let result = sqlx::query("UPDATE secrets SET policies = ?, updated_at = ? WHERE path = ?")
            .bind(names_to_json(policies)?)
            .bind(now.timestamp())
            .bind(path)
            .execute(self.pool())
            .await
            .map_err(map_sqlx_err)?;

        Ok(result.rows_affected() > 0)
    }

    /// Tombstones a secret. Returns whether a live row was updated.
    pub async fn tombstone_secret(
        &self,
        path: &str,
        deleted_at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let result = sqlx::query(
            "UPDATE secrets SET deleted_at = ?, updated_at = ? WHERE path = ? AND deleted_at IS NULL",
        )
        .bind(deleted_at.timestamp())
        .bind(deleted_at.timestamp())
        .bind(path)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_err)?;

        Ok(result.rows_affected() > 0)
    }

    /// Purges tombstoned secrets whose retention window ended before
    /// `cutoff`: removes the metadata row and every version. Returns the
    /// number of secrets purged.
    pub async fn purge_deleted_secrets(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError> {
        let mut tx = self.pool().begin().await.map_err(map_sqlx_err)?;

        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT path FROM secrets WHERE deleted_at IS NOT NULL AND deleted_at < ?")
                .bind(cutoff.timestamp())
                .fetch_all(&mut *tx)
                .await
                .map_err(map_sqlx_err)?;

        for (path,) in &rows {
            sqlx::query("DELETE FROM secret_versions WHERE path = ?")
                .bind(path)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_err)?;
            sqlx::query("DELETE FROM secrets WHERE path = ?")
                .bind(path)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_err)?;
        }

        tx.commit().await.map_err(map_sqlx_err)?;

        Ok(rows.len() as u64)
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

    #[tokio::test]
    async fn test_versions_increment() {
        let (_tmp, backend) = setup().await;
        let now = Utc::now();

        let v1 = backend
            .write_secret_version("db/prod", SecretType::Static, b"ct-1", now)
            .await
            .unwrap();
        let v2 = backend
            .write_secret_version("db/prod", SecretType::Static, b"ct-2", now)
            .await
            .unwrap();

        assert_eq!((v1, v2), (1, 2));

        let meta = backend.get_secret("db/prod").await.unwrap().unwrap();
        assert_eq!(meta.current_version, 2);

        let version = backend
            .get_secret_version("db/prod", 1)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(version.ciphertext, b"ct-1");

        let versions = backend.list_secret_versions("db/prod").await.unwrap();
        assert_eq!(versions.len(), 2);
    }

    #[tokio::test]
    async fn test_tombstone_hides_from_listing() {
        let (_tmp, backend) = setup().await;
        let now = Utc::now();

        backend
            .write_secret_version("db/prod", SecretType::Static, b"ct", now)
            .await
            .unwrap();
        backend
            .write_secret_version("db/dev", SecretType::Static, b"ct", now)
            .await
            .unwrap();

        assert!(backend.tombstone_secret("db/prod", now).await.unwrap());
        assert!(!backend.tombstone_secret("db/prod", now).await.unwrap());

        let paths = backend.list_secret_paths("db/").await.unwrap();
        assert_eq!(paths, vec!["db/dev"]);

        // Versions stay retrievable for the retention window.
        assert!(backend
            .get_secret_version("db/prod", 1)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_write_after_tombstone_revives() {
        let (_tmp, backend) = setup().await;
        let now = Utc::now();

        backend
            .write_secret_version("app/key", SecretType::Static, b"v1", now)
            .await
            .unwrap();
        backend.tombstone_secret("app/key", now).await.unwrap();

        let v2 = backend
            .write_secret_version("app/key", SecretType::Static, b"v2", now)
            .await
            .unwrap();
        assert_eq!(v2, 2);

        let meta = backend.get_secret("app/key").await.unwrap().unwrap();
        assert!(meta.deleted_at.is_none());
    }

    #[tokio::test]
    async fn test_purge_after_retention() {
        let (_tmp, backend) = setup().await;
        let now = Utc::now();

        backend
            .write_secret_version("old/secret", SecretType::Static, b"ct", now)
            .await
            .unwrap();
        backend
            .tombstone_secret("old/secret", now - Duration::days(120))
            .await
            .unwrap();

        let purged = backend
            .purge_deleted_secrets(now - Duration::days(90))
            .await
            .unwrap();
        assert_eq!(purged, 1);

        assert!(backend.get_secret("old/secret").await.unwrap().is_none());
        assert!(backend
            .get_secret_version("old/secret", 1)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_set_policies() {
        let (_tmp, backend) = setup().await;
        let now = Utc::now();

        backend
            .write_secret_version("db/prod", SecretType::Static, b"ct", now)
            .await
            .unwrap();
        backend
            .set_secret_policies("db/prod", &["db-read".to_string()], now)
            .await
            .unwrap();

        let meta = backend.get_secret("db/prod").await.unwrap().unwrap();
        assert_eq!(meta.policies, vec!["db-read"]);
    }
}
