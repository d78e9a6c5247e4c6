//! # Warden Storage - SQLite Backend
//!
//! SQLite implementation of the storage contracts: generic key/value for
//! seal metadata plus typed repositories for every entity the core owns
//! (certificates, roles, secret ids, session tokens, policies, secrets,
//! audit entries, leases, agent bindings).
//!
//! The audit table enforces uniqueness on `sequence`; concurrent appenders
//! race on it and the collision surfaces as [`StorageError::Conflict`] so
//! the audit layer can re-read the tail and retry.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod agents;
mod approle;
mod audit;
mod certificates;
mod leases;
mod policies;
mod secrets;
mod tokens;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tracing::{debug, info};

use warden_storage::{StorageBackend, StorageError};

pub use audit::{AuditSearchFilter, CoupledWrite};

/// SQLite storage backend.
///
/// One database file per data directory, `warden.db`, created on open.
#[derive(Clone)]
pub struct SqliteBackend {
    pool: SqlitePool,
    #[allow(dead_code)]
    db_path: PathBuf,
}

impl SqliteBackend {
    /// Opens or creates the Warden database under `base_path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created, the database
    /// connection fails, or migrations fail.
    pub async fn open(base_path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let base = base_path.as_ref();
        std::fs::create_dir_all(base).map_err(|e| {
            StorageError::ConnectionFailed(format!("failed to create directory: {e}"))
        })?;

        let db_path = base.join("warden.db");
        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());

        debug!(path = %db_path.display(), "Opening SQLite database");

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        let backend = Self { pool, db_path };

        backend.migrate().await?;

        info!("SQLite backend ready");

        Ok(backend)
    }

    /// Runs database migrations.
    async fn migrate(&self) -> Result<(), StorageError> {
        debug!("Running database migrations");

        self.execute_raw(
            r#"
            CREATE TABLE IF NOT EXISTS kv_store (
                key        TEXT PRIMARY KEY,
                value      BLOB NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS certificates (
                id                    TEXT PRIMARY KEY,
                serial                TEXT NOT NULL UNIQUE,
                cert_type             TEXT NOT NULL,
                certificate_pem       TEXT NOT NULL,
                encrypted_private_key BLOB,
                fingerprint           TEXT NOT NULL UNIQUE,
                subject               TEXT NOT NULL,
                issuer                TEXT NOT NULL,
                issuer_id             TEXT,
                not_before            INTEGER NOT NULL,
                not_after             INTEGER NOT NULL,
                revoked               INTEGER NOT NULL DEFAULT 0,
                revoked_at            INTEGER,
                revocation_reason     TEXT,
                created_at            INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_certificates_type ON certificates (cert_type);

            CREATE TABLE IF NOT EXISTS roles (
                name               TEXT PRIMARY KEY,
                role_id            TEXT NOT NULL UNIQUE,
                policies           TEXT NOT NULL,
                bind_secret_id     INTEGER NOT NULL,
                secret_id_ttl      INTEGER,
                secret_id_num_uses INTEGER,
                token_ttl          INTEGER NOT NULL,
                created_at         INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS secret_ids (
                id             TEXT PRIMARY KEY,
                role_name      TEXT NOT NULL,
                secret_id_hash TEXT NOT NULL,
                uses_remaining INTEGER,
                expires_at     INTEGER,
                revoked        INTEGER NOT NULL DEFAULT 0,
                created_at     INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_secret_ids_role ON secret_ids (role_name);

            CREATE TABLE IF NOT EXISTS session_tokens (
                token_hash             TEXT PRIMARY KEY,
                entity_id              TEXT NOT NULL,
                role_name              TEXT,
                secret_id_ref          TEXT,
                policies               TEXT NOT NULL,
                bound_cert_fingerprint TEXT,
                issued_at              INTEGER NOT NULL,
                expires_at             INTEGER NOT NULL,
                revoked                INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_tokens_entity ON session_tokens (entity_id);

            CREATE TABLE IF NOT EXISTS policies (
                name       TEXT PRIMARY KEY,
                effect     TEXT NOT NULL,
                rules_json TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS secrets (
                path            TEXT PRIMARY KEY,
                secret_type     TEXT NOT NULL,
                current_version INTEGER NOT NULL DEFAULT 0,
                policies        TEXT NOT NULL,
                deleted_at      INTEGER,
                created_at      INTEGER NOT NULL,
                updated_at      INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS secret_versions (
                path       TEXT NOT NULL,
                version    INTEGER NOT NULL,
                ciphertext BLOB NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (path, version)
            );

            CREATE TABLE IF NOT EXISTS audit_entries (
                sequence      INTEGER PRIMARY KEY,
                timestamp     INTEGER NOT NULL,
                event_kind    TEXT NOT NULL,
                actor_type    TEXT NOT NULL,
                actor_id      TEXT NOT NULL,
                target        TEXT NOT NULL,
                outcome       TEXT NOT NULL,
                metadata_json TEXT NOT NULL,
                previous_hash TEXT NOT NULL,
                current_hash  TEXT NOT NULL,
                signature     TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_entries (timestamp);
            CREATE INDEX IF NOT EXISTS idx_audit_actor ON audit_entries (actor_id);

            CREATE TABLE IF NOT EXISTS leases (
                lease_id        TEXT PRIMARY KEY,
                entity_id       TEXT NOT NULL,
                backend_kind    TEXT NOT NULL,
                backend_handle  TEXT NOT NULL,
                path            TEXT NOT NULL,
                issued_at       INTEGER NOT NULL,
                expires_at      INTEGER NOT NULL,
                max_ttl_seconds INTEGER NOT NULL,
                revoking        INTEGER NOT NULL DEFAULT 0,
                revoked         INTEGER NOT NULL DEFAULT 0,
                revoked_at      INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_leases_expires ON leases (expires_at);
            CREATE INDEX IF NOT EXISTS idx_leases_entity ON leases (entity_id);

            CREATE TABLE IF NOT EXISTS agent_bindings (
                agent_id       TEXT PRIMARY KEY,
                role_name      TEXT NOT NULL,
                certificate_id TEXT,
                last_seen      INTEGER,
                status         TEXT NOT NULL,
                created_at     INTEGER NOT NULL
            )
            "#,
        )
        .await?;

        debug!("Migrations complete");

        Ok(())
    }

    /// Returns the underlying connection pool.
    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Returns the current Unix timestamp.
    fn now() -> i64 {
        Utc::now().timestamp()
    }

    /// Executes raw SQL statements (for migrations/schema creation).
    pub async fn execute_raw(&self, sql: &str) -> Result<(), StorageError> {
        for statement in sql.split(';').filter(|s| !s.trim().is_empty()) {
            sqlx::query(statement.trim())
                .execute(&self.pool)
                .await
                .map_err(map_sqlx_err)?;
        }
        Ok(())
    }

    /// Executes a SQL statement with string parameters.
    pub async fn execute(&self, sql: &str, params: &[&str]) -> Result<u64, StorageError> {
        let mut query = sqlx::query(sql);
        for param in params {
            query = query.bind(*param);
        }
        let result = query.execute(&self.pool).await.map_err(map_sqlx_err)?;
        Ok(result.rows_affected())
    }
}

/// Maps sqlx errors onto the storage taxonomy. Unique-constraint
/// violations become [`StorageError::Conflict`].
pub(crate) fn map_sqlx_err(e: sqlx::Error) -> StorageError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StorageError::Conflict(db.to_string())
        }
        _ => StorageError::QueryFailed(e.to_string()),
    }
}

/// Converts a stored Unix timestamp into `DateTime<Utc>`.
pub(crate) fn from_ts(secs: i64) -> Result<DateTime<Utc>, StorageError> {
    DateTime::<Utc>::from_timestamp(secs, 0)
        .ok_or_else(|| StorageError::Serialization(format!("timestamp out of range: {secs}")))
}

/// Converts an optional stored Unix timestamp.
pub(crate) fn from_ts_opt(secs: Option<i64>) -> Result<Option<DateTime<Utc>>, StorageError> {
    secs.map(from_ts).transpose()
}

/// Serializes a string list for a TEXT column.
pub(crate) fn names_to_json(names: &[String]) -> Result<String, StorageError> {
    serde_json::to_string(names).map_err(|e| StorageError::Serialization(e.to_string()))
}

/// Deserializes a string list from a TEXT column.
pub(crate) fn names_from_json(json: &str) -> Result<Vec<String>, StorageError> {
    serde_json::from_str(json).map_err(|e| StorageError::Serialization(e.to_string()))
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let row: Option<(Vec<u8>,)> = sqlx::query_as("SELECT value FROM kv_store WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_err)?;

        Ok(row.map(|(v,)| v))
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let now = Self::now();

        sqlx::query(
            r#"
            INSERT INTO kv_store (key, value, created_at, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_err)?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM kv_store WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_err)?;

        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let pattern = format!("{prefix}%");

        let rows: Vec<(String,)> = sqlx::query_as("SELECT key FROM kv_store WHERE key LIKE ?")
            .bind(&pattern)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_err)?;

        Ok(rows.into_iter().map(|(k,)| k).collect())
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

    #[tokio::test]
    async fn test_open_creates_db() {
        let tmp = TempDir::new().unwrap();
        let _backend = SqliteBackend::open(tmp.path()).await.unwrap();

        let db_path = tmp.path().join("warden.db");
        assert!(db_path.exists(), "database file should be created");
    }

    #[tokio::test]
    async fn test_kv_roundtrip() {
        let (_tmp, backend) = setup().await;

        let result = backend.get("seal/config").await.unwrap();
        assert!(result.is_none());

        backend.put("seal/config", b"state").await.unwrap();
        let result = backend.get("seal/config").await.unwrap();
        assert_eq!(result, Some(b"state".to_vec()));

        backend.put("seal/config", b"updated").await.unwrap();
        let result = backend.get("seal/config").await.unwrap();
        assert_eq!(result, Some(b"updated".to_vec()));

        backend.delete("seal/config").await.unwrap();
        let result = backend.get("seal/config").await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_kv_delete_nonexistent_is_ok() {
        let (_tmp, backend) = setup().await;
        backend.delete("nonexistent").await.unwrap();
    }

    #[tokio::test]
    async fn test_kv_list_prefix() {
        let (_tmp, backend) = setup().await;

        backend.put("seal/threshold", b"3").await.unwrap();
        backend.put("seal/total", b"5").await.unwrap();
        backend.put("other/key", b"x").await.unwrap();

        let mut keys = backend.list("seal/").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["seal/threshold", "seal/total"]);
    }

    #[tokio::test]
    async fn test_kv_binary_data() {
        let (_tmp, backend) = setup().await;

        let binary_data: Vec<u8> = (0..=255).collect();
        backend.put("binary", &binary_data).await.unwrap();

        let result = backend.get("binary").await.unwrap();
        assert_eq!(result, Some(binary_data));
    }

    #[tokio::test]
    async fn test_reopen_preserves_data() {
        let tmp = TempDir::new().unwrap();

        {
            let backend = SqliteBackend::open(tmp.path()).await.unwrap();
            backend.put("persist", b"value").await.unwrap();
        }

        {
            let backend = SqliteBackend::open(tmp.path()).await.unwrap();
            let result = backend.get("persist").await.unwrap();
            assert_eq!(result, Some(b"value".to_vec()));
        }
    }
}
