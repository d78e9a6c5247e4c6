//! Session token repository. Rows are keyed by the SHA-256 of the bearer
//! value; the bearer itself never touches storage.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use warden_storage::records::TokenRecord;
use warden_storage::StorageError;

use crate::certificates::parse_uuid;
use crate::{from_ts, map_sqlx_err, names_from_json, names_to_json, SqliteBackend};

fn token_from_row(row: &SqliteRow) -> Result<TokenRecord, StorageError> {
    let secret_id_ref: Option<String> = row.try_get("secret_id_ref").map_err(map_sqlx_err)?;
    let policies: String = row.try_get("policies").map_err(map_sqlx_err)?;
    let issued_at: i64 = row.try_get("issued_at").map_err(map_sqlx_err)?;
    let expires_at: i64 = row.try_get("expires_at").map_err(map_sqlx_err)?;

    Ok(TokenRecord {
        token_hash: row.try_get("token_hash").map_err(map_sqlx_err)?,
        entity_id: row.try_get("entity_id").map_err(map_sqlx_err)?,
        role_name: row.try_get("role_name").map_err(map_sqlx_err)?,
        secret_id_ref: secret_id_ref.map(|s| parse_uuid(&s)).transpose()?,
        policies: names_from_json(&policies)?,
        bound_cert_fingerprint: row
            .try_get("bound_cert_fingerprint")
            .map_err(map_sqlx_err)?,
        issued_at: from_ts(issued_at)?,
        expires_at: from_ts(expires_at)?,
        revoked: row.try_get::<i64, _>("revoked").map_err(map_sqlx_err)? != 0,
    })
}

impl SqliteBackend {
    /// Inserts a session token record.
    pub async fn insert_token(&self, record: &TokenRecord) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO session_tokens
                (token_hash, entity_id, role_name, secret_id_ref, policies,
                 bound_cert_fingerprint, issued_at, expires_at, revoked)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.token_hash)
        .bind(&record.entity_id)
        .bind(&record.role_name)
        .bind(record.secret_id_ref.map(|u| u.to_string()))
        .bind(names_to_json(&record.policies)?)
        .bind(&record.bound_cert_fingerprint)
        .bind(record.issued_at.timestamp())
        .bind(record.expires_at.timestamp())
        .bind(i64::from(record.revoked))
        .execute(self.pool())
        .await
        .map_err(map_sqlx_err)?;

        Ok(())
    }

    /// Fetches a token record by bearer hash.
    pub async fn get_token(&self, token_hash: &str) -> Result<Option<TokenRecord>, StorageError> {
        let row = sqlx::query("SELECT * FROM session_tokens WHERE token_hash = ?")
            .bind(token_hash)
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_err)?;

        row.as_ref().map(token_from_row).transpose()
    }

    /// Revokes a token. Returns whether a live row was updated.
    pub async fn revoke_token(&self, token_hash: &str) -> Result<bool, StorageError> {
        let result =
            sqlx::query("UPDATE session_tokens SET revoked = 1 WHERE token_hash = ? AND revoked = 0")
                .bind(token_hash)
                .execute(self.pool())
                .await
                .map_err(map_sqlx_err)?;

        Ok(result.rows_affected() > 0)
    }

    /// Binds a token to a certificate fingerprint (bootstrap completion).
    pub async fn bind_token_certificate(
        &self,
        token_hash: &str,
        fingerprint: &str,
    ) -> Result<(), StorageError> {
        sqlx::query("UPDATE session_tokens SET bound_cert_fingerprint = ? WHERE token_hash = ?")
            .bind(fingerprint)
            .bind(token_hash)
            .execute(self.pool())
            .await
            .map_err(map_sqlx_err)?;

        Ok(())
    }

    /// Deletes tokens that expired before `cutoff`. Returns the count.
    pub async fn purge_expired_tokens(&self, cutoff: DateTime<Utc>) -> Result<u64, StorageError> {
        let result = sqlx::query("DELETE FROM session_tokens WHERE expires_at < ?")
            .bind(cutoff.timestamp())
            .execute(self.pool())
            .await
            .map_err(map_sqlx_err)?;

        Ok(result.rows_affected())
    }
}
