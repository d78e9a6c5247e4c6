//! AppRole repository: roles and minted secret ids.

use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use warden_storage::records::{RoleRecord, SecretIdRecord};
use warden_storage::StorageError;

use crate::certificates::parse_uuid;
use crate::{from_ts, from_ts_opt, map_sqlx_err, names_from_json, names_to_json, SqliteBackend};

fn role_from_row(row: &SqliteRow) -> Result<RoleRecord, StorageError> {
    let role_id: String = row.try_get("role_id").map_err(map_sqlx_err)?;
    let policies: String = row.try_get("policies").map_err(map_sqlx_err)?;
    let created_at: i64 = row.try_get("created_at").map_err(map_sqlx_err)?;

    Ok(RoleRecord {
        name: row.try_get("name").map_err(map_sqlx_err)?,
        role_id: parse_uuid(&role_id)?,
        policies: names_from_json(&policies)?,
        bind_secret_id: row.try_get::<i64, _>("bind_secret_id").map_err(map_sqlx_err)? != 0,
        secret_id_ttl: row.try_get("secret_id_ttl").map_err(map_sqlx_err)?,
        secret_id_num_uses: row.try_get("secret_id_num_uses").map_err(map_sqlx_err)?,
        token_ttl: row.try_get("token_ttl").map_err(map_sqlx_err)?,
        created_at: from_ts(created_at)?,
    })
}

fn secret_id_from_row(row: &SqliteRow) -> Result<SecretIdRecord, StorageError> {
    let id: String = row.try_get("id").map_err(map_sqlx_err)?;
    let expires_at: Option<i64> = row.try_get("expires_at").map_err(map_sqlx_err)?;
    let created_at: i64 = row.try_get("created_at").map_err(map_sqlx_err)?;

    Ok(SecretIdRecord {
        id: parse_uuid(&id)?,
        role_name: row.try_get("role_name").map_err(map_sqlx_err)?,
        secret_id_hash: row.try_get("secret_id_hash").map_err(map_sqlx_err)?,
        uses_remaining: row.try_get("uses_remaining").map_err(map_sqlx_err)?,
        expires_at: from_ts_opt(expires_at)?,
        revoked: row.try_get::<i64, _>("revoked").map_err(map_sqlx_err)? != 0,
        created_at: from_ts(created_at)?,
    })
}

impl SqliteBackend {
    /// Inserts a role. The name and role id are unique.
    pub async fn insert_role(&self, record: &RoleRecord) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO roles
                (name, role_id, policies, bind_secret_id, secret_id_ttl,
                 secret_id_num_uses, token_ttl, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.name)
        .bind(record.role_id.to_string())
        .bind(names_to_json(&record.policies)?)
        .bind(i64::from(record.bind_secret_id))
        .bind(record.secret_id_ttl)
        .bind(record.secret_id_num_uses)
        .bind(record.token_ttl)
        .bind(record.created_at.timestamp())
        .execute(self.pool())
        .await
        .map_err(map_sqlx_err)?;

        Ok(())
    }

    /// Fetches a role by name.
    pub async fn get_role(&self, name: &str) -> Result<Option<RoleRecord>, StorageError> {
        let row = sqlx::query("SELECT * FROM roles WHERE name = ?")
            .bind(name)
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_err)?;

        row.as_ref().map(role_from_row).transpose()
    }

    /// Fetches a role by its public role id.
    pub async fn get_role_by_id(&self, role_id: Uuid) -> Result<Option<RoleRecord>, StorageError> {
        let row = sqlx::query("SELECT * FROM roles WHERE role_id = ?")
            .bind(role_id.to_string())
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_err)?;

        row.as_ref().map(role_from_row).transpose()
    }

    /// Deletes a role. Returns whether a row was removed.
    pub async fn delete_role(&self, name: &str) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM roles WHERE name = ?")
            .bind(name)
            .execute(self.pool())
            .await
            .map_err(map_sqlx_err)?;

        Ok(result.rows_affected() > 0)
    }

    /// Lists all roles.
    pub async fn list_roles(&self) -> Result<Vec<RoleRecord>, StorageError> {
        let rows = sqlx::query("SELECT * FROM roles ORDER BY name")
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_err)?;

        rows.iter().map(role_from_row).collect()
    }

    /// Inserts a minted secret id record.
    pub async fn insert_secret_id(&self, record: &SecretIdRecord) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO secret_ids
                (id, role_name, secret_id_hash, uses_remaining, expires_at, revoked, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.id.to_string())
        .bind(&record.role_name)
        .bind(&record.secret_id_hash)
        .bind(record.uses_remaining)
        .bind(record.expires_at.map(|t| t.timestamp()))
        .bind(i64::from(record.revoked))
        .bind(record.created_at.timestamp())
        .execute(self.pool())
        .await
        .map_err(map_sqlx_err)?;

        Ok(())
    }

    /// Fetches a secret id record.
    pub async fn get_secret_id(&self, id: Uuid) -> Result<Option<SecretIdRecord>, StorageError> {
        let row = sqlx::query("SELECT * FROM secret_ids WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_err)?;

        row.as_ref().map(secret_id_from_row).transpose()
    }

    /// Lists live (unrevoked) secret ids for a role.
    pub async fn list_secret_ids_for_role(
        &self,
        role_name: &str,
    ) -> Result<Vec<SecretIdRecord>, StorageError> {
        let rows = sqlx::query(
            "SELECT * FROM secret_ids WHERE role_name = ? AND revoked = 0 ORDER BY created_at",
        )
        .bind(role_name)
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_err)?;

        rows.iter().map(secret_id_from_row).collect()
    }

    /// Records a login against a secret id: decrements the remaining-use
    /// counter and revokes on exhaustion.
    pub async fn consume_secret_id_use(
        &self,
        id: Uuid,
        uses_remaining: Option<i64>,
        revoked: bool,
    ) -> Result<(), StorageError> {
        sqlx::query("UPDATE secret_ids SET uses_remaining = ?, revoked = ? WHERE id = ?")
            .bind(uses_remaining)
            .bind(i64::from(revoked))
            .bind(id.to_string())
            .execute(self.pool())
            .await
            .map_err(map_sqlx_err)?;

        Ok(())
    }

    /// Revokes a secret id.
    pub async fn revoke_secret_id(&self, id: Uuid) -> Result<(), StorageError> {
        sqlx::query("UPDATE secret_ids SET revoked = 1 WHERE id = ?")
            .bind(id.to_string())
            .execute(self.pool())
            .await
            .map_err(map_sqlx_err)?;

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, SqliteBackend) {
        let tmp = TempDir::new().unwrap();
        let backend = SqliteBackend::open(tmp.path()).await.unwrap();
        (tmp, backend)
    }

    fn sample_role(name: &str) -> RoleRecord {
        RoleRecord {
            name: name.to_string(),
            role_id: Uuid::new_v4(),
            policies: vec!["default".to_string(), "db-read".to_string()],
            bind_secret_id: true,
            secret_id_ttl: Some(3600),
            secret_id_num_uses: Some(3),
            token_ttl: 1800,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_role_roundtrip() {
        let (_tmp, backend) = setup().await;

        let role = sample_role("db-agent");
        backend.insert_role(&role).await.unwrap();

        let loaded = backend.get_role("db-agent").await.unwrap().unwrap();
        assert_eq!(loaded.role_id, role.role_id);
        assert_eq!(loaded.policies, role.policies);
        assert!(loaded.bind_secret_id);

        let by_id = backend.get_role_by_id(role.role_id).await.unwrap().unwrap();
        assert_eq!(by_id.name, "db-agent");
    }

    #[tokio::test]
    async fn test_duplicate_role_name_conflicts() {
        let (_tmp, backend) = setup().await;

        backend.insert_role(&sample_role("dup")).await.unwrap();
        let result = backend.insert_role(&sample_role("dup")).await;
        assert!(matches!(result, Err(StorageError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_delete_role() {
        let (_tmp, backend) = setup().await;

        backend.insert_role(&sample_role("gone")).await.unwrap();
        assert!(backend.delete_role("gone").await.unwrap());
        assert!(!backend.delete_role("gone").await.unwrap());
        assert!(backend.get_role("gone").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_secret_id_lifecycle() {
        let (_tmp, backend) = setup().await;

        let record = SecretIdRecord {
            id: Uuid::new_v4(),
            role_name: "db-agent".to_string(),
            secret_id_hash: "$argon2id$...".to_string(),
            uses_remaining: Some(2),
            expires_at: None,
            revoked: false,
            created_at: Utc::now(),
        };
        backend.insert_secret_id(&record).await.unwrap();

        let live = backend.list_secret_ids_for_role("db-agent").await.unwrap();
        assert_eq!(live.len(), 1);

        backend
            .consume_secret_id_use(record.id, Some(1), false)
            .await
            .unwrap();
        let loaded = backend.get_secret_id(record.id).await.unwrap().unwrap();
        assert_eq!(loaded.uses_remaining, Some(1));

        backend
            .consume_secret_id_use(record.id, Some(0), true)
            .await
            .unwrap();
        let live = backend.list_secret_ids_for_role("db-agent").await.unwrap();
        assert!(live.is_empty());
    }
}
