//! Policy document repository.

use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use warden_storage::records::PolicyRecord;
use warden_storage::StorageError;

use crate::{from_ts, map_sqlx_err, SqliteBackend};

fn policy_from_row(row: &SqliteRow) -> Result<PolicyRecord, StorageError> {
    let created_at: i64 = row.try_get("created_at").map_err(map_sqlx_err)?;
    let updated_at: i64 = row.try_get("updated_at").map_err(map_sqlx_err)?;

    Ok(PolicyRecord {
        name: row.try_get("name").map_err(map_sqlx_err)?,
        effect: row.try_get("effect").map_err(map_sqlx_err)?,
        rules_json: row.try_get("rules_json").map_err(map_sqlx_err)?,
        created_at: from_ts(created_at)?,
        updated_at: from_ts(updated_at)?,
    })
}

impl SqliteBackend {
    /// Inserts or replaces a policy document.
    pub async fn upsert_policy(&self, record: &PolicyRecord) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO policies (name, effect, rules_json, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                effect = excluded.effect,
                rules_json = excluded.rules_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&record.name)
        .bind(&record.effect)
        .bind(&record.rules_json)
        .bind(record.created_at.timestamp())
        .bind(record.updated_at.timestamp())
        .execute(self.pool())
        .await
        .map_err(map_sqlx_err)?;

        Ok(())
    }

    /// Fetches a policy by name.
    pub async fn get_policy(&self, name: &str) -> Result<Option<PolicyRecord>, StorageError> {
        let row = sqlx::query("SELECT * FROM policies WHERE name = ?")
            .bind(name)
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_err)?;

        row.as_ref().map(policy_from_row).transpose()
    }

    /// Deletes a policy. Returns whether a row was removed.
    pub async fn delete_policy(&self, name: &str) -> Result<bool, StorageError> {
        let result = sqlx::query("DELETE FROM policies WHERE name = ?")
            .bind(name)
            .execute(self.pool())
            .await
            .map_err(map_sqlx_err)?;

        Ok(result.rows_affected() > 0)
    }

    /// Lists all policies ordered by name.
    pub async fn list_policies(&self) -> Result<Vec<PolicyRecord>, StorageError> {
        let rows = sqlx::query("SELECT * FROM policies ORDER BY name")
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_err)?;

        rows.iter().map(policy_from_row).collect()
    }
}
