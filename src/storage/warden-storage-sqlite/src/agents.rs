//! Agent binding repository.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use warden_storage::records::{AgentBindingRecord, AgentStatus};
use warden_storage::StorageError;

use crate::certificates::parse_uuid;
use crate::{from_ts, from_ts_opt, map_sqlx_err, SqliteBackend};

fn binding_from_row(row: &SqliteRow) -> Result<AgentBindingRecord, StorageError> {
    let certificate_id: Option<String> = row.try_get("certificate_id").map_err(map_sqlx_err)?;
    let last_seen: Option<i64> = row.try_get("last_seen").map_err(map_sqlx_err)?;
    let status: String = row.try_get("status").map_err(map_sqlx_err)?;
    let created_at: i64 = row.try_get("created_at").map_err(map_sqlx_err)?;

    Ok(AgentBindingRecord {
        agent_id: row.try_get("agent_id").map_err(map_sqlx_err)?,
        role_name: row.try_get("role_name").map_err(map_sqlx_err)?,
        certificate_id: certificate_id.map(|s| parse_uuid(&s)).transpose()?,
        last_seen: from_ts_opt(last_seen)?,
        status: AgentStatus::parse(&status)
            .ok_or_else(|| StorageError::Serialization(format!("bad agent status: {status}")))?,
        created_at: from_ts(created_at)?,
    })
}

impl SqliteBackend {
    /// Inserts or replaces an agent binding.
    pub async fn upsert_agent_binding(
        &self,
        record: &AgentBindingRecord,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO agent_bindings
                (agent_id, role_name, certificate_id, last_seen, status, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(agent_id) DO UPDATE SET
                role_name = excluded.role_name,
                certificate_id = excluded.certificate_id,
                last_seen = excluded.last_seen,
                status = excluded.status
            "#,
        )
        .bind(&record.agent_id)
        .bind(&record.role_name)
        .bind(record.certificate_id.map(|u| u.to_string()))
        .bind(record.last_seen.map(|t| t.timestamp()))
        .bind(record.status.as_str())
        .bind(record.created_at.timestamp())
        .execute(self.pool())
        .await
        .map_err(map_sqlx_err)?;

        Ok(())
    }

    /// Fetches an agent binding.
    pub async fn get_agent_binding(
        &self,
        agent_id: &str,
    ) -> Result<Option<AgentBindingRecord>, StorageError> {
        let row = sqlx::query("SELECT * FROM agent_bindings WHERE agent_id = ?")
            .bind(agent_id)
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_err)?;

        row.as_ref().map(binding_from_row).transpose()
    }

    /// Updates an agent's lifecycle status.
    pub async fn set_agent_status(
        &self,
        agent_id: &str,
        status: AgentStatus,
    ) -> Result<bool, StorageError> {
        let result = sqlx::query("UPDATE agent_bindings SET status = ? WHERE agent_id = ?")
            .bind(status.as_str())
            .bind(agent_id)
            .execute(self.pool())
            .await
            .map_err(map_sqlx_err)?;

        Ok(result.rows_affected() > 0)
    }

    /// Records a certificate issued to an agent and activates the binding.
    pub async fn set_agent_certificate(
        &self,
        agent_id: &str,
        certificate_id: Uuid,
    ) -> Result<(), StorageError> {
        sqlx::query(
            "UPDATE agent_bindings SET certificate_id = ?, status = 'active' WHERE agent_id = ?",
        )
        .bind(certificate_id.to_string())
        .bind(agent_id)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_err)?;

        Ok(())
    }

    /// Stamps an agent's last-seen instant.
    pub async fn touch_agent(
        &self,
        agent_id: &str,
        seen_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        sqlx::query("UPDATE agent_bindings SET last_seen = ? WHERE agent_id = ?")
            .bind(seen_at.timestamp())
            .bind(agent_id)
            .execute(self.pool())
            .await
            .map_err(map_sqlx_err)?;

        Ok(())
    }

    /// Lists all agent bindings.
    pub async fn list_agent_bindings(&self) -> Result<Vec<AgentBindingRecord>, StorageError> {
        let rows = sqlx::query("SELECT * FROM agent_bindings ORDER BY agent_id")
            .fetch_all(self.pool())
            .await
            .map_err(map_sqlx_err)?;

        rows.iter().map(binding_from_row).collect()
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

    fn sample(agent_id: &str) -> AgentBindingRecord {
        AgentBindingRecord {
            agent_id: agent_id.to_string(),
            role_name: "db-agent".to_string(),
            certificate_id: None,
            last_seen: None,
            status: AgentStatus::Pending,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_binding_lifecycle() {
        let (_tmp, backend) = setup().await;

        backend.upsert_agent_binding(&sample("agent-1")).await.unwrap();

        let loaded = backend.get_agent_binding("agent-1").await.unwrap().unwrap();
        assert_eq!(loaded.status, AgentStatus::Pending);
        assert!(loaded.certificate_id.is_none());

        let cert_id = Uuid::new_v4();
        backend
            .set_agent_certificate("agent-1", cert_id)
            .await
            .unwrap();

        let loaded = backend.get_agent_binding("agent-1").await.unwrap().unwrap();
        assert_eq!(loaded.status, AgentStatus::Active);
        assert_eq!(loaded.certificate_id, Some(cert_id));

        backend.touch_agent("agent-1", Utc::now()).await.unwrap();
        let loaded = backend.get_agent_binding("agent-1").await.unwrap().unwrap();
        assert!(loaded.last_seen.is_some());

        assert!(backend
            .set_agent_status("agent-1", AgentStatus::Suspended)
            .await
            .unwrap());
        let loaded = backend.get_agent_binding("agent-1").await.unwrap().unwrap();
        assert_eq!(loaded.status, AgentStatus::Suspended);
    }

    #[tokio::test]
    async fn test_list_bindings() {
        let (_tmp, backend) = setup().await;

        backend.upsert_agent_binding(&sample("a")).await.unwrap();
        backend.upsert_agent_binding(&sample("b")).await.unwrap();

        let listed = backend.list_agent_bindings().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].agent_id, "a");
    }
}
