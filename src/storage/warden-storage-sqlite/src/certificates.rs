//! Certificate repository.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use warden_storage::records::{CertificateRecord, CertificateType};
use warden_storage::StorageError;

use crate::{from_ts, from_ts_opt, map_sqlx_err, SqliteBackend};

const COLUMNS: &str = "id, serial, cert_type, certificate_pem, encrypted_private_key, fingerprint, \
                       subject, issuer, issuer_id, not_before, not_after, revoked, revoked_at, \
                       revocation_reason, created_at";

fn cert_from_row(row: &SqliteRow) -> Result<CertificateRecord, StorageError> {
    let id: String = row.try_get("id").map_err(map_sqlx_err)?;
    let cert_type: String = row.try_get("cert_type").map_err(map_sqlx_err)?;
    let issuer_id: Option<String> = row.try_get("issuer_id").map_err(map_sqlx_err)?;
    let not_before: i64 = row.try_get("not_before").map_err(map_sqlx_err)?;
    let not_after: i64 = row.try_get("not_after").map_err(map_sqlx_err)?;
    let revoked_at: Option<i64> = row.try_get("revoked_at").map_err(map_sqlx_err)?;
    let created_at: i64 = row.try_get("created_at").map_err(map_sqlx_err)?;

    Ok(CertificateRecord {
        id: parse_uuid(&id)?,
        serial: row.try_get("serial").map_err(map_sqlx_err)?,
        cert_type: CertificateType::parse(&cert_type)
            .ok_or_else(|| StorageError::Serialization(format!("bad cert_type: {cert_type}")))?,
        certificate_pem: row.try_get("certificate_pem").map_err(map_sqlx_err)?,
        encrypted_private_key: row.try_get("encrypted_private_key").map_err(map_sqlx_err)?,
        fingerprint: row.try_get("fingerprint").map_err(map_sqlx_err)?,
        subject: row.try_get("subject").map_err(map_sqlx_err)?,
        issuer: row.try_get("issuer").map_err(map_sqlx_err)?,
        issuer_id: issuer_id.map(|s| parse_uuid(&s)).transpose()?,
        not_before: from_ts(not_before)?,
        not_after: from_ts(not_after)?,
        revoked: row.try_get::<i64, _>("revoked").map_err(map_sqlx_err)? != 0,
        revoked_at: from_ts_opt(revoked_at)?,
        revocation_reason: row.try_get("revocation_reason").map_err(map_sqlx_err)?,
        created_at: from_ts(created_at)?,
    })
}

pub(crate) fn parse_uuid(s: &str) -> Result<Uuid, StorageError> {
    Uuid::parse_str(s).map_err(|e| StorageError::Serialization(format!("bad uuid {s}: {e}")))
}

impl SqliteBackend {
    /// Inserts a new certificate record. The serial and fingerprint columns
    /// are unique; a collision surfaces as `Conflict`.
    pub async fn insert_certificate(
        &self,
        record: &CertificateRecord,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO certificates
                (id, serial, cert_type, certificate_pem, encrypted_private_key, fingerprint,
                 subject, issuer, issuer_id, not_before, not_after, revoked, revoked_at,
                 revocation_reason, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.id.to_string())
        .bind(&record.serial)
        .bind(record.cert_type.as_str())
        .bind(&record.certificate_pem)
        .bind(&record.encrypted_private_key)
        .bind(&record.fingerprint)
        .bind(&record.subject)
        .bind(&record.issuer)
        .bind(record.issuer_id.map(|u| u.to_string()))
        .bind(record.not_before.timestamp())
        .bind(record.not_after.timestamp())
        .bind(i64::from(record.revoked))
        .bind(record.revoked_at.map(|t| t.timestamp()))
        .bind(&record.revocation_reason)
        .bind(record.created_at.timestamp())
        .execute(self.pool())
        .await
        .map_err(map_sqlx_err)?;

        Ok(())
    }

    /// Fetches a certificate by record id.
    pub async fn get_certificate(
        &self,
        id: Uuid,
    ) -> Result<Option<CertificateRecord>, StorageError> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM certificates WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(self.pool())
            .await
            .map_err(map_sqlx_err)?;

        row.as_ref().map(cert_from_row).transpose()
    }

    /// Fetches a certificate by serial number.
    pub async fn get_certificate_by_serial(
        &self,
        serial: &str,
    ) -> Result<Option<CertificateRecord>, StorageError> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM certificates WHERE serial = ?"
        ))
        .bind(serial)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_err)?;

        row.as_ref().map(cert_from_row).transpose()
    }

    /// Fetches a certificate by SHA-256 fingerprint.
    pub async fn get_certificate_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<CertificateRecord>, StorageError> {
        let row = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM certificates WHERE fingerprint = ?"
        ))
        .bind(fingerprint)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_err)?;

        row.as_ref().map(cert_from_row).transpose()
    }

    /// Lists certificates, optionally filtered by type, newest first.
    pub async fn list_certificates(
        &self,
        cert_type: Option<CertificateType>,
    ) -> Result<Vec<CertificateRecord>, StorageError> {
        let rows = match cert_type {
            Some(ty) => {
                sqlx::query(&format!(
                    "SELECT {COLUMNS} FROM certificates WHERE cert_type = ? ORDER BY created_at DESC"
                ))
                .bind(ty.as_str())
                .fetch_all(self.pool())
                .await
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {COLUMNS} FROM certificates ORDER BY created_at DESC"
                ))
                .fetch_all(self.pool())
                .await
            }
        }
        .map_err(map_sqlx_err)?;

        rows.iter().map(cert_from_row).collect()
    }

    /// Lists unrevoked certificates expiring before `cutoff`.
    pub async fn list_certificates_expiring_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<CertificateRecord>, StorageError> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM certificates WHERE revoked = 0 AND not_after <= ? \
             ORDER BY not_after ASC"
        ))
        .bind(cutoff.timestamp())
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_err)?;

        rows.iter().map(cert_from_row).collect()
    }
}
