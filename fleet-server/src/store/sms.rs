//! SMS message persistence and visibility-filtered listing.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{FromRow, QueryBuilder, Row, Sqlite};

use fleet_types::SmsReceivedDto;

use super::{normalize, Db, Page};
use crate::visibility::AllowedSets;

/// A stored SMS row.
#[derive(Debug, Clone, Serialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct SmsRecord {
    /// Row id; also the read-receipt source id.
    pub id: i64,
    pub device_id: String,
    pub com_port: String,
    pub sender_number: String,
    pub message_content: String,
    pub received_time: DateTime<Utc>,
    pub sms_timestamp: Option<String>,
    /// Operator stamped from the device snapshot at ingest time.
    pub operator: Option<String>,
    pub is_deleted: bool,
    /// Filled per page from the caller's receipt set; not a column.
    #[sqlx(default)]
    pub is_read: bool,
}

/// Post-visibility query filters.
#[derive(Debug, Clone, Default)]
pub struct SmsFilter {
    /// Exact device match (normalized).
    pub device_id: Option<String>,
    /// Exact port match (normalized).
    pub com_port: Option<String>,
    /// Substring match on the sender.
    pub sender_number: Option<String>,
    /// Inclusive lower bound on received time.
    pub start_time: Option<DateTime<Utc>>,
    /// Inclusive upper bound on received time.
    pub end_time: Option<DateTime<Utc>>,
    /// Include soft-deleted rows (admin only).
    pub include_deleted: bool,
}

/// Persist an ingested SMS. `operator` comes from the device snapshot.
pub async fn insert(db: &Db, dto: &SmsReceivedDto, operator: Option<String>) -> Result<i64> {
    let result = sqlx::query(
        "INSERT INTO sms_messages \
         (device_id, com_port, sender_number, message_content, received_time, sms_timestamp, operator) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&dto.device_id)
    .bind(&dto.com_port)
    .bind(&dto.sender_number)
    .bind(&dto.message_content)
    .bind(dto.received_time)
    .bind(&dto.sms_timestamp)
    .bind(operator)
    .execute(db.pool())
    .await
    .context("SMS insert failed")?;
    Ok(result.last_insert_rowid())
}

fn push_filters(
    qb: &mut QueryBuilder<'_, Sqlite>,
    visibility: Option<&AllowedSets>,
    filter: &SmsFilter,
) {
    if !filter.include_deleted {
        qb.push(" AND is_deleted = 0");
    }
    if let Some(allowed) = visibility {
        qb.push(" AND UPPER(TRIM(com_port)) IN (");
        let mut parts = qb.separated(", ");
        for port in &allowed.com_ports {
            parts.push_bind(port.clone());
        }
        qb.push(")");
    }
    if let Some(device_id) = &filter.device_id {
        qb.push(" AND UPPER(TRIM(device_id)) = ").push_bind(normalize(device_id));
    }
    if let Some(com_port) = &filter.com_port {
        qb.push(" AND UPPER(TRIM(com_port)) = ").push_bind(normalize(com_port));
    }
    if let Some(sender) = &filter.sender_number {
        qb.push(" AND sender_number LIKE ")
            .push_bind(format!("%{}%", sender.trim()));
    }
    if let Some(start) = filter.start_time {
        qb.push(" AND received_time >= ").push_bind(start);
    }
    if let Some(end) = filter.end_time {
        qb.push(" AND received_time <= ").push_bind(end);
    }
}

/// List one page of SMS rows, newest first. `visibility` is `None` for
/// admins; a user with empty allow-sets gets an empty page up front.
pub async fn list(
    db: &Db,
    visibility: Option<&AllowedSets>,
    filter: &SmsFilter,
    page: Page,
) -> Result<(i64, Vec<SmsRecord>)> {
    if visibility.is_some_and(AllowedSets::is_empty) {
        return Ok((0, Vec::new()));
    }

    let mut count_qb = QueryBuilder::new("SELECT COUNT(*) AS n FROM sms_messages WHERE 1=1");
    push_filters(&mut count_qb, visibility, filter);
    let total: i64 = count_qb
        .build()
        .fetch_one(db.pool())
        .await
        .context("SMS count failed")?
        .get("n");

    let mut qb = QueryBuilder::new(
        "SELECT id, device_id, com_port, sender_number, message_content, \
         received_time, sms_timestamp, operator, is_deleted \
         FROM sms_messages WHERE 1=1",
    );
    push_filters(&mut qb, visibility, filter);
    qb.push(" ORDER BY received_time DESC, id DESC LIMIT ")
        .push_bind(i64::from(page.size))
        .push(" OFFSET ")
        .push_bind(page.offset());

    let rows = qb
        .build_query_as::<SmsRecord>()
        .fetch_all(db.pool())
        .await
        .context("SMS page query failed")?;

    Ok((total, rows))
}

/// Append `SELECT id FROM sms_messages ...` covering all non-deleted
/// messages a visibility set can see, with an optional device/port
/// constraint. Composed into read-receipt statements.
pub fn push_visible_ids(
    qb: &mut QueryBuilder<'static, Sqlite>,
    visibility: Option<&AllowedSets>,
    device_id: Option<&str>,
    com_port: Option<&str>,
) {
    qb.push("SELECT id FROM sms_messages WHERE is_deleted = 0");
    if let Some(allowed) = visibility {
        qb.push(" AND UPPER(TRIM(com_port)) IN (");
        let mut parts = qb.separated(", ");
        for port in &allowed.com_ports {
            parts.push_bind(port.clone());
        }
        qb.push(")");
    }
    if let Some(device_id) = device_id {
        qb.push(" AND UPPER(TRIM(device_id)) = ").push_bind(normalize(device_id));
    }
    if let Some(com_port) = com_port {
        qb.push(" AND UPPER(TRIM(com_port)) = ").push_bind(normalize(com_port));
    }
}

/// Fetch one message by id, deleted or not.
pub async fn get(db: &Db, id: i64) -> Result<Option<SmsRecord>> {
    let record = sqlx::query_as::<_, SmsRecord>(
        "SELECT id, device_id, com_port, sender_number, message_content, \
         received_time, sms_timestamp, operator, is_deleted \
         FROM sms_messages WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(db.pool())
    .await
    .context("SMS get failed")?;
    Ok(record)
}

/// Soft-delete one message. Returns whether a row was affected.
pub async fn soft_delete(db: &Db, id: i64) -> Result<bool> {
    let result = sqlx::query("UPDATE sms_messages SET is_deleted = 1 WHERE id = ? AND is_deleted = 0")
        .bind(id)
        .execute(db.pool())
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Physically remove one message (admin only).
pub async fn hard_delete(db: &Db, id: i64) -> Result<bool> {
    let result = sqlx::query("DELETE FROM sms_messages WHERE id = ?")
        .bind(id)
        .execute(db.pool())
        .await?;
    Ok(result.rows_affected() > 0)
}
