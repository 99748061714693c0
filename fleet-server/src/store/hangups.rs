//! Call-hangup record persistence and visibility-filtered listing.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{FromRow, QueryBuilder, Row, Sqlite};

use fleet_types::CallHangupDto;

use super::{normalize, Db, Page};
use crate::visibility::AllowedSets;

/// A stored hangup row.
#[derive(Debug, Clone, Serialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct HangupRecord {
    /// Row id; also the read-receipt source id.
    pub id: i64,
    pub device_id: String,
    pub com_port: String,
    pub caller_number: Option<String>,
    pub hangup_time: DateTime<Utc>,
    /// `AutoHangup`, `Manual`, or `Unknown`.
    pub reason: String,
    pub raw_line: Option<String>,
    pub is_deleted: bool,
    /// Filled per page from the caller's receipt set; not a column.
    #[sqlx(default)]
    pub is_read: bool,
}

/// Post-visibility query filters.
#[derive(Debug, Clone, Default)]
pub struct HangupFilter {
    /// Exact device match (normalized).
    pub device_id: Option<String>,
    /// Exact port match (normalized).
    pub com_port: Option<String>,
    /// Substring match on the caller.
    pub caller_number: Option<String>,
    /// Inclusive lower bound on hangup time.
    pub start_time: Option<DateTime<Utc>>,
    /// Inclusive upper bound on hangup time.
    pub end_time: Option<DateTime<Utc>>,
    /// Include soft-deleted rows (admin only).
    pub include_deleted: bool,
}

/// Persist an ingested hangup event.
pub async fn insert(db: &Db, dto: &CallHangupDto) -> Result<i64> {
    let reason = serde_json::to_value(dto.reason)?
        .as_str()
        .unwrap_or("Unknown")
        .to_string();
    let result = sqlx::query(
        "INSERT INTO call_hangup_records \
         (device_id, com_port, caller_number, hangup_time, reason, raw_line) \
         VALUES (?, ?, ?, ?, ?, ?)",
    )
    .bind(&dto.device_id)
    .bind(&dto.com_port)
    .bind(&dto.caller_number)
    .bind(dto.hangup_time)
    .bind(reason)
    .bind(&dto.raw_line)
    .execute(db.pool())
    .await
    .context("hangup insert failed")?;
    Ok(result.last_insert_rowid())
}

fn push_filters(
    qb: &mut QueryBuilder<'_, Sqlite>,
    visibility: Option<&AllowedSets>,
    filter: &HangupFilter,
) {
    if !filter.include_deleted {
        qb.push(" AND is_deleted = 0");
    }
    if let Some(allowed) = visibility {
        // hangups need both the device and the port to be allocated
        qb.push(" AND UPPER(TRIM(device_id)) IN (");
        let mut parts = qb.separated(", ");
        for device in &allowed.device_ids {
            parts.push_bind(device.clone());
        }
        qb.push(") AND UPPER(TRIM(com_port)) IN (");
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
    if let Some(caller) = &filter.caller_number {
        qb.push(" AND caller_number LIKE ")
            .push_bind(format!("%{}%", caller.trim()));
    }
    if let Some(start) = filter.start_time {
        qb.push(" AND hangup_time >= ").push_bind(start);
    }
    if let Some(end) = filter.end_time {
        qb.push(" AND hangup_time <= ").push_bind(end);
    }
}

/// List one page of hangup rows, newest first.
pub async fn list(
    db: &Db,
    visibility: Option<&AllowedSets>,
    filter: &HangupFilter,
    page: Page,
) -> Result<(i64, Vec<HangupRecord>)> {
    if visibility.is_some_and(AllowedSets::is_empty) {
        return Ok((0, Vec::new()));
    }

    let mut count_qb = QueryBuilder::new("SELECT COUNT(*) AS n FROM call_hangup_records WHERE 1=1");
    push_filters(&mut count_qb, visibility, filter);
    let total: i64 = count_qb
        .build()
        .fetch_one(db.pool())
        .await
        .context("hangup count failed")?
        .get("n");

    let mut qb = QueryBuilder::new(
        "SELECT id, device_id, com_port, caller_number, hangup_time, reason, raw_line, is_deleted \
         FROM call_hangup_records WHERE 1=1",
    );
    push_filters(&mut qb, visibility, filter);
    qb.push(" ORDER BY hangup_time DESC, id DESC LIMIT ")
        .push_bind(i64::from(page.size))
        .push(" OFFSET ")
        .push_bind(page.offset());

    let rows = qb
        .build_query_as::<HangupRecord>()
        .fetch_all(db.pool())
        .await
        .context("hangup page query failed")?;

    Ok((total, rows))
}

/// Append `SELECT id FROM call_hangup_records ...` covering the rows a
/// visibility set can see. Composed into read-receipt statements.
pub fn push_visible_ids(
    qb: &mut QueryBuilder<'static, Sqlite>,
    visibility: Option<&AllowedSets>,
    device_id: Option<&str>,
    com_port: Option<&str>,
) {
    qb.push("SELECT id FROM call_hangup_records WHERE is_deleted = 0");
    if let Some(allowed) = visibility {
        qb.push(" AND UPPER(TRIM(device_id)) IN (");
        let mut parts = qb.separated(", ");
        for device in &allowed.device_ids {
            parts.push_bind(device.clone());
        }
        qb.push(") AND UPPER(TRIM(com_port)) IN (");
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

/// Fetch one record by id, deleted or not.
pub async fn get(db: &Db, id: i64) -> Result<Option<HangupRecord>> {
    let record = sqlx::query_as::<_, HangupRecord>(
        "SELECT id, device_id, com_port, caller_number, hangup_time, reason, raw_line, is_deleted \
         FROM call_hangup_records WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(db.pool())
    .await
    .context("hangup get failed")?;
    Ok(record)
}

/// Soft-delete one record.
pub async fn soft_delete(db: &Db, id: i64) -> Result<bool> {
    let result =
        sqlx::query("UPDATE call_hangup_records SET is_deleted = 1 WHERE id = ? AND is_deleted = 0")
            .bind(id)
            .execute(db.pool())
            .await?;
    Ok(result.rows_affected() > 0)
}

/// Physically remove one record (admin only).
pub async fn hard_delete(db: &Db, id: i64) -> Result<bool> {
    let result = sqlx::query("DELETE FROM call_hangup_records WHERE id = ?")
        .bind(id)
        .execute(db.pool())
        .await?;
    Ok(result.rows_affected() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use fleet_types::HangupReason;

    fn dto(device: &str, port: &str, caller: Option<&str>, minute: u32) -> CallHangupDto {
        CallHangupDto {
            device_id: device.into(),
            com_port: port.into(),
            caller_number: caller.map(String::from),
            hangup_time: Utc.with_ymd_and_hms(2026, 1, 23, 15, minute, 0).unwrap(),
            reason: HangupReason::AutoHangup,
            raw_line: None,
        }
    }

    #[tokio::test]
    async fn test_visibility_needs_device_and_port() {
        let db = Db::connect_in_memory().await.unwrap();
        insert(&db, &dto("D1", "COM3", Some("+1"), 0)).await.unwrap();
        insert(&db, &dto("D1", "COM4", Some("+2"), 1)).await.unwrap();
        insert(&db, &dto("D3", "COM3", Some("+3"), 2)).await.unwrap();

        let sets = AllowedSets {
            device_ids: vec!["D1".into()],
            com_ports: vec!["COM3".into()],
        };
        let (total, rows) = list(&db, Some(&sets), &HangupFilter::default(), Page::new(None, None))
            .await
            .unwrap();

        // (D1,COM4) fails the port check; (D3,COM3) fails the device check
        assert_eq!(total, 1);
        assert_eq!(rows[0].device_id, "D1");
        assert_eq!(rows[0].com_port, "COM3");
        assert_eq!(rows[0].reason, "AutoHangup");
    }

    #[tokio::test]
    async fn test_caller_contains_filter() {
        let db = Db::connect_in_memory().await.unwrap();
        insert(&db, &dto("D1", "COM3", Some("+15550001111"), 0)).await.unwrap();
        insert(&db, &dto("D1", "COM3", Some("+16660002222"), 1)).await.unwrap();
        insert(&db, &dto("D1", "COM3", None, 2)).await.unwrap();

        let filter = HangupFilter {
            caller_number: Some("666".into()),
            ..HangupFilter::default()
        };
        let (total, rows) = list(&db, None, &filter, Page::new(None, None)).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(rows[0].caller_number.as_deref(), Some("+16660002222"));
    }
}
