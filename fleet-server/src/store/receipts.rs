//! Read receipts: durable per-user "seen" markers.
//!
//! The unique key (user, type, source) makes insertion idempotent, so
//! unread counts reduce to a set difference computed in SQL.

use std::collections::HashSet;

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::{QueryBuilder, Row, Sqlite};

use super::{hangups, sms, Db, MessageType};
use crate::visibility::AllowedSets;

/// Unread totals per message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct UnreadCounts {
    /// Unread visible SMS messages.
    pub sms: i64,
    /// Unread visible hangup records.
    pub hangup: i64,
}

/// Mark one source row read. Duplicate marks are silently idempotent.
pub async fn mark_read(db: &Db, user_id: i64, message_type: MessageType, source_id: i64) -> Result<()> {
    sqlx::query(
        "INSERT OR IGNORE INTO message_read_receipts (user_id, message_type, source_id, read_time) \
         VALUES (?, ?, ?, ?)",
    )
    .bind(user_id)
    .bind(message_type.as_str())
    .bind(source_id)
    .bind(Utc::now())
    .execute(db.pool())
    .await
    .context("mark-read insert failed")?;
    Ok(())
}

/// Mark every visible row of `message_type` read, optionally constrained
/// to a device and/or port. One atomic `INSERT ... SELECT`; rows already
/// read are ignored by the unique key.
///
/// Returns the number of receipts created.
pub async fn mark_all_read(
    db: &Db,
    user_id: i64,
    message_type: MessageType,
    visibility: Option<&AllowedSets>,
    device_id: Option<&str>,
    com_port: Option<&str>,
) -> Result<u64> {
    if visibility.is_some_and(AllowedSets::is_empty) {
        return Ok(0);
    }

    let mut qb: QueryBuilder<'static, Sqlite> = QueryBuilder::new(
        "INSERT OR IGNORE INTO message_read_receipts (user_id, message_type, source_id, read_time) \
         SELECT ",
    );
    qb.push_bind(user_id)
        .push(", ")
        .push_bind(message_type.as_str())
        .push(", v.id, ")
        .push_bind(Utc::now())
        .push(" FROM (");
    match message_type {
        MessageType::Sms => sms::push_visible_ids(&mut qb, visibility, device_id, com_port),
        MessageType::Hangup => hangups::push_visible_ids(&mut qb, visibility, device_id, com_port),
    }
    qb.push(") v");

    let result = qb
        .build()
        .execute(db.pool())
        .await
        .context("mark-all-read failed")?;
    Ok(result.rows_affected())
}

/// Count visible-but-unread rows for one message type.
async fn unread_count(
    db: &Db,
    user_id: i64,
    message_type: MessageType,
    visibility: Option<&AllowedSets>,
) -> Result<i64> {
    if visibility.is_some_and(AllowedSets::is_empty) {
        return Ok(0);
    }

    let mut qb: QueryBuilder<'static, Sqlite> = QueryBuilder::new("SELECT COUNT(*) AS n FROM (");
    match message_type {
        MessageType::Sms => sms::push_visible_ids(&mut qb, visibility, None, None),
        MessageType::Hangup => hangups::push_visible_ids(&mut qb, visibility, None, None),
    }
    qb.push(
        ") v WHERE NOT EXISTS (SELECT 1 FROM message_read_receipts r \
         WHERE r.user_id = ",
    )
    .push_bind(user_id)
    .push(" AND r.message_type = ")
    .push_bind(message_type.as_str())
    .push(" AND r.source_id = v.id)");

    let row = qb
        .build()
        .fetch_one(db.pool())
        .await
        .context("unread count failed")?;
    Ok(row.get("n"))
}

/// Unread counts for both message types (visible set minus receipt set).
pub async fn unread_counts(
    db: &Db,
    user_id: i64,
    visibility: Option<&AllowedSets>,
) -> Result<UnreadCounts> {
    Ok(UnreadCounts {
        sms: unread_count(db, user_id, MessageType::Sms, visibility).await?,
        hangup: unread_count(db, user_id, MessageType::Hangup, visibility).await?,
    })
}

/// The subset of `source_ids` this user has read, fetched in one query
/// for page enrichment.
pub async fn receipt_set(
    db: &Db,
    user_id: i64,
    message_type: MessageType,
    source_ids: &[i64],
) -> Result<HashSet<i64>> {
    if source_ids.is_empty() {
        return Ok(HashSet::new());
    }

    let mut qb: QueryBuilder<'_, Sqlite> =
        QueryBuilder::new("SELECT source_id FROM message_read_receipts WHERE user_id = ");
    qb.push_bind(user_id)
        .push(" AND message_type = ")
        .push_bind(message_type.as_str())
        .push(" AND source_id IN (");
    let mut parts = qb.separated(", ");
    for id in source_ids {
        parts.push_bind(*id);
    }
    qb.push(")");

    let rows = qb.build().fetch_all(db.pool()).await?;
    Ok(rows.iter().map(|r| r.get("source_id")).collect())
}
