//! COM allocation reads: the triples granting a user access to
//! (device, port) pairs. CRUD for allocations is an admin-UI concern;
//! the core only reads them for visibility checks.

use anyhow::{Context, Result};
use sqlx::Row;

use super::Db;

/// One allocation row with its port list already decoded.
#[derive(Debug, Clone)]
pub struct Allocation {
    /// Row id.
    pub id: i64,
    /// Granted user.
    pub user_id: i64,
    /// Device the allocation covers.
    pub device_id: String,
    /// Ports on that device, as stored (not yet normalized).
    pub com_ports: Vec<String>,
}

/// All non-deleted allocations for `user_id`. Rows whose port list fails
/// to decode are skipped and logged, never fatal.
pub async fn for_user(db: &Db, user_id: i64) -> Result<Vec<Allocation>> {
    let rows = sqlx::query(
        "SELECT id, user_id, device_id, com_ports_json \
         FROM com_allocations WHERE user_id = ? AND is_deleted = 0",
    )
    .bind(user_id)
    .fetch_all(db.pool())
    .await
    .context("allocation query failed")?;

    let mut allocations = Vec::with_capacity(rows.len());
    for row in rows {
        let id: i64 = row.get("id");
        let json: String = row.get("com_ports_json");
        match serde_json::from_str::<Vec<String>>(&json) {
            Ok(com_ports) => allocations.push(Allocation {
                id,
                user_id: row.get("user_id"),
                device_id: row.get("device_id"),
                com_ports,
            }),
            Err(e) => log::warn!("allocation {id} has undecodable port list: {e}"),
        }
    }
    Ok(allocations)
}

/// Insert an allocation (seeding and tests).
pub async fn insert(db: &Db, user_id: i64, device_id: &str, com_ports: &[&str]) -> Result<i64> {
    let json = serde_json::to_string(com_ports)?;
    let result = sqlx::query(
        "INSERT INTO com_allocations (user_id, device_id, com_ports_json) VALUES (?, ?, ?)",
    )
    .bind(user_id)
    .bind(device_id)
    .bind(json)
    .execute(db.pool())
    .await?;
    Ok(result.last_insert_rowid())
}
