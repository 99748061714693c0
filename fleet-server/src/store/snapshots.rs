//! Device COM snapshots: the authoritative per-device port catalog.
//!
//! Writes are overwrite-semantic: an upsert replaces the whole port list,
//! whether it comes from an agent's scan completion or an admin edit.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::Row;

use fleet_types::PortInfo;

use super::{normalize, Db};

/// One device snapshot with its decoded port list.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    /// Owning device.
    pub device_id: String,
    /// All ports from the last scan or edit.
    pub ports: Vec<PortInfo>,
    /// When the snapshot was last written.
    pub update_time: DateTime<Utc>,
}

/// Replace the snapshot for `device_id` with `ports`. Each port's device
/// id is rewritten to `device_id` so a payload cannot smuggle rows onto
/// another device.
pub async fn upsert(db: &Db, device_id: &str, ports: &[PortInfo]) -> Result<()> {
    let rewritten: Vec<PortInfo> = ports
        .iter()
        .map(|p| PortInfo {
            device_id: device_id.to_string(),
            ..p.clone()
        })
        .collect();
    let data_json = serde_json::to_string(&rewritten)?;

    sqlx::query(
        "INSERT INTO device_com_snapshots (device_id, data_json, update_time) VALUES (?, ?, ?) \
         ON CONFLICT(device_id) DO UPDATE SET data_json = excluded.data_json, \
         update_time = excluded.update_time",
    )
    .bind(device_id)
    .bind(data_json)
    .bind(Utc::now())
    .execute(db.pool())
    .await
    .context("snapshot upsert failed")?;
    Ok(())
}

/// Load the snapshot for `device_id`, if one exists.
pub async fn get(db: &Db, device_id: &str) -> Result<Option<Snapshot>> {
    let row = sqlx::query(
        "SELECT device_id, data_json, update_time FROM device_com_snapshots WHERE device_id = ?",
    )
    .bind(device_id)
    .fetch_optional(db.pool())
    .await
    .context("snapshot query failed")?;

    let Some(row) = row else {
        return Ok(None);
    };
    let data_json: String = row.get("data_json");
    let ports = serde_json::from_str(&data_json).context("snapshot payload undecodable")?;
    Ok(Some(Snapshot {
        device_id: row.get("device_id"),
        ports,
        update_time: row.get("update_time"),
    }))
}

/// Operator of the snapshot port matching `com_port`, for stamping onto
/// ingested SMS rows. Best effort: any miss yields `None`.
pub async fn operator_for(db: &Db, device_id: &str, com_port: &str) -> Option<String> {
    let snapshot = match get(db, device_id).await {
        Ok(s) => s?,
        Err(e) => {
            log::warn!("snapshot lookup for {device_id} failed: {e:#}");
            return None;
        }
    };
    let wanted = normalize(com_port);
    snapshot
        .ports
        .iter()
        .find(|p| normalize(&p.port_name) == wanted)
        .and_then(|p| p.modem_info.as_ref())
        .and_then(|m| m.operator.clone())
}
