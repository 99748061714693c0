//! Device endpoints: presence, scan trigger, snapshot read/upsert, and
//! the REST trigger for an SMS send.

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use fleet_types::PortInfo;

use super::error::ApiError;
use super::AppState;
use crate::auth::AuthUser;
use crate::store::snapshots;

/// `GET /device/connected`: distinct connected device ids.
pub async fn connected_devices(
    State(state): State<AppState>,
    _user: AuthUser,
) -> Json<Vec<String>> {
    Json(state.hub.connected_device_ids())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanRequested {
    device_id: String,
}

/// `POST /device/scan-com-ports/{deviceId}`: route a scan command to the
/// connected agent.
pub async fn scan_com_ports(
    State(state): State<AppState>,
    _user: AuthUser,
    Path(device_id): Path<String>,
) -> Result<Json<ScanRequested>, ApiError> {
    if device_id.trim().is_empty() {
        return Err(ApiError::bad_request("deviceId must not be empty"));
    }
    if !state.hub.request_com_port_scan(&device_id) {
        return Err(ApiError::not_found(format!(
            "no connected agent for device {device_id}"
        )));
    }
    Ok(Json(ScanRequested { device_id }))
}

/// `GET /device/com-snapshot/{deviceId}`.
pub async fn get_snapshot(
    State(state): State<AppState>,
    _user: AuthUser,
    Path(device_id): Path<String>,
) -> Result<Json<snapshots::Snapshot>, ApiError> {
    let snapshot = snapshots::get(&state.db, &device_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("no snapshot for device {device_id}")))?;
    Ok(Json(snapshot))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotUpsert {
    /// Full replacement port list.
    pub ports: Vec<PortInfo>,
}

/// `POST /device/com-snapshot/{deviceId}`: admin manual edit with
/// overwrite semantics. The path device id overrides whatever the body
/// ports carry.
pub async fn upsert_snapshot(
    State(state): State<AppState>,
    user: AuthUser,
    Path(device_id): Path<String>,
    Json(body): Json<SnapshotUpsert>,
) -> Result<Json<snapshots::Snapshot>, ApiError> {
    user.require_admin()?;
    if device_id.trim().is_empty() {
        return Err(ApiError::bad_request("deviceId must not be empty"));
    }
    snapshots::upsert(&state.db, &device_id, &body.ports).await?;
    let snapshot = snapshots::get(&state.db, &device_id)
        .await?
        .ok_or_else(|| ApiError::internal(anyhow::anyhow!("snapshot vanished after upsert")))?;
    Ok(Json(snapshot))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendSmsRequest {
    pub device_id: String,
    pub com_port: String,
    pub target_number: String,
    pub message_content: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendSmsAccepted {
    record_id: String,
}

/// `POST /device/send-sms`: dispatch one send transaction to an agent.
/// The outcome arrives asynchronously as an `SmsSendResult` broadcast
/// carrying the returned record id.
pub async fn send_sms(
    State(state): State<AppState>,
    _user: AuthUser,
    Json(body): Json<SendSmsRequest>,
) -> Result<Json<SendSmsAccepted>, ApiError> {
    if body.device_id.trim().is_empty() {
        return Err(ApiError::bad_request("deviceId must not be empty"));
    }
    if body.com_port.trim().is_empty() {
        return Err(ApiError::bad_request("comPort must not be empty"));
    }
    if body.target_number.trim().is_empty() {
        return Err(ApiError::bad_request("targetNumber must not be empty"));
    }
    if body.message_content.is_empty() {
        return Err(ApiError::bad_request("messageContent must not be empty"));
    }

    let record_id = Uuid::new_v4().to_string();
    let dispatched = state.hub.request_send_sms(
        &body.device_id,
        &body.com_port,
        &body.target_number,
        &body.message_content,
        &record_id,
    );
    if !dispatched {
        return Err(ApiError::not_found(format!(
            "no connected agent for device {}",
            body.device_id
        )));
    }
    Ok(Json(SendSmsAccepted { record_id }))
}
