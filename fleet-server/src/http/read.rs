//! Read-receipt endpoints.

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};

use super::error::ApiError;
use super::AppState;
use crate::auth::AuthUser;
use crate::store::{receipts, MessageType};
use crate::visibility::{self, AllowedSets};

async fn caller_visibility(state: &AppState, user: &AuthUser) -> Result<Option<AllowedSets>, ApiError> {
    if user.is_admin() {
        Ok(None)
    } else {
        Ok(Some(visibility::allowed_sets(&state.db, user.user_id).await?))
    }
}

fn parse_type(value: &str) -> Result<MessageType, ApiError> {
    MessageType::parse(value)
        .ok_or_else(|| ApiError::bad_request(format!("unknown messageType {value:?}")))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkReadRequest {
    /// `Sms` or `Hangup`.
    pub message_type: String,
    /// Row id of the message or hangup record.
    pub source_id: i64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkReadResponse {
    marked: u64,
}

/// `POST /message-read/mark-read`: idempotent single mark.
pub async fn mark_read(
    State(state): State<AppState>,
    user: AuthUser,
    Json(body): Json<MarkReadRequest>,
) -> Result<Json<MarkReadResponse>, ApiError> {
    let message_type = parse_type(&body.message_type)?;
    receipts::mark_read(&state.db, user.user_id, message_type, body.source_id).await?;
    Ok(Json(MarkReadResponse { marked: 1 }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkAllReadRequest {
    /// `Sms` or `Hangup`.
    pub message_type: String,
    /// Optional device constraint.
    pub device_id: Option<String>,
    /// Optional port constraint.
    pub com_port: Option<String>,
}

/// `POST /message-read/mark-all-read`: bulk-mark the visible set under
/// the optional constraints.
pub async fn mark_all_read(
    State(state): State<AppState>,
    user: AuthUser,
    Json(body): Json<MarkAllReadRequest>,
) -> Result<Json<MarkReadResponse>, ApiError> {
    let message_type = parse_type(&body.message_type)?;
    let visibility = caller_visibility(&state, &user).await?;
    let marked = receipts::mark_all_read(
        &state.db,
        user.user_id,
        message_type,
        visibility.as_ref(),
        body.device_id.as_deref(),
        body.com_port.as_deref(),
    )
    .await?;
    Ok(Json(MarkReadResponse { marked }))
}

/// `GET /message-read/unread-counts`.
pub async fn unread_counts(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<receipts::UnreadCounts>, ApiError> {
    let visibility = caller_visibility(&state, &user).await?;
    let counts = receipts::unread_counts(&state.db, user.user_id, visibility.as_ref()).await?;
    Ok(Json(counts))
}
