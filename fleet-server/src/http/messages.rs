//! SMS and hangup listing plus soft/hard deletes.
//!
//! Non-admin queries are restricted to the caller's allocations before
//! any query-parameter filter applies; admins see everything and may
//! include soft-deleted rows.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::error::ApiError;
use super::{AppState, PagedResponse};
use crate::auth::AuthUser;
use crate::store::hangups::{self, HangupFilter, HangupRecord};
use crate::store::sms::{self, SmsFilter, SmsRecord};
use crate::store::{normalize, receipts, MessageType, Page};
use crate::visibility::{self, AllowedSets};

/// Resolve the caller's visibility: admins see everything.
async fn caller_visibility(state: &AppState, user: &AuthUser) -> Result<Option<AllowedSets>, ApiError> {
    if user.is_admin() {
        Ok(None)
    } else {
        Ok(Some(visibility::allowed_sets(&state.db, user.user_id).await?))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmsQuery {
    pub device_id: Option<String>,
    pub com_port: Option<String>,
    pub sender_number: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub include_deleted: Option<bool>,
    pub page_number: Option<u32>,
    pub page_size: Option<u32>,
}

impl SmsQuery {
    fn filter(&self, include_deleted: bool) -> SmsFilter {
        SmsFilter {
            device_id: self.device_id.clone(),
            com_port: self.com_port.clone(),
            sender_number: self.sender_number.clone(),
            start_time: self.start_time,
            end_time: self.end_time,
            include_deleted,
        }
    }

    fn page(&self) -> Page {
        Page::new(self.page_number, self.page_size)
    }
}

async fn sms_page(
    state: &AppState,
    user: &AuthUser,
    visibility: Option<&AllowedSets>,
    filter: &SmsFilter,
    page: Page,
) -> Result<PagedResponse<SmsRecord>, ApiError> {
    let (total, mut rows) = sms::list(&state.db, visibility, filter, page).await?;

    let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
    let read = receipts::receipt_set(&state.db, user.user_id, MessageType::Sms, &ids).await?;
    for row in &mut rows {
        row.is_read = read.contains(&row.id);
    }

    Ok(PagedResponse::new(total, page, rows))
}

/// `GET /smsmessages`: the caller's visible messages.
pub async fn list_sms(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<SmsQuery>,
) -> Result<Json<PagedResponse<SmsRecord>>, ApiError> {
    let visibility = caller_visibility(&state, &user).await?;
    let page = sms_page(
        &state,
        &user,
        visibility.as_ref(),
        &query.filter(false),
        query.page(),
    )
    .await?;
    Ok(Json(page))
}

/// `GET /smsmessages/admin/all`: everything, optionally with deleted rows.
pub async fn list_sms_admin(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<SmsQuery>,
) -> Result<Json<PagedResponse<SmsRecord>>, ApiError> {
    user.require_admin()?;
    let filter = query.filter(query.include_deleted.unwrap_or(false));
    let page = sms_page(&state, &user, None, &filter, query.page()).await?;
    Ok(Json(page))
}

/// Whether the caller's allocations cover a row's port (SMS visibility).
fn sms_visible(visibility: Option<&AllowedSets>, record: &SmsRecord) -> bool {
    match visibility {
        None => true,
        Some(sets) => sets.com_ports.contains(&normalize(&record.com_port)),
    }
}

/// `DELETE /smsmessages/{id}`: soft delete, for rows the caller can see.
pub async fn soft_delete_sms(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    let record = sms::get(&state.db, id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("no SMS message {id}")))?;
    let visibility = caller_visibility(&state, &user).await?;
    if !sms_visible(visibility.as_ref(), &record) {
        return Err(ApiError::not_found(format!("no SMS message {id}")));
    }
    sms::soft_delete(&state.db, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `DELETE /smsmessages/admin/hard-delete/{id}`.
pub async fn hard_delete_sms(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    user.require_admin()?;
    if !sms::hard_delete(&state.db, id).await? {
        return Err(ApiError::not_found(format!("no SMS message {id}")));
    }
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HangupQuery {
    pub device_id: Option<String>,
    pub com_port: Option<String>,
    pub caller_number: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub include_deleted: Option<bool>,
    pub page_number: Option<u32>,
    pub page_size: Option<u32>,
}

impl HangupQuery {
    fn filter(&self, include_deleted: bool) -> HangupFilter {
        HangupFilter {
            device_id: self.device_id.clone(),
            com_port: self.com_port.clone(),
            caller_number: self.caller_number.clone(),
            start_time: self.start_time,
            end_time: self.end_time,
            include_deleted,
        }
    }

    fn page(&self) -> Page {
        Page::new(self.page_number, self.page_size)
    }
}

async fn hangup_page(
    state: &AppState,
    user: &AuthUser,
    visibility: Option<&AllowedSets>,
    filter: &HangupFilter,
    page: Page,
) -> Result<PagedResponse<HangupRecord>, ApiError> {
    let (total, mut rows) = hangups::list(&state.db, visibility, filter, page).await?;

    let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
    let read = receipts::receipt_set(&state.db, user.user_id, MessageType::Hangup, &ids).await?;
    for row in &mut rows {
        row.is_read = read.contains(&row.id);
    }

    Ok(PagedResponse::new(total, page, rows))
}

/// `GET /call-hangup-records`.
pub async fn list_hangups(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<HangupQuery>,
) -> Result<Json<PagedResponse<HangupRecord>>, ApiError> {
    let visibility = caller_visibility(&state, &user).await?;
    let page = hangup_page(
        &state,
        &user,
        visibility.as_ref(),
        &query.filter(false),
        query.page(),
    )
    .await?;
    Ok(Json(page))
}

/// `GET /call-hangup-records/admin/all`.
pub async fn list_hangups_admin(
    State(state): State<AppState>,
    user: AuthUser,
    Query(query): Query<HangupQuery>,
) -> Result<Json<PagedResponse<HangupRecord>>, ApiError> {
    user.require_admin()?;
    let filter = query.filter(query.include_deleted.unwrap_or(false));
    let page = hangup_page(&state, &user, None, &filter, query.page()).await?;
    Ok(Json(page))
}

fn hangup_visible(visibility: Option<&AllowedSets>, record: &HangupRecord) -> bool {
    match visibility {
        None => true,
        Some(sets) => {
            sets.device_ids.contains(&normalize(&record.device_id))
                && sets.com_ports.contains(&normalize(&record.com_port))
        }
    }
}

/// `DELETE /call-hangup-records/{id}`.
pub async fn soft_delete_hangup(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    let record = hangups::get(&state.db, id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("no hangup record {id}")))?;
    let visibility = caller_visibility(&state, &user).await?;
    if !hangup_visible(visibility.as_ref(), &record) {
        return Err(ApiError::not_found(format!("no hangup record {id}")));
    }
    hangups::soft_delete(&state.db, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `DELETE /call-hangup-records/admin/hard-delete/{id}`.
pub async fn hard_delete_hangup(
    State(state): State<AppState>,
    user: AuthUser,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    user.require_admin()?;
    if !hangups::hard_delete(&state.db, id).await? {
        return Err(ApiError::not_found(format!("no hangup record {id}")));
    }
    Ok(StatusCode::NO_CONTENT)
}
