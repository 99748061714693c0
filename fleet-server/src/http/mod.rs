//! HTTP surface: routing, shared state, and the paged response shape.

pub mod device;
pub mod error;
pub mod messages;
pub mod read;

use std::sync::Arc;

use axum::routing::{delete, get, post};
use axum::Router;
use serde::Serialize;
use tower_http::cors::CorsLayer;

use crate::auth::AuthKeys;
use crate::hub::{ws, Hub};
use crate::store::{Db, Page};

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    /// Database handle.
    pub db: Db,
    /// Realtime hub.
    pub hub: Arc<Hub>,
    /// Token validation keys.
    pub auth: AuthKeys,
}

/// Envelope for every list response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PagedResponse<T> {
    /// Total matching rows, before paging.
    pub total_count: i64,
    /// Echoed 1-based page number.
    pub page_number: u32,
    /// Echoed (clamped) page size.
    pub page_size: u32,
    /// The page itself.
    pub data: Vec<T>,
}

impl<T> PagedResponse<T> {
    /// Wrap a page of rows.
    #[must_use]
    pub fn new(total_count: i64, page: Page, data: Vec<T>) -> Self {
        Self {
            total_count,
            page_number: page.number,
            page_size: page.size,
            data,
        }
    }
}

async fn healthz() -> &'static str {
    "ok"
}

/// Build the full application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/hub/agent", get(ws::agent_ws))
        .route("/hub/client", get(ws::client_ws))
        .route("/device/connected", get(device::connected_devices))
        .route("/device/scan-com-ports/{deviceId}", post(device::scan_com_ports))
        .route(
            "/device/com-snapshot/{deviceId}",
            get(device::get_snapshot).post(device::upsert_snapshot),
        )
        .route("/device/send-sms", post(device::send_sms))
        .route("/smsmessages", get(messages::list_sms))
        .route("/smsmessages/admin/all", get(messages::list_sms_admin))
        .route("/smsmessages/{id}", delete(messages::soft_delete_sms))
        .route(
            "/smsmessages/admin/hard-delete/{id}",
            delete(messages::hard_delete_sms),
        )
        .route("/call-hangup-records", get(messages::list_hangups))
        .route(
            "/call-hangup-records/admin/all",
            get(messages::list_hangups_admin),
        )
        .route(
            "/call-hangup-records/{id}",
            delete(messages::soft_delete_hangup),
        )
        .route(
            "/call-hangup-records/admin/hard-delete/{id}",
            delete(messages::hard_delete_hangup),
        )
        .route("/message-read/mark-read", post(read::mark_read))
        .route("/message-read/mark-all-read", post(read::mark_all_read))
        .route("/message-read/unread-counts", get(read::unread_counts))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
