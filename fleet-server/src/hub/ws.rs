//! Websocket endpoints for the hub.
//!
//! `/hub/agent` carries agent connections (inbound [`AgentMessage`],
//! outbound [`ServerCommand`]); `/hub/client` carries browser clients
//! (outbound [`ClientEvent`] only). Clients authenticate with a bearer
//! token in the `Authorization` header or an `access_token` query
//! parameter, since browsers cannot set headers on websocket upgrades.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;

use fleet_types::AgentMessage;

use crate::http::error::ApiError;
use crate::http::AppState;

/// Upgrade handler for agent connections.
pub async fn agent_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| agent_socket(state, socket))
}

async fn agent_socket(state: AppState, socket: WebSocket) {
    let (conn_id, mut commands) = state.hub.register_connection();
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else { break };
                let frame = match serde_json::to_string(&command) {
                    Ok(f) => f,
                    Err(e) => {
                        log::error!("command serialization failed: {e}");
                        continue;
                    }
                };
                if sink.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<AgentMessage>(text.as_str()) {
                        Ok(message) => state.hub.handle_agent_message(conn_id, message).await,
                        Err(e) => log::warn!("undecodable agent frame skipped: {e}"),
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::warn!("agent socket error: {e}");
                    break;
                }
            },
        }
    }

    state.hub.remove_connection(conn_id);
}

/// Query parameters accepted on the client endpoint.
#[derive(Debug, Deserialize)]
pub struct ClientWsQuery {
    /// Bearer token fallback for browsers.
    pub access_token: Option<String>,
}

/// Upgrade handler for browser client connections.
pub async fn client_ws(
    State(state): State<AppState>,
    Query(query): Query<ClientWsQuery>,
    headers: axum::http::HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
        .or(query.access_token);

    let Some(token) = token else {
        return ApiError::unauthorized("missing bearer token").into_response();
    };
    if let Err(e) = state.auth.verify(&token) {
        return e.into_response();
    }

    ws.on_upgrade(move |socket| client_socket(state, socket))
}

async fn client_socket(state: AppState, socket: WebSocket) {
    let mut events = state.hub.subscribe();
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let frame = match serde_json::to_string(&event) {
                        Ok(f) => f,
                        Err(e) => {
                            log::error!("event serialization failed: {e}");
                            continue;
                        }
                    };
                    if sink.send(Message::Text(frame.into())).await.is_err() {
                        break;
                    }
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    log::warn!("client fell behind; {missed} events skipped");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::debug!("client socket error: {e}");
                    break;
                }
            },
        }
    }
}
