//! Realtime hub: tracks connected agents, routes commands to a specific
//! agent, and fans events out to browser clients.
//!
//! Presence is a process-local concurrent map keyed by connection id; a
//! multi-instance deployment would need a shared presence store keyed by
//! device id, which is an extension point, not built here.
//!
//! Ingested events are persisted before they are broadcast, so clients
//! only ever see durable events. A persistence failure is logged and the
//! broadcast still goes out.

pub mod ws;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use fleet_types::{AgentMessage, ClientEvent, ServerCommand};

use crate::store::{hangups, sms, snapshots, Db};

/// Broadcast buffer per client; slow clients skip missed events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

struct AgentEntry {
    device_id: Option<String>,
    tx: mpsc::UnboundedSender<ServerCommand>,
}

/// The hub state shared by websocket handlers and the HTTP surface.
pub struct Hub {
    db: Db,
    agents: DashMap<Uuid, AgentEntry>,
    events: broadcast::Sender<ClientEvent>,
}

impl Hub {
    /// Create a hub over `db`.
    #[must_use]
    pub fn new(db: Db) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            db,
            agents: DashMap::new(),
            events,
        }
    }

    /// Subscribe to client broadcasts (FIFO per subscriber).
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Track a new agent connection. Returns its connection id and the
    /// command stream to forward onto the socket.
    pub fn register_connection(&self) -> (Uuid, mpsc::UnboundedReceiver<ServerCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn_id = Uuid::new_v4();
        self.agents.insert(
            conn_id,
            AgentEntry {
                device_id: None,
                tx,
            },
        );
        log::info!("agent connection {conn_id} opened");
        (conn_id, rx)
    }

    /// Drop an agent connection; announces `DeviceDisconnected` when the
    /// connection had registered a device.
    pub fn remove_connection(&self, conn_id: Uuid) {
        if let Some((_, entry)) = self.agents.remove(&conn_id) {
            if let Some(device_id) = entry.device_id {
                log::info!("device {device_id} disconnected");
                self.broadcast(ClientEvent::DeviceDisconnected { device_id });
            } else {
                log::info!("agent connection {conn_id} closed before registering");
            }
        }
    }

    /// Distinct connected device ids, sorted case-insensitively.
    #[must_use]
    pub fn connected_device_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .agents
            .iter()
            .filter_map(|entry| entry.device_id.clone())
            .collect();
        ids.sort_by_key(|id| id.to_lowercase());
        ids.dedup_by(|a, b| a.eq_ignore_ascii_case(b));
        ids
    }

    /// Route a scan command to the agent registered as `device_id`.
    /// Returns false (and logs) when no such agent is connected.
    pub fn request_com_port_scan(&self, device_id: &str) -> bool {
        self.send_to_device(
            device_id,
            ServerCommand::ScanComPorts {
                device_id: device_id.to_string(),
            },
        )
    }

    /// Route a send command to the agent registered as `device_id`.
    pub fn request_send_sms(
        &self,
        device_id: &str,
        com_port: &str,
        target_number: &str,
        message_content: &str,
        record_id: &str,
    ) -> bool {
        self.send_to_device(
            device_id,
            ServerCommand::SendSms {
                device_id: device_id.to_string(),
                com_port: com_port.to_string(),
                target_number: target_number.to_string(),
                message_content: message_content.to_string(),
                record_id: record_id.to_string(),
            },
        )
    }

    fn send_to_device(&self, device_id: &str, command: ServerCommand) -> bool {
        let entry = self.agents.iter().find(|entry| {
            entry
                .device_id
                .as_deref()
                .is_some_and(|d| d.eq_ignore_ascii_case(device_id))
        });
        match entry {
            Some(entry) => entry.tx.send(command).is_ok(),
            None => {
                log::warn!("no connected agent for device {device_id}");
                false
            }
        }
    }

    fn broadcast(&self, event: ClientEvent) {
        // send only fails with zero subscribers, which is fine
        let _ = self.events.send(event);
    }

    /// Process one message from an agent connection. Persistence happens
    /// before the corresponding broadcast; persistence failures never
    /// suppress the broadcast.
    pub async fn handle_agent_message(&self, conn_id: Uuid, message: AgentMessage) {
        match message {
            AgentMessage::RegisterDevice { device_id } => {
                match self.agents.get_mut(&conn_id) {
                    Some(mut entry) => {
                        log::info!("connection {conn_id} registered as device {device_id}");
                        entry.device_id = Some(device_id.clone());
                    }
                    None => {
                        log::warn!("register from unknown connection {conn_id}");
                        return;
                    }
                }
                self.broadcast(ClientEvent::DeviceConnected { device_id });
            }
            AgentMessage::SendScanAcknowledgment { device_id, message } => {
                self.broadcast(ClientEvent::ScanAcknowledged { device_id, message });
            }
            AgentMessage::SendComPortFound { device_id, port } => {
                self.broadcast(ClientEvent::ComPortFound { device_id, port });
            }
            AgentMessage::SendComPortScanCompleted {
                device_id,
                completed_time,
            } => {
                self.broadcast(ClientEvent::ComPortScanCompleted {
                    device_id,
                    completed_time,
                });
            }
            AgentMessage::SendComPortScanResult {
                device_id,
                scan_result,
            } => {
                if let Err(e) = snapshots::upsert(&self.db, &device_id, &scan_result.ports).await {
                    log::error!("snapshot upsert for {device_id} failed: {e:#}");
                }
            }
            AgentMessage::SendSmsReceived { device_id, sms } => {
                let operator = snapshots::operator_for(&self.db, &device_id, &sms.com_port).await;
                if let Err(e) = sms::insert(&self.db, &sms, operator).await {
                    log::error!("SMS persist failed (broadcasting anyway): {e:#}");
                }
                self.broadcast(ClientEvent::SmsReceived { device_id, sms });
            }
            AgentMessage::SendCallHangupRecord { device_id, hangup } => {
                if hangup.com_port.trim().is_empty() {
                    log::warn!("hangup from {device_id} without a port; not persisted");
                } else if let Err(e) = hangups::insert(&self.db, &hangup).await {
                    log::error!("hangup persist failed (broadcasting anyway): {e:#}");
                }
                self.broadcast(ClientEvent::CallHangupRecord { device_id, hangup });
            }
            AgentMessage::SendSmsResult {
                record_id,
                status,
                error_message,
            } => {
                self.broadcast(ClientEvent::SmsSendResult {
                    record_id,
                    status,
                    error_message,
                });
            }
        }
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("agents", &self.agents.len())
            .finish_non_exhaustive()
    }
}
