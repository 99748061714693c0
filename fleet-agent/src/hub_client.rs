//! Hub client: the agent's persistent connection to the server.
//!
//! Owns the websocket lifecycle (connect, register, dispatch, reconnect
//! with capped exponential backoff) and the [`AgentRuntime`] that maps
//! inbound [`ServerCommand`]s onto the modem driver.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite;

use fleet_types::{AgentMessage, ListenerPort, ServerCommand};

use crate::config::AgentConfig;
use crate::receiver::{AutoHangupConfig, SmsReceiver};
use crate::scanner::ComPortScanner;
use crate::sender::SmsSender;
use crate::session::{CommandLocks, PortArbiter, PortOpener};

/// Initial reconnect delay; doubles up to [`MAX_BACKOFF`].
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Reconnect delay cap.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// The agent-side driver surface a hub connection dispatches into.
pub struct AgentRuntime<O: PortOpener> {
    device_id: String,
    auto_start_on_scan: bool,
    scanner: ComPortScanner<O>,
    receiver: Arc<SmsReceiver<O>>,
    sender: SmsSender<O>,
    outgoing: mpsc::UnboundedSender<AgentMessage>,
}

impl<O: PortOpener> AgentRuntime<O> {
    /// Wire up the driver stack: receiver, sender, scanner, arbiter, and
    /// the event bridges that forward receiver events to the hub.
    pub async fn new(
        config: &AgentConfig,
        opener: Arc<O>,
        outgoing: mpsc::UnboundedSender<AgentMessage>,
    ) -> Self {
        let locks = CommandLocks::new();
        let arbiter = Arc::new(PortArbiter::new());

        let (sms_tx, mut sms_rx) = mpsc::unbounded_channel();
        let (hangup_tx, mut hangup_rx) = mpsc::unbounded_channel();

        let hangup_cfg = AutoHangupConfig {
            enabled: config.auto_hangup.enabled,
            hangup_delay: Duration::from_millis(config.auto_hangup.hangup_delay_ms),
            cooldown: Duration::from_millis(config.auto_hangup.cooldown_ms),
            whitelist: config.auto_hangup.whitelist.clone(),
        };
        let receiver = Arc::new(SmsReceiver::new(
            config.device_id.clone(),
            Arc::clone(&opener),
            locks,
            hangup_cfg,
            sms_tx,
            hangup_tx,
        ));
        arbiter.set_pauser(Arc::new(receiver.handle())).await;

        // event bridges: receiver events become hub messages
        let bridge_out = outgoing.clone();
        let bridge_device = config.device_id.clone();
        tokio::spawn(async move {
            while let Some(sms) = sms_rx.recv().await {
                let msg = AgentMessage::SendSmsReceived {
                    device_id: bridge_device.clone(),
                    sms,
                };
                if bridge_out.send(msg).is_err() {
                    break;
                }
            }
        });
        let bridge_out = outgoing.clone();
        let bridge_device = config.device_id.clone();
        tokio::spawn(async move {
            while let Some(hangup) = hangup_rx.recv().await {
                let msg = AgentMessage::SendCallHangupRecord {
                    device_id: bridge_device.clone(),
                    hangup,
                };
                if bridge_out.send(msg).is_err() {
                    break;
                }
            }
        });

        Self {
            device_id: config.device_id.clone(),
            auto_start_on_scan: config.auto_start_on_scan,
            scanner: ComPortScanner::new(
                config.device_id.clone(),
                Arc::clone(&opener),
                config.baud_rates.clone(),
            ),
            receiver,
            sender: SmsSender::new(opener, arbiter),
            outgoing,
        }
    }

    /// This agent's device id.
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Stop listeners and release cached send handles.
    pub async fn shutdown(&self) {
        self.receiver.stop_listening().await;
        self.sender.release_ports().await;
    }

    /// Dispatch one inbound command. Commands addressed to a different
    /// device are ignored.
    pub async fn handle_command(&self, command: ServerCommand) {
        if !command.targets(&self.device_id) {
            log::debug!("ignoring command for another device: {command:?}");
            return;
        }

        match command {
            ServerCommand::ScanComPorts { .. } => self.run_scan().await,
            ServerCommand::StartSmsReceiver { ports, .. } => {
                self.receiver.start_listening(&ports).await;
            }
            ServerCommand::StopSmsReceiver { .. } => {
                self.receiver.stop_listening().await;
            }
            ServerCommand::SendSms {
                com_port,
                target_number,
                message_content,
                record_id,
                ..
            } => {
                let outcome = self
                    .sender
                    .send_sms(&com_port, &target_number, &message_content)
                    .await;
                if let Some(error) = &outcome.error_message {
                    log::warn!("send on {com_port} failed: {error}");
                }
                self.send(AgentMessage::SendSmsResult {
                    record_id,
                    status: outcome.status().as_str().to_string(),
                    error_message: outcome.error_message,
                });
            }
        }
    }

    async fn run_scan(&self) {
        self.send(AgentMessage::SendScanAcknowledgment {
            device_id: self.device_id.clone(),
            message: "scan started".to_string(),
        });

        let (port_tx, mut port_rx) = mpsc::unbounded_channel();
        let forward_out = self.outgoing.clone();
        let forward_device = self.device_id.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(port) = port_rx.recv().await {
                let msg = AgentMessage::SendComPortFound {
                    device_id: forward_device.clone(),
                    port,
                };
                if forward_out.send(msg).is_err() {
                    break;
                }
            }
        });

        let result = self.scanner.scan(&port_tx).await;
        drop(port_tx);
        let _ = forwarder.await;

        self.send(AgentMessage::SendComPortScanCompleted {
            device_id: self.device_id.clone(),
            completed_time: Utc::now().to_rfc3339(),
        });
        self.send(AgentMessage::SendComPortScanResult {
            device_id: self.device_id.clone(),
            scan_result: result.clone(),
        });

        if self.auto_start_on_scan {
            let ports: Vec<ListenerPort> = result
                .ports
                .iter()
                .filter(|p| {
                    p.is_sms_modem
                        && p.baud_rate.is_some()
                        && p.modem_info.as_ref().is_some_and(|m| m.has_sim_card)
                })
                .map(|p| ListenerPort {
                    port_name: p.port_name.clone(),
                    baud_rate: p.baud_rate.unwrap_or(115_200),
                })
                .collect();
            if !ports.is_empty() {
                log::info!("auto-starting receivers on {} scanned ports", ports.len());
                self.receiver.start_listening(&ports).await;
            }
        }
    }

    fn send(&self, message: AgentMessage) {
        if self.outgoing.send(message).is_err() {
            log::error!("hub outgoing channel closed; message dropped");
        }
    }
}

/// Convert an HTTP(S) server URL into the agent websocket endpoint.
#[must_use]
pub fn agent_endpoint(server_url: &str) -> String {
    let ws = if server_url.starts_with("ws://") || server_url.starts_with("wss://") {
        server_url.to_string()
    } else {
        server_url
            .replace("https://", "wss://")
            .replace("http://", "ws://")
    };
    format!("{}/hub/agent", ws.trim_end_matches('/'))
}

/// Run the hub connection until `shutdown` fires.
///
/// Reconnects forever with capped exponential backoff and re-registers the
/// device after every successful connect.
pub async fn run<O: PortOpener>(
    runtime: Arc<AgentRuntime<O>>,
    mut outgoing_rx: mpsc::UnboundedReceiver<AgentMessage>,
    server_url: String,
    mut shutdown: watch::Receiver<bool>,
) {
    let endpoint = agent_endpoint(&server_url);
    let mut backoff = INITIAL_BACKOFF;

    loop {
        if *shutdown.borrow() {
            return;
        }
        log::info!("connecting to hub at {endpoint}");
        match connection_session(&runtime, &mut outgoing_rx, &endpoint, &mut shutdown).await {
            Ok(SessionOutcome::Shutdown) => {
                log::info!("hub connection closing for shutdown");
                return;
            }
            Ok(SessionOutcome::Disconnected) => {
                backoff = INITIAL_BACKOFF;
                log::warn!("hub connection lost; reconnecting in {backoff:?}");
            }
            Err(e) => {
                log::warn!("hub connection failed: {e:#}; retrying in {backoff:?}");
            }
        }

        tokio::select! {
            () = tokio::time::sleep(backoff) => {}
            _ = shutdown.changed() => return,
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

enum SessionOutcome {
    Disconnected,
    Shutdown,
}

async fn connection_session<O: PortOpener>(
    runtime: &Arc<AgentRuntime<O>>,
    outgoing_rx: &mut mpsc::UnboundedReceiver<AgentMessage>,
    endpoint: &str,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<SessionOutcome> {
    let (ws, _response) = tokio_tungstenite::connect_async(endpoint)
        .await
        .context("websocket connect failed")?;
    let (mut sink, mut stream) = ws.split();

    // (re)announce identity before anything else flows
    let register = AgentMessage::RegisterDevice {
        device_id: runtime.device_id().to_string(),
    };
    let frame = serde_json::to_string(&register)?;
    sink.send(tungstenite::Message::Text(frame))
        .await
        .context("device registration failed")?;
    log::info!("registered as device {}", runtime.device_id());

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                let _ = sink.send(tungstenite::Message::Close(None)).await;
                return Ok(SessionOutcome::Shutdown);
            }
            outgoing = outgoing_rx.recv() => {
                let Some(message) = outgoing else {
                    return Ok(SessionOutcome::Shutdown);
                };
                let frame = serde_json::to_string(&message)?;
                if sink.send(tungstenite::Message::Text(frame)).await.is_err() {
                    return Ok(SessionOutcome::Disconnected);
                }
            }
            inbound = stream.next() => match inbound {
                Some(Ok(tungstenite::Message::Text(text))) => {
                    match serde_json::from_str::<ServerCommand>(&text) {
                        Ok(command) => {
                            let runtime = Arc::clone(runtime);
                            tokio::spawn(async move {
                                runtime.handle_command(command).await;
                            });
                        }
                        Err(e) => log::warn!("undecodable hub command skipped: {e}"),
                    }
                }
                Some(Ok(tungstenite::Message::Ping(_) | tungstenite::Message::Pong(_))) => {}
                Some(Ok(tungstenite::Message::Close(_))) | None => {
                    return Ok(SessionOutcome::Disconnected);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::warn!("hub read error: {e}");
                    return Ok(SessionOutcome::Disconnected);
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AutoHangupSettings;
    use anyhow::Result;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::DuplexStream;

    #[test]
    fn test_agent_endpoint_scheme_mapping() {
        assert_eq!(agent_endpoint("http://localhost:5000"), "ws://localhost:5000/hub/agent");
        assert_eq!(agent_endpoint("https://fleet.example.com/"), "wss://fleet.example.com/hub/agent");
        assert_eq!(agent_endpoint("ws://host:1"), "ws://host:1/hub/agent");
    }

    struct NoPortsOpener {
        opens: AtomicUsize,
    }

    impl PortOpener for NoPortsOpener {
        type Stream = DuplexStream;

        fn open(&self, port: &str, _baud: u32) -> Result<DuplexStream> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("no device on {port}")
        }

        fn enumerate(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
    }

    fn test_config() -> AgentConfig {
        AgentConfig {
            server_url: "http://localhost:5000".into(),
            device_id: "edge-01".into(),
            baud_rates: vec![115_200],
            auto_start_on_scan: false,
            auto_hangup: AutoHangupSettings::default(),
        }
    }

    #[tokio::test]
    async fn test_commands_for_other_devices_are_ignored() {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let runtime = AgentRuntime::new(
            &test_config(),
            Arc::new(NoPortsOpener {
                opens: AtomicUsize::new(0),
            }),
            out_tx,
        )
        .await;

        runtime
            .handle_command(ServerCommand::ScanComPorts {
                device_id: "someone-else".into(),
            })
            .await;
        assert!(out_rx.try_recv().is_err(), "ignored command produced output");
    }

    #[tokio::test]
    async fn test_scan_command_emits_ack_completion_and_result() {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let runtime = AgentRuntime::new(
            &test_config(),
            Arc::new(NoPortsOpener {
                opens: AtomicUsize::new(0),
            }),
            out_tx,
        )
        .await;

        // empty device id targets every agent
        runtime
            .handle_command(ServerCommand::ScanComPorts {
                device_id: String::new(),
            })
            .await;

        let mut messages = Vec::new();
        while let Ok(m) = out_rx.try_recv() {
            messages.push(m);
        }
        assert!(matches!(
            messages[0],
            AgentMessage::SendScanAcknowledgment { .. }
        ));
        assert!(matches!(
            messages[messages.len() - 2],
            AgentMessage::SendComPortScanCompleted { .. }
        ));
        match &messages[messages.len() - 1] {
            AgentMessage::SendComPortScanResult { scan_result, .. } => {
                assert!(scan_result.success);
                assert!(scan_result.ports.is_empty());
            }
            other => panic!("expected scan result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_command_reports_failure_result() {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let runtime = AgentRuntime::new(
            &test_config(),
            Arc::new(NoPortsOpener {
                opens: AtomicUsize::new(0),
            }),
            out_tx,
        )
        .await;

        runtime
            .handle_command(ServerCommand::SendSms {
                device_id: "edge-01".into(),
                com_port: "COM9".into(),
                target_number: "+15550001111".into(),
                message_content: "hi".into(),
                record_id: "r-77".into(),
            })
            .await;

        let result = out_rx.try_recv().expect("no send result emitted");
        match result {
            AgentMessage::SendSmsResult {
                record_id,
                status,
                error_message,
            } => {
                assert_eq!(record_id, "r-77");
                assert_eq!(status, "Failed");
                assert!(error_message.unwrap().contains("COM9"));
            }
            other => panic!("expected SendSmsResult, got {other:?}"),
        }
    }
}
