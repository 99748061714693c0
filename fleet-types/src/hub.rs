//! Hub wire protocol.
//!
//! Named messages, bidirectional, one JSON object per websocket text
//! frame, tagged by `type` with the payload under `data`. Three directions:
//! agent to server ([`AgentMessage`]), server to agent ([`ServerCommand`]),
//! and server to browser clients ([`ClientEvent`]).

use serde::{Deserialize, Serialize};

use crate::port::{PortInfo, ScanResult};
use crate::sms::{CallHangupDto, ListenerPort, SmsReceivedDto};

/// Messages an agent sends up to the server.
#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
#[serde(tag = "type", content = "data")]
pub enum AgentMessage {
    /// Bind this connection to a device id. Sent after every (re)connect.
    RegisterDevice {
        /// Agent identity.
        #[serde(rename = "deviceId")]
        device_id: String,
    },

    /// A scan command was accepted and is starting.
    SendScanAcknowledgment {
        #[serde(rename = "deviceId")]
        device_id: String,
        /// Free-form status text for the UI.
        message: String,
    },

    /// Incremental scan emission; sent twice per identified modem.
    SendComPortFound {
        #[serde(rename = "deviceId")]
        device_id: String,
        port: PortInfo,
    },

    /// Full scan result, sent once after completion.
    SendComPortScanResult {
        #[serde(rename = "deviceId")]
        device_id: String,
        #[serde(rename = "scanResult")]
        scan_result: ScanResult,
    },

    /// Scan finished marker with an ISO-8601 completion time.
    SendComPortScanCompleted {
        #[serde(rename = "deviceId")]
        device_id: String,
        #[serde(rename = "completedTime")]
        completed_time: String,
    },

    /// An inbound SMS was decoded.
    SendSmsReceived {
        #[serde(rename = "deviceId")]
        device_id: String,
        sms: SmsReceivedDto,
    },

    /// A call was hung up (or observed ending).
    SendCallHangupRecord {
        #[serde(rename = "deviceId")]
        device_id: String,
        hangup: CallHangupDto,
    },

    /// Outcome of a `SendSms` command.
    SendSmsResult {
        #[serde(rename = "recordId")]
        record_id: String,
        /// `"Success"` or `"Failed"`.
        status: String,
        #[serde(rename = "errorMessage")]
        error_message: Option<String>,
    },
}

/// Commands the server routes down to one agent.
///
/// An empty `deviceId` addresses whichever agent receives the frame; agents
/// ignore commands addressed to someone else.
#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
#[serde(tag = "type", content = "data")]
pub enum ServerCommand {
    /// Enumerate and probe all serial ports.
    ScanComPorts {
        #[serde(rename = "deviceId")]
        device_id: String,
    },

    /// Start SMS listeners on the given ports.
    StartSmsReceiver {
        #[serde(rename = "deviceId")]
        device_id: String,
        ports: Vec<ListenerPort>,
    },

    /// Stop all SMS listeners.
    StopSmsReceiver {
        #[serde(rename = "deviceId")]
        device_id: String,
    },

    /// Perform one SMS send transaction.
    SendSms {
        #[serde(rename = "deviceId")]
        device_id: String,
        #[serde(rename = "comPort")]
        com_port: String,
        #[serde(rename = "targetNumber")]
        target_number: String,
        #[serde(rename = "messageContent")]
        message_content: String,
        #[serde(rename = "recordId")]
        record_id: String,
    },
}

impl ServerCommand {
    /// Whether an agent with `device_id` should act on this command.
    #[must_use]
    pub fn targets(&self, device_id: &str) -> bool {
        let target = match self {
            ServerCommand::ScanComPorts { device_id }
            | ServerCommand::StartSmsReceiver { device_id, .. }
            | ServerCommand::StopSmsReceiver { device_id }
            | ServerCommand::SendSms { device_id, .. } => device_id,
        };
        target.is_empty() || target.eq_ignore_ascii_case(device_id)
    }
}

/// Broadcasts fanned out to every connected browser client.
#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
#[serde(tag = "type", content = "data")]
pub enum ClientEvent {
    /// An agent registered its device id.
    DeviceConnected {
        #[serde(rename = "deviceId")]
        device_id: String,
    },

    /// An agent connection dropped.
    DeviceDisconnected {
        #[serde(rename = "deviceId")]
        device_id: String,
    },

    /// An agent acknowledged a scan command.
    ScanAcknowledged {
        #[serde(rename = "deviceId")]
        device_id: String,
        message: String,
    },

    /// Incremental scan emission relay.
    ComPortFound {
        #[serde(rename = "deviceId")]
        device_id: String,
        port: PortInfo,
    },

    /// Scan finished relay.
    ComPortScanCompleted {
        #[serde(rename = "deviceId")]
        device_id: String,
        #[serde(rename = "completedTime")]
        completed_time: String,
    },

    /// A persisted inbound SMS.
    SmsReceived {
        #[serde(rename = "deviceId")]
        device_id: String,
        sms: SmsReceivedDto,
    },

    /// A persisted call-hangup record.
    CallHangupRecord {
        #[serde(rename = "deviceId")]
        device_id: String,
        hangup: CallHangupDto,
    },

    /// Outcome relay for a send command.
    SmsSendResult {
        #[serde(rename = "recordId")]
        record_id: String,
        status: String,
        #[serde(rename = "errorMessage")]
        error_message: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_device_frame_shape() {
        let msg = AgentMessage::RegisterDevice {
            device_id: "edge-01".into(),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(
            json,
            r#"{"type":"RegisterDevice","data":{"deviceId":"edge-01"}}"#
        );
    }

    #[test]
    fn test_command_targeting() {
        let cmd = ServerCommand::ScanComPorts {
            device_id: String::new(),
        };
        assert!(cmd.targets("anyone"));

        let cmd = ServerCommand::StopSmsReceiver {
            device_id: "Edge-01".into(),
        };
        assert!(cmd.targets("edge-01"));
        assert!(!cmd.targets("edge-02"));
    }

    #[test]
    fn test_send_sms_command_round_trip() {
        let frame = r#"{"type":"SendSms","data":{"deviceId":"D1","comPort":"COM5",
            "targetNumber":"+15550001111","messageContent":"hi","recordId":"r-1"}}"#;
        let cmd: ServerCommand = serde_json::from_str(frame).unwrap();
        match cmd {
            ServerCommand::SendSms {
                com_port, record_id, ..
            } => {
                assert_eq!(com_port, "COM5");
                assert_eq!(record_id, "r-1");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
