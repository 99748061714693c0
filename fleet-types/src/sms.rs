//! SMS and call-hangup event payloads emitted by the agent-side receiver.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An inbound SMS decoded by a listening port.
#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct SmsReceivedDto {
    /// Device that received the message.
    pub device_id: String,

    /// Port the message arrived on.
    pub com_port: String,

    /// Sender number as reported by the modem.
    pub sender_number: String,

    /// Decoded message body (UTF-8; UCS2 payloads already decoded).
    pub message_content: String,

    /// When the agent ingested the message (UTC).
    pub received_time: DateTime<Utc>,

    /// Raw AT timestamp string (`YY/MM/DD,HH:MM:SS+TZ`), when present.
    pub sms_timestamp: Option<String>,
}

/// Why a call ended.
#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone, Copy)]
pub enum HangupReason {
    /// The agent hung the call up by policy.
    AutoHangup,
    /// An operator hung the call up.
    Manual,
    /// Could not be determined.
    Unknown,
}

/// A call-hangup event emitted by a listening port.
#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CallHangupDto {
    /// Device that observed the call.
    pub device_id: String,

    /// Port the call rang on.
    pub com_port: String,

    /// Caller id from `+CLIP`, when it arrived in time.
    pub caller_number: Option<String>,

    /// When the hangup was performed (UTC).
    pub hangup_time: DateTime<Utc>,

    /// What ended the call.
    pub reason: HangupReason,

    /// Best-effort raw buffer tail around the event, for diagnostics.
    pub raw_line: Option<String>,
}

/// Outcome of a single SMS send attempt. The gateway performs exactly one
/// AT-level attempt; retrying lives above this layer.
#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone, Copy)]
pub enum SmsSendStatus {
    /// `+CMGS:` and `OK` observed.
    Success,
    /// `ERROR` or `+CMS ERROR` observed, or the dialog timed out.
    Failed,
}

impl SmsSendStatus {
    /// Wire string used in `SendSmsResult`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            SmsSendStatus::Success => "Success",
            SmsSendStatus::Failed => "Failed",
        }
    }
}

/// A port the receiver should listen on, with the baud rate the scanner
/// identified it at.
#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ListenerPort {
    /// OS port name.
    pub port_name: String,

    /// Identified baud rate.
    pub baud_rate: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_sms_dto_round_trip() {
        let dto = SmsReceivedDto {
            device_id: "D1".into(),
            com_port: "COM3".into(),
            sender_number: "+8613800138000".into(),
            message_content: "hello".into(),
            received_time: Utc.with_ymd_and_hms(2026, 1, 23, 14, 30, 45).unwrap(),
            sms_timestamp: Some("26/01/23,14:30:45+32".into()),
        };
        let json = serde_json::to_string(&dto).unwrap();
        assert!(json.contains("\"senderNumber\""));
        assert!(json.contains("\"smsTimestamp\""));
        let back: SmsReceivedDto = serde_json::from_str(&json).unwrap();
        assert_eq!(back, dto);
    }

    #[test]
    fn test_hangup_reason_wire_name() {
        let dto = CallHangupDto {
            device_id: "D1".into(),
            com_port: "COM5".into(),
            caller_number: Some("+16660002222".into()),
            hangup_time: Utc::now(),
            reason: HangupReason::AutoHangup,
            raw_line: None,
        };
        let json = serde_json::to_string(&dto).unwrap();
        assert!(json.contains("\"reason\":\"AutoHangup\""));
    }
}
