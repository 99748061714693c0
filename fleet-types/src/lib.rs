//! Shared wire types for the GSM modem fleet gateway.
//!
//! Everything that crosses the hub websocket or the HTTP boundary is
//! defined here so the agent and the server cannot drift apart. All JSON
//! payloads use lowerCamelCase field names.

pub mod hub;
pub mod port;
pub mod sms;

pub use hub::{AgentMessage, ClientEvent, ServerCommand};
pub use port::{ModemInfo, PortInfo, ScanResult, SignalQuality};
pub use sms::{CallHangupDto, HangupReason, ListenerPort, SmsReceivedDto, SmsSendStatus};
