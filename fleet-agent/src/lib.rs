//! Fleet agent library: serial GSM modem driver plus hub client.
//!
//! The binary in `main.rs` wires these modules together; they are exposed
//! as a library so integration tests can drive the full driver stack
//! against scripted in-memory modems.

pub mod at;
pub mod config;
pub mod hub_client;
pub mod receiver;
pub mod scanner;
pub mod sender;
pub mod session;
pub mod ucs2;

pub use config::AgentConfig;
pub use hub_client::AgentRuntime;
pub use receiver::{AutoHangupConfig, SmsReceiver};
pub use scanner::ComPortScanner;
pub use sender::SmsSender;
pub use session::{CommandLocks, PortArbiter, PortOpener, SerialOpener};
pub use ucs2::decode_ucs2_if_needed;
