//! Serial port ownership and arbitration.
//!
//! At any instant at most one of {scan probe, receive listener, send
//! transaction, auto-hangup write} touches a given port. Two mechanisms
//! enforce that:
//!
//! - a per-port command mutex ([`CommandLocks`]) serializing writes from
//!   the listener's stored-SMS handling and the auto-hangup task;
//! - the [`PortArbiter`], which lets the sender pause the listener (the
//!   listener closes its OS handle), run with exclusive port access, and
//!   is guaranteed to resume the listener on every exit path.
//!
//! The arbiter talks to the receiver through the [`ListenerPauser`] trait
//! so the sender never depends on the receiver directly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_serial::{DataBits, FlowControl, Parity, SerialPort, SerialPortBuilderExt, SerialStream, StopBits};

/// Read timeout applied while a listener owns the port.
pub const LISTEN_READ_TIMEOUT: Duration = Duration::from_millis(1500);

/// Write timeout for all port writes.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(3);

/// Normalize a port name for map keys and comparisons.
#[must_use]
pub fn normalize_port(name: &str) -> String {
    name.trim().to_ascii_uppercase()
}

/// Something that can open serial ports and enumerate them.
///
/// The production implementation wraps `tokio-serial`; tests substitute
/// in-memory duplex streams so modem conversations can be scripted.
pub trait PortOpener: Send + Sync + 'static {
    /// Concrete stream type produced by [`PortOpener::open`].
    type Stream: AsyncRead + AsyncWrite + Send + Unpin + 'static;

    /// Open `port_name` at `baud_rate`, 8-N-1, DTR and RTS asserted.
    fn open(&self, port_name: &str, baud_rate: u32) -> Result<Self::Stream>;

    /// All serial port names, in OS enumeration order.
    fn enumerate(&self) -> Result<Vec<String>>;
}

/// Production opener backed by `tokio-serial`.
#[derive(Debug, Clone, Default)]
pub struct SerialOpener;

impl PortOpener for SerialOpener {
    type Stream = SerialStream;

    fn open(&self, port_name: &str, baud_rate: u32) -> Result<SerialStream> {
        let mut stream = tokio_serial::new(port_name, baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(LISTEN_READ_TIMEOUT)
            .open_native_async()
            .with_context(|| format!("failed to open {port_name} at {baud_rate}"))?;

        stream
            .write_data_terminal_ready(true)
            .with_context(|| format!("failed to assert DTR on {port_name}"))?;
        stream
            .write_request_to_send(true)
            .with_context(|| format!("failed to assert RTS on {port_name}"))?;

        Ok(stream)
    }

    fn enumerate(&self) -> Result<Vec<String>> {
        let ports = tokio_serial::available_ports().context("serial enumeration failed")?;
        Ok(ports.into_iter().map(|p| p.port_name).collect())
    }
}

/// Per-port command mutexes, handed to the listener and the auto-hangup
/// task so their writes never interleave.
#[derive(Debug, Clone, Default)]
pub struct CommandLocks {
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl CommandLocks {
    /// Create an empty lock registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The command mutex for `port_name`, created on first use.
    pub async fn for_port(&self, port_name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(
            locks
                .entry(normalize_port(port_name))
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }
}

/// Pause/resume surface the receiver exposes to the arbiter.
#[async_trait]
pub trait ListenerPauser: Send + Sync {
    /// Ask the listener on `port_name` to release its port. Returns true
    /// when a listener was actually paused (and must be resumed later).
    async fn pause_listening(&self, port_name: &str) -> bool;

    /// Reopen and re-initialize the listener on `port_name`. Returns true
    /// when a paused listener was resumed.
    async fn resume_listening(&self, port_name: &str) -> bool;
}

/// Proof that a port's listener was paused; redeemed by the arbiter.
#[derive(Debug)]
pub struct PauseToken {
    port_name: String,
    was_listening: bool,
}

impl PauseToken {
    /// Whether a listener actually released the port for this token.
    #[must_use]
    pub fn was_listening(&self) -> bool {
        self.was_listening
    }
}

/// Arbiter giving the sender exclusive access to a port while guaranteeing
/// the listener comes back afterwards.
#[derive(Default)]
pub struct PortArbiter {
    pauser: Mutex<Option<Arc<dyn ListenerPauser>>>,
}

impl PortArbiter {
    /// Create an arbiter with no receiver attached yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the receiver's pause/resume surface. Called once the
    /// receiver exists; until then pause requests are no-ops.
    pub async fn set_pauser(&self, pauser: Arc<dyn ListenerPauser>) {
        *self.pauser.lock().await = Some(pauser);
    }

    /// Pause the listener on `port_name`, returning a token that must be
    /// passed back to [`PortArbiter::resume`].
    pub async fn pause(&self, port_name: &str) -> PauseToken {
        let was_listening = match self.pauser.lock().await.as_ref() {
            Some(pauser) => pauser.pause_listening(port_name).await,
            None => false,
        };
        PauseToken {
            port_name: port_name.to_string(),
            was_listening,
        }
    }

    /// Resume the listener paused by `token`, when one was paused.
    pub async fn resume(&self, token: PauseToken) {
        if !token.was_listening {
            return;
        }
        match self.pauser.lock().await.as_ref() {
            Some(pauser) => {
                if !pauser.resume_listening(&token.port_name).await {
                    log::warn!(
                        "listener on {} did not resume after exclusive access",
                        token.port_name
                    );
                }
            }
            None => log::warn!(
                "no pauser attached while resuming {}; listener stays down",
                token.port_name
            ),
        }
    }
}

impl std::fmt::Debug for PortArbiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortArbiter").finish_non_exhaustive()
    }
}
