//! SMS send transaction.
//!
//! A send pauses the listener on the target port (through the arbiter, so
//! resume is guaranteed), opens or reuses a cached handle, runs the
//! `AT+CMGS` dialog, and reports the outcome of exactly one attempt.
//! Retrying lives above this layer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use fleet_types::SmsSendStatus;

use crate::at;
use crate::session::{normalize_port, PortArbiter, PortOpener};

/// Baud rate used for send transactions.
const SEND_BAUD_RATE: u32 = 115_200;

/// Wait after pausing a listener so the kernel releases the handle.
const HANDLE_RELEASE_DELAY: Duration = Duration::from_secs(1);

/// Wait after a fresh open before the init sequence.
const OPEN_SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Gap between init commands.
const INIT_COMMAND_GAP: Duration = Duration::from_millis(300);

/// Budget for the `>` prompt after `AT+CMGS`.
const PROMPT_TIMEOUT: Duration = Duration::from_secs(10);

/// Budget for the `+CMGS`/`OK` confirmation after Ctrl-Z.
const CONFIRM_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of one send attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOutcome {
    /// Whether the modem confirmed the send.
    pub ok: bool,
    /// Error description when `ok` is false.
    pub error_message: Option<String>,
}

impl SendOutcome {
    fn success() -> Self {
        Self {
            ok: true,
            error_message: None,
        }
    }

    fn failure(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error_message: Some(message.into()),
        }
    }

    /// Wire status for `SendSmsResult`.
    #[must_use]
    pub fn status(&self) -> SmsSendStatus {
        if self.ok {
            SmsSendStatus::Success
        } else {
            SmsSendStatus::Failed
        }
    }
}

/// Sender with a per-port handle cache.
pub struct SmsSender<O: PortOpener> {
    opener: Arc<O>,
    arbiter: Arc<PortArbiter>,
    cache: Mutex<HashMap<String, O::Stream>>,
}

impl<O: PortOpener> SmsSender<O> {
    /// Create a sender that arbitrates port access through `arbiter`.
    pub fn new(opener: Arc<O>, arbiter: Arc<PortArbiter>) -> Self {
        Self {
            opener,
            arbiter,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Perform one send transaction on `com_port`.
    pub async fn send_sms(&self, com_port: &str, target_number: &str, content: &str) -> SendOutcome {
        if com_port.trim().is_empty() {
            return SendOutcome::failure("COM port must not be empty");
        }
        if target_number.trim().is_empty() {
            return SendOutcome::failure("target number must not be empty");
        }
        if content.is_empty() {
            return SendOutcome::failure("message content must not be empty");
        }

        let token = self.arbiter.pause(com_port).await;
        if token.was_listening() {
            // give the kernel time to fully release the listener's handle
            tokio::time::sleep(HANDLE_RELEASE_DELAY).await;
        }

        let key = normalize_port(com_port);
        let cached = self.cache.lock().await.remove(&key);
        let (mut stream, fresh) = match cached {
            Some(s) => (s, false),
            None => match self.opener.open(com_port, SEND_BAUD_RATE) {
                Ok(s) => (s, true),
                Err(e) => {
                    let outcome =
                        SendOutcome::failure(format!("failed to open {com_port}: {e:#}"));
                    self.arbiter.resume(token).await;
                    return outcome;
                }
            },
        };
        if fresh {
            tokio::time::sleep(OPEN_SETTLE_DELAY).await;
        }

        let outcome = transact(&mut stream, com_port, target_number, content).await;

        if token.was_listening() {
            // the listener reopens this port on resume; a cached handle
            // would collide with it
            drop(stream);
        } else {
            self.cache.lock().await.insert(key, stream);
        }
        self.arbiter.resume(token).await;
        outcome
    }

    /// Drop all cached handles (shutdown path).
    pub async fn release_ports(&self) {
        self.cache.lock().await.clear();
    }
}

/// The `AT+CMGS` dialog on an already-open port.
async fn transact<S>(stream: &mut S, com_port: &str, target_number: &str, content: &str) -> SendOutcome
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // init; the bare AT check is warn-only
    match at::request(stream, "AT", at::COMMAND_TIMEOUT).await {
        Ok(r) if at::has_terminator(&r) => {}
        Ok(_) => log::warn!("{com_port}: modem did not answer AT before send"),
        Err(e) => return SendOutcome::failure(format!("port write failed: {e:#}")),
    }
    tokio::time::sleep(INIT_COMMAND_GAP).await;

    for cmd in ["ATE0", "AT+CMGF=1", "AT+CSCS=\"UCS2\""] {
        match at::request(stream, cmd, at::COMMAND_TIMEOUT).await {
            Ok(r) if at::has_terminator(&r) && !at::has_error(&r) => {}
            Ok(r) => log::warn!("{com_port}: init {cmd} answered {:?}", r.trim()),
            Err(e) => return SendOutcome::failure(format!("init {cmd} failed: {e:#}")),
        }
        tokio::time::sleep(INIT_COMMAND_GAP).await;
    }

    if !content.is_ascii() {
        // the content goes out as raw bytes under CSCS="UCS2"; modems that
        // expect hex-encoded UCS2 will garble this
        log::warn!("{com_port}: non-ASCII SMS content sent raw; may arrive garbled");
    }

    drain_input(stream).await;

    let cmgs = format!("AT+CMGS=\"{target_number}\"\r");
    if let Err(e) = stream.write_all(cmgs.as_bytes()).await {
        return SendOutcome::failure(format!("AT+CMGS write failed: {e}"));
    }
    let _ = stream.flush().await;

    match await_prompt(stream).await {
        PromptResult::Prompt => {}
        PromptResult::Error(text) => {
            return SendOutcome::failure(format!("modem rejected AT+CMGS: {text}"));
        }
        PromptResult::Timeout => {
            return SendOutcome::failure("timed out waiting for > prompt");
        }
    }

    let mut payload = content.as_bytes().to_vec();
    payload.push(0x1A);
    if let Err(e) = stream.write_all(&payload).await {
        return SendOutcome::failure(format!("message body write failed: {e}"));
    }
    let _ = stream.flush().await;

    let response = at::collect_response(stream, CONFIRM_TIMEOUT).await;
    if response.contains("+CMGS:") && response.contains("OK") {
        if let Some(reference) = parse_cmgs_reference(&response) {
            log::info!("{com_port}: SMS accepted, message reference {reference}");
        }
        SendOutcome::success()
    } else if at::has_error(&response) {
        SendOutcome::failure(format!("modem reported send error: {}", response.trim()))
    } else {
        SendOutcome::failure("timed out waiting for +CMGS confirmation")
    }
}

enum PromptResult {
    Prompt,
    Error(String),
    Timeout,
}

/// Wait for the `>` prompt, aborting early on an error terminator.
async fn await_prompt<S>(stream: &mut S) -> PromptResult
where
    S: AsyncRead + Unpin,
{
    let mut collected = String::new();
    let mut buf = [0u8; 256];
    let deadline = tokio::time::Instant::now() + PROMPT_TIMEOUT;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return PromptResult::Timeout;
        }
        match tokio::time::timeout(remaining.min(at::POLL_INTERVAL), stream.read(&mut buf)).await {
            Ok(Ok(0)) => return PromptResult::Timeout,
            Ok(Ok(n)) => {
                collected.push_str(&String::from_utf8_lossy(&buf[..n]));
                if at::has_error(&collected) {
                    return PromptResult::Error(collected.trim().to_string());
                }
                if collected.contains('>') {
                    return PromptResult::Prompt;
                }
            }
            Ok(Err(_)) => return PromptResult::Timeout,
            Err(_) => {}
        }
    }
}

/// Discard whatever is sitting in the input buffer.
async fn drain_input<S>(stream: &mut S)
where
    S: AsyncRead + Unpin,
{
    let mut buf = [0u8; 512];
    while let Ok(Ok(n)) = tokio::time::timeout(Duration::from_millis(10), stream.read(&mut buf)).await
    {
        if n == 0 {
            break;
        }
    }
}

/// Message reference from a `+CMGS: <mr>` line.
fn parse_cmgs_reference(response: &str) -> Option<u32> {
    let after = response.split("+CMGS:").nth(1)?;
    let digits: String = after
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}
