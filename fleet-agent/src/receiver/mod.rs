//! SMS receiver: per-port URC listeners with auto-hangup.
//!
//! Each listening port runs one task that owns the serial stream. The
//! task splits the stream; the read half feeds the URC buffer, the write
//! half is shared (behind the per-port command mutex) with spawned
//! auto-hangup tasks. Pausing a listener drops both halves so the OS
//! handle is closed before a send transaction opens the port; resuming
//! reopens and replays the init sequence.

pub mod urc;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, Mutex};

use fleet_types::{CallHangupDto, HangupReason, ListenerPort, SmsReceivedDto};

use crate::at;
use crate::session::{normalize_port, CommandLocks, ListenerPauser, PortOpener};
use crate::ucs2::decode_ucs2_if_needed;
use urc::{CmtScan, CALL_FRAGMENT_WATERMARK, CMT_WATERMARK};

/// How long a cached `+CLIP` caller id stays resolvable.
const CLIP_CACHE_TTL: Duration = Duration::from_secs(120);

/// Gap between init-sequence commands.
const INIT_COMMAND_GAP: Duration = Duration::from_millis(200);

/// Budget for reading back a stored message (`AT+CMGR` / `AT+CMGL`).
const STORED_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Cap applied to each diagnostic fragment attached to hangup events.
const RAW_LINE_CAP: usize = 512;

/// Auto-hangup policy for inbound calls.
#[derive(Debug, Clone)]
pub struct AutoHangupConfig {
    /// Whether inbound calls are hung up at all.
    pub enabled: bool,
    /// Delay between detection and the hangup write.
    pub hangup_delay: Duration,
    /// Minimum spacing between hangups on one port.
    pub cooldown: Duration,
    /// Case-insensitive substrings; matching callers are never hung up.
    pub whitelist: Vec<String>,
}

impl Default for AutoHangupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            hangup_delay: Duration::from_millis(200),
            cooldown: Duration::from_secs(5),
            whitelist: Vec::new(),
        }
    }
}

impl AutoHangupConfig {
    fn is_whitelisted(&self, caller: &str) -> bool {
        let caller = caller.to_lowercase();
        self.whitelist
            .iter()
            .any(|entry| !entry.is_empty() && caller.contains(&entry.to_lowercase()))
    }
}

/// Per-port mutable state shared between the listener and hangup tasks.
#[derive(Debug, Default)]
struct UrcState {
    /// Last `+CLIP` caller with when it was seen.
    last_clip: Option<(String, Instant)>,
    /// Last completed hangup, for the cooldown window.
    last_hangup: Option<Instant>,
    /// Tail of the URC buffer at the last append.
    last_tail: String,
    /// Last raw chunk read from the port.
    last_chunk: String,
}

impl UrcState {
    fn cached_caller(&self) -> Option<String> {
        self.last_clip
            .as_ref()
            .filter(|(_, at)| at.elapsed() < CLIP_CACHE_TTL)
            .map(|(caller, _)| caller.clone())
    }
}

enum ListenerControl {
    Pause(oneshot::Sender<bool>),
    Resume(oneshot::Sender<bool>),
    Stop,
}

struct ListenerEntry {
    control: mpsc::UnboundedSender<ListenerControl>,
    task: tokio::task::JoinHandle<()>,
}

/// Receiver managing all listening ports of one agent.
pub struct SmsReceiver<O: PortOpener> {
    device_id: String,
    opener: Arc<O>,
    locks: CommandLocks,
    hangup: AutoHangupConfig,
    sms_tx: mpsc::UnboundedSender<SmsReceivedDto>,
    hangup_tx: mpsc::UnboundedSender<CallHangupDto>,
    listeners: Arc<Mutex<HashMap<String, ListenerEntry>>>,
}

impl<O: PortOpener> SmsReceiver<O> {
    /// Create a receiver. Event sinks are required up front; a receiver
    /// with nowhere to deliver events is a configuration error.
    pub fn new(
        device_id: String,
        opener: Arc<O>,
        locks: CommandLocks,
        hangup: AutoHangupConfig,
        sms_tx: mpsc::UnboundedSender<SmsReceivedDto>,
        hangup_tx: mpsc::UnboundedSender<CallHangupDto>,
    ) -> Self {
        Self {
            device_id,
            opener,
            locks,
            hangup,
            sms_tx,
            hangup_tx,
            listeners: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// A cloneable pause/resume handle for the [`crate::session::PortArbiter`].
    #[must_use]
    pub fn handle(&self) -> ReceiverHandle {
        ReceiverHandle {
            listeners: Arc::clone(&self.listeners),
        }
    }

    /// Start listeners on `ports`. Ports that already have a listener are
    /// skipped (logged), so repeated start commands are harmless.
    pub async fn start_listening(&self, ports: &[ListenerPort]) {
        for port in ports {
            let key = normalize_port(&port.port_name);
            let mut listeners = self.listeners.lock().await;
            if listeners.contains_key(&key) {
                log::info!("listener already running on {}; ignoring start", port.port_name);
                continue;
            }

            let (control_tx, control_rx) = mpsc::unbounded_channel();
            let ctx = ListenerCtx {
                device_id: self.device_id.clone(),
                port_name: port.port_name.clone(),
                baud_rate: port.baud_rate,
                opener: Arc::clone(&self.opener),
                cmd_lock: self.locks.for_port(&port.port_name).await,
                hangup: self.hangup.clone(),
                sms_tx: self.sms_tx.clone(),
                hangup_tx: self.hangup_tx.clone(),
            };
            let task = tokio::spawn(run_listener(ctx, control_rx));
            listeners.insert(
                key,
                ListenerEntry {
                    control: control_tx,
                    task,
                },
            );
            log::info!(
                "started SMS listener on {} at {} baud",
                port.port_name,
                port.baud_rate
            );
        }
    }

    /// Signal all listeners to stop without waiting.
    pub async fn stop(&self) {
        let listeners = self.listeners.lock().await;
        for (port, entry) in listeners.iter() {
            if entry.control.send(ListenerControl::Stop).is_err() {
                log::debug!("listener on {port} already gone");
            }
        }
    }

    /// Stop all listeners and wait until every port is released.
    pub async fn stop_listening(&self) {
        let entries: Vec<(String, ListenerEntry)> = {
            let mut listeners = self.listeners.lock().await;
            listeners.drain().collect()
        };
        for (port, entry) in entries {
            let _ = entry.control.send(ListenerControl::Stop);
            if let Err(e) = entry.task.await {
                log::warn!("listener task on {port} ended abnormally: {e}");
            }
        }
        log::info!("all SMS listeners stopped");
    }
}

/// Cloneable pause/resume surface over the listener map.
#[derive(Clone)]
pub struct ReceiverHandle {
    listeners: Arc<Mutex<HashMap<String, ListenerEntry>>>,
}

#[async_trait]
impl ListenerPauser for ReceiverHandle {
    async fn pause_listening(&self, port_name: &str) -> bool {
        let (ack_tx, ack_rx) = oneshot::channel();
        {
            let listeners = self.listeners.lock().await;
            let Some(entry) = listeners.get(&normalize_port(port_name)) else {
                return false;
            };
            if entry.control.send(ListenerControl::Pause(ack_tx)).is_err() {
                return false;
            }
        }
        ack_rx.await.unwrap_or(false)
    }

    async fn resume_listening(&self, port_name: &str) -> bool {
        let (ack_tx, ack_rx) = oneshot::channel();
        {
            let listeners = self.listeners.lock().await;
            let Some(entry) = listeners.get(&normalize_port(port_name)) else {
                return false;
            };
            if entry.control.send(ListenerControl::Resume(ack_tx)).is_err() {
                return false;
            }
        }
        ack_rx.await.unwrap_or(false)
    }
}

struct ListenerCtx<O: PortOpener> {
    device_id: String,
    port_name: String,
    baud_rate: u32,
    opener: Arc<O>,
    cmd_lock: Arc<Mutex<()>>,
    hangup: AutoHangupConfig,
    sms_tx: mpsc::UnboundedSender<SmsReceivedDto>,
    hangup_tx: mpsc::UnboundedSender<CallHangupDto>,
}

enum SessionEnd {
    /// Pause requested; the ack fires once the handle is fully released.
    Paused(oneshot::Sender<bool>),
    Stopped,
    Disconnected,
}

/// One listener task: open, init, read URCs; pause and resume on demand.
async fn run_listener<O: PortOpener>(
    ctx: ListenerCtx<O>,
    mut control_rx: mpsc::UnboundedReceiver<ListenerControl>,
) {
    let state = Arc::new(Mutex::new(UrcState::default()));
    let mut pending_resume: Option<oneshot::Sender<bool>> = None;

    'session: loop {
        let mut stream = match ctx.opener.open(&ctx.port_name, ctx.baud_rate) {
            Ok(s) => s,
            Err(e) => {
                log::error!("cannot open {} for listening: {e:#}", ctx.port_name);
                if let Some(ack) = pending_resume.take() {
                    let _ = ack.send(false);
                }
                // wait before retrying so a flapping port does not spin
                match wait_retry_or_control(&mut control_rx).await {
                    RetryWait::Retry => continue 'session,
                    RetryWait::Stop => return,
                    RetryWait::Resume(ack) => {
                        pending_resume = Some(ack);
                        continue 'session;
                    }
                }
            }
        };

        initialize_sms_settings(&mut stream, &ctx.port_name).await;
        if let Some(ack) = pending_resume.take() {
            let _ = ack.send(true);
        }

        let (reader, writer) = tokio::io::split(stream);
        let writer = Arc::new(Mutex::new(Some(writer)));

        let end = listen_session(&ctx, reader, Arc::clone(&writer), Arc::clone(&state), &mut control_rx).await;

        // make sure the OS handle is fully released (the read half dropped
        // when the session returned; this drops the write half)
        *writer.lock().await = None;

        match end {
            SessionEnd::Stopped => return,
            SessionEnd::Disconnected => {
                log::warn!("listener on {} lost its port; reopening", ctx.port_name);
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            SessionEnd::Paused(ack) => {
                let _ = ack.send(true);
                log::info!("listener on {} paused, port released", ctx.port_name);
                loop {
                    match control_rx.recv().await {
                        Some(ListenerControl::Resume(ack)) => {
                            pending_resume = Some(ack);
                            continue 'session;
                        }
                        Some(ListenerControl::Pause(ack)) => {
                            // already paused
                            let _ = ack.send(true);
                        }
                        Some(ListenerControl::Stop) | None => return,
                    }
                }
            }
        }
    }
}

enum RetryWait {
    Retry,
    Stop,
    Resume(oneshot::Sender<bool>),
}

async fn wait_retry_or_control(
    control_rx: &mut mpsc::UnboundedReceiver<ListenerControl>,
) -> RetryWait {
    tokio::select! {
        () = tokio::time::sleep(Duration::from_secs(5)) => RetryWait::Retry,
        ctrl = control_rx.recv() => match ctrl {
            Some(ListenerControl::Resume(ack)) => RetryWait::Resume(ack),
            Some(ListenerControl::Pause(ack)) => {
                let _ = ack.send(false);
                RetryWait::Retry
            }
            Some(ListenerControl::Stop) | None => RetryWait::Stop,
        },
    }
}

/// Init sequence replayed on every open and resume. Failures are logged
/// and the listener attaches anyway.
async fn initialize_sms_settings<S>(stream: &mut S, port_name: &str)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    for cmd in ["ATE0", "AT+CMGF=1", "AT+CNMI=2,2,0,0,0", "AT+CSCS=\"GSM\""] {
        match at::request(stream, cmd, at::COMMAND_TIMEOUT).await {
            Ok(response) if at::has_terminator(&response) => {}
            Ok(_) => log::warn!("{port_name}: no response to init command {cmd}"),
            Err(e) => log::warn!("{port_name}: init command {cmd} failed: {e:#}"),
        }
        tokio::time::sleep(INIT_COMMAND_GAP).await;
    }
}

async fn listen_session<O: PortOpener>(
    ctx: &ListenerCtx<O>,
    mut reader: ReadHalf<O::Stream>,
    writer: Arc<Mutex<Option<WriteHalf<O::Stream>>>>,
    state: Arc<Mutex<UrcState>>,
    control_rx: &mut mpsc::UnboundedReceiver<ListenerControl>,
) -> SessionEnd {
    let mut buffer = String::new();
    let mut chunk = [0u8; 2048];

    loop {
        tokio::select! {
            ctrl = control_rx.recv() => match ctrl {
                Some(ListenerControl::Pause(ack)) => return SessionEnd::Paused(ack),
                Some(ListenerControl::Resume(ack)) => {
                    // not paused; resuming is a no-op
                    let _ = ack.send(true);
                }
                Some(ListenerControl::Stop) | None => {
                    log::info!("listener on {} stopped", ctx.port_name);
                    return SessionEnd::Stopped;
                }
            },
            read = reader.read(&mut chunk) => match read {
                Ok(0) => return SessionEnd::Disconnected,
                Ok(n) => {
                    let text = String::from_utf8_lossy(&chunk[..n]).to_string();
                    buffer.push_str(&text);
                    {
                        let mut st = state.lock().await;
                        st.last_chunk = text;
                        st.last_tail = tail_chars(&buffer, RAW_LINE_CAP);
                    }
                    process_buffer(ctx, &mut buffer, &mut reader, &writer, &state).await;
                }
                Err(e) => {
                    log::error!("read error on {}: {e}", ctx.port_name);
                    return SessionEnd::Disconnected;
                }
            },
        }
    }
}

/// Apply the URC checks, in priority order, after every append.
async fn process_buffer<O: PortOpener>(
    ctx: &ListenerCtx<O>,
    buffer: &mut String,
    reader: &mut ReadHalf<O::Stream>,
    writer: &Arc<Mutex<Option<WriteHalf<O::Stream>>>>,
    state: &Arc<Mutex<UrcState>>,
) {
    // 1. Incoming-call fragments.
    if let Some(fragment) = urc::detect_call(buffer) {
        if let Some(caller) = &fragment.caller {
            state.lock().await.last_clip = Some((caller.clone(), Instant::now()));
        }
        if ctx.hangup.enabled {
            spawn_auto_hangup(ctx, Arc::clone(writer), Arc::clone(state));
        }
        if fragment.complete_clip {
            buffer.clear();
        } else if buffer.len() > CALL_FRAGMENT_WATERMARK {
            buffer.clear();
        }
    }

    // 2. Stored-SMS notifications.
    while let Some(index) = urc::take_cmti(buffer) {
        handle_stored_sms(ctx, index, reader, writer).await;
    }

    // 3. Direct pushes.
    loop {
        match urc::take_cmt(buffer) {
            CmtScan::Parsed(sms) => emit_sms(ctx, &sms.sender, &sms.timestamp, &sms.content),
            CmtScan::Incomplete => {
                if buffer.len() > CMT_WATERMARK {
                    log::warn!(
                        "URC buffer on {} exceeded {} bytes without progress; clearing",
                        ctx.port_name,
                        CMT_WATERMARK
                    );
                    buffer.clear();
                }
                break;
            }
            CmtScan::None => break,
        }
    }
}

/// Read a stored message back, emit it, then delete it from the modem.
async fn handle_stored_sms<O: PortOpener>(
    ctx: &ListenerCtx<O>,
    index: u32,
    reader: &mut ReadHalf<O::Stream>,
    writer: &Arc<Mutex<Option<WriteHalf<O::Stream>>>>,
) {
    let _guard = ctx.cmd_lock.lock().await;

    let read_cmds = [
        format!("AT+CMGR={index}"),
        "AT+CMGL=\"ALL\"".to_string(),
        "AT+CMGL=\"REC UNREAD\"".to_string(),
    ];

    let mut stored = None;
    for cmd in &read_cmds {
        let response = match command_on_split(reader, writer, cmd, STORED_READ_TIMEOUT).await {
            Ok(r) => r,
            Err(e) => {
                log::warn!("{}: stored read {cmd} failed: {e:#}", ctx.port_name);
                return;
            }
        };
        match urc::parse_stored_read(&response) {
            Some(sms) => {
                stored = Some(sms);
                break;
            }
            None => log::debug!("{}: {cmd} returned no message", ctx.port_name),
        }
    }

    let Some(sms) = stored else {
        log::warn!(
            "{}: +CMTI index {index} could not be read back; skipping",
            ctx.port_name
        );
        return;
    };

    emit_sms(ctx, &sms.sender, &sms.timestamp, &sms.content);

    let delete = format!("AT+CMGD={index}");
    if let Err(e) = command_on_split(reader, writer, &delete, at::COMMAND_TIMEOUT).await {
        log::warn!("{}: delete of index {index} failed: {e:#}", ctx.port_name);
    }
}

/// Run one request/response on a split stream (write half + read half).
async fn command_on_split<S>(
    reader: &mut ReadHalf<S>,
    writer: &Arc<Mutex<Option<WriteHalf<S>>>>,
    cmd: &str,
    timeout: Duration,
) -> Result<String>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    {
        let mut guard = writer.lock().await;
        let Some(w) = guard.as_mut() else {
            anyhow::bail!("port writer is closed");
        };
        w.write_all(cmd.as_bytes()).await?;
        w.write_all(b"\r").await?;
        w.flush().await?;
    }
    Ok(at::collect_response(reader, timeout).await)
}

fn emit_sms<O: PortOpener>(ctx: &ListenerCtx<O>, sender: &str, timestamp: &str, content: &str) {
    if sender.trim().is_empty() && content.trim().is_empty() {
        log::debug!("{}: dropping empty SMS parse", ctx.port_name);
        return;
    }

    let parsed_time = at::parse_sms_timestamp(timestamp);
    if !timestamp.is_empty() && parsed_time.is_none() {
        log::warn!("{}: unparseable SMS timestamp {timestamp:?}", ctx.port_name);
    }

    let dto = SmsReceivedDto {
        device_id: ctx.device_id.clone(),
        com_port: ctx.port_name.clone(),
        sender_number: sender.to_string(),
        message_content: decode_ucs2_if_needed(content),
        received_time: parsed_time.unwrap_or_else(Utc::now),
        sms_timestamp: (!timestamp.is_empty()).then(|| timestamp.to_string()),
    };

    if ctx.sms_tx.send(dto).is_err() {
        log::error!("SMS event sink dropped; message from {sender} lost");
    }
}

/// Spawn the asynchronous auto-hangup sequence for a detected call.
fn spawn_auto_hangup<O: PortOpener>(
    ctx: &ListenerCtx<O>,
    writer: Arc<Mutex<Option<WriteHalf<O::Stream>>>>,
    state: Arc<Mutex<UrcState>>,
) {
    let cfg = ctx.hangup.clone();
    let cmd_lock = Arc::clone(&ctx.cmd_lock);
    let hangup_tx = ctx.hangup_tx.clone();
    let device_id = ctx.device_id.clone();
    let port_name = ctx.port_name.clone();

    tokio::spawn(async move {
        let _guard = cmd_lock.lock().await;

        {
            let st = state.lock().await;
            if let Some(last) = st.last_hangup {
                if last.elapsed() < cfg.cooldown {
                    log::debug!("{port_name}: hangup suppressed by cooldown");
                    return;
                }
            }
        }

        tokio::time::sleep(cfg.hangup_delay).await;

        let caller = state.lock().await.cached_caller();
        if let Some(caller) = &caller {
            if cfg.is_whitelisted(caller) {
                log::info!("{port_name}: caller {caller} is whitelisted; not hanging up");
                return;
            }
        }

        // Write only; reading here would race the listener's read loop.
        {
            let mut guard = writer.lock().await;
            let Some(w) = guard.as_mut() else {
                log::debug!("{port_name}: port closed before hangup write");
                return;
            };
            if let Err(e) = w.write_all(b"ATH\r").await {
                log::warn!("{port_name}: ATH write failed: {e}");
                return;
            }
            let _ = w.flush().await;
            tokio::time::sleep(Duration::from_millis(150)).await;
            if let Err(e) = w.write_all(b"AT+CHUP\r").await {
                log::warn!("{port_name}: AT+CHUP write failed: {e}");
            }
            let _ = w.flush().await;
        }

        let raw_line = {
            let mut st = state.lock().await;
            st.last_hangup = Some(Instant::now());
            let tail = tail_chars(&st.last_tail, RAW_LINE_CAP);
            let chunk = tail_chars(&st.last_chunk, RAW_LINE_CAP);
            (!tail.is_empty() || !chunk.is_empty()).then(|| format!("{tail}|{chunk}"))
        };

        let dto = CallHangupDto {
            device_id,
            com_port: port_name.clone(),
            caller_number: caller,
            hangup_time: Utc::now(),
            reason: HangupReason::AutoHangup,
            raw_line,
        };
        if hangup_tx.send(dto).is_err() {
            log::error!("hangup event sink dropped; event on {port_name} lost");
        }
    });
}

/// Last `cap` characters of `text`, on a char boundary.
fn tail_chars(text: &str, cap: usize) -> String {
    if text.len() <= cap {
        return text.to_string();
    }
    let mut start = text.len() - cap;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}
