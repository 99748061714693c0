//! COM port scanner: probe every serial port for an AT-speaking modem and
//! gather its details.
//!
//! Ports are emitted incrementally through a channel so clients can render
//! as results come in. Each identified modem is emitted twice: once right
//! after identification with no details, and again once details are
//! gathered (an upsert keyed by device and port name).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

use fleet_types::{ModemInfo, PortInfo, ScanResult, SignalQuality};

use crate::at;
use crate::session::PortOpener;

/// Baud rates tried per port when none are configured.
pub const DEFAULT_BAUD_RATES: [u32; 5] = [115_200, 9_600, 19_200, 38_400, 57_600];

/// Settle time after opening before the first probe write.
const SETTLE_DELAY: Duration = Duration::from_millis(300);

/// Budget for one probe attempt.
const PROBE_ATTEMPT_TIMEOUT: Duration = Duration::from_millis(1500);

/// Probe attempts per baud rate.
const PROBE_ATTEMPTS: u32 = 3;

/// Total budget for the detail-gathering phase of one port.
const DETAIL_PHASE_TIMEOUT: Duration = Duration::from_secs(25);

/// Scanner over all serial ports of one device.
pub struct ComPortScanner<O: PortOpener> {
    device_id: String,
    opener: Arc<O>,
    baud_rates: Vec<u32>,
}

impl<O: PortOpener> ComPortScanner<O> {
    /// Create a scanner. An empty `baud_rates` falls back to the default
    /// probe order.
    pub fn new(device_id: String, opener: Arc<O>, baud_rates: Vec<u32>) -> Self {
        let baud_rates = if baud_rates.is_empty() {
            DEFAULT_BAUD_RATES.to_vec()
        } else {
            baud_rates
        };
        Self {
            device_id,
            opener,
            baud_rates,
        }
    }

    /// Scan every port, streaming incremental [`PortInfo`] emissions
    /// through `on_port`, and return the full result.
    pub async fn scan(&self, on_port: &mpsc::UnboundedSender<PortInfo>) -> ScanResult {
        let scan_time = Utc::now();
        let port_names = match self.opener.enumerate() {
            Ok(names) => names,
            Err(e) => {
                log::error!("port enumeration failed: {e:#}");
                return ScanResult {
                    scan_time,
                    success: false,
                    error: Some(format!("{e:#}")),
                    ports: Vec::new(),
                };
            }
        };

        log::info!("scanning {} serial ports", port_names.len());
        let mut ports = Vec::with_capacity(port_names.len());
        for name in port_names {
            let info = self.scan_port(&name, on_port).await;
            ports.push(info);
        }

        ScanResult {
            scan_time,
            success: true,
            error: None,
            ports,
        }
    }

    /// Probe one port across the configured baud rates.
    async fn scan_port(&self, port_name: &str, on_port: &mpsc::UnboundedSender<PortInfo>) -> PortInfo {
        let mut ever_opened = false;

        for &baud in &self.baud_rates {
            let mut stream = match self.opener.open(port_name, baud) {
                Ok(s) => s,
                Err(e) => {
                    log::debug!("{port_name}@{baud}: open failed: {e:#}");
                    continue;
                }
            };
            ever_opened = true;
            tokio::time::sleep(SETTLE_DELAY).await;

            let Some(probe_raw) = probe(&mut stream, port_name, baud).await else {
                continue;
            };

            log::info!("{port_name}: AT device identified at {baud} baud");
            let mut info = PortInfo {
                device_id: self.device_id.clone(),
                port_name: port_name.to_string(),
                is_available: true,
                is_sms_modem: true,
                baud_rate: Some(baud),
                modem_info: None,
                raw: Some(probe_raw),
            };
            // first emission: identified, details pending
            let _ = on_port.send(info.clone());

            let details = tokio::time::timeout(DETAIL_PHASE_TIMEOUT, gather_details(&mut stream))
                .await
                .unwrap_or_else(|_| {
                    log::warn!("{port_name}: detail gathering hit the 25 s budget");
                    ModemInfo::default()
                });
            info.modem_info = Some(details);

            // second emission: the detail upsert
            let _ = on_port.send(info.clone());
            return info;
        }

        let info = PortInfo::unidentified(&self.device_id, port_name, ever_opened);
        let _ = on_port.send(info.clone());
        info
    }
}

/// Probe for an AT response. Returns the raw transcript on success.
async fn probe<S>(stream: &mut S, port_name: &str, baud: u32) -> Option<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    for attempt in 1..=PROBE_ATTEMPTS {
        let half = PROBE_ATTEMPT_TIMEOUT / 2;

        if stream.write_all(b"AT\r").await.is_err() {
            return None;
        }
        let _ = stream.flush().await;
        let mut collected = at::collect_response(stream, half).await;

        if !at::has_terminator(&collected) {
            // some firmwares only answer to CRLF
            if stream.write_all(b"AT\r\n").await.is_err() {
                return None;
            }
            let _ = stream.flush().await;
            collected.push_str(&at::collect_response(stream, half).await);
        }

        if at::has_terminator(&collected) {
            return Some(collected);
        }
        log::debug!("{port_name}@{baud}: probe attempt {attempt} got no recognizable response");
    }
    None
}

/// Gather modem details. Any sub-query that stalls or errors is skipped.
async fn gather_details<S>(stream: &mut S) -> ModemInfo
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut info = ModemInfo::default();

    info.manufacturer = query_payload(stream, "AT+CGMI").await;
    info.model = query_payload(stream, "AT+CGMM").await;
    // firmware revision is queried for the raw transcript but not stored
    let _ = query_payload(stream, "AT+CGMR").await;
    info.imei = query_payload(stream, "AT+CGSN")
        .await
        .map(|s| at::longest_digit_run(&s))
        .filter(|imei| !imei.is_empty());

    if let Some(pin) = query_payload(stream, "AT+CPIN?").await {
        info.has_sim_card = pin.contains("READY") || pin.contains("SIM PIN");
        info.sim_status = Some(pin);
    }

    if let Some(cops) = query_payload(stream, "AT+COPS?").await {
        info.operator = at::first_quoted(&cops);
    }

    if let Some(csq) = query_payload(stream, "AT+CSQ").await {
        if let Some(rssi) = parse_csq(&csq) {
            info.signal_strength = Some(rssi);
            info.signal_quality = Some(SignalQuality::from_rssi(rssi));
        }
    }

    if let Some(creg) = query_payload(stream, "AT+CREG?").await {
        info.network_status = parse_creg(&creg);
    }

    if info.has_sim_card {
        info.iccid = query_iccid(stream).await;
        info.phone_number = query_own_number(stream).await;
    }

    info
}

async fn query_payload<S>(stream: &mut S, cmd: &str) -> Option<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match at::request(stream, cmd, at::COMMAND_TIMEOUT).await {
        Ok(raw) if at::has_terminator(&raw) && !at::has_error(&raw) => {
            let payload = at::extract_payload(&raw, cmd);
            (!payload.is_empty()).then_some(payload)
        }
        Ok(_) => {
            log::debug!("{cmd}: no usable response");
            None
        }
        Err(e) => {
            log::debug!("{cmd} failed: {e:#}");
            None
        }
    }
}

/// Try the three ICCID command spellings until a plausible digit run
/// (18 to 22 characters) shows up.
async fn query_iccid<S>(stream: &mut S) -> Option<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    for cmd in ["AT+CCID", "AT+ICCID", "AT^ICCID"] {
        if let Some(payload) = query_payload(stream, cmd).await {
            let digits = at::longest_digit_run(&payload);
            if (18..=22).contains(&digits.len()) {
                return Some(digits);
            }
        }
    }
    None
}

/// Own subscriber number from `AT+CNUM`: the first quoted string that is a
/// `+`-prefixed or all-digit number.
async fn query_own_number<S>(stream: &mut S) -> Option<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let payload = query_payload(stream, "AT+CNUM").await?;
    at::all_quoted(&payload).into_iter().find(|q| {
        let digits = q.strip_prefix('+').unwrap_or(q);
        !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
    })
}

/// RSSI from a `+CSQ: <rssi>,<ber>` payload.
fn parse_csq(payload: &str) -> Option<u8> {
    let after = payload.split("+CSQ:").nth(1)?;
    let number: String = after
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    number.parse().ok()
}

/// Registration state from a `+CREG: <n>,<stat>` payload.
fn parse_creg(payload: &str) -> Option<String> {
    let after = payload.split("+CREG:").nth(1)?;
    let stat = after.split(',').nth(1)?.trim();
    let stat: u8 = stat
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect::<String>()
        .parse()
        .ok()?;
    let name = match stat {
        0 => "Not registered",
        1 => "Registered Home",
        2 => "Searching",
        3 => "Denied",
        5 => "Registered Roaming",
        _ => return None,
    };
    Some(name.to_string())
}
