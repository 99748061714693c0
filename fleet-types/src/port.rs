//! Port and modem description types produced by the agent-side scanner and
//! stored in the per-device snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Human-readable signal quality bucket derived from `AT+CSQ`.
#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, Clone, Copy)]
pub enum SignalQuality {
    /// RSSI 0 or the 99 "unknown" sentinel.
    #[serde(rename = "No Signal")]
    NoSignal,
    /// RSSI 1 to 9.
    #[serde(rename = "Very Weak")]
    VeryWeak,
    /// RSSI 10 to 14.
    #[serde(rename = "Weak")]
    Weak,
    /// RSSI 15 to 19.
    #[serde(rename = "Fair")]
    Fair,
    /// RSSI 20 to 24.
    #[serde(rename = "Good")]
    Good,
    /// RSSI 25 to 31.
    #[serde(rename = "Excellent")]
    Excellent,
}

impl SignalQuality {
    /// Bucket a raw `+CSQ` RSSI value.
    #[must_use]
    pub fn from_rssi(rssi: u8) -> Self {
        match rssi {
            1..=9 => SignalQuality::VeryWeak,
            10..=14 => SignalQuality::Weak,
            15..=19 => SignalQuality::Fair,
            20..=24 => SignalQuality::Good,
            25..=31 => SignalQuality::Excellent,
            _ => SignalQuality::NoSignal,
        }
    }
}

/// Details gathered from an identified SMS modem.
#[derive(Serialize, Deserialize, PartialEq, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct ModemInfo {
    /// Whether a SIM card is present (`AT+CPIN?` answered `READY` or `SIM PIN`).
    pub has_sim_card: bool,

    /// SIM ICCID, an 18 to 22 digit run, when a SIM is present.
    pub iccid: Option<String>,

    /// Network operator name from `AT+COPS?`.
    pub operator: Option<String>,

    /// Raw RSSI from `AT+CSQ`: 0 to 31, or 99 when unknown.
    pub signal_strength: Option<u8>,

    /// Bucketed signal quality.
    pub signal_quality: Option<SignalQuality>,

    /// Own subscriber number from `AT+CNUM`, when the SIM exposes it.
    pub phone_number: Option<String>,

    /// Manufacturer string from `AT+CGMI`.
    pub manufacturer: Option<String>,

    /// Model string from `AT+CGMM`.
    pub model: Option<String>,

    /// IMEI from `AT+CGSN`.
    pub imei: Option<String>,

    /// Raw `AT+CPIN?` status text.
    pub sim_status: Option<String>,

    /// Decoded network registration state from `AT+CREG?`.
    pub network_status: Option<String>,
}

/// One serial port as seen by a device scan.
#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PortInfo {
    /// Owning device id (agent identity).
    pub device_id: String,

    /// OS port name, e.g. `COM3` or `/dev/ttyUSB0`.
    pub port_name: String,

    /// Whether the port could be opened at all.
    pub is_available: bool,

    /// Whether an AT-speaking modem answered on this port.
    pub is_sms_modem: bool,

    /// Baud rate the modem answered at, when identified.
    pub baud_rate: Option<u32>,

    /// Modem details, present after the detail-gathering pass.
    pub modem_info: Option<ModemInfo>,

    /// Raw probe transcript kept for diagnostics.
    pub raw: Option<String>,
}

impl PortInfo {
    /// A port that failed identification.
    #[must_use]
    pub fn unidentified(device_id: &str, port_name: &str, is_available: bool) -> Self {
        Self {
            device_id: device_id.to_string(),
            port_name: port_name.to_string(),
            is_available,
            is_sms_modem: false,
            baud_rate: None,
            modem_info: None,
            raw: None,
        }
    }
}

/// Result of a full COM port scan on one device.
#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ScanResult {
    /// When the scan started (UTC).
    pub scan_time: DateTime<Utc>,

    /// Whether enumeration itself succeeded. Individual port failures do
    /// not clear this flag.
    pub success: bool,

    /// Enumeration error, when `success` is false.
    pub error: Option<String>,

    /// All enumerated ports in OS order.
    pub ports: Vec<PortInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_quality_buckets() {
        assert_eq!(SignalQuality::from_rssi(0), SignalQuality::NoSignal);
        assert_eq!(SignalQuality::from_rssi(99), SignalQuality::NoSignal);
        assert_eq!(SignalQuality::from_rssi(1), SignalQuality::VeryWeak);
        assert_eq!(SignalQuality::from_rssi(9), SignalQuality::VeryWeak);
        assert_eq!(SignalQuality::from_rssi(10), SignalQuality::Weak);
        assert_eq!(SignalQuality::from_rssi(15), SignalQuality::Fair);
        assert_eq!(SignalQuality::from_rssi(20), SignalQuality::Good);
        assert_eq!(SignalQuality::from_rssi(31), SignalQuality::Excellent);
        assert_eq!(SignalQuality::from_rssi(32), SignalQuality::NoSignal);
    }

    #[test]
    fn test_port_info_camel_case_json() {
        let port = PortInfo::unidentified("D1", "COM3", true);
        let json = serde_json::to_string(&port).unwrap();
        assert!(json.contains("\"portName\":\"COM3\""));
        assert!(json.contains("\"isSmsModem\":false"));
        assert!(json.contains("\"deviceId\":\"D1\""));
    }
}
