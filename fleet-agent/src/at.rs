//! AT command plumbing shared by the scanner, receiver, and sender.
//!
//! Modems answer with loosely framed ASCII: echoes, blank lines, payload
//! lines, and a terminator (`OK`, `ERROR`, `+CME ERROR`, `+CMS ERROR`)
//! wrapped in any mix of CR/LF. Everything here is tolerant of that.

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// How often accumulated bytes are re-checked for a terminator.
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Default per-command response budget.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(3);

/// Response terminators, checked delimiter-tolerantly.
const TERMINATORS: [&str; 4] = ["OK", "ERROR", "+CME ERROR", "+CMS ERROR"];

/// Whether `response` contains a recognized terminator on its own line
/// (`\rOK\r`, `\nOK\n`, `\r\nOK\r\n` all count).
#[must_use]
pub fn has_terminator(response: &str) -> bool {
    response.lines().any(is_terminator_line)
}

/// Whether an error terminator (`ERROR`, `+CME ERROR`, `+CMS ERROR`) is present.
#[must_use]
pub fn has_error(response: &str) -> bool {
    response
        .lines()
        .map(str::trim)
        .any(|l| l == "ERROR" || l.starts_with("+CME ERROR") || l.starts_with("+CMS ERROR"))
}

fn is_terminator_line(line: &str) -> bool {
    let line = line.trim();
    TERMINATORS
        .iter()
        .any(|t| line == *t || (t.starts_with('+') && line.starts_with(t)))
}

/// Write `cmd` followed by CR and collect the response until a terminator
/// shows up or `timeout` elapses. Returns whatever accumulated either way;
/// the caller decides whether a terminator-less response is fatal.
pub async fn request<S>(port: &mut S, cmd: &str, timeout: Duration) -> Result<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    port.write_all(cmd.as_bytes())
        .await
        .with_context(|| format!("write failed for {cmd:?}"))?;
    port.write_all(b"\r").await?;
    port.flush().await?;

    Ok(collect_response(port, timeout).await)
}

/// Accumulate bytes until a terminator is present or `timeout` elapses.
pub async fn collect_response<S>(port: &mut S, timeout: Duration) -> String
where
    S: AsyncRead + Unpin,
{
    let mut collected = String::new();
    let mut buf = [0u8; 1024];
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        let budget = remaining.min(POLL_INTERVAL);
        match tokio::time::timeout(budget, port.read(&mut buf)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => {
                collected.push_str(&String::from_utf8_lossy(&buf[..n]));
                if has_terminator(&collected) {
                    break;
                }
            }
            Ok(Err(_)) => break,
            Err(_) => {
                // poll window elapsed without data; keep waiting
            }
        }
    }

    collected
}

/// Extract the payload of a response: non-empty lines minus the command
/// echo minus terminator lines, joined by single spaces.
#[must_use]
pub fn extract_payload(response: &str, cmd: &str) -> String {
    response
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter(|l| *l != cmd.trim())
        .filter(|l| !is_terminator_line(l))
        .collect::<Vec<_>>()
        .join(" ")
}

/// First double-quoted string in `text`, if any.
#[must_use]
pub fn first_quoted(text: &str) -> Option<String> {
    let start = text.find('"')? + 1;
    let end = text[start..].find('"')? + start;
    Some(text[start..end].to_string())
}

/// All double-quoted strings in `text`, in order.
#[must_use]
pub fn all_quoted(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find('"') {
        let tail = &rest[start + 1..];
        match tail.find('"') {
            Some(end) => {
                out.push(tail[..end].to_string());
                rest = &tail[end + 1..];
            }
            None => break,
        }
    }
    out
}

/// Longest run of consecutive ASCII digits in `text`.
#[must_use]
pub fn longest_digit_run(text: &str) -> String {
    let mut best = "";
    let mut start = None;
    for (i, c) in text.char_indices() {
        if c.is_ascii_digit() {
            if start.is_none() {
                start = Some(i);
            }
        } else if let Some(s) = start.take() {
            if i - s > best.len() {
                best = &text[s..i];
            }
        }
    }
    if let Some(s) = start {
        if text.len() - s > best.len() {
            best = &text[s..];
        }
    }
    best.to_string()
}

/// Parse a modem SMS timestamp (`YY/MM/DD,HH:MM:SS+TZ`) into UTC.
///
/// `YY` maps to 2000+YY. The trailing quarter-hour zone suffix is tolerated
/// but not applied; timestamps without one are equally treated as UTC,
/// matching how the records are displayed downstream.
#[must_use]
pub fn parse_sms_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim().trim_matches('"');
    // Cut any +TZ / -TZ suffix after the seconds field.
    let core = raw.get(..17).unwrap_or(raw);
    let naive = NaiveDateTime::parse_from_str(core, "%y/%m/%d,%H:%M:%S").ok()?;
    Some(Utc.from_utc_datetime(&naive))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminator_variants() {
        assert!(has_terminator("AT\r\r\nOK\r\n"));
        assert!(has_terminator("\nOK\n"));
        assert!(has_terminator("\rERROR\r"));
        assert!(has_terminator("+CME ERROR: 10\r\n"));
        assert!(has_terminator("+CMS ERROR: 500"));
        assert!(!has_terminator("+CSQ: 24,0\r\n"));
        // OK embedded in a payload word is not a terminator
        assert!(!has_terminator("BROKEN LINE\r\n"));
    }

    #[test]
    fn test_error_detection() {
        assert!(has_error("\r\nERROR\r\n"));
        assert!(has_error("+CMS ERROR: 304"));
        assert!(!has_error("\r\nOK\r\n"));
    }

    #[test]
    fn test_extract_payload_strips_echo_and_terminator() {
        let raw = "AT+CSQ\r\r\n+CSQ: 21,0\r\n\r\nOK\r\n";
        assert_eq!(extract_payload(raw, "AT+CSQ"), "+CSQ: 21,0");
    }

    #[test]
    fn test_extract_payload_joins_lines() {
        let raw = "AT+CGMI\r\nSIMCOM\r\nINCORPORATED\r\nOK\r\n";
        assert_eq!(extract_payload(raw, "AT+CGMI"), "SIMCOM INCORPORATED");
    }

    #[test]
    fn test_quoted_extraction() {
        assert_eq!(
            first_quoted(r#"+COPS: 0,0,"CHINA MOBILE",7"#),
            Some("CHINA MOBILE".to_string())
        );
        assert_eq!(
            all_quoted(r#"+CMGR: "REC UNREAD","+15551234567",,"25/06/01,10:00:00+00""#),
            vec!["REC UNREAD", "+15551234567", "25/06/01,10:00:00+00"]
        );
        assert_eq!(first_quoted("no quotes"), None);
    }

    #[test]
    fn test_longest_digit_run() {
        assert_eq!(
            longest_digit_run("+CCID: 898600680113F0123456"),
            "898600680113"
        );
        assert_eq!(longest_digit_run("89860068011301234567"), "89860068011301234567");
        assert_eq!(longest_digit_run("none"), "");
    }

    #[test]
    fn test_parse_sms_timestamp() {
        let ts = parse_sms_timestamp("26/01/23,14:30:45+32").unwrap();
        assert_eq!(ts.to_rfc3339(), "2026-01-23T14:30:45+00:00");

        let ts = parse_sms_timestamp("25/06/01,10:00:00").unwrap();
        assert_eq!(ts.to_rfc3339(), "2025-06-01T10:00:00+00:00");

        assert!(parse_sms_timestamp("garbage").is_none());
    }

    #[tokio::test]
    async fn test_request_collects_until_terminator() {
        let (mut client, mut server) = tokio::io::duplex(256);
        let modem = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let n = server.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"AT+CSQ\r");
            server.write_all(b"\r\n+CSQ: 18,0\r\n\r\nOK\r\n").await.unwrap();
        });

        let raw = request(&mut client, "AT+CSQ", Duration::from_secs(1))
            .await
            .unwrap();
        assert!(raw.contains("+CSQ: 18,0"));
        assert!(has_terminator(&raw));
        modem.await.unwrap();
    }

    #[tokio::test]
    async fn test_request_times_out_without_terminator() {
        let (mut client, _server) = tokio::io::duplex(256);
        let start = tokio::time::Instant::now();
        let raw = request(&mut client, "AT", Duration::from_millis(200))
            .await
            .unwrap();
        assert!(raw.is_empty());
        assert!(start.elapsed() >= Duration::from_millis(200));
    }
}
