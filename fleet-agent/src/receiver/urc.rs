//! Unsolicited result code parsing over the per-port byte buffer.
//!
//! The listener appends whatever the modem pushed and asks this module
//! what is in there. Checks run in priority order: incoming-call
//! fragments, stored-SMS notifications (`+CMTI`), then direct pushes
//! (`+CMT`). Consumption rules differ per kind; a detected but incomplete
//! `+CMT` body is the one case that must be left in the buffer untouched.

use lazy_static::lazy_static;
use regex::Regex;

use crate::at::all_quoted;

/// Buffer watermark for call fragments without a complete `+CLIP`.
pub const CALL_FRAGMENT_WATERMARK: usize = 4096;

/// Buffer watermark for a `+CMT` header whose body never completes.
pub const CMT_WATERMARK: usize = 10_000;

lazy_static! {
    static ref CMT_HEADER: Regex =
        Regex::new(r#"\+CMT:\s*"(?P<sender>[^"]*)"\s*,[^,\r\n]*,\s*"(?P<ts>[^"]*)"[^\r\n]*\r?\n"#)
            .expect("CMT header regex");
    static ref CMTI_LINE: Regex =
        Regex::new(r#"\+CMTI:\s*"(?P<mem>[^"]*)"\s*,\s*(?P<index>\d+)\s*\r?\n"#)
            .expect("CMTI regex");
}

/// An incoming-call fragment (`RING` and/or `+CLIP:`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallFragment {
    /// Caller id from the last `+CLIP:`, when its quoted field is complete.
    pub caller: Option<String>,
    /// Whether a complete `+CLIP` was parsed (controls buffer clearing).
    pub complete_clip: bool,
}

/// Detect a call fragment. Does not consume; the caller applies the
/// clearing rules (clear on complete `+CLIP`, or on watermark overflow).
#[must_use]
pub fn detect_call(buf: &str) -> Option<CallFragment> {
    let has_ring = buf.contains("RING");
    let clip_at = buf.rfind("+CLIP:");
    if !has_ring && clip_at.is_none() {
        return None;
    }

    let (caller, complete_clip) = match clip_at {
        Some(at) => {
            let tail = &buf[at..];
            match all_quoted(tail).into_iter().next() {
                Some(c) if !c.is_empty() => (Some(c), true),
                Some(_) => (None, true),
                None => (None, false),
            }
        }
        None => (None, false),
    };

    Some(CallFragment {
        caller,
        complete_clip,
    })
}

/// Extract the first complete `+CMTI: "<mem>",<index>` notification,
/// removing the consumed prefix (everything through that line).
#[must_use]
pub fn take_cmti(buf: &mut String) -> Option<u32> {
    let caps = CMTI_LINE.captures(buf)?;
    let index: u32 = caps.name("index")?.as_str().parse().ok()?;
    let end = caps.get(0)?.end();
    buf.drain(..end);
    Some(index)
}

/// A direct-push SMS parsed out of the buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectSms {
    /// Sender number from the `+CMT` header.
    pub sender: String,
    /// Raw timestamp string from the header.
    pub timestamp: String,
    /// Undecode message body (may still be UCS2 hex).
    pub content: String,
}

/// Outcome of a `+CMT` scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CmtScan {
    /// No `+CMT` header in the buffer.
    None,
    /// Header matched but the body has not fully arrived. The buffer must
    /// not be consumed; more data is coming.
    Incomplete,
    /// A complete message was parsed and its bytes consumed.
    Parsed(DirectSms),
}

/// Scan for a direct push. The body starts after the header line (leading
/// blank lines skipped) and ends at a blank line, an `OK` line, the next
/// `+CMT`, or a line-terminated end of buffer.
#[must_use]
pub fn take_cmt(buf: &mut String) -> CmtScan {
    let Some(caps) = CMT_HEADER.captures(buf) else {
        return if buf.contains("+CMT:") {
            // header itself still arriving
            CmtScan::Incomplete
        } else {
            CmtScan::None
        };
    };

    let sender = caps["sender"].to_string();
    let timestamp = caps["ts"].to_string();
    let body_start = caps.get(0).map(|m| m.end()).unwrap_or(0);

    match scan_body(&buf[body_start..]) {
        Some((content, consumed)) => {
            buf.drain(..body_start + consumed);
            CmtScan::Parsed(DirectSms {
                sender,
                timestamp,
                content,
            })
        }
        None => CmtScan::Incomplete,
    }
}

/// Collect body lines from `rest`; returns (content, bytes consumed) or
/// `None` when the body is still incomplete.
fn scan_body(rest: &str) -> Option<(String, usize)> {
    let mut lines: Vec<&str> = Vec::new();
    let mut offset = 0;
    let mut seen_content = false;

    loop {
        let remaining = &rest[offset..];
        if remaining.is_empty() {
            // line-terminated end of buffer counts as a terminator once
            // content exists
            return seen_content.then(|| (lines.join("\n"), offset));
        }

        let Some(nl) = remaining.find('\n') else {
            // a partial line is still in flight; wait for more data
            return None;
        };
        let line = remaining[..nl].trim_end_matches('\r');
        let line_end = offset + nl + 1;

        let trimmed = line.trim();
        if trimmed.is_empty() {
            if seen_content {
                return Some((lines.join("\n"), line_end));
            }
            // blank separator between header and body
            offset = line_end;
            continue;
        }
        if trimmed == "OK" || trimmed.starts_with("+CMT:") {
            return seen_content.then(|| (lines.join("\n"), offset));
        }

        lines.push(line);
        seen_content = true;
        offset = line_end;
    }
}

/// A stored message read back via `AT+CMGR` / `AT+CMGL`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredSms {
    /// Sender number from the header line.
    pub sender: String,
    /// Raw timestamp string from the header line.
    pub timestamp: String,
    /// Undecode message body.
    pub content: String,
}

/// Parse the first message out of a `+CMGR:`/`+CMGL:` response. Returns
/// `None` when the response has no header line (e.g. bare `OK`).
#[must_use]
pub fn parse_stored_read(response: &str) -> Option<StoredSms> {
    let mut lines = response.lines().peekable();
    let header = loop {
        let line = lines.next()?;
        let trimmed = line.trim();
        if trimmed.starts_with("+CMGR:") || trimmed.starts_with("+CMGL:") {
            break trimmed;
        }
    };

    let quoted = all_quoted(header);
    let sender = quoted
        .iter()
        .find(|q| looks_like_number(q))
        .or_else(|| quoted.get(1))
        .cloned()
        .unwrap_or_default();
    let timestamp = quoted
        .iter()
        .rev()
        .find(|q| q.contains('/') && q.contains(':'))
        .cloned()
        .unwrap_or_default();

    let mut content_lines = Vec::new();
    for line in lines {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed == "OK" {
            continue;
        }
        if trimmed.starts_with("+CMGL:") || trimmed.starts_with("+CMGR:") {
            // next stored entry; first message only
            break;
        }
        content_lines.push(line.trim_end_matches('\r'));
    }

    if sender.is_empty() && content_lines.is_empty() {
        return None;
    }

    Some(StoredSms {
        sender,
        timestamp,
        content: content_lines.join("\n"),
    })
}

fn looks_like_number(q: &str) -> bool {
    let q = q.trim();
    if q.is_empty() {
        return false;
    }
    let digits = q.strip_prefix('+').unwrap_or(q);
    !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_ring_without_clip() {
        let frag = detect_call("\r\nRING\r\n").unwrap();
        assert_eq!(frag.caller, None);
        assert!(!frag.complete_clip);
    }

    #[test]
    fn test_detect_clip_with_caller() {
        let frag = detect_call("RING\r\n+CLIP: \"+15550001111\",145\r\n").unwrap();
        assert_eq!(frag.caller.as_deref(), Some("+15550001111"));
        assert!(frag.complete_clip);
    }

    #[test]
    fn test_detect_uses_last_clip() {
        let buf = "+CLIP: \"+15550001111\",145\r\nRING\r\n+CLIP: \"+16660002222\",145\r\n";
        let frag = detect_call(buf).unwrap();
        assert_eq!(frag.caller.as_deref(), Some("+16660002222"));
    }

    #[test]
    fn test_detect_incomplete_clip() {
        let frag = detect_call("RING\r\n+CLIP: \"+1555").unwrap();
        assert_eq!(frag.caller, None);
        assert!(!frag.complete_clip);
    }

    #[test]
    fn test_take_cmti_consumes_prefix() {
        let mut buf = "junk\r\n+CMTI: \"SM\",7\r\n+CMT leftover".to_string();
        assert_eq!(take_cmti(&mut buf), Some(7));
        assert_eq!(buf, "+CMT leftover");
        assert_eq!(take_cmti(&mut buf), None);
    }

    #[test]
    fn test_take_cmti_waits_for_complete_line() {
        let mut buf = "+CMTI: \"SM\",12".to_string();
        assert_eq!(take_cmti(&mut buf), None);
        buf.push_str("\r\n");
        assert_eq!(take_cmti(&mut buf), Some(12));
    }

    #[test]
    fn test_take_cmt_literal_scenario() {
        // The UCS2 ingest scenario: header, blank line, hex body.
        let mut buf =
            "+CMT: \"+8613800138000\",,\"26/01/23,14:30:45+32\"\r\n\r\n4F604F60\r\n".to_string();
        match take_cmt(&mut buf) {
            CmtScan::Parsed(sms) => {
                assert_eq!(sms.sender, "+8613800138000");
                assert_eq!(sms.timestamp, "26/01/23,14:30:45+32");
                assert_eq!(sms.content, "4F604F60");
            }
            other => panic!("expected parse, got {other:?}"),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_take_cmt_incomplete_body_is_not_consumed() {
        let mut buf = "+CMT: \"+15551234567\",,\"25/06/01,10:00:00+00\"\r\nHel".to_string();
        let before = buf.clone();
        assert_eq!(take_cmt(&mut buf), CmtScan::Incomplete);
        assert_eq!(buf, before);

        buf.push_str("lo\r\n");
        match take_cmt(&mut buf) {
            CmtScan::Parsed(sms) => assert_eq!(sms.content, "Hello"),
            other => panic!("expected parse, got {other:?}"),
        }
    }

    #[test]
    fn test_take_cmt_partial_header_is_incomplete() {
        let mut buf = "+CMT: \"+1555".to_string();
        assert_eq!(take_cmt(&mut buf), CmtScan::Incomplete);
    }

    #[test]
    fn test_take_cmt_multiline_body_until_ok() {
        let mut buf =
            "+CMT: \"+15551234567\",,\"25/06/01,10:00:00+00\"\r\nline one\r\nline two\r\nOK\r\n"
                .to_string();
        match take_cmt(&mut buf) {
            CmtScan::Parsed(sms) => assert_eq!(sms.content, "line one\nline two"),
            other => panic!("expected parse, got {other:?}"),
        }
        assert!(buf.starts_with("OK"));
    }

    #[test]
    fn test_take_cmt_stops_at_next_cmt() {
        let mut buf = "+CMT: \"+1111\",,\"25/06/01,10:00:00+00\"\r\nfirst\r\n+CMT: \"+2222\",,\"25/06/01,10:01:00+00\"\r\nsecond\r\n".to_string();
        match take_cmt(&mut buf) {
            CmtScan::Parsed(sms) => {
                assert_eq!(sms.sender, "+1111");
                assert_eq!(sms.content, "first");
            }
            other => panic!("expected parse, got {other:?}"),
        }
        match take_cmt(&mut buf) {
            CmtScan::Parsed(sms) => {
                assert_eq!(sms.sender, "+2222");
                assert_eq!(sms.content, "second");
            }
            other => panic!("expected parse, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_stored_read_cmgr() {
        let response =
            "+CMGR: \"REC UNREAD\",\"+15551234567\",,\"25/06/01,10:00:00+00\"\r\nHello\r\nOK\r\n";
        let sms = parse_stored_read(response).unwrap();
        assert_eq!(sms.sender, "+15551234567");
        assert_eq!(sms.timestamp, "25/06/01,10:00:00+00");
        assert_eq!(sms.content, "Hello");
    }

    #[test]
    fn test_parse_stored_read_cmgl_first_entry_only() {
        let response = "+CMGL: 1,\"REC UNREAD\",\"+1111\",,\"25/06/01,10:00:00+00\"\r\nfirst\r\n+CMGL: 2,\"REC UNREAD\",\"+2222\",,\"25/06/01,10:01:00+00\"\r\nsecond\r\nOK\r\n";
        let sms = parse_stored_read(response).unwrap();
        assert_eq!(sms.sender, "+1111");
        assert_eq!(sms.content, "first");
    }

    #[test]
    fn test_parse_stored_read_empty_response() {
        assert_eq!(parse_stored_read("\r\nOK\r\n"), None);
        assert_eq!(parse_stored_read(""), None);
    }
}
