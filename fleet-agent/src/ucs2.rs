//! UCS2 payload detection and decoding.
//!
//! Modems configured with `AT+CSCS="GSM"` still deliver non-Latin SMS
//! bodies as hex-encoded UTF-16BE. Anything that looks like such a payload
//! is decoded; everything else passes through unchanged.

/// Decode `content` as hex UTF-16BE when it looks like a UCS2 payload.
///
/// Detection: after stripping spaces, CR, LF, and quotes, the remainder
/// must be pure hex of length >= 4. Odd trailing half-bytes or half-words
/// are trimmed so the hex length is a multiple of 4 before decoding.
#[must_use]
pub fn decode_ucs2_if_needed(content: &str) -> String {
    let stripped: String = content
        .chars()
        .filter(|c| !matches!(c, ' ' | '\r' | '\n' | '"'))
        .collect();

    if stripped.len() < 4 || !stripped.chars().all(|c| c.is_ascii_hexdigit()) {
        return content.to_string();
    }

    let trimmed_len = stripped.len() - (stripped.len() % 4);
    let hex = &stripped[..trimmed_len];

    let Ok(bytes) = hex::decode(hex) else {
        return content.to_string();
    };

    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();

    match String::from_utf16(&units) {
        Ok(decoded) => decoded,
        Err(_) => content.to_string(),
    }
}

/// Hex-encode `text` as UTF-16BE, the inverse of [`decode_ucs2_if_needed`].
/// Used by tests and kept for symmetric diagnostics.
#[must_use]
pub fn encode_ucs2(text: &str) -> String {
    let mut out = String::with_capacity(text.len() * 4);
    for unit in text.encode_utf16() {
        out.push_str(&format!("{unit:04X}"));
    }
    out
}
