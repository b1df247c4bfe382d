/// Clamp a payload to at most `max_chars` characters.
///
/// Returns the (possibly shortened) payload and whether anything was cut.
/// Counting is done in characters, not bytes, so multi-byte text is never
/// split in the middle of a code point.
pub fn truncate_payload(data: &str, max_chars: usize) -> (String, bool) {
    match data.char_indices().nth(max_chars) {
        Some((cut, _)) => (data[..cut].to_string(), true),
        None => (data.to_string(), false),
    }
}

/// Remove every `\r` and `\n` from a payload.
///
/// The reader treats a line terminator as the end of the payload, so any
/// embedded one would split it. Returns the cleaned payload and whether
/// anything was removed.
pub fn strip_line_breaks(data: &str) -> (String, bool) {
    if !data.contains(['\r', '\n']) {
        return (data.to_string(), false);
    }
    (data.replace(['\r', '\n'], ""), true)
}

/// Hex dump of outgoing bytes, one space between bytes (`"53 54 0A"`)
pub fn format_hex_spaced(bytes: &[u8]) -> String {
    let hex = hex::encode_upper(bytes);
    let mut spaced = String::with_capacity(hex.len() + hex.len() / 2);
    for (i, c) in hex.chars().enumerate() {
        if i > 0 && i % 2 == 0 {
            spaced.push(' ');
        }
        spaced.push(c);
    }
    spaced
}

/// Decode a raw line received from the device.
///
/// Trailing `\r`/`\n` and surrounding whitespace are removed. Bytes that are
/// not valid UTF-8 are replaced, and the raw bytes are logged so the operator
/// can see what the device actually sent.
pub fn decode_line(raw: &[u8]) -> String {
    match std::str::from_utf8(raw) {
        Ok(text) => text.trim().to_string(),
        Err(_) => {
            log::debug!(
                "Non UTF-8 line from device: {} \"{}\"",
                format_hex_spaced(raw),
                raw.escape_ascii()
            );
            String::from_utf8_lossy(raw).trim().to_string()
        }
    }
}
