/// Escapes a raw client line so it can be logged safely: control bytes and
/// non-ASCII bytes become `\xNN`, the trailing CRLF is dropped.
pub fn escape_for_log(line: &[u8]) -> String {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    let line = line.strip_suffix(b"\r").unwrap_or(line);

    let mut result = String::with_capacity(line.len());
    for &byte in line {
        match byte {
            b'\0' => result.push_str("\\0"),
            b'\t' => result.push_str("\\t"),
            b'\r' => result.push_str("\\r"),
            b'\n' => result.push_str("\\n"),
            b'\\' => result.push_str("\\\\"),
            0x20..=0x7e => result.push(byte as char),
            _ => result.push_str(&format!("\\x{:02x}", byte)),
        }
    }
    result
}

/// Domain part of a mailbox, if any.
pub fn extract_domain(address: &str) -> Option<&str> {
    match address.rsplit_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Some(domain),
        _ => None,
    }
}
