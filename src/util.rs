use std::time::{SystemTime, UNIX_EPOCH};

const HEX: &[u8; 16] = b"0123456789abcdef";

#[inline]
pub(crate) fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_secs())
}

/// `call_` followed by 32 lowercase hex digits.
#[inline]
pub(crate) fn next_call_id() -> String {
    prefixed_uuid("call_")
}

/// `prefix` followed by a random v4-shaped uuid without dashes.
pub(crate) fn prefixed_uuid(prefix: &str) -> String {
    let raw = fastrand::u128(..);
    // version 4, RFC 4122 variant
    let raw = (raw & !(0xf_u128 << 76)) | (0x4_u128 << 76);
    let raw = (raw & !(0x3_u128 << 62)) | (0x2_u128 << 62);
    format!("{prefix}{}", uuid::Uuid::from_u128(raw).simple())
}

/// `byte_len` random bytes rendered as lowercase hex.
pub(crate) fn random_hex(byte_len: usize) -> String {
    let mut out = String::with_capacity(byte_len * 2);
    for _ in 0..byte_len {
        let byte = fastrand::u8(..);
        out.push(char::from(HEX[usize::from(byte >> 4)]));
        out.push(char::from(HEX[usize::from(byte & 0x0f)]));
    }
    out
}

#[inline]
pub(crate) fn push_json_string_escaped(out: &mut String, value: &str) {
    let bytes = value.as_bytes();
    if bytes.iter().all(|&b| b >= 0x20 && b != b'"' && b != b'\\') {
        out.push('"');
        out.push_str(value);
        out.push('"');
        return;
    }

    out.push('"');
    for ch in value.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0c}' => out.push_str("\\f"),
            c if c <= '\u{1f}' => {
                let control = c as u8;
                out.push_str("\\u00");
                out.push(char::from(HEX[(control >> 4) as usize]));
                out.push(char::from(HEX[(control & 0x0f) as usize]));
            }
            _ => out.push(ch),
        }
    }
    out.push('"');
}

#[inline]
pub(crate) fn push_u64_decimal(out: &mut String, mut n: u64) {
    if n == 0 {
        out.push('0');
        return;
    }

    let mut buf = [0u8; 20];
    let mut i = buf.len();
    while n > 0 {
        i -= 1;
        buf[i] = b'0' + ((n % 10) as u8);
        n /= 10;
    }
    let digits = std::str::from_utf8(&buf[i..]).unwrap_or("0");
    out.push_str(digits);
}

#[inline]
pub(crate) fn push_usize_decimal(out: &mut String, n: usize) {
    push_u64_decimal(out, n as u64);
}

/// Constant-time comparison for shared secrets.
pub(crate) fn secrets_match(provided: &str, expected: &str) -> bool {
    use subtle::ConstantTimeEq;
    provided.as_bytes().ct_eq(expected.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_json_string_escaped_matches_serde_json() {
        let inputs = [
            "",
            "plain ascii",
            "quote \" and slash \\",
            "line\nbreak\r\n",
            "\u{08}\u{0c}\t",
            "control \u{001f} tail",
            "emoji 😀 café",
            "mix \"😀\\\n\t\r\u{0000}",
        ];

        for input in inputs {
            let mut out = String::new();
            push_json_string_escaped(&mut out, input);
            let expected = serde_json::to_string(input).expect("serialize");
            assert_eq!(out, expected);
        }
    }

    #[test]
    fn push_u64_decimal_formats_edges() {
        let mut out = String::new();
        push_u64_decimal(&mut out, 0);
        out.push(',');
        push_u64_decimal(&mut out, u64::MAX);
        assert_eq!(out, format!("0,{}", u64::MAX));
    }

    #[test]
    fn call_ids_are_prefixed_and_unique() {
        let a = next_call_id();
        let b = next_call_id();
        assert!(a.starts_with("call_"));
        assert_eq!(a.len(), "call_".len() + 32);
        assert!(a["call_".len()..].bytes().all(|b| b.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    #[test]
    fn random_hex_has_expected_width() {
        let id = random_hex(16);
        assert_eq!(id.len(), 32);
        assert!(id.bytes().all(|b| b.is_ascii_hexdigit()));
    }

    #[test]
    fn secrets_match_requires_exact_bytes() {
        assert!(secrets_match("s3cret", "s3cret"));
        assert!(!secrets_match("s3cret", "s3cre"));
        assert!(!secrets_match("", "x"));
    }
}
