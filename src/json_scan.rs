//! Byte-level JSON scanners that work on possibly-truncated input.
//!
//! Each scanner returns the index one past the end of the value it starts at.
//! A value cut off by the end of the buffer reports [`ScanError::Incomplete`],
//! which lets streaming callers tell "wait for more bytes" apart from
//! "this is not JSON".

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScanError {
    Incomplete,
    Invalid,
}

pub(crate) type ScanResult = Result<usize, ScanError>;

#[inline]
pub(crate) fn skip_ws(bytes: &[u8], mut i: usize) -> usize {
    while let Some(b' ' | b'\n' | b'\r' | b'\t') = bytes.get(i) {
        i += 1;
    }
    i
}

#[inline]
pub(crate) fn string_end(bytes: &[u8], start: usize) -> ScanResult {
    match bytes.get(start) {
        Some(b'"') => {}
        Some(_) => return Err(ScanError::Invalid),
        None => return Err(ScanError::Incomplete),
    }
    let mut i = start + 1;
    while let Some(&b) = bytes.get(i) {
        match b {
            b'"' => return Ok(i + 1),
            b'\\' => i += 2,
            0x00..=0x1F => return Err(ScanError::Invalid),
            _ => i += 1,
        }
    }
    Err(ScanError::Incomplete)
}

pub(crate) fn value_end(bytes: &[u8], start: usize) -> ScanResult {
    let i = skip_ws(bytes, start);
    let Some(&first) = bytes.get(i) else {
        return Err(ScanError::Incomplete);
    };
    match first {
        b'"' => string_end(bytes, i),
        b'{' => container_end(bytes, i, b'}'),
        b'[' => container_end(bytes, i, b']'),
        b't' => literal_end(bytes, i, b"true"),
        b'f' => literal_end(bytes, i, b"false"),
        b'n' => literal_end(bytes, i, b"null"),
        b'-' | b'0'..=b'9' => number_end(bytes, i),
        _ => Err(ScanError::Invalid),
    }
}

fn container_end(bytes: &[u8], start: usize, close: u8) -> ScanResult {
    let is_object = close == b'}';
    let mut i = skip_ws(bytes, start + 1);
    if bytes.get(i) == Some(&close) {
        return Ok(i + 1);
    }
    loop {
        if is_object {
            i = string_end(bytes, skip_ws(bytes, i))?;
            i = skip_ws(bytes, i);
            match bytes.get(i) {
                Some(b':') => i += 1,
                Some(_) => return Err(ScanError::Invalid),
                None => return Err(ScanError::Incomplete),
            }
        }
        i = skip_ws(bytes, value_end(bytes, i)?);
        match bytes.get(i) {
            Some(b',') => i += 1,
            Some(&b) if b == close => return Ok(i + 1),
            Some(_) => return Err(ScanError::Invalid),
            None => return Err(ScanError::Incomplete),
        }
    }
}

fn literal_end(bytes: &[u8], start: usize, lit: &[u8]) -> ScanResult {
    let available = &bytes[start..];
    if available.len() < lit.len() {
        return if lit.starts_with(available) {
            Err(ScanError::Incomplete)
        } else {
            Err(ScanError::Invalid)
        };
    }
    if available.starts_with(lit) {
        Ok(start + lit.len())
    } else {
        Err(ScanError::Invalid)
    }
}

// A number touching the end of the buffer may still grow, so it is
// reported as incomplete.
fn number_end(bytes: &[u8], start: usize) -> ScanResult {
    let mut i = start;
    if bytes.get(i) == Some(&b'-') {
        i += 1;
    }
    let digits_start = i;
    while let Some(b) = bytes.get(i) {
        if b.is_ascii_digit() || matches!(b, b'.' | b'e' | b'E' | b'+' | b'-') {
            i += 1;
        } else {
            break;
        }
    }
    if i == bytes.len() {
        return Err(ScanError::Incomplete);
    }
    if i == digits_start || !bytes[digits_start].is_ascii_digit() {
        return Err(ScanError::Invalid);
    }
    Ok(i)
}
