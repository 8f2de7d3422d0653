//! Outbound SSE frame encoding.

use bytes::Bytes;

pub const DONE_FRAME: &[u8] = b"data: [DONE]\n\n";
pub const KEEP_ALIVE_FRAME: &[u8] = b": keep-alive\n\n";

/// Unnamed frame: `data: {json}\n\n`.
#[must_use]
pub fn data_frame(json: &str) -> Bytes {
    let mut out = String::with_capacity(8 + json.len());
    out.push_str("data: ");
    out.push_str(json);
    out.push_str("\n\n");
    Bytes::from(out)
}

/// Named frame: `event: {name}\ndata: {json}\n\n`.
#[must_use]
pub fn named_frame(event: &str, json: &str) -> Bytes {
    let mut out = String::with_capacity(16 + event.len() + json.len());
    out.push_str("event: ");
    out.push_str(event);
    out.push('\n');
    out.push_str("data: ");
    out.push_str(json);
    out.push_str("\n\n");
    Bytes::from(out)
}

#[must_use]
pub fn done_frame() -> Bytes {
    Bytes::from_static(DONE_FRAME)
}

#[must_use]
pub fn keep_alive_frame() -> Bytes {
    Bytes::from_static(KEEP_ALIVE_FRAME)
}
