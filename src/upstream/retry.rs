use std::time::{Duration, SystemTime};

use http::header::RETRY_AFTER;

const RETRY_BACKOFF_BASE_MS: u64 = 200;
const RETRY_BACKOFF_MAX_MS: u64 = 2_000;
const RETRY_AFTER_MAX_SECS: u64 = 30;

#[inline]
pub(crate) fn should_retry_status(status: http::StatusCode) -> bool {
    matches!(status.as_u16(), 429 | 500 | 502 | 503 | 504 | 529)
}

#[inline]
pub(crate) fn should_retry_transport_message(message: &str) -> bool {
    const NEEDLES: [&[u8]; 7] = [
        b"timed out",
        b"timeout",
        b"connection reset",
        b"connection refused",
        b"broken pipe",
        b"unexpected eof",
        b"error sending request",
    ];
    let haystack = message.as_bytes();
    NEEDLES
        .iter()
        .any(|needle| contains_ascii_case_insensitive(haystack, needle))
}

#[inline]
fn contains_ascii_case_insensitive(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() {
        return true;
    }
    if haystack.len() < needle.len() {
        return false;
    }
    haystack.windows(needle.len()).any(|window| {
        window
            .iter()
            .zip(needle.iter())
            .all(|(a, b)| a.eq_ignore_ascii_case(b))
    })
}

#[inline]
pub(crate) fn backoff_delay(attempt: u32) -> Duration {
    let multiplier = 1_u64 << attempt.min(10);
    Duration::from_millis(
        RETRY_BACKOFF_BASE_MS
            .saturating_mul(multiplier)
            .min(RETRY_BACKOFF_MAX_MS),
    )
}

/// `Retry-After` when the upstream sent one, exponential backoff otherwise.
pub(crate) fn retry_delay(headers: &http::HeaderMap, attempt: u32) -> Duration {
    parse_retry_after(headers).unwrap_or_else(|| backoff_delay(attempt))
}

fn parse_retry_after(headers: &http::HeaderMap) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(seconds) = raw.parse::<u64>() {
        return Some(Duration::from_secs(seconds.min(RETRY_AFTER_MAX_SECS)));
    }
    let target = httpdate::parse_http_date(raw).ok()?;
    let delay = target.duration_since(SystemTime::now()).unwrap_or_default();
    Some(delay.min(Duration::from_secs(RETRY_AFTER_MAX_SECS)))
}
