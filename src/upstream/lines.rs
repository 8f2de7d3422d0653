//! Byte stream to line stream.

use bytes::Bytes;
use futures_util::Stream;
use memchr::memchr_iter;
use std::collections::VecDeque;

/// Incremental line splitter.
///
/// Feed it text chunks cut at arbitrary boundaries; it yields complete lines
/// without their `\n` / `\r\n` terminator.
#[derive(Debug, Default)]
pub struct LineSplitter {
    buffer: String,
    read_offset: usize,
}

impl LineSplitter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed_into(&mut self, chunk: &str, out: &mut VecDeque<String>) {
        self.buffer.push_str(chunk);
        let scan_start = self.read_offset;
        let mut processed_up_to = scan_start;
        for rel_pos in memchr_iter(b'\n', &self.buffer.as_bytes()[scan_start..]) {
            let line_end = scan_start + rel_pos;
            let line = &self.buffer[processed_up_to..line_end];
            out.push_back(line.strip_suffix('\r').unwrap_or(line).to_string());
            processed_up_to = line_end + 1;
        }

        self.read_offset = processed_up_to;
        if self.read_offset == self.buffer.len() {
            self.buffer.clear();
            self.read_offset = 0;
            return;
        }
        let should_compact = self.read_offset > 0
            && (self.read_offset >= self.buffer.len() / 2 || self.read_offset >= 8 * 1024);
        if should_compact {
            self.buffer.drain(..self.read_offset);
            self.read_offset = 0;
        }
    }

    /// Unterminated tail left when the stream ends.
    pub fn finish(&mut self) -> Option<String> {
        let tail = &self.buffer[self.read_offset..];
        let tail = tail.strip_suffix('\r').unwrap_or(tail);
        let out = (!tail.is_empty()).then(|| tail.to_string());
        self.buffer.clear();
        self.read_offset = 0;
        out
    }
}

/// Holds the bytes of a code point split across chunks.
#[derive(Debug, Default)]
struct Utf8Carry {
    remainder: Vec<u8>,
}

impl Utf8Carry {
    fn decode(&mut self, bytes: &[u8], splitter: &mut LineSplitter, out: &mut VecDeque<String>) {
        let joined;
        let mut rest: &[u8] = if self.remainder.is_empty() {
            bytes
        } else {
            let mut buf = std::mem::take(&mut self.remainder);
            buf.extend_from_slice(bytes);
            joined = buf;
            &joined
        };
        loop {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    splitter.feed_into(text, out);
                    return;
                }
                Err(err) => {
                    let valid_up_to = err.valid_up_to();
                    feed_valid_prefix(&rest[..valid_up_to], splitter, out);
                    match err.error_len() {
                        // truncated code point: wait for the next chunk
                        None => {
                            self.remainder.extend_from_slice(&rest[valid_up_to..]);
                            return;
                        }
                        Some(bad) => {
                            splitter.feed_into("\u{FFFD}", out);
                            rest = &rest[valid_up_to + bad..];
                        }
                    }
                }
            }
        }
    }
}

fn feed_valid_prefix(valid: &[u8], splitter: &mut LineSplitter, out: &mut VecDeque<String>) {
    if let Ok(text) = std::str::from_utf8(valid) {
        splitter.feed_into(text, out);
    }
}

/// Split an upstream byte stream into UTF-8 lines.
///
/// A stream error is forwarded once and ends the line stream.
pub fn line_stream<S, E>(byte_stream: S) -> impl Stream<Item = Result<String, E>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Send + 'static,
{
    use futures_util::StreamExt;

    futures_util::stream::unfold(
        (
            Box::pin(byte_stream),
            LineSplitter::new(),
            Utf8Carry::default(),
            VecDeque::<String>::with_capacity(8),
            false,
        ),
        |(mut stream, mut splitter, mut carry, mut pending, mut done)| async move {
            loop {
                if let Some(line) = pending.pop_front() {
                    return Some((Ok(line), (stream, splitter, carry, pending, done)));
                }
                if done {
                    return None;
                }
                match stream.as_mut().next().await {
                    Some(Ok(bytes)) => carry.decode(&bytes, &mut splitter, &mut pending),
                    Some(Err(err)) => {
                        done = true;
                        return Some((Err(err), (stream, splitter, carry, pending, done)));
                    }
                    None => {
                        done = true;
                        if let Some(tail) = splitter.finish() {
                            pending.push_back(tail);
                        }
                    }
                }
            }
        },
    )
}
