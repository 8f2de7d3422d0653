//! Destinations for rendered SSE frames.

use bytes::Bytes;
use futures_util::Stream;
use std::future::Future;
use tokio::sync::mpsc;

/// The client went away; nothing more can be written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("client stream closed")]
pub struct SinkClosed;

/// Ordered, fallible frame writer.
pub trait SseSink: Send {
    fn send(&mut self, frame: Bytes) -> impl Future<Output = Result<(), SinkClosed>> + Send;
}

/// Sink backed by a bounded channel whose receiver becomes the HTTP body.
pub struct ChannelSink {
    tx: mpsc::Sender<Bytes>,
}

impl ChannelSink {
    /// Returns the sink and the body stream that drains it.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, impl Stream<Item = Result<Bytes, std::io::Error>> + Send) {
        let (tx, rx) = mpsc::channel::<Bytes>(capacity.max(1));
        let body = futures_util::stream::unfold(rx, |mut rx| async move {
            let frame = rx.recv().await?;
            Some((Ok(frame), rx))
        });
        (Self { tx }, body)
    }
}

impl SseSink for ChannelSink {
    async fn send(&mut self, frame: Bytes) -> Result<(), SinkClosed> {
        self.tx.send(frame).await.map_err(|_| SinkClosed)
    }
}

/// In-memory sink; optionally starts failing after a number of writes.
#[derive(Debug, Default)]
pub struct VecSink {
    pub frames: Vec<Bytes>,
    fail_after: Option<usize>,
    attempts: usize,
}

impl VecSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn failing_after(writes: usize) -> Self {
        Self {
            fail_after: Some(writes),
            ..Self::default()
        }
    }

    /// Number of writes attempted, including failed ones.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    /// All accepted frames concatenated as text.
    #[must_use]
    pub fn text(&self) -> String {
        self.frames
            .iter()
            .map(|frame| String::from_utf8_lossy(frame))
            .collect()
    }
}

impl SseSink for VecSink {
    async fn send(&mut self, frame: Bytes) -> Result<(), SinkClosed> {
        self.attempts += 1;
        if self.fail_after.is_some_and(|limit| self.frames.len() >= limit) {
            return Err(SinkClosed);
        }
        self.frames.push(frame);
        Ok(())
    }
}

/// Sink for non-streaming requests; only the completed record matters.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardSink;

impl SseSink for DiscardSink {
    async fn send(&mut self, _frame: Bytes) -> Result<(), SinkClosed> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    #[tokio::test]
    async fn channel_sink_feeds_body_in_order() {
        let (mut sink, body) = ChannelSink::new(4);
        sink.send(Bytes::from_static(b"a")).await.expect("send a");
        sink.send(Bytes::from_static(b"b")).await.expect("send b");
        drop(sink);
        let frames: Vec<Bytes> = body
            .map(|item| item.expect("frame"))
            .collect()
            .await;
        assert_eq!(frames, vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]);
    }

    #[tokio::test]
    async fn channel_sink_reports_dropped_receiver() {
        let (mut sink, body) = ChannelSink::new(1);
        drop(body);
        assert_eq!(sink.send(Bytes::from_static(b"x")).await, Err(SinkClosed));
    }

    #[tokio::test]
    async fn vec_sink_fails_after_limit() {
        let mut sink = VecSink::failing_after(1);
        assert!(sink.send(Bytes::from_static(b"1")).await.is_ok());
        assert!(sink.send(Bytes::from_static(b"2")).await.is_err());
        assert_eq!(sink.frames.len(), 1);
        assert_eq!(sink.attempts(), 2);
    }
}
