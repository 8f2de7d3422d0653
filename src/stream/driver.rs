//! Pumps an upstream byte stream through a [`StreamRuntime`].

use std::time::Duration;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde_json::Value;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use super::{SseSink, StreamRenderer, StreamRuntime};
use crate::config::StreamConfig;
use crate::upstream::decoder::{decode_line, DecodeContext};
use crate::upstream::lines::line_stream;

#[derive(Debug, Clone, Copy)]
pub struct DriverSettings {
    pub keep_alive_interval: Duration,
    pub idle_timeout: Duration,
    pub max_keep_alive_without_content: u32,
}

impl DriverSettings {
    #[must_use]
    pub fn from_config(config: &StreamConfig) -> Self {
        Self {
            keep_alive_interval: Duration::from_secs(config.keep_alive_interval_secs.max(1)),
            idle_timeout: Duration::from_secs(config.idle_timeout_secs.max(1)),
            max_keep_alive_without_content: config.max_keep_alive_without_content,
        }
    }
}

/// Why the read loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveOutcome {
    Completed,
    UpstreamClosed,
    UpstreamFailed,
    IdleTimeout,
    KeepAliveLimit,
    ClientGone,
}

/// Read upstream lines until a stop condition, then finalize.
///
/// Returns the completed record (when one could be produced) and why the
/// loop ended.
pub async fn drive<R, S, B, E>(
    runtime: &mut StreamRuntime<R, S>,
    upstream: B,
    thinking_enabled: bool,
    settings: DriverSettings,
) -> (Option<Value>, DriveOutcome)
where
    R: StreamRenderer,
    S: SseSink,
    B: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let outcome = pump(runtime, upstream, thinking_enabled, settings).await;
    debug!(?outcome, "upstream read loop ended");
    (runtime.finalize().await, outcome)
}

async fn pump<R, S, B, E>(
    runtime: &mut StreamRuntime<R, S>,
    upstream: B,
    thinking_enabled: bool,
    settings: DriverSettings,
) -> DriveOutcome
where
    R: StreamRenderer,
    S: SseSink,
    B: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    if !runtime.start().await {
        return DriveOutcome::ClientGone;
    }
    let lines = line_stream(upstream);
    tokio::pin!(lines);

    let mut ctx = DecodeContext::initial(thinking_enabled);
    let mut ticker = tokio::time::interval_at(
        Instant::now() + settings.keep_alive_interval,
        settings.keep_alive_interval,
    );
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_activity = Instant::now();
    let mut content_seen = false;
    let mut idle_keep_alives = 0_u32;

    loop {
        tokio::select! {
            next = lines.next() => {
                let line = match next {
                    Some(Ok(line)) => line,
                    Some(Err(err)) => {
                        warn!(error = %err, "upstream stream failed");
                        return DriveOutcome::UpstreamFailed;
                    }
                    None => return DriveOutcome::UpstreamClosed,
                };
                last_activity = Instant::now();
                let record = decode_line(&line, ctx);
                ctx = ctx.advance(&record);
                let decision = runtime.on_record(&record).await;
                if decision.content_seen {
                    content_seen = true;
                    idle_keep_alives = 0;
                }
                if decision.stop {
                    return if runtime.is_writable() {
                        DriveOutcome::Completed
                    } else {
                        DriveOutcome::ClientGone
                    };
                }
            }
            _ = ticker.tick() => {
                if last_activity.elapsed() >= settings.idle_timeout {
                    return DriveOutcome::IdleTimeout;
                }
                if !runtime.send_keep_alive().await {
                    return DriveOutcome::ClientGone;
                }
                idle_keep_alives += 1;
                if content_seen && idle_keep_alives >= settings.max_keep_alive_without_content {
                    return DriveOutcome::KeepAliveLimit;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{StreamOptions, StreamSummary, VecSink};
    use crate::toolcall::{ToolCall, ToolCallDelta};
    use serde_json::json;

    struct TextRenderer;

    impl StreamRenderer for TextRenderer {
        fn render_content(&mut self, text: &str, _: bool, out: &mut Vec<Bytes>) {
            out.push(Bytes::from(format!("c:{text}\n")));
        }
        fn render_reasoning(&mut self, text: &str, _: bool, out: &mut Vec<Bytes>) {
            out.push(Bytes::from(format!("r:{text}\n")));
        }
        fn render_tool_call_deltas(&mut self, _: &[ToolCallDelta], _: bool, _: &mut Vec<Bytes>) {}
        fn render_tool_calls(&mut self, _: &[ToolCall], _: bool, _: &mut Vec<Bytes>) {}
        fn completed_record(&self, summary: &StreamSummary<'_>) -> Value {
            json!({"text": summary.visible_text, "finish": summary.finish_reason.as_str()})
        }
        fn render_terminal(&mut self, _: &StreamSummary<'_>, _: &Value, _: &mut Vec<Bytes>) {}
    }

    fn settings() -> DriverSettings {
        DriverSettings {
            keep_alive_interval: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(30),
            max_keep_alive_without_content: 10,
        }
    }

    fn chunks(parts: &[&'static str]) -> impl Stream<Item = Result<Bytes, String>> + Send + 'static {
        let items: Vec<Result<Bytes, String>> =
            parts.iter().copied().map(|p| Ok(Bytes::from_static(p.as_bytes()))).collect();
        futures_util::stream::iter(items)
    }

    #[tokio::test]
    async fn lines_split_across_chunks_are_decoded() {
        let mut rt = StreamRuntime::new(TextRenderer, VecSink::new(), StreamOptions::new("m", "p"));
        let upstream = chunks(&[
            "data: {\"p\":\"response/content\",\"v\":\"Hel\"}\n",
            "\ndata: {\"v\":\"lo\"}\n\ndata: [DO",
            "NE]\n\n",
        ]);
        let (record, outcome) = drive(&mut rt, upstream, false, settings()).await;
        assert_eq!(outcome, DriveOutcome::Completed);
        let record = record.expect("completed record");
        assert_eq!(record["text"], "Hello");
        assert_eq!(record["finish"], "stop");
        assert!(rt.sink().text().starts_with("c:Hel\nc:lo\n"));
    }

    #[tokio::test]
    async fn upstream_end_without_done_still_finalizes() {
        let mut rt = StreamRuntime::new(TextRenderer, VecSink::new(), StreamOptions::new("m", "p"));
        let upstream = chunks(&["data: {\"p\":\"response/content\",\"v\":\"x\"}\n"]);
        let (record, outcome) = drive(&mut rt, upstream, false, settings()).await;
        assert_eq!(outcome, DriveOutcome::UpstreamClosed);
        assert_eq!(record.expect("completed record")["text"], "x");
        assert!(rt.sink().text().ends_with("data: [DONE]\n\n"));
    }

    #[tokio::test]
    async fn upstream_error_ends_the_loop() {
        let mut rt = StreamRuntime::new(TextRenderer, VecSink::new(), StreamOptions::new("m", "p"));
        let upstream = futures_util::stream::iter(vec![
            Ok(Bytes::from_static(b"data: {\"p\":\"response/content\",\"v\":\"a\"}\n")),
            Err("reset".to_string()),
        ]);
        let (record, outcome) = drive(&mut rt, upstream, false, settings()).await;
        assert_eq!(outcome, DriveOutcome::UpstreamFailed);
        assert!(record.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn keep_alives_are_sent_while_upstream_is_quiet() {
        let mut rt = StreamRuntime::new(TextRenderer, VecSink::new(), StreamOptions::new("m", "p"));
        let upstream = futures_util::stream::pending::<Result<Bytes, String>>();
        let (_, outcome) = drive(&mut rt, upstream, false, settings()).await;
        assert_eq!(outcome, DriveOutcome::IdleTimeout);
        let keep_alives = rt.sink().text().matches(": keep-alive").count();
        assert_eq!(keep_alives, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn keep_alive_limit_applies_after_content() {
        let mut rt = StreamRuntime::new(TextRenderer, VecSink::new(), StreamOptions::new("m", "p"));
        let first = futures_util::stream::iter(vec![Ok::<_, String>(Bytes::from_static(
            b"data: {\"p\":\"response/content\",\"v\":\"hi\"}\n",
        ))]);
        let upstream = first.chain(futures_util::stream::pending());
        let mut quick = settings();
        quick.max_keep_alive_without_content = 2;
        let (record, outcome) = drive(&mut rt, upstream, false, quick).await;
        assert_eq!(outcome, DriveOutcome::KeepAliveLimit);
        assert_eq!(record.expect("completed record")["text"], "hi");
    }

    #[tokio::test]
    async fn closed_client_stops_reading() {
        let mut rt = StreamRuntime::new(
            TextRenderer,
            VecSink::failing_after(0),
            StreamOptions::new("m", "p"),
        );
        let upstream = chunks(&["data: {\"p\":\"response/content\",\"v\":\"a\"}\n"]);
        let (record, outcome) = drive(&mut rt, upstream, false, settings()).await;
        assert_eq!(outcome, DriveOutcome::ClientGone);
        assert!(record.is_none());
    }
}
