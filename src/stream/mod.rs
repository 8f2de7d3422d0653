//! Per-stream translation runtime.
//!
//! One [`StreamRuntime`] owns the tool sieve and the accumulated output of a
//! single client stream. Protocol differences live entirely in the
//! [`StreamRenderer`] it is parameterised with.

pub mod driver;
pub mod sink;
pub mod sse;

pub use sink::{ChannelSink, DiscardSink, SinkClosed, SseSink, VecSink};

use crate::observability::token_counter::{log_stream_usage, StreamUsage};
use crate::toolcall::{
    parse_tool_calls_with_limit, SieveEvent, SieveOptions, ToolCall, ToolCallDelta, ToolNameFilter, ToolSieve,
};
use crate::upstream::decoder::{is_citation, DecodedRecord, FragmentKind};
use bytes::Bytes;
use serde_json::Value;
use std::time::Instant;
use tracing::debug;

/// Why the upstream side of a stream ended.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TerminalReason {
    #[default]
    Stop,
    ContentFilter,
    UpstreamError(String),
}

/// Finish reason reported to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    ToolCalls,
    ContentFilter,
}

impl FinishReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::ToolCalls => "tool_calls",
            FinishReason::ContentFilter => "content_filter",
        }
    }
}

/// What the caller should do after a record.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RecordDecision {
    pub stop: bool,
    pub reason: Option<TerminalReason>,
    /// The record carried at least one fragment that was not filtered out.
    pub content_seen: bool,
}

impl RecordDecision {
    fn stop(reason: Option<TerminalReason>) -> Self {
        Self {
            stop: true,
            reason,
            content_seen: false,
        }
    }
}

/// Per-stream settings fixed when the request is prepared.
#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub model: String,
    /// Prompt sent upstream; only used for usage estimation.
    pub prompt: String,
    pub thinking_enabled: bool,
    pub search_enabled: bool,
    pub tool_names: ToolNameFilter,
    /// Route text through the live tool sieve.
    pub buffer_tool_content: bool,
    pub emit_early_tool_deltas: bool,
    pub max_capture_bytes: usize,
}

impl StreamOptions {
    #[must_use]
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            thinking_enabled: false,
            search_enabled: false,
            tool_names: ToolNameFilter::default(),
            buffer_tool_content: false,
            emit_early_tool_deltas: false,
            max_capture_bytes: SieveOptions::default().max_capture_bytes,
        }
    }
}

/// Everything a renderer needs to close a stream.
#[derive(Debug)]
pub struct StreamSummary<'a> {
    pub reasoning: &'a str,
    /// Text that actually reached the client as content.
    pub visible_text: &'a str,
    pub tool_calls: &'a [ToolCall],
    pub finish_reason: FinishReason,
    pub terminal: &'a TerminalReason,
    pub usage: StreamUsage,
}

/// Protocol-specific frame encoding.
///
/// `with_role` is true for the first delta of the stream; renderers that
/// attach an assistant role marker do it only then.
pub trait StreamRenderer: Send {
    fn render_start(&mut self, _out: &mut Vec<Bytes>) {}

    fn render_content(&mut self, text: &str, with_role: bool, out: &mut Vec<Bytes>);

    fn render_reasoning(&mut self, text: &str, with_role: bool, out: &mut Vec<Bytes>);

    fn render_tool_call_deltas(&mut self, deltas: &[ToolCallDelta], with_role: bool, out: &mut Vec<Bytes>);

    fn render_tool_calls(&mut self, calls: &[ToolCall], with_role: bool, out: &mut Vec<Bytes>);

    /// The object handed to the persist callback and returned to
    /// non-streaming clients.
    fn completed_record(&self, summary: &StreamSummary<'_>) -> Value;

    /// Terminal frames, excluding the `[DONE]` sentinel.
    fn render_terminal(&mut self, summary: &StreamSummary<'_>, record: &Value, out: &mut Vec<Bytes>);
}

pub type PersistFn = Box<dyn FnOnce(&Value) + Send>;

pub struct StreamRuntime<R, S> {
    renderer: R,
    sink: S,
    options: StreamOptions,
    sieve: Option<ToolSieve>,
    persist: Option<PersistFn>,

    writable: bool,
    started: bool,
    first_chunk_sent: bool,
    tool_calls_emitted: bool,
    finalized: bool,

    accumulated_reasoning: String,
    accumulated_text: String,
    visible_text: String,
    tool_calls: Vec<ToolCall>,
    terminal: TerminalReason,

    frames: Vec<Bytes>,
    started_at: Instant,
}

impl<R: StreamRenderer, S: SseSink> StreamRuntime<R, S> {
    pub fn new(renderer: R, sink: S, options: StreamOptions) -> Self {
        let sieve = options.buffer_tool_content.then(|| {
            ToolSieve::new(
                options.tool_names.clone(),
                SieveOptions {
                    emit_early_deltas: options.emit_early_tool_deltas,
                    max_capture_bytes: options.max_capture_bytes,
                },
            )
        });
        Self {
            renderer,
            sink,
            options,
            sieve,
            persist: None,
            writable: true,
            started: false,
            first_chunk_sent: false,
            tool_calls_emitted: false,
            finalized: false,
            accumulated_reasoning: String::new(),
            accumulated_text: String::new(),
            visible_text: String::new(),
            tool_calls: Vec::new(),
            terminal: TerminalReason::Stop,
            frames: Vec::with_capacity(4),
            started_at: Instant::now(),
        }
    }

    #[must_use]
    pub fn with_persist(mut self, persist: PersistFn) -> Self {
        self.persist = Some(persist);
        self
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    #[must_use]
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    #[must_use]
    pub fn accumulated_text(&self) -> &str {
        &self.accumulated_text
    }

    #[must_use]
    pub fn accumulated_reasoning(&self) -> &str {
        &self.accumulated_reasoning
    }

    #[must_use]
    pub fn visible_text(&self) -> &str {
        &self.visible_text
    }

    #[must_use]
    pub fn tool_calls(&self) -> &[ToolCall] {
        &self.tool_calls
    }

    #[must_use]
    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Writes the protocol preamble, if any. Idempotent.
    pub async fn start(&mut self) -> bool {
        if self.started {
            return self.writable;
        }
        self.started = true;
        self.renderer.render_start(&mut self.frames);
        self.send_frames().await
    }

    pub async fn on_record(&mut self, record: &DecodedRecord) -> RecordDecision {
        if !self.writable || self.finalized {
            return RecordDecision::stop(None);
        }
        if !record.parsed {
            return RecordDecision::default();
        }
        if record.content_filtered {
            self.terminal = TerminalReason::ContentFilter;
            return RecordDecision::stop(Some(TerminalReason::ContentFilter));
        }
        if let Some(message) = &record.error_message {
            self.terminal = TerminalReason::UpstreamError(message.clone());
            return RecordDecision::stop(Some(self.terminal.clone()));
        }
        if record.stop {
            self.terminal = TerminalReason::Stop;
            return RecordDecision::stop(Some(TerminalReason::Stop));
        }
        if !self.start().await {
            return RecordDecision::stop(None);
        }

        let mut content_seen = false;
        for fragment in &record.fragments {
            match fragment.kind {
                FragmentKind::Reasoning => {
                    if !self.options.thinking_enabled {
                        continue;
                    }
                    content_seen = true;
                    self.accumulated_reasoning.push_str(&fragment.text);
                    self.render_with(|r, role, out| r.render_reasoning(&fragment.text, role, out));
                }
                FragmentKind::Text => {
                    if self.options.search_enabled && is_citation(&fragment.text) {
                        continue;
                    }
                    content_seen = true;
                    self.accumulated_text.push_str(&fragment.text);
                    let events = match self.sieve.as_mut() {
                        Some(sieve) => sieve.process_chunk(&fragment.text),
                        None => vec![SieveEvent::Content(fragment.text.clone())],
                    };
                    self.render_events(events);
                }
            }
            if !self.send_frames().await {
                return RecordDecision::stop(None);
            }
        }
        RecordDecision {
            stop: false,
            reason: None,
            content_seen,
        }
    }

    /// Closes the stream. Only the first call has any effect; the completed
    /// record is returned when the terminal frames could be produced.
    pub async fn finalize(&mut self) -> Option<Value> {
        if self.finalized {
            return None;
        }
        self.finalized = true;
        if !self.writable || !self.start().await {
            return None;
        }

        let detected = parse_tool_calls_with_limit(
            &self.accumulated_text,
            &self.options.tool_names,
            self.options.max_capture_bytes,
        );
        if !detected.is_empty() && !self.tool_calls_emitted {
            self.tool_calls_emitted = true;
            self.render_with(|r, role, out| r.render_tool_calls(&detected, role, out));
            self.tool_calls = detected;
        } else if let Some(events) = self.sieve.as_mut().map(ToolSieve::flush) {
            self.render_events(events);
        }
        if !self.send_frames().await {
            return None;
        }

        let finish_reason = if self.tool_calls_emitted {
            FinishReason::ToolCalls
        } else {
            match self.terminal {
                TerminalReason::Stop => FinishReason::Stop,
                TerminalReason::ContentFilter | TerminalReason::UpstreamError(_) => {
                    FinishReason::ContentFilter
                }
            }
        };
        let usage = StreamUsage::estimate(
            &self.options.prompt,
            &self.accumulated_reasoning,
            &self.accumulated_text,
        );
        let summary = StreamSummary {
            reasoning: &self.accumulated_reasoning,
            visible_text: &self.visible_text,
            tool_calls: &self.tool_calls,
            finish_reason,
            terminal: &self.terminal,
            usage,
        };
        let record = self.renderer.completed_record(&summary);
        if let Some(persist) = self.persist.take() {
            persist(&record);
        }
        self.renderer.render_terminal(&summary, &record, &mut self.frames);
        self.frames.push(sse::done_frame());
        // the record is complete even if the client already went away
        let _ = self.send_frames().await;

        log_stream_usage(
            &self.options.model,
            &usage,
            finish_reason.as_str(),
            self.started_at.elapsed(),
        );
        Some(record)
    }

    pub async fn send_keep_alive(&mut self) -> bool {
        if !self.writable || self.finalized {
            return false;
        }
        self.frames.push(sse::keep_alive_frame());
        self.send_frames().await
    }

    fn render_events(&mut self, events: Vec<SieveEvent>) {
        for event in events {
            match event {
                SieveEvent::Content(text) => {
                    self.visible_text.push_str(&text);
                    self.render_with(|r, role, out| r.render_content(&text, role, out));
                }
                SieveEvent::ToolCallDeltas(deltas) => {
                    self.tool_calls_emitted = true;
                    self.render_with(|r, role, out| r.render_tool_call_deltas(&deltas, role, out));
                }
                SieveEvent::ToolCalls(calls) => {
                    self.tool_calls_emitted = true;
                    self.render_with(|r, role, out| r.render_tool_calls(&calls, role, out));
                    self.tool_calls.extend(calls);
                }
            }
        }
    }

    fn render_with(&mut self, render: impl FnOnce(&mut R, bool, &mut Vec<Bytes>)) {
        let before = self.frames.len();
        render(&mut self.renderer, !self.first_chunk_sent, &mut self.frames);
        if self.frames.len() > before {
            self.first_chunk_sent = true;
        }
    }

    async fn send_frames(&mut self) -> bool {
        if !self.writable {
            self.frames.clear();
            return false;
        }
        for frame in self.frames.drain(..) {
            if self.sink.send(frame).await.is_err() {
                debug!(model = %self.options.model, "client write failed, dropping rest of stream");
                self.writable = false;
                break;
            }
        }
        self.frames.clear();
        self.writable
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::decoder::UpstreamFragment;

    /// Renders each event as one plain line so assertions stay readable.
    #[derive(Default)]
    struct LineRenderer;

    impl StreamRenderer for LineRenderer {
        fn render_start(&mut self, out: &mut Vec<Bytes>) {
            out.push(Bytes::from_static(b"start\n"));
        }
        fn render_content(&mut self, text: &str, with_role: bool, out: &mut Vec<Bytes>) {
            let role = if with_role { "+role" } else { "" };
            out.push(Bytes::from(format!("content{role}:{text}\n")));
        }
        fn render_reasoning(&mut self, text: &str, with_role: bool, out: &mut Vec<Bytes>) {
            let role = if with_role { "+role" } else { "" };
            out.push(Bytes::from(format!("reasoning{role}:{text}\n")));
        }
        fn render_tool_call_deltas(&mut self, deltas: &[ToolCallDelta], _: bool, out: &mut Vec<Bytes>) {
            for delta in deltas {
                out.push(Bytes::from(format!("delta:{}:{}\n", delta.index, delta.arguments)));
            }
        }
        fn render_tool_calls(&mut self, calls: &[ToolCall], _: bool, out: &mut Vec<Bytes>) {
            for call in calls {
                out.push(Bytes::from(format!("call:{}:{}\n", call.name, call.arguments_json())));
            }
        }
        fn completed_record(&self, summary: &StreamSummary<'_>) -> Value {
            serde_json::json!({
                "text": summary.visible_text,
                "finish": summary.finish_reason.as_str(),
                "completion_tokens": summary.usage.completion_tokens(),
            })
        }
        fn render_terminal(&mut self, summary: &StreamSummary<'_>, _: &Value, out: &mut Vec<Bytes>) {
            out.push(Bytes::from(format!("finish:{}\n", summary.finish_reason.as_str())));
        }
    }

    fn text(chunk: &str) -> DecodedRecord {
        DecodedRecord {
            parsed: true,
            fragments: vec![UpstreamFragment {
                kind: FragmentKind::Text,
                text: chunk.to_string(),
            }],
            content_filtered: false,
            error_message: None,
            stop: false,
            next_kind: FragmentKind::Text,
        }
    }

    fn reasoning(chunk: &str) -> DecodedRecord {
        let mut record = text(chunk);
        record.fragments[0].kind = FragmentKind::Reasoning;
        record
    }

    fn runtime(options: StreamOptions) -> StreamRuntime<LineRenderer, VecSink> {
        StreamRuntime::new(LineRenderer, VecSink::new(), options)
    }

    #[tokio::test]
    async fn role_is_attached_to_first_delta_only() {
        let mut options = StreamOptions::new("m", "p");
        options.thinking_enabled = true;
        let mut rt = runtime(options);
        rt.on_record(&reasoning("hmm")).await;
        rt.on_record(&text("Hi")).await;
        rt.finalize().await;
        assert_eq!(
            rt.sink().text(),
            "start\nreasoning+role:hmm\ncontent:Hi\nfinish:stop\ndata: [DONE]\n\n"
        );
    }

    #[tokio::test]
    async fn reasoning_is_dropped_when_thinking_disabled() {
        let mut rt = runtime(StreamOptions::new("m", "p"));
        let decision = rt.on_record(&reasoning("hidden")).await;
        assert!(!decision.content_seen);
        assert!(rt.accumulated_reasoning().is_empty());
        assert_eq!(rt.sink().text(), "start\n");
    }

    #[tokio::test]
    async fn unparsed_records_have_no_effect() {
        let mut rt = runtime(StreamOptions::new("m", "p"));
        let mut record = text("x");
        record.parsed = false;
        assert_eq!(rt.on_record(&record).await, RecordDecision::default());
        assert!(rt.sink().frames.is_empty());
    }

    #[tokio::test]
    async fn terminal_records_stop_without_emitting_fragments() {
        let mut rt = runtime(StreamOptions::new("m", "p"));
        let mut record = text("late");
        record.content_filtered = true;
        let decision = rt.on_record(&record).await;
        assert!(decision.stop);
        assert_eq!(decision.reason, Some(TerminalReason::ContentFilter));
        assert!(rt.accumulated_text().is_empty());
        let completed = rt.finalize().await.expect("completed record");
        assert_eq!(completed["finish"], "content_filter");
    }

    #[tokio::test]
    async fn sieve_hides_marker_and_sets_tool_calls_finish() {
        let mut options = StreamOptions::new("m", "p");
        options.tool_names = ToolNameFilter::new(["search"]);
        options.buffer_tool_content = true;
        let mut rt = runtime(options);
        rt.on_record(&text("Looking. ")).await;
        rt.on_record(&text(r#"{"tool_calls":[{"name":"search","#)).await;
        rt.on_record(&text(r#""input":{"q":"rust"}}]}"#)).await;
        let completed = rt.finalize().await.expect("completed record");
        let out = rt.sink().text();
        assert!(out.contains("content+role:Looking. \n"));
        assert!(out.contains(r#"call:search:{"q":"rust"}"#));
        assert!(!out.contains("tool_calls"));
        assert_eq!(completed["finish"], "tool_calls");
        assert_eq!(rt.visible_text(), "Looking. ");
    }

    #[tokio::test]
    async fn fallback_detects_calls_when_sieve_is_off() {
        let mut options = StreamOptions::new("m", "p");
        options.tool_names = ToolNameFilter::new(["search"]);
        let mut rt = runtime(options);
        rt.on_record(&text(r#"{"tool_calls":[{"name":"search","input":{}}]}"#)).await;
        let completed = rt.finalize().await.expect("completed record");
        assert_eq!(completed["finish"], "tool_calls");
        assert_eq!(rt.tool_calls().len(), 1);
    }

    #[tokio::test]
    async fn marker_over_capture_limit_is_text_only_once() {
        let mut options = StreamOptions::new("m", "p");
        options.tool_names = ToolNameFilter::new(["search"]);
        options.buffer_tool_content = true;
        options.max_capture_bytes = 64;
        let mut rt = runtime(options);
        let marker = format!(
            r#"{{"tool_calls":[{{"name":"search","input":{{"q":"{}"}}}}]}}"#,
            "x".repeat(80)
        );
        for chunk in marker.as_bytes().chunks(10) {
            let chunk = std::str::from_utf8(chunk).expect("ascii marker");
            rt.on_record(&text(chunk)).await;
        }
        let completed = rt.finalize().await.expect("completed record");
        assert_eq!(rt.visible_text(), marker);
        assert!(rt.tool_calls().is_empty());
        assert!(!rt.sink().text().contains("call:"));
        assert_eq!(completed["finish"], "stop");
    }

    #[tokio::test]
    async fn malformed_marker_after_early_deltas_finishes_as_tool_calls() {
        let mut options = StreamOptions::new("m", "p");
        options.tool_names = ToolNameFilter::new(["search"]);
        options.buffer_tool_content = true;
        options.emit_early_tool_deltas = true;
        let mut rt = runtime(options);
        rt.on_record(&text(r#"{"tool_calls":[{"name":"search","input":{"q":"ru"#)).await;
        rt.on_record(&text(r#"st"}}], "note": 1}"#)).await;
        let completed = rt.finalize().await.expect("completed record");
        let out = rt.sink().text();
        assert!(out.contains(r#"delta:0:{"q":"ru"#));
        assert!(!out.contains("call:"));
        assert!(rt.tool_calls().is_empty());
        assert_eq!(
            rt.visible_text(),
            r#"{"tool_calls":[{"name":"search","input":{"q":"rust"}}], "note": 1}"#
        );
        assert_eq!(completed["finish"], "tool_calls");
    }

    #[tokio::test]
    async fn pending_prefix_is_flushed_on_finalize() {
        let mut options = StreamOptions::new("m", "p");
        options.tool_names = ToolNameFilter::new(["search"]);
        options.buffer_tool_content = true;
        let mut rt = runtime(options);
        rt.on_record(&text("see {\"tool")).await;
        rt.finalize().await;
        assert_eq!(rt.visible_text(), "see {\"tool");
        assert!(rt.sink().text().contains("finish:stop"));
    }

    #[tokio::test]
    async fn finalize_runs_once_and_persists_before_terminal() {
        let seen = std::sync::Arc::new(parking_lot::Mutex::new(None));
        let slot = seen.clone();
        let mut rt = runtime(StreamOptions::new("m", "p"))
            .with_persist(Box::new(move |record| *slot.lock() = Some(record.clone())));
        rt.on_record(&text("Hello")).await;
        assert!(rt.finalize().await.is_some());
        assert!(rt.finalize().await.is_none());
        assert_eq!(rt.sink().text().matches("finish:").count(), 1);
        let persisted = seen.lock().clone().expect("persisted record");
        assert_eq!(persisted["text"], "Hello");
    }

    #[tokio::test]
    async fn write_failure_silences_the_stream() {
        let mut rt = StreamRuntime::new(
            LineRenderer,
            VecSink::failing_after(1),
            StreamOptions::new("m", "p"),
        );
        let decision = rt.on_record(&text("a")).await;
        assert!(decision.stop);
        assert!(!rt.is_writable());
        let attempts = rt.sink().attempts();
        assert!(!rt.send_keep_alive().await);
        assert!(rt.finalize().await.is_none());
        assert_eq!(rt.sink().attempts(), attempts);
    }
}
