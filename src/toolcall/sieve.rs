use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use super::marker::{find_open, parse_call_array, scan_call_views, ArrayTracker, OpenSearch, TrackStep};
use super::{ToolCall, ToolCallDelta, ToolNameFilter};
use crate::util::next_call_id;

// Streaming tool-call sieve.
//
// Separates inline `{"tool_calls":[...]}` markers from the assistant text in
// a single pass. Text that can no longer be the start of a marker leaves the
// sieve immediately; only a candidate opening (or an opened marker) is held
// back in `pending`.
//
// Invariants:
// - Concatenated `Content` output equals the input minus confirmed markers.
// - `pending` never grows past `max_capture_bytes`; overflow releases it as
//   content.
// - Tool-call indexes and ids are stable for the lifetime of the sieve.

const DEFAULT_MAX_CAPTURE_BYTES: usize = 512 * 1024;

/// Output of one sieve step, in emission order.
#[derive(Debug, Clone, PartialEq)]
pub enum SieveEvent {
    Content(String),
    ToolCallDeltas(Vec<ToolCallDelta>),
    ToolCalls(Vec<ToolCall>),
}

#[derive(Debug, Clone, Copy)]
pub struct SieveOptions {
    /// Stream argument text of a call before its marker closes.
    pub emit_early_deltas: bool,
    pub max_capture_bytes: usize,
}

impl Default for SieveOptions {
    fn default() -> Self {
        Self {
            emit_early_deltas: false,
            max_capture_bytes: DEFAULT_MAX_CAPTURE_BYTES,
        }
    }
}

#[derive(Debug)]
enum SieveMode {
    Scanning,
    Capturing(Capture),
}

#[derive(Debug)]
struct Capture {
    tracker: ArrayTracker,
    /// Argument bytes already sent as deltas, by position among allowed calls.
    streamed: SmallVec<[usize; 4]>,
}

enum Step {
    Done,
    EmitAll,
    Hold { at: usize },
    Open { at: usize, len: usize },
    NeedMore,
    Closed { end: usize },
    Malformed { end: usize },
}

pub struct ToolSieve {
    allowed: ToolNameFilter,
    options: SieveOptions,
    pending: String,
    mode: SieveMode,
    next_index: usize,
    emitted_ids: FxHashMap<usize, String>,
}

impl ToolSieve {
    #[must_use]
    pub fn new(allowed: ToolNameFilter, options: SieveOptions) -> Self {
        Self {
            allowed,
            options,
            pending: String::new(),
            mode: SieveMode::Scanning,
            next_index: 0,
            emitted_ids: FxHashMap::default(),
        }
    }

    /// Whether a marker has opened and is still being captured.
    #[must_use]
    pub fn is_capturing(&self) -> bool {
        matches!(self.mode, SieveMode::Capturing(_))
    }

    /// Bytes currently held back from the client.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Id handed out for a tool-call index, if any.
    #[must_use]
    pub fn tool_call_id(&self, index: usize) -> Option<&str> {
        self.emitted_ids.get(&index).map(String::as_str)
    }

    /// Feed the next piece of assistant text.
    pub fn process_chunk(&mut self, text: &str) -> Vec<SieveEvent> {
        let mut events = Vec::new();
        if text.is_empty() {
            return events;
        }
        self.pending.push_str(text);
        self.drain(&mut events);
        events
    }

    /// Release whatever is still held back. Called once at stream end.
    pub fn flush(&mut self) -> Vec<SieveEvent> {
        let mut events = Vec::new();
        self.abandon_capture();
        let rest = std::mem::take(&mut self.pending);
        push_content(&mut events, rest);
        events
    }

    fn drain(&mut self, events: &mut Vec<SieveEvent>) {
        loop {
            let step = match &mut self.mode {
                SieveMode::Scanning if self.pending.is_empty() => Step::Done,
                SieveMode::Scanning => match find_open(self.pending.as_bytes()) {
                    OpenSearch::None => Step::EmitAll,
                    OpenSearch::Held { at } => Step::Hold { at },
                    OpenSearch::Opened { at, len } => Step::Open { at, len },
                },
                SieveMode::Capturing(capture) => match capture.tracker.advance(self.pending.as_bytes()) {
                    TrackStep::NeedMore => Step::NeedMore,
                    TrackStep::Closed { end } => Step::Closed { end },
                    TrackStep::Malformed { end } => Step::Malformed { end },
                },
            };

            match step {
                Step::Done => return,
                Step::EmitAll => {
                    let text = std::mem::take(&mut self.pending);
                    push_content(events, text);
                    return;
                }
                Step::Hold { at } => {
                    self.emit_prefix(events, at);
                    self.enforce_capture_limit(events);
                    return;
                }
                Step::Open { at, len } => {
                    self.emit_prefix(events, at);
                    self.mode = SieveMode::Capturing(Capture {
                        tracker: ArrayTracker::new(len - 1),
                        streamed: SmallVec::new(),
                    });
                }
                Step::NeedMore => {
                    if self.options.emit_early_deltas {
                        self.push_early_deltas(events);
                    }
                    self.enforce_capture_limit(events);
                    return;
                }
                Step::Closed { end } => self.complete_marker(events, end),
                Step::Malformed { end } => {
                    tracing::debug!(bytes = end, "tool-call marker malformed, releasing as content");
                    self.abandon_capture();
                    self.emit_prefix(events, end);
                }
            }
        }
    }

    /// Leave capture mode without a parsed marker. Indexes already handed out
    /// through early deltas stay taken.
    fn abandon_capture(&mut self) {
        if let SieveMode::Capturing(capture) = std::mem::replace(&mut self.mode, SieveMode::Scanning) {
            self.next_index += capture.streamed.len();
        }
    }

    fn emit_prefix(&mut self, events: &mut Vec<SieveEvent>, end: usize) {
        if end == 0 {
            return;
        }
        let rest = self.pending.split_off(end);
        let head = std::mem::replace(&mut self.pending, rest);
        push_content(events, head);
    }

    fn enforce_capture_limit(&mut self, events: &mut Vec<SieveEvent>) {
        if self.pending.len() <= self.options.max_capture_bytes {
            return;
        }
        tracing::debug!(
            bytes = self.pending.len(),
            limit = self.options.max_capture_bytes,
            "tool-call capture overflow, releasing as content"
        );
        self.abandon_capture();
        let text = std::mem::take(&mut self.pending);
        push_content(events, text);
    }

    fn push_early_deltas(&mut self, events: &mut Vec<SieveEvent>) {
        let SieveMode::Capturing(capture) = &mut self.mode else {
            return;
        };
        let body_start = capture.tracker.array_start + 1;
        let body = &self.pending.as_bytes()[body_start..];
        let mut deltas = Vec::new();
        let mut ordinal = 0;
        for view in scan_call_views(body) {
            let Some(name) = view.name.as_deref() else {
                if view.complete {
                    continue;
                }
                // name not written yet; later elements cannot exist
                break;
            };
            if !self.allowed.allows(name) {
                continue;
            }
            let index = self.next_index + ordinal;
            if capture.streamed.len() <= ordinal {
                capture.streamed.push(0);
            }
            let sent = capture.streamed[ordinal];
            let first = !self.emitted_ids.contains_key(&index);
            let arguments = view
                .arguments
                .as_ref()
                .filter(|range| range.len() > sent)
                .map(|range| {
                    self.pending[body_start + range.start + sent..body_start + range.end].to_string()
                })
                .unwrap_or_default();
            ordinal += 1;
            if !first && arguments.is_empty() {
                continue;
            }
            capture.streamed[ordinal - 1] = sent + arguments.len();
            let (id, name) = if first {
                let id = next_call_id();
                self.emitted_ids.insert(index, id.clone());
                (Some(id), Some(name.to_string()))
            } else {
                (None, None)
            };
            deltas.push(ToolCallDelta {
                index,
                id,
                name,
                arguments,
            });
        }
        if !deltas.is_empty() {
            events.push(SieveEvent::ToolCallDeltas(deltas));
        }
    }

    fn complete_marker(&mut self, events: &mut Vec<SieveEvent>, end: usize) {
        let SieveMode::Capturing(capture) = std::mem::replace(&mut self.mode, SieveMode::Scanning)
        else {
            return;
        };
        let array_start = capture.tracker.array_start;
        let array_end = capture.tracker.array_end.unwrap_or(end);

        // Same outcome whether the marker arrived in one chunk or many.
        if end > self.options.max_capture_bytes {
            tracing::debug!(
                bytes = end,
                limit = self.options.max_capture_bytes,
                "tool-call marker exceeds capture limit, releasing as content"
            );
            self.next_index += capture.streamed.len();
            self.emit_prefix(events, end);
            return;
        }

        let Some(parsed) = parse_call_array(&self.pending[array_start..array_end]) else {
            tracing::debug!("tool-call marker did not parse, releasing as content");
            self.next_index += capture.streamed.len();
            self.emit_prefix(events, end);
            return;
        };

        let views = if capture.streamed.is_empty() {
            SmallVec::new()
        } else {
            scan_call_views(&self.pending.as_bytes()[array_start + 1..array_end])
        };
        let mut streamed_views = views.iter().filter(|view| {
            view.name
                .as_deref()
                .is_some_and(|name| self.allowed.allows(name))
        });

        let mut tails = Vec::new();
        let mut calls = Vec::with_capacity(parsed.len());
        for (name, arguments) in parsed {
            if !self.allowed.allows(&name) {
                tracing::debug!(tool = %name, "dropping tool call for undeclared tool");
                continue;
            }
            let ordinal = calls.len();
            let index = self.next_index + ordinal;
            let view = if ordinal < capture.streamed.len() {
                streamed_views.next()
            } else {
                None
            };
            let streamed = match (view, self.emitted_ids.get(&index)) {
                (Some(view), Some(_)) => {
                    let sent = capture.streamed[ordinal];
                    // Deltas must add up to the final arguments. Nothing went
                    // out yet for string-encoded or absent arguments, so the
                    // tail carries the whole object.
                    let rest = if sent == 0 {
                        Some(serde_json::to_string(&arguments).unwrap_or_else(|_| "{}".to_string()))
                    } else {
                        view.arguments
                            .as_ref()
                            .filter(|range| range.len() > sent)
                            .map(|range| {
                                let from = array_start + 1 + range.start + sent;
                                let to = array_start + 1 + range.end;
                                self.pending[from..to].to_string()
                            })
                    };
                    if let Some(arguments) = rest {
                        tails.push(ToolCallDelta {
                            index,
                            id: None,
                            name: None,
                            arguments,
                        });
                    }
                    true
                }
                _ => false,
            };
            let id = self
                .emitted_ids
                .entry(index)
                .or_insert_with(next_call_id)
                .clone();
            calls.push(ToolCall {
                index,
                id,
                name,
                arguments,
                streamed,
            });
        }

        self.next_index += calls.len();
        self.pending.drain(..end);
        if !tails.is_empty() {
            events.push(SieveEvent::ToolCallDeltas(tails));
        }
        if !calls.is_empty() {
            events.push(SieveEvent::ToolCalls(calls));
        }
    }
}

fn push_content(events: &mut Vec<SieveEvent>, text: String) {
    if text.is_empty() {
        return;
    }
    if let Some(SieveEvent::Content(last)) = events.last_mut() {
        last.push_str(&text);
        return;
    }
    events.push(SieveEvent::Content(text));
}

#[cfg(test)]
mod tests {
    use super::*;

    const MARKER: &str = r#"{"tool_calls":[{"name":"search","input":{"q":"golang"}}]}"#;

    fn sieve(names: &[&str]) -> ToolSieve {
        ToolSieve::new(ToolNameFilter::new(names.iter().copied()), SieveOptions::default())
    }

    fn early_sieve(names: &[&str]) -> ToolSieve {
        ToolSieve::new(
            ToolNameFilter::new(names.iter().copied()),
            SieveOptions {
                emit_early_deltas: true,
                ..SieveOptions::default()
            },
        )
    }

    fn content_of(events: &[SieveEvent]) -> String {
        events
            .iter()
            .filter_map(|event| match event {
                SieveEvent::Content(text) => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    fn calls_of(events: &[SieveEvent]) -> Vec<ToolCall> {
        events
            .iter()
            .filter_map(|event| match event {
                SieveEvent::ToolCalls(calls) => Some(calls.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    fn deltas_of(events: &[SieveEvent]) -> Vec<ToolCallDelta> {
        events
            .iter()
            .filter_map(|event| match event {
                SieveEvent::ToolCallDeltas(deltas) => Some(deltas.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    fn run(sieve: &mut ToolSieve, chunks: &[&str]) -> Vec<SieveEvent> {
        let mut events = Vec::new();
        for chunk in chunks {
            events.extend(sieve.process_chunk(chunk));
        }
        events.extend(sieve.flush());
        events
    }

    #[test]
    fn plain_text_passes_through_immediately() {
        let mut s = sieve(&["search"]);
        let events = s.process_chunk("Hello, world");
        assert_eq!(events, vec![SieveEvent::Content("Hello, world".into())]);
        assert_eq!(s.pending_len(), 0);
    }

    #[test]
    fn braces_that_cannot_open_a_marker_are_not_held() {
        let mut s = sieve(&["search"]);
        let events = s.process_chunk("fn main() { println!(\"{}\", x); }");
        assert_eq!(content_of(&events), "fn main() { println!(\"{}\", x); }");
        assert_eq!(s.pending_len(), 0);
    }

    #[test]
    fn trailing_brace_is_held_until_the_next_chunk() {
        let mut s = sieve(&["search"]);
        let first = s.process_chunk("value = {");
        assert_eq!(content_of(&first), "value = ");
        let second = s.process_chunk("\"a\": 1}");
        assert_eq!(content_of(&second), "{\"a\": 1}");
    }

    #[test]
    fn whole_marker_yields_one_call_and_no_content() {
        let mut s = sieve(&["search"]);
        let events = run(&mut s, &[MARKER]);
        assert_eq!(content_of(&events), "");
        let calls = calls_of(&events);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "search");
        assert_eq!(calls[0].arguments_json(), r#"{"q":"golang"}"#);
        assert!(!calls[0].streamed);
    }

    #[test]
    fn marker_split_inside_key_is_detected() {
        let (head, tail) = MARKER.split_at(8); // ends inside `tool_calls`
        let mut s = sieve(&["search"]);
        let events = run(&mut s, &["Sure. ", head, tail, " Done."]);
        assert_eq!(content_of(&events), "Sure.  Done.");
        assert_eq!(calls_of(&events).len(), 1);
    }

    #[test]
    fn marker_fed_one_char_at_a_time_is_detected() {
        let text = format!("before {MARKER} after");
        let chars: Vec<String> = text.chars().map(String::from).collect();
        let chunks: Vec<&str> = chars.iter().map(String::as_str).collect();
        let mut s = sieve(&["search"]);
        let events = run(&mut s, &chunks);
        assert_eq!(content_of(&events), "before  after");
        assert_eq!(calls_of(&events).len(), 1);
    }

    #[test]
    fn content_order_is_preserved_around_tool_calls() {
        let mut s = sieve(&["search"]);
        let events = s.process_chunk(&format!("A{MARKER}B"));
        assert!(matches!(&events[0], SieveEvent::Content(t) if t == "A"));
        assert!(matches!(&events[1], SieveEvent::ToolCalls(c) if c.len() == 1));
        assert!(matches!(&events[2], SieveEvent::Content(t) if t == "B"));
    }

    #[test]
    fn unknown_tool_marker_is_dropped() {
        let mut s = sieve(&["search"]);
        let text = r#"x{"tool_calls":[{"name":"delete_all","input":{}}]}y"#;
        let events = run(&mut s, &[text]);
        assert_eq!(content_of(&events), "xy");
        assert!(calls_of(&events).is_empty());
    }

    #[test]
    fn unparseable_marker_is_released_as_content() {
        let mut s = sieve(&["search"]);
        let text = r#"{"tool_calls":[{"name":"search","input":{'q':1}}]} tail"#;
        let events = run(&mut s, &[text]);
        assert_eq!(content_of(&events), text);
        assert!(calls_of(&events).is_empty());
    }

    #[test]
    fn extra_top_level_key_is_not_a_marker() {
        let mut s = sieve(&["search"]);
        let text = r#"{"tool_calls":[], "note": "x"}"#;
        let events = run(&mut s, &[text]);
        assert_eq!(content_of(&events), text);
    }

    #[test]
    fn unclosed_marker_is_recovered_by_flush() {
        let mut s = sieve(&["search"]);
        let partial = r#"{"tool_calls":[{"name":"search","input":{"q":"go"#;
        let live = s.process_chunk(partial);
        assert!(live.is_empty());
        assert!(s.is_capturing());
        let flushed = s.flush();
        assert_eq!(content_of(&flushed), partial);
        assert_eq!(s.pending_len(), 0);
    }

    #[test]
    fn capture_overflow_releases_buffer() {
        let mut s = ToolSieve::new(
            ToolNameFilter::new(["search"]),
            SieveOptions {
                emit_early_deltas: false,
                max_capture_bytes: 64,
            },
        );
        let mut text = String::from(r#"{"tool_calls":[{"name":"search","input":{"q":""#);
        text.push_str(&"x".repeat(100));
        let events = s.process_chunk(&text);
        assert_eq!(content_of(&events), text);
        assert!(!s.is_capturing());
        assert_eq!(s.pending_len(), 0);
    }

    #[test]
    fn indexes_continue_across_markers() {
        let mut s = sieve(&["search"]);
        let events = run(&mut s, &[MARKER, " and ", MARKER]);
        let calls = calls_of(&events);
        assert_eq!(calls.iter().map(|c| c.index).collect::<Vec<_>>(), vec![0, 1]);
        assert_ne!(calls[0].id, calls[1].id);
        assert_eq!(s.tool_call_id(1), Some(calls[1].id.as_str()));
    }

    #[test]
    fn early_deltas_carry_id_once_and_rebuild_arguments() {
        let mut s = early_sieve(&["search"]);
        let chunks = [
            r#"{"tool_calls":[{"name":"search","#,
            r#""input":{"q":"gol"#,
            r#"ang"}}]}"#,
        ];
        let events = run(&mut s, &chunks);

        let deltas: Vec<ToolCallDelta> = events
            .iter()
            .filter_map(|event| match event {
                SieveEvent::ToolCallDeltas(deltas) => Some(deltas.clone()),
                _ => None,
            })
            .flatten()
            .collect();
        assert!(deltas.len() >= 2);
        assert!(deltas[0].id.is_some());
        assert_eq!(deltas[0].name.as_deref(), Some("search"));
        assert!(deltas[1..].iter().all(|d| d.id.is_none() && d.name.is_none()));
        let arguments: String = deltas.iter().map(|d| d.arguments.as_str()).collect();
        assert_eq!(arguments, r#"{"q":"golang"}"#);

        let calls = calls_of(&events);
        assert_eq!(calls.len(), 1);
        assert!(calls[0].streamed);
        assert_eq!(Some(calls[0].id.clone()), deltas[0].id);
        assert_eq!(content_of(&events), "");
    }

    #[test]
    fn early_deltas_skip_undeclared_tools() {
        let mut s = early_sieve(&["search"]);
        let events = s.process_chunk(r#"{"tool_calls":[{"name":"other","input":{"a":"#);
        assert!(events.is_empty());
    }

    #[test]
    fn early_deltas_deliver_string_encoded_arguments() {
        let mut s = early_sieve(&["search"]);
        let chunks = [
            r#"{"tool_calls":[{"name":"search","#,
            r#""arguments":"{\"q\":\"rust\"}"}]}"#,
        ];
        let events = run(&mut s, &chunks);
        let deltas = deltas_of(&events);
        assert_eq!(deltas[0].name.as_deref(), Some("search"));
        let arguments: String = deltas.iter().map(|d| d.arguments.as_str()).collect();
        assert_eq!(arguments, r#"{"q":"rust"}"#);
        let calls = calls_of(&events);
        assert!(calls[0].streamed);
        assert_eq!(calls[0].arguments_json(), arguments);
    }

    #[test]
    fn early_deltas_deliver_empty_object_without_arguments() {
        let mut s = early_sieve(&["search"]);
        let events = run(&mut s, &[r#"{"tool_calls":[{"name":"search""#, "}]}"]);
        let arguments: String = deltas_of(&events).iter().map(|d| d.arguments.as_str()).collect();
        assert_eq!(arguments, "{}");
        assert!(calls_of(&events)[0].streamed);
    }

    #[test]
    fn malformed_marker_after_early_deltas_keeps_its_index() {
        let mut s = early_sieve(&["search"]);
        let broken = [
            r#"{"tool_calls":[{"name":"search","input":{"q":"a"#,
            r#""}}], "note": 1}"#,
        ];
        let first = run(&mut s, &broken);
        assert_eq!(deltas_of(&first)[0].index, 0);
        assert!(calls_of(&first).is_empty());
        assert_eq!(content_of(&first), broken.concat());

        let second = run(&mut s, &[r#"{"tool_calls":[{"name":"search","#, r#""input":{}}]}"#]);
        let deltas = deltas_of(&second);
        assert_eq!(deltas[0].index, 1);
        assert!(deltas[0].id.is_some());
        assert_eq!(calls_of(&second)[0].index, 1);
    }

    #[test]
    fn marker_over_the_limit_stays_text_even_in_one_chunk() {
        let mut s = ToolSieve::new(
            ToolNameFilter::new(["search"]),
            SieveOptions {
                emit_early_deltas: false,
                max_capture_bytes: 32,
            },
        );
        let events = run(&mut s, &[MARKER]);
        assert_eq!(content_of(&events), MARKER);
        assert!(calls_of(&events).is_empty());
    }
}
