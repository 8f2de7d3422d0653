//! Grammar of the in-band tool-call marker:
//! `{` ws* quote `tool_calls` quote ws* `:` ws* `[` ... `]` ws* `}`.

use memchr::memchr;
use serde::Deserialize;
use serde_json::{Map, Value};
use smallvec::SmallVec;

use crate::json_scan::{skip_ws, string_end, value_end, ScanError};

const MARKER_KEY: &[u8] = b"tool_calls";
const ARGUMENT_KEYS: [&[u8]; 3] = [b"input", b"arguments", b"parameters"];

/// How far the text starting at a `{` matches the opening of a marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpenMatch {
    Mismatch,
    /// Every available byte matches but the opening is not finished yet.
    Partial,
    /// The opening matched; `len` bytes up to and including the `[`.
    Complete { len: usize },
}

pub(crate) fn match_open(bytes: &[u8]) -> OpenMatch {
    if bytes.first() != Some(&b'{') {
        return OpenMatch::Mismatch;
    }
    let mut i = skip_ws(bytes, 1);
    let Some(&quote) = bytes.get(i) else {
        return OpenMatch::Partial;
    };
    if quote != b'"' && quote != b'\'' {
        return OpenMatch::Mismatch;
    }
    i += 1;
    for &expected in MARKER_KEY.iter().chain(std::iter::once(&quote)) {
        match bytes.get(i) {
            None => return OpenMatch::Partial,
            Some(&b) if b == expected => i += 1,
            Some(_) => return OpenMatch::Mismatch,
        }
    }
    for expected in [b':', b'['] {
        i = skip_ws(bytes, i);
        match bytes.get(i) {
            None => return OpenMatch::Partial,
            Some(&b) if b == expected => i += 1,
            Some(_) => return OpenMatch::Mismatch,
        }
    }
    OpenMatch::Complete { len: i }
}

/// Result of looking for a marker opening in scanning mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpenSearch {
    None,
    /// A candidate opening starts at `at` but runs into the end of the text.
    Held { at: usize },
    Opened { at: usize, len: usize },
}

pub(crate) fn find_open(bytes: &[u8]) -> OpenSearch {
    let mut from = 0;
    while let Some(rel) = memchr(b'{', &bytes[from..]) {
        let at = from + rel;
        match match_open(&bytes[at..]) {
            OpenMatch::Mismatch => from = at + 1,
            OpenMatch::Partial => return OpenSearch::Held { at },
            OpenMatch::Complete { len } => return OpenSearch::Opened { at, len },
        }
    }
    OpenSearch::None
}

/// Bracket tracker for the argument array of an opened marker.
#[derive(Debug, Clone)]
pub(crate) struct ArrayTracker {
    /// Offset of the opening `[`.
    pub(crate) array_start: usize,
    cursor: usize,
    depth: u32,
    in_string: bool,
    escaped: bool,
    /// Offset one past the closing `]`, once seen.
    pub(crate) array_end: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TrackStep {
    NeedMore,
    /// The marker ends right before `end`.
    Closed { end: usize },
    /// The text stopped following the grammar at `end`.
    Malformed { end: usize },
}

impl ArrayTracker {
    pub(crate) fn new(array_start: usize) -> Self {
        Self {
            array_start,
            cursor: array_start + 1,
            depth: 1,
            in_string: false,
            escaped: false,
            array_end: None,
        }
    }

    /// Continue from where the previous call stopped.
    pub(crate) fn advance(&mut self, bytes: &[u8]) -> TrackStep {
        while self.array_end.is_none() {
            let Some(&b) = bytes.get(self.cursor) else {
                return TrackStep::NeedMore;
            };
            self.cursor += 1;
            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if b == b'\\' {
                    self.escaped = true;
                } else if b == b'"' {
                    self.in_string = false;
                }
                continue;
            }
            match b {
                b'"' => self.in_string = true,
                b'[' | b'{' => self.depth += 1,
                b']' | b'}' => {
                    self.depth -= 1;
                    if self.depth == 0 {
                        if b != b']' {
                            return TrackStep::Malformed { end: self.cursor };
                        }
                        self.array_end = Some(self.cursor);
                    }
                }
                _ => {}
            }
        }

        self.cursor = skip_ws(bytes, self.cursor);
        match bytes.get(self.cursor) {
            None => TrackStep::NeedMore,
            Some(b'}') => TrackStep::Closed {
                end: self.cursor + 1,
            },
            Some(_) => TrackStep::Malformed { end: self.cursor },
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawCall {
    #[serde(default)]
    name: String,
    #[serde(default, alias = "arguments", alias = "parameters")]
    input: Option<Value>,
}

/// Parse the complete `[...]` argument array of a marker.
///
/// Returns `None` when the array is not a list of call objects; calls with
/// an empty name are skipped.
pub(crate) fn parse_call_array(array_text: &str) -> Option<Vec<(String, Map<String, Value>)>> {
    let raw: Vec<RawCall> = serde_json::from_str(array_text).ok()?;
    let mut calls = Vec::with_capacity(raw.len());
    for call in raw {
        let name = call.name.trim();
        if name.is_empty() {
            continue;
        }
        let arguments = match call.input {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map,
            Some(Value::String(encoded)) => match serde_json::from_str::<Value>(&encoded) {
                Ok(Value::Object(map)) => map,
                _ => return None,
            },
            Some(_) => return None,
        };
        calls.push((name.to_string(), arguments));
    }
    Some(calls)
}

/// What is known so far about one element of a growing argument array.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct CallView {
    pub(crate) name: Option<String>,
    /// Byte range of the argument object relative to the array body; the end
    /// is the end of the buffer while the object is still growing.
    pub(crate) arguments: Option<std::ops::Range<usize>>,
    pub(crate) complete: bool,
}

/// Walk the elements of an argument array body (the bytes after `[`),
/// tolerating truncation of the last element.
pub(crate) fn scan_call_views(body: &[u8]) -> SmallVec<[CallView; 4]> {
    let mut views = SmallVec::new();
    let mut i = skip_ws(body, 0);
    while body.get(i) == Some(&b'{') {
        let (view, end) = scan_call_object(body, i);
        views.push(view);
        let Some(end) = end else {
            break;
        };
        i = skip_ws(body, end);
        if body.get(i) != Some(&b',') {
            break;
        }
        i = skip_ws(body, i + 1);
    }
    views
}

fn scan_call_object(body: &[u8], start: usize) -> (CallView, Option<usize>) {
    let mut view = CallView::default();
    let mut i = start + 1;
    loop {
        i = skip_ws(body, i);
        match body.get(i) {
            Some(b'}') => {
                view.complete = true;
                return (view, Some(i + 1));
            }
            Some(b'"') => {}
            _ => return (view, None),
        }
        let Ok(key_end) = string_end(body, i) else {
            return (view, None);
        };
        let key = &body[i + 1..key_end - 1];
        i = skip_ws(body, key_end);
        if body.get(i) != Some(&b':') {
            return (view, None);
        }
        i = skip_ws(body, i + 1);
        let is_arguments = ARGUMENT_KEYS.contains(&key) && body.get(i) == Some(&b'{');
        match value_end(body, i) {
            Ok(end) => {
                if key == b"name" {
                    view.name = serde_json::from_slice::<String>(&body[i..end])
                        .ok()
                        .map(|name| name.trim().to_string());
                } else if is_arguments {
                    view.arguments = Some(i..end);
                }
                i = skip_ws(body, end);
                match body.get(i) {
                    Some(b',') => i += 1,
                    Some(b'}') => {
                        view.complete = true;
                        return (view, Some(i + 1));
                    }
                    _ => return (view, None),
                }
            }
            Err(ScanError::Incomplete) => {
                if is_arguments {
                    view.arguments = Some(i..body.len());
                }
                return (view, None);
            }
            Err(ScanError::Invalid) => return (view, None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opening_accepts_both_quote_styles_and_whitespace() {
        assert_eq!(
            match_open(br#"{"tool_calls":["#),
            OpenMatch::Complete { len: 15 }
        );
        assert_eq!(
            match_open(b"{ \n 'tool_calls' :\t[ rest"),
            OpenMatch::Complete { len: 20 }
        );
    }

    #[test]
    fn opening_prefixes_are_partial() {
        for text in ["{", "{ ", "{\"", "{\"tool_", "{\"tool_calls\"", "{'tool_calls' :"] {
            assert_eq!(match_open(text.as_bytes()), OpenMatch::Partial, "{text}");
        }
    }

    #[test]
    fn opening_rejects_other_objects() {
        for text in [
            "{\"name\":1}",
            "{\"tool_calls':[",
            "{\"tool_calls\":{",
            "{tool_calls:[",
            "{}",
        ] {
            assert_eq!(match_open(text.as_bytes()), OpenMatch::Mismatch, "{text}");
        }
    }

    #[test]
    fn find_open_skips_unrelated_braces() {
        let text = br#"fn x() { y } then {"tool_calls": ["#;
        assert_eq!(find_open(text), OpenSearch::Opened { at: 18, len: 16 });
        assert_eq!(find_open(b"if (a) {"), OpenSearch::Held { at: 7 });
        assert_eq!(find_open(b"{a} {b}"), OpenSearch::None);
    }

    #[test]
    fn tracker_ignores_brackets_inside_strings() {
        let text = br#"{"tool_calls":[{"name":"a","input":{"q":"]}"}}]} after"#;
        let mut tracker = ArrayTracker::new(14);
        let end = match tracker.advance(text) {
            TrackStep::Closed { end } => end,
            other => panic!("expected closed marker, got {other:?}"),
        };
        assert_eq!(&text[end..], b" after");
    }

    #[test]
    fn tracker_resumes_across_chunks() {
        let full = br#"{"tool_calls":[{"name":"a"}] }"#;
        let mut tracker = ArrayTracker::new(14);
        assert_eq!(tracker.advance(&full[..20]), TrackStep::NeedMore);
        assert_eq!(tracker.advance(&full[..28]), TrackStep::NeedMore);
        assert_eq!(tracker.advance(full), TrackStep::Closed { end: full.len() });
    }

    #[test]
    fn tracker_flags_extra_keys_as_malformed() {
        let text = br#"{"tool_calls":[], "other": 1}"#;
        let mut tracker = ArrayTracker::new(14);
        assert_eq!(tracker.advance(text), TrackStep::Malformed { end: 16 });
    }

    #[test]
    fn parse_call_array_skips_nameless_calls_and_defaults_arguments() {
        let calls = parse_call_array(r#"[{"name":" search ","input":{"q":"go"}},{"name":""},{"name":"ping"}]"#)
            .expect("valid array");
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, "search");
        assert_eq!(calls[0].1.get("q"), Some(&Value::from("go")));
        assert_eq!(calls[1].0, "ping");
        assert!(calls[1].1.is_empty());
    }

    #[test]
    fn parse_call_array_accepts_encoded_arguments() {
        let calls = parse_call_array(r#"[{"name":"a","arguments":"{\"x\":1}"}]"#).expect("valid");
        assert_eq!(calls[0].1.get("x"), Some(&Value::from(1)));
        assert!(parse_call_array(r#"[{"name":"a","input":[1]}]"#).is_none());
        assert!(parse_call_array("[1,2]").is_none());
    }

    #[test]
    fn call_views_follow_a_growing_array() {
        let body = br#"{"name":"search","input":{"q":"gol"#;
        let views = scan_call_views(body);
        assert_eq!(views.len(), 1);
        assert_eq!(views[0].name.as_deref(), Some("search"));
        let args = views[0].arguments.clone().expect("arguments started");
        assert_eq!(&body[args], br#"{"q":"gol"#);
        assert!(!views[0].complete);

        let body = br#"{"name":"a","input":{}}, {"input":{"k":1},"name":"b"}]"#;
        let views = scan_call_views(body);
        assert_eq!(views.len(), 2);
        assert!(views.iter().all(|view| view.complete));
        assert_eq!(views[1].name.as_deref(), Some("b"));
    }
}
