//! Detection of tool calls the upstream model writes inline as JSON text.

mod marker;
pub mod prompt;
pub mod sieve;

use rustc_hash::FxHashSet;
use serde_json::{Map, Value};

pub use sieve::{SieveEvent, SieveOptions, ToolSieve};

/// A fully parsed tool call.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    /// Position among all tool calls of the stream.
    pub index: usize,
    pub id: String,
    pub name: String,
    pub arguments: Map<String, Value>,
    /// Argument text for this call already went out as incremental deltas.
    pub streamed: bool,
}

impl ToolCall {
    #[must_use]
    pub fn arguments_json(&self) -> String {
        serde_json::to_string(&self.arguments).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Incremental piece of a tool call that is still being written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCallDelta {
    pub index: usize,
    /// Present only on the first delta of an index.
    pub id: Option<String>,
    /// Present only on the first delta of an index.
    pub name: Option<String>,
    pub arguments: String,
}

/// Tool names a request declared; calls naming anything else are dropped.
#[derive(Debug, Clone, Default)]
pub struct ToolNameFilter {
    names: FxHashSet<String>,
}

impl ToolNameFilter {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names
                .into_iter()
                .map(Into::into)
                .filter(|name: &String| !name.trim().is_empty())
                .collect(),
        }
    }

    #[must_use]
    pub fn allows(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }
}

/// Scan complete text for tool-call markers and return the allowed calls.
#[must_use]
pub fn parse_tool_calls(text: &str, allowed: &ToolNameFilter) -> Vec<ToolCall> {
    parse_tool_calls_with_limit(text, allowed, SieveOptions::default().max_capture_bytes)
}

/// Like [`parse_tool_calls`], but a marker longer than `max_capture_bytes`
/// stays text, matching a live sieve built with the same limit.
#[must_use]
pub fn parse_tool_calls_with_limit(
    text: &str,
    allowed: &ToolNameFilter,
    max_capture_bytes: usize,
) -> Vec<ToolCall> {
    if allowed.is_empty() || !text.contains("tool_calls") {
        return Vec::new();
    }
    let options = SieveOptions {
        emit_early_deltas: false,
        max_capture_bytes,
    };
    let mut sieve = ToolSieve::new(allowed.clone(), options);
    let mut events = sieve.process_chunk(text);
    events.extend(sieve.flush());
    events
        .into_iter()
        .filter_map(|event| match event {
            SieveEvent::ToolCalls(calls) => Some(calls),
            _ => None,
        })
        .flatten()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(names: &[&str]) -> ToolNameFilter {
        ToolNameFilter::new(names.iter().copied())
    }

    #[test]
    fn parse_tool_calls_finds_marker_in_prose() {
        let text = r#"Let me look that up. {"tool_calls": [{"name": "search", "input": {"q": "golang"}}]}"#;
        let calls = parse_tool_calls(text, &filter(&["search"]));
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "search");
        assert_eq!(calls[0].arguments_json(), r#"{"q":"golang"}"#);
        assert!(calls[0].id.starts_with("call_"));
        assert_eq!(calls[0].index, 0);
    }

    #[test]
    fn parse_tool_calls_drops_unknown_tools() {
        let text = r#"{"tool_calls":[{"name":"rm_rf","input":{}},{"name":"search","input":{}}]}"#;
        let calls = parse_tool_calls(text, &filter(&["search"]));
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "search");
    }

    #[test]
    fn parse_tool_calls_numbers_multiple_markers_in_order() {
        let text = concat!(
            r#"{"tool_calls":[{"name":"a"}]} and "#,
            r#"{'tool_calls': [{"name":"b","input":{"k":[1,2]}}]}"#,
        );
        let calls = parse_tool_calls(text, &filter(&["a", "b"]));
        let names: Vec<_> = calls.iter().map(|c| (c.index, c.name.as_str())).collect();
        assert_eq!(names, vec![(0, "a"), (1, "b")]);
    }

    #[test]
    fn oversized_marker_is_not_a_call() {
        let text = r#"{"tool_calls":[{"name":"search","input":{"q":"a rather long query string"}}]}"#;
        assert!(parse_tool_calls_with_limit(text, &filter(&["search"]), 32).is_empty());
        assert_eq!(parse_tool_calls_with_limit(text, &filter(&["search"]), text.len()).len(), 1);
    }

    #[test]
    fn empty_filter_detects_nothing() {
        let text = r#"{"tool_calls":[{"name":"search","input":{}}]}"#;
        assert!(parse_tool_calls(text, &ToolNameFilter::default()).is_empty());
    }

    #[test]
    fn unclosed_marker_yields_no_calls() {
        let text = r#"{"tool_calls":[{"name":"search","input":{"q":"#;
        assert!(parse_tool_calls(text, &filter(&["search"])).is_empty());
    }
}
