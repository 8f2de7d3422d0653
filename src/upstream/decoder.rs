//! Decoder for the upstream completion stream.
//!
//! The upstream writes one self-contained record per line:
//!
//! ```text
//! data: {"v":{"response":{...}}}
//! data: {"p":"response/thinking_content","v":"Let"}
//! data: {"v":" me"}
//! data: {"p":"response/content","v":"Hello"}
//! data: {"p":"response/status","v":"FINISHED"}
//! data: [DONE]
//! ```
//!
//! Records without a path continue the channel of the previous record, so
//! the caller threads [`DecodedRecord::next_kind`] into the next call.

use serde_json::Value;

const THINKING_PATH: &str = "response/thinking_content";
const CONTENT_PATH: &str = "response/content";
const SEARCH_STATUS_PATH: &str = "response/search_status";
const FRAGMENTS_PATH: &str = "response/fragments";
const FINISHED: &str = "FINISHED";
const CONTENT_FILTER_CODE: &str = "content_filter";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragmentKind {
    Text,
    Reasoning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamFragment {
    pub kind: FragmentKind,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeContext {
    pub thinking_enabled: bool,
    pub current_kind: FragmentKind,
}

impl DecodeContext {
    /// Context for the first record of a stream.
    #[must_use]
    pub fn initial(thinking_enabled: bool) -> Self {
        Self {
            thinking_enabled,
            current_kind: if thinking_enabled {
                FragmentKind::Reasoning
            } else {
                FragmentKind::Text
            },
        }
    }

    #[must_use]
    pub fn advance(self, record: &DecodedRecord) -> Self {
        Self {
            current_kind: record.next_kind,
            ..self
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedRecord {
    /// `false` for lines that carry no payload; such records have no effect.
    pub parsed: bool,
    pub fragments: Vec<UpstreamFragment>,
    pub content_filtered: bool,
    pub error_message: Option<String>,
    pub stop: bool,
    pub next_kind: FragmentKind,
}

impl DecodedRecord {
    fn ignored(kind: FragmentKind) -> Self {
        Self {
            parsed: false,
            fragments: Vec::new(),
            content_filtered: false,
            error_message: None,
            stop: false,
            next_kind: kind,
        }
    }

    fn empty(kind: FragmentKind) -> Self {
        Self {
            parsed: true,
            ..Self::ignored(kind)
        }
    }
}

/// Decode one upstream line.
#[must_use]
pub fn decode_line(line: &str, ctx: DecodeContext) -> DecodedRecord {
    let line = line.trim();
    let Some(payload) = line.strip_prefix("data:") else {
        return DecodedRecord::ignored(ctx.current_kind);
    };
    let payload = payload.trim();
    if payload.is_empty() {
        return DecodedRecord::ignored(ctx.current_kind);
    }
    if payload == "[DONE]" {
        return DecodedRecord {
            stop: true,
            ..DecodedRecord::empty(ctx.current_kind)
        };
    }

    let chunk: Value = match serde_json::from_str(payload) {
        Ok(chunk) => chunk,
        Err(err) => {
            tracing::debug!(error = %err, "skipping undecodable upstream record");
            return DecodedRecord::ignored(ctx.current_kind);
        }
    };
    decode_chunk(&chunk, ctx)
}

fn decode_chunk(chunk: &Value, ctx: DecodeContext) -> DecodedRecord {
    let mut record = DecodedRecord::empty(ctx.current_kind);

    if let Some(error) = chunk.get("error") {
        record.content_filtered = is_content_filter(chunk) || is_content_filter(error);
        record.error_message = Some(error_text(error));
        return record;
    }
    if is_content_filter(chunk) {
        record.content_filtered = true;
        return record;
    }

    let path = chunk.get("p").and_then(Value::as_str).unwrap_or("");
    if path == SEARCH_STATUS_PATH {
        return record;
    }
    let Some(value) = chunk.get("v") else {
        return record;
    };
    if path.ends_with("status") {
        record.stop = value.as_str() == Some(FINISHED);
        return record;
    }

    let kind = kind_for_path(path, ctx.current_kind);
    record.next_kind = kind;
    match value {
        Value::String(text) => push_fragment(&mut record.fragments, kind, text),
        Value::Array(items) => {
            if path.contains(FRAGMENTS_PATH) {
                // fragment objects decide their own channel
                record.next_kind = walk_items(items, kind, &mut record);
            } else {
                walk_items(items, kind, &mut record);
            }
        }
        _ => {}
    }
    record
}

fn kind_for_path(path: &str, current: FragmentKind) -> FragmentKind {
    match path {
        "" => current,
        THINKING_PATH => FragmentKind::Reasoning,
        CONTENT_PATH => FragmentKind::Text,
        p if p.contains("thinking") => FragmentKind::Reasoning,
        p if p.contains("content") || p == "response" => FragmentKind::Text,
        _ => current,
    }
}

/// Returns the channel of the last fragment seen.
fn walk_items(items: &[Value], kind: FragmentKind, record: &mut DecodedRecord) -> FragmentKind {
    let mut last = kind;
    for item in items {
        if record.stop {
            break;
        }
        match item {
            Value::String(text) => push_fragment(&mut record.fragments, kind, text),
            Value::Object(map) => {
                if let Some(fragment_type) = map.get("type").and_then(Value::as_str) {
                    let fragment_kind = match fragment_type.to_ascii_uppercase().as_str() {
                        "THINK" | "THINKING" => FragmentKind::Reasoning,
                        "RESPONSE" => FragmentKind::Text,
                        _ => continue,
                    };
                    if let Some(text) = map.get("content").and_then(Value::as_str) {
                        push_fragment(&mut record.fragments, fragment_kind, text);
                    }
                    last = fragment_kind;
                    continue;
                }

                let item_path = map.get("p").and_then(Value::as_str).unwrap_or("");
                if item_path == SEARCH_STATUS_PATH {
                    continue;
                }
                let Some(value) = map.get("v") else {
                    continue;
                };
                if item_path.ends_with("status") {
                    if value.as_str() == Some(FINISHED) {
                        record.stop = true;
                    }
                    continue;
                }
                let item_kind = kind_for_path(item_path, kind);
                match value {
                    Value::String(text) => {
                        push_fragment(&mut record.fragments, item_kind, text);
                        last = item_kind;
                    }
                    Value::Array(nested) => last = walk_items(nested, item_kind, record),
                    _ => {}
                }
            }
            _ => {}
        }
    }
    last
}

fn push_fragment(fragments: &mut Vec<UpstreamFragment>, kind: FragmentKind, text: &str) {
    if text.is_empty() {
        return;
    }
    fragments.push(UpstreamFragment {
        kind,
        text: text.to_string(),
    });
}

fn is_content_filter(value: &Value) -> bool {
    value.get("code").and_then(Value::as_str) == Some(CONTENT_FILTER_CODE)
}

fn error_text(error: &Value) -> String {
    match error {
        Value::String(message) => message.clone(),
        Value::Object(map) => map
            .get("message")
            .and_then(Value::as_str)
            .map_or_else(|| error.to_string(), str::to_string),
        other => other.to_string(),
    }
}

/// Inline citation markers the upstream injects when web search is enabled.
#[must_use]
pub fn is_citation(text: &str) -> bool {
    text.trim_start().starts_with("[citation:")
}
