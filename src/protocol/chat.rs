//! OpenAI chat-completions frames.

use bytes::Bytes;
use serde_json::{json, Map, Value};

use crate::stream::{StreamRenderer, StreamSummary, TerminalReason};
use crate::toolcall::{ToolCall, ToolCallDelta};
use crate::util::{prefixed_uuid, push_json_string_escaped, push_u64_decimal, push_usize_decimal, unix_now_secs};

pub struct ChatRenderer {
    id: String,
    model: String,
    created: u64,
}

impl ChatRenderer {
    #[must_use]
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            id: prefixed_uuid("chatcmpl-"),
            model: model.into(),
            created: unix_now_secs(),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    fn chunk_prefix(&self, capacity: usize) -> String {
        let mut out = String::with_capacity(128 + self.id.len() + self.model.len() + capacity);
        out.push_str("data: {\"id\":");
        push_json_string_escaped(&mut out, &self.id);
        out.push_str(",\"object\":\"chat.completion.chunk\",\"created\":");
        push_u64_decimal(&mut out, self.created);
        out.push_str(",\"model\":");
        push_json_string_escaped(&mut out, &self.model);
        out
    }

    /// One choice delta; `body` is the delta object's inner fields.
    fn delta_frame(&self, with_role: bool, body: &str) -> Bytes {
        let mut out = self.chunk_prefix(body.len());
        out.push_str(",\"choices\":[{\"index\":0,\"delta\":{");
        if with_role {
            out.push_str("\"role\":\"assistant\"");
            if !body.is_empty() {
                out.push(',');
            }
        }
        out.push_str(body);
        out.push_str("},\"finish_reason\":null}]}\n\n");
        Bytes::from(out)
    }

    fn text_frame(&self, field: &str, text: &str, with_role: bool) -> Bytes {
        let mut body = String::with_capacity(field.len() + text.len() + 8);
        push_json_string_escaped(&mut body, field);
        body.push(':');
        push_json_string_escaped(&mut body, text);
        self.delta_frame(with_role, &body)
    }
}

fn push_tool_call_item(
    out: &mut String,
    index: usize,
    id: Option<&str>,
    name: Option<&str>,
    arguments: &str,
) {
    out.push_str("{\"index\":");
    push_usize_decimal(out, index);
    if let Some(id) = id {
        out.push_str(",\"id\":");
        push_json_string_escaped(out, id);
        out.push_str(",\"type\":\"function\"");
    }
    out.push_str(",\"function\":{");
    if let Some(name) = name {
        out.push_str("\"name\":");
        push_json_string_escaped(out, name);
        out.push(',');
    }
    out.push_str("\"arguments\":");
    push_json_string_escaped(out, arguments);
    out.push_str("}}");
}

/// `tool_calls` entries for a non-streaming message.
#[must_use]
pub fn tool_calls_json(calls: &[ToolCall]) -> Value {
    Value::Array(
        calls
            .iter()
            .map(|call| {
                json!({
                    "id": call.id,
                    "type": "function",
                    "function": {"name": call.name, "arguments": call.arguments_json()},
                })
            })
            .collect(),
    )
}

impl StreamRenderer for ChatRenderer {
    fn render_content(&mut self, text: &str, with_role: bool, out: &mut Vec<Bytes>) {
        if text.is_empty() {
            return;
        }
        out.push(self.text_frame("content", text, with_role));
    }

    fn render_reasoning(&mut self, text: &str, with_role: bool, out: &mut Vec<Bytes>) {
        if text.is_empty() {
            return;
        }
        out.push(self.text_frame("reasoning_content", text, with_role));
    }

    fn render_tool_call_deltas(&mut self, deltas: &[ToolCallDelta], with_role: bool, out: &mut Vec<Bytes>) {
        if deltas.is_empty() {
            return;
        }
        let mut body = String::from("\"tool_calls\":[");
        for (i, delta) in deltas.iter().enumerate() {
            if i > 0 {
                body.push(',');
            }
            push_tool_call_item(
                &mut body,
                delta.index,
                delta.id.as_deref(),
                delta.name.as_deref(),
                &delta.arguments,
            );
        }
        body.push(']');
        out.push(self.delta_frame(with_role, &body));
    }

    fn render_tool_calls(&mut self, calls: &[ToolCall], with_role: bool, out: &mut Vec<Bytes>) {
        let mut body = String::from("\"tool_calls\":[");
        let mut any = false;
        // arguments of streamed calls already went out as deltas
        for call in calls.iter().filter(|call| !call.streamed) {
            if any {
                body.push(',');
            }
            any = true;
            push_tool_call_item(
                &mut body,
                call.index,
                Some(&call.id),
                Some(&call.name),
                &call.arguments_json(),
            );
        }
        if !any {
            return;
        }
        body.push(']');
        out.push(self.delta_frame(with_role, &body));
    }

    fn completed_record(&self, summary: &StreamSummary<'_>) -> Value {
        let mut message = Map::new();
        message.insert("role".into(), Value::from("assistant"));
        let content = if summary.visible_text.is_empty() && !summary.tool_calls.is_empty() {
            Value::Null
        } else {
            Value::from(summary.visible_text)
        };
        message.insert("content".into(), content);
        if !summary.reasoning.is_empty() {
            message.insert("reasoning_content".into(), Value::from(summary.reasoning));
        }
        if !summary.tool_calls.is_empty() {
            message.insert("tool_calls".into(), tool_calls_json(summary.tool_calls));
        }
        json!({
            "id": self.id,
            "object": "chat.completion",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "message": Value::Object(message),
                "finish_reason": summary.finish_reason.as_str(),
            }],
            "usage": summary.usage.chat_json(),
        })
    }

    fn render_terminal(&mut self, summary: &StreamSummary<'_>, _record: &Value, out: &mut Vec<Bytes>) {
        if let TerminalReason::UpstreamError(message) = summary.terminal {
            let mut frame = String::with_capacity(80 + message.len());
            frame.push_str("data: {\"error\":{\"message\":");
            push_json_string_escaped(&mut frame, message);
            frame.push_str(",\"type\":\"upstream_error\",\"code\":\"upstream_error\"}}\n\n");
            out.push(Bytes::from(frame));
        }
        let usage = summary.usage.chat_json().to_string();
        let mut frame = self.chunk_prefix(usage.len() + 32);
        frame.push_str(",\"choices\":[{\"index\":0,\"delta\":{},\"finish_reason\":");
        push_json_string_escaped(&mut frame, summary.finish_reason.as_str());
        frame.push_str("}],\"usage\":");
        frame.push_str(&usage);
        frame.push_str("}\n\n");
        out.push(Bytes::from(frame));
    }
}
