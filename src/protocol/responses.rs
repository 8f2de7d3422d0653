//! OpenAI Responses API events.

use bytes::Bytes;
use serde_json::{json, Map, Value};

use crate::stream::sse::named_frame;
use crate::stream::{FinishReason, StreamRenderer, StreamSummary, TerminalReason};
use crate::toolcall::{ToolCall, ToolCallDelta};
use crate::util::{prefixed_uuid, unix_now_secs};

pub const EVENT_CREATED: &str = "response.created";
pub const EVENT_TEXT_DELTA: &str = "response.output_text.delta";
pub const EVENT_REASONING_DELTA: &str = "response.reasoning.delta";
pub const EVENT_TOOL_CALL_DELTA: &str = "response.output_tool_call.delta";
pub const EVENT_TOOL_CALL_DONE: &str = "response.output_tool_call.done";
pub const EVENT_COMPLETED: &str = "response.completed";
pub const EVENT_FAILED: &str = "response.failed";

pub struct ResponsesRenderer {
    id: String,
    model: String,
    created_at: u64,
}

impl ResponsesRenderer {
    #[must_use]
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            id: prefixed_uuid("resp_"),
            model: model.into(),
            created_at: unix_now_secs(),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    fn event(event: &str, payload: &Value) -> Bytes {
        named_frame(event, &payload.to_string())
    }

    fn delta_event(&self, event: &str, text: &str) -> Bytes {
        Self::event(event, &json!({"type": event, "id": self.id, "delta": text}))
    }
}

fn tool_call_delta_item(delta: &ToolCallDelta) -> Value {
    let mut function = Map::new();
    if let Some(name) = &delta.name {
        function.insert("name".into(), Value::from(name.as_str()));
    }
    function.insert("arguments".into(), Value::from(delta.arguments.as_str()));
    let mut item = Map::new();
    item.insert("index".into(), Value::from(delta.index));
    if let Some(id) = &delta.id {
        item.insert("id".into(), Value::from(id.as_str()));
        item.insert("type".into(), Value::from("function"));
    }
    item.insert("function".into(), Value::Object(function));
    Value::Object(item)
}

fn tool_call_item(call: &ToolCall) -> Value {
    json!({
        "index": call.index,
        "id": call.id,
        "type": "function",
        "function": {"name": call.name, "arguments": call.arguments_json()},
    })
}

/// Response status and the optional detail fields that go with it.
fn status_for(summary: &StreamSummary<'_>) -> (&'static str, Option<Value>, Option<Value>) {
    if summary.finish_reason == FinishReason::ToolCalls {
        return ("completed", None, None);
    }
    match summary.terminal {
        TerminalReason::Stop => ("completed", None, None),
        TerminalReason::ContentFilter => (
            "incomplete",
            Some(json!({"reason": "content_filter"})),
            None,
        ),
        TerminalReason::UpstreamError(message) => (
            "failed",
            None,
            Some(json!({"code": "upstream_error", "message": message})),
        ),
    }
}

impl StreamRenderer for ResponsesRenderer {
    fn render_start(&mut self, out: &mut Vec<Bytes>) {
        out.push(Self::event(
            EVENT_CREATED,
            &json!({
                "type": EVENT_CREATED,
                "id": self.id,
                "object": "response",
                "created_at": self.created_at,
                "model": self.model,
                "status": "in_progress",
            }),
        ));
    }

    fn render_content(&mut self, text: &str, _with_role: bool, out: &mut Vec<Bytes>) {
        if !text.is_empty() {
            out.push(self.delta_event(EVENT_TEXT_DELTA, text));
        }
    }

    fn render_reasoning(&mut self, text: &str, _with_role: bool, out: &mut Vec<Bytes>) {
        if !text.is_empty() {
            out.push(self.delta_event(EVENT_REASONING_DELTA, text));
        }
    }

    fn render_tool_call_deltas(&mut self, deltas: &[ToolCallDelta], _with_role: bool, out: &mut Vec<Bytes>) {
        if deltas.is_empty() {
            return;
        }
        let items: Vec<Value> = deltas.iter().map(tool_call_delta_item).collect();
        out.push(Self::event(
            EVENT_TOOL_CALL_DELTA,
            &json!({"type": EVENT_TOOL_CALL_DELTA, "id": self.id, "tool_calls": items}),
        ));
    }

    fn render_tool_calls(&mut self, calls: &[ToolCall], _with_role: bool, out: &mut Vec<Bytes>) {
        if calls.is_empty() {
            return;
        }
        let items: Vec<Value> = calls.iter().map(tool_call_item).collect();
        out.push(Self::event(
            EVENT_TOOL_CALL_DONE,
            &json!({"type": EVENT_TOOL_CALL_DONE, "id": self.id, "tool_calls": items}),
        ));
    }

    fn completed_record(&self, summary: &StreamSummary<'_>) -> Value {
        let mut output = Vec::with_capacity(2 + summary.tool_calls.len());
        if !summary.reasoning.is_empty() {
            output.push(json!({
                "type": "reasoning",
                "id": prefixed_uuid("rs_"),
                "summary": [{"type": "summary_text", "text": summary.reasoning}],
            }));
        }
        if !summary.visible_text.is_empty() {
            output.push(json!({
                "type": "message",
                "id": prefixed_uuid("msg_"),
                "role": "assistant",
                "status": "completed",
                "content": [{"type": "output_text", "text": summary.visible_text, "annotations": []}],
            }));
        }
        for call in summary.tool_calls {
            output.push(json!({
                "type": "function_call",
                "id": prefixed_uuid("fc_"),
                "call_id": call.id,
                "name": call.name,
                "arguments": call.arguments_json(),
                "status": "completed",
            }));
        }

        let (status, incomplete_details, error) = status_for(summary);
        let mut record = Map::new();
        record.insert("id".into(), Value::from(self.id.as_str()));
        record.insert("object".into(), Value::from("response"));
        record.insert("created_at".into(), Value::from(self.created_at));
        record.insert("model".into(), Value::from(self.model.as_str()));
        record.insert("status".into(), Value::from(status));
        record.insert("output".into(), Value::Array(output));
        record.insert("output_text".into(), Value::from(summary.visible_text));
        record.insert("usage".into(), summary.usage.responses_json());
        if let Some(details) = incomplete_details {
            record.insert("incomplete_details".into(), details);
        }
        if let Some(error) = error {
            record.insert("error".into(), error);
        }
        Value::Object(record)
    }

    fn render_terminal(&mut self, summary: &StreamSummary<'_>, record: &Value, out: &mut Vec<Bytes>) {
        let event = match (summary.finish_reason, summary.terminal) {
            (FinishReason::ToolCalls, _) => EVENT_COMPLETED,
            (_, TerminalReason::UpstreamError(_)) => EVENT_FAILED,
            _ => EVENT_COMPLETED,
        };
        out.push(Self::event(event, &json!({"type": event, "response": record})));
    }
}
