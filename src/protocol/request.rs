//! Client request parsing and upstream prompt assembly.

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::GatewayError;
use crate::models::{resolve_model, ModelProfile};
use crate::toolcall::prompt::{tool_system_prompt, ToolSpec};

const USER_TAG: &str = "<｜User｜>";
const ASSISTANT_TAG: &str = "<｜Assistant｜>";
const END_OF_SENTENCE: &str = "<｜end▁of▁sentence｜>";

/// `POST /v1/chat/completions` body.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    #[serde(default)]
    pub messages: Vec<Value>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub tools: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `POST /v1/responses` body.
#[derive(Debug, Clone, Deserialize)]
pub struct ResponsesRequest {
    pub model: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub tools: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptMessage {
    pub role: Role,
    pub content: String,
}

/// Everything the completion flow needs from a client request.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub model: &'static ModelProfile,
    /// Model name as the client sent it.
    pub requested_model: String,
    pub stream: bool,
    pub prompt: String,
    pub tool_names: Vec<String>,
}

fn parse_body<'a, T: Deserialize<'a>>(body: &'a [u8]) -> Result<T, GatewayError> {
    serde_json::from_slice(body)
        .map_err(|err| GatewayError::InvalidRequest(format!("Invalid request body: {err}")))
}

/// # Errors
///
/// Returns `GatewayError::InvalidRequest` for malformed bodies and
/// `GatewayError::ModelUnavailable` for unknown models.
pub fn prepare_chat_request(body: &[u8]) -> Result<PreparedRequest, GatewayError> {
    let request: ChatRequest = parse_body(body)?;
    if request.messages.is_empty() {
        return Err(GatewayError::InvalidRequest(
            "messages must be a non-empty array".to_string(),
        ));
    }
    let messages = normalize_messages(&request.messages);
    finish_prepare(request.model, request.stream, &request.tools, messages)
}

/// # Errors
///
/// Returns `GatewayError::InvalidRequest` for malformed bodies and
/// `GatewayError::ModelUnavailable` for unknown models.
pub fn prepare_responses_request(body: &[u8]) -> Result<PreparedRequest, GatewayError> {
    let request: ResponsesRequest = parse_body(body)?;
    let mut raw = Vec::new();
    if let Some(instructions) = request.instructions.as_deref().filter(|s| !s.trim().is_empty()) {
        raw.push(serde_json::json!({"role": "system", "content": instructions}));
    }
    raw.extend(responses_input_messages(&request.input));
    if raw.is_empty() {
        return Err(GatewayError::InvalidRequest("input must not be empty".to_string()));
    }
    let messages = normalize_messages(&raw);
    finish_prepare(request.model, request.stream, &request.tools, messages)
}

fn finish_prepare(
    model: String,
    stream: bool,
    tools: &[Value],
    messages: Vec<PromptMessage>,
) -> Result<PreparedRequest, GatewayError> {
    let profile = resolve_model(&model)?;
    let specs: Vec<ToolSpec> = tools.iter().filter_map(ToolSpec::from_value).collect();
    let tool_prompt = (!specs.is_empty()).then(|| tool_system_prompt(&specs));
    let prompt = build_prompt(&messages, tool_prompt.as_deref());
    Ok(PreparedRequest {
        model: profile,
        requested_model: model,
        stream,
        prompt,
        tool_names: specs.into_iter().map(|spec| spec.name).collect(),
    })
}

/// Responses `input` as chat-shaped messages.
fn responses_input_messages(input: &Value) -> Vec<Value> {
    match input {
        Value::String(text) if !text.trim().is_empty() => {
            vec![serde_json::json!({"role": "user", "content": text})]
        }
        Value::Array(items) => items.iter().filter_map(responses_item_message).collect(),
        _ => Vec::new(),
    }
}

fn responses_item_message(item: &Value) -> Option<Value> {
    if let Value::String(text) = item {
        return Some(serde_json::json!({"role": "user", "content": text}));
    }
    match item.get("type").and_then(Value::as_str).unwrap_or("") {
        "function_call" => Some(serde_json::json!({
            "role": "assistant",
            "tool_calls": [{
                "id": item.get("call_id").or_else(|| item.get("id")).cloned().unwrap_or(Value::Null),
                "function": {
                    "name": item.get("name").cloned().unwrap_or(Value::Null),
                    "arguments": item.get("arguments").cloned().unwrap_or(Value::Null),
                },
            }],
        })),
        "function_call_output" => Some(serde_json::json!({
            "role": "tool",
            "tool_call_id": item.get("call_id").cloned().unwrap_or(Value::Null),
            "content": item.get("output").cloned().unwrap_or(Value::Null),
        })),
        _ if item.get("role").is_some() => Some(item.clone()),
        _ => None,
    }
}

fn str_field<'a>(value: &'a Value, key: &str) -> &'a str {
    value.get(key).and_then(Value::as_str).map_or("", str::trim)
}

/// Flatten OpenAI-style messages into prompt messages. Tool calls and tool
/// results become plain text blocks the upstream model can read.
#[must_use]
pub fn normalize_messages(raw: &[Value]) -> Vec<PromptMessage> {
    let mut out = Vec::with_capacity(raw.len());
    for message in raw.iter().filter(|m| m.is_object()) {
        let role = str_field(message, "role").to_ascii_lowercase();
        match role.as_str() {
            "assistant" => {
                let content = content_text(message.get("content"));
                let calls = assistant_tool_calls_text(message);
                let combined = join_non_empty(&[content.as_str(), calls.as_str()]);
                if !combined.is_empty() {
                    out.push(PromptMessage {
                        role: Role::Assistant,
                        content: combined,
                    });
                }
            }
            "tool" | "function" => out.push(PromptMessage {
                role: Role::User,
                content: tool_result_text(message),
            }),
            "system" | "developer" => out.push(PromptMessage {
                role: Role::System,
                content: content_text(message.get("content")),
            }),
            _ => {
                let content = content_text(message.get("content"));
                if role == "user" || !content.is_empty() {
                    out.push(PromptMessage {
                        role: Role::User,
                        content,
                    });
                }
            }
        }
    }
    out
}

fn assistant_tool_calls_text(message: &Value) -> String {
    let mut entries = Vec::new();
    if let Some(calls) = message.get("tool_calls").and_then(Value::as_array) {
        for (i, call) in calls.iter().enumerate() {
            let id = match str_field(call, "id") {
                "" => format!("call_{}", i + 1),
                id => id.to_string(),
            };
            let function = call.get("function");
            let mut name = str_field(call, "name");
            if name.is_empty() {
                name = function.map_or("", |f| str_field(f, "name"));
            }
            let args = [
                function.and_then(|f| f.get("arguments")),
                call.get("arguments"),
                call.get("input"),
            ]
            .into_iter()
            .map(arguments_text)
            .find(|args| !args.is_empty())
            .unwrap_or_else(|| "{}".to_string());
            entries.push(tool_call_block(&id, or_unknown(name), &args));
        }
    }
    if let Some(legacy) = message.get("function_call").filter(|v| v.is_object()) {
        let args = arguments_text(legacy.get("arguments"));
        let args = if args.is_empty() { "{}".to_string() } else { args };
        entries.push(tool_call_block(
            "call_legacy",
            or_unknown(str_field(legacy, "name")),
            &args,
        ));
    }
    entries.join("\n\n")
}

fn tool_call_block(id: &str, name: &str, args: &str) -> String {
    format!("Tool call:\n- tool_call_id: {id}\n- function.name: {name}\n- function.arguments: {args}")
}

fn tool_result_text(message: &Value) -> String {
    let id = [str_field(message, "tool_call_id"), str_field(message, "id")]
        .into_iter()
        .find(|s| !s.is_empty())
        .unwrap_or("unknown");
    let name = [str_field(message, "name"), str_field(message, "tool_name")]
        .into_iter()
        .find(|s| !s.is_empty())
        .unwrap_or("unknown");
    let content = ["content", "output", "result"]
        .into_iter()
        .map(|key| content_text(message.get(key)))
        .find(|text| !is_empty_content(text))
        .unwrap_or_else(|| "null".to_string());
    format!("Tool result:\n- tool_call_id: {id}\n- name: {name}\n- content: {content}")
}

fn or_unknown(name: &str) -> &str {
    if name.is_empty() {
        "unknown"
    } else {
        name
    }
}

fn is_empty_content(text: &str) -> bool {
    matches!(text.trim(), "" | "null" | "[]")
}

fn arguments_text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.trim().to_string(),
        Some(other) => other.to_string(),
    }
}

/// Message content as prompt text. Arrays of content blocks are joined by
/// newlines; blocks with no readable text are kept as JSON.
fn content_text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(blocks)) => {
            let parts: Vec<String> = blocks.iter().filter_map(block_text).collect();
            parts.join("\n")
        }
        Some(other) => other.to_string(),
    }
}

fn block_text(block: &Value) -> Option<String> {
    match block {
        Value::Null => None,
        Value::String(text) => (!text.trim().is_empty()).then(|| text.clone()),
        Value::Object(_) => {
            let kind = str_field(block, "type").to_ascii_lowercase();
            for key in ["text", "content"] {
                if let Some(text) = block.get(key).and_then(Value::as_str).filter(|s| !s.is_empty()) {
                    return Some(text.to_string());
                }
            }
            if let Some(raw) = block.get("content").filter(|v| !v.is_null()) {
                let nested = content_text(Some(raw));
                return Some(if nested.trim().is_empty() {
                    raw.to_string()
                } else {
                    nested
                });
            }
            let output = content_text(block.get("output"));
            if !output.trim().is_empty() {
                return Some(output);
            }
            match kind.as_str() {
                "" | "text" | "output_text" | "input_text" | "tool_result" | "tool_output" => None,
                _ => Some(block.to_string()),
            }
        }
        other => Some(other.to_string()),
    }
}

fn join_non_empty(parts: &[&str]) -> String {
    parts
        .iter()
        .filter(|part| !part.trim().is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Render messages in the upstream chat template.
///
/// Consecutive messages with the same role are merged. System text comes
/// first without a tag; the tool instructions, when present, lead it.
#[must_use]
pub fn build_prompt(messages: &[PromptMessage], tool_prompt: Option<&str>) -> String {
    let mut system: Vec<&str> = Vec::new();
    if let Some(tool_prompt) = tool_prompt {
        system.push(tool_prompt);
    }
    let mut turns: Vec<(Role, String)> = Vec::with_capacity(messages.len());
    for message in messages {
        if message.role == Role::System {
            if !message.content.trim().is_empty() {
                system.push(&message.content);
            }
            continue;
        }
        match turns.last_mut() {
            Some((role, text)) if *role == message.role => {
                text.push_str("\n\n");
                text.push_str(&message.content);
            }
            _ => turns.push((message.role, message.content.clone())),
        }
    }

    let mut prompt = system.join("\n\n");
    for (role, text) in &turns {
        match role {
            Role::Assistant => {
                prompt.push_str(ASSISTANT_TAG);
                prompt.push_str(text);
                prompt.push_str(END_OF_SENTENCE);
            }
            Role::User | Role::System => {
                prompt.push_str(USER_TAG);
                prompt.push_str(text);
            }
        }
    }
    prompt.push_str(ASSISTANT_TAG);
    prompt
}
