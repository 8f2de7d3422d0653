use serde_json::Value;

/// A tool declared by the client request.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: Option<String>,
    pub parameters: Option<Value>,
}

impl ToolSpec {
    /// Accepts both `{"type":"function","function":{...}}` and the flat
    /// Responses shape `{"type":"function","name":...}`.
    #[must_use]
    pub fn from_value(value: &Value) -> Option<Self> {
        let function = value.get("function").unwrap_or(value);
        let name = function.get("name")?.as_str()?.trim();
        if name.is_empty() {
            return None;
        }
        Some(Self {
            name: name.to_string(),
            description: function
                .get("description")
                .and_then(Value::as_str)
                .map(str::to_string),
            parameters: function
                .get("parameters")
                .or_else(|| function.get("input_schema"))
                .cloned(),
        })
    }
}

const TOOL_PROMPT_HEAD: &str = "You have access to the following tools:\n\n";

const TOOL_PROMPT_RULES: &str = r#"
When you need to call tools, reply with a single JSON object in exactly this shape and nothing else on those lines:

{"tool_calls": [{"name": "<tool name>", "input": {<arguments as a JSON object>}}]}

Rules:
1. Use only tool names from the list above, spelled exactly.
2. `input` must be a JSON object whose keys match the tool's parameters.
3. Several calls go into the same `tool_calls` array; do not emit the object twice.
4. Do not wrap the JSON in code fences and do not describe the call before or after it.
5. Tool results come back in later messages as "Tool result:" blocks; read them before calling again."#;

/// System instructions describing the declared tools and the inline
/// `tool_calls` JSON format the gateway detects.
#[must_use]
pub fn tool_system_prompt(tools: &[ToolSpec]) -> String {
    let mut out = String::from(TOOL_PROMPT_HEAD);
    for tool in tools {
        out.push_str("Tool: ");
        out.push_str(&tool.name);
        out.push('\n');
        if let Some(description) = tool.description.as_deref().filter(|d| !d.trim().is_empty()) {
            out.push_str("Description: ");
            out.push_str(description.trim());
            out.push('\n');
        }
        if let Some(parameters) = &tool.parameters {
            out.push_str("Parameters: ");
            out.push_str(&serde_json::to_string(parameters).unwrap_or_else(|_| "{}".into()));
            out.push('\n');
        }
        out.push('\n');
    }
    out.push_str(TOOL_PROMPT_RULES);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn tool_spec_reads_chat_and_responses_shapes() {
        let chat = json!({"type":"function","function":{"name":"search","description":"web","parameters":{"type":"object"}}});
        let flat = json!({"type":"function","name":"search","parameters":{"type":"object"}});
        let a = ToolSpec::from_value(&chat).expect("chat tool");
        let b = ToolSpec::from_value(&flat).expect("flat tool");
        assert_eq!(a.name, "search");
        assert_eq!(a.description.as_deref(), Some("web"));
        assert_eq!(a.parameters, b.parameters);
        assert!(ToolSpec::from_value(&json!({"type":"function"})).is_none());
    }

    #[test]
    fn prompt_lists_every_tool_and_the_marker_format() {
        let tools = vec![
            ToolSpec {
                name: "search".into(),
                description: Some("Search the web".into()),
                parameters: Some(json!({"type":"object","properties":{"q":{"type":"string"}}})),
            },
            ToolSpec {
                name: "clock".into(),
                description: None,
                parameters: None,
            },
        ];
        let prompt = tool_system_prompt(&tools);
        assert!(prompt.contains("Tool: search\nDescription: Search the web\n"));
        assert!(prompt.contains("Tool: clock\n"));
        assert!(prompt.contains(r#"{"tool_calls": ["#));
    }
}
