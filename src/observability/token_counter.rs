use serde_json::{json, Value};
use std::time::Duration;
use tracing::info;

/// Estimate the number of tokens in `text`.
///
/// Uses a lightweight heuristic (`bytes / 4`) to avoid loading BPE tables.
#[must_use]
pub fn estimate_tokens(text: &str) -> u64 {
    (text.len() as u64).div_ceil(4)
}

/// Token counts for one stream, estimated from the prompt and the text the
/// upstream produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamUsage {
    pub prompt_tokens: u64,
    pub reasoning_tokens: u64,
    pub text_tokens: u64,
}

impl StreamUsage {
    #[must_use]
    pub fn estimate(prompt: &str, reasoning: &str, text: &str) -> Self {
        Self {
            prompt_tokens: estimate_tokens(prompt),
            reasoning_tokens: estimate_tokens(reasoning),
            text_tokens: estimate_tokens(text),
        }
    }

    #[must_use]
    pub fn completion_tokens(&self) -> u64 {
        self.reasoning_tokens + self.text_tokens
    }

    #[must_use]
    pub fn total_tokens(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens()
    }

    /// Chat Completions `usage` object.
    #[must_use]
    pub fn chat_json(&self) -> Value {
        json!({
            "prompt_tokens": self.prompt_tokens,
            "completion_tokens": self.completion_tokens(),
            "total_tokens": self.total_tokens(),
            "completion_tokens_details": {"reasoning_tokens": self.reasoning_tokens},
        })
    }

    /// Responses `usage` object.
    #[must_use]
    pub fn responses_json(&self) -> Value {
        json!({
            "input_tokens": self.prompt_tokens,
            "output_tokens": self.completion_tokens(),
            "total_tokens": self.total_tokens(),
            "output_tokens_details": {"reasoning_tokens": self.reasoning_tokens},
        })
    }
}

/// Log token usage for a completed stream at INFO level.
pub fn log_stream_usage(model: &str, usage: &StreamUsage, finish_reason: &str, duration: Duration) {
    info!(
        model = model,
        prompt_tokens = usage.prompt_tokens,
        completion_tokens = usage.completion_tokens(),
        reasoning_tokens = usage.reasoning_tokens,
        finish_reason = finish_reason,
        duration_seconds = duration.as_secs_f64(),
        "stream completed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_rounds_up() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abc"), 1);
        assert_eq!(estimate_tokens("Hello"), 2);
        assert_eq!(estimate_tokens("12345678"), 2);
    }

    #[test]
    fn completion_counts_reasoning_and_text() {
        let usage = StreamUsage::estimate("prompt text", "thinking", "Hello");
        assert_eq!(usage.prompt_tokens, 3);
        assert_eq!(usage.completion_tokens(), 4);
        assert_eq!(usage.total_tokens(), 7);
    }

    #[test]
    fn renders_both_usage_shapes() {
        let usage = StreamUsage {
            prompt_tokens: 10,
            reasoning_tokens: 2,
            text_tokens: 3,
        };
        let chat = usage.chat_json();
        assert_eq!(chat["completion_tokens"], 5);
        assert_eq!(chat["total_tokens"], 15);
        assert_eq!(chat["completion_tokens_details"]["reasoning_tokens"], 2);
        let responses = usage.responses_json();
        assert_eq!(responses["input_tokens"], 10);
        assert_eq!(responses["output_tokens"], 5);
        assert_eq!(responses["output_tokens_details"]["reasoning_tokens"], 2);
    }
}
