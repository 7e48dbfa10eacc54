//! Fabrication of synthetic OpenAI-style chat completion responses.
//!
//! When the operator skips upstream entirely, the caller still needs a
//! well-formed `chat.completion` object. The builders here fabricate one
//! from the parked request plus the operator-supplied content or tool
//! call, with plausible whitespace-token usage accounting so SDK-side
//! bookkeeping keeps working.

use serde_json::{json, Value};

use crate::exchange::{CapturedRequest, CapturedResponse, ExchangeId};

/// Operator input for a fabricated completion.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyntheticReply {
    /// Plain assistant message content.
    Content(String),
    /// A single function tool call.
    ToolCall {
        /// Function name.
        name: String,
        /// Function arguments, conventionally a JSON object string.
        arguments: String,
    },
}

/// Fabricates a `chat.completion` response for `reply`, priced against the
/// parked request's messages.
///
/// The completion id reuses the exchange id (`chatcmpl-hp_...`) so the
/// fabricated response stays correlatable in caller-side logs.
#[must_use]
pub fn chat_completion(
    id: &ExchangeId,
    request: &CapturedRequest,
    reply: &SyntheticReply,
) -> CapturedResponse {
    let request_json = request.body.json().unwrap_or(Value::Null);

    let model = request_json
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or("gpt-3.5-turbo")
        .to_string();

    let prompt_tokens: usize = request_json
        .get("messages")
        .and_then(Value::as_array)
        .map(|messages| {
            messages
                .iter()
                .map(|m| {
                    m.get("content")
                        .and_then(Value::as_str)
                        .map_or(0, count_tokens)
                })
                .sum()
        })
        .unwrap_or(0);

    let (message, completion_tokens) = match reply {
        SyntheticReply::Content(content) => (
            json!({
                "role": "assistant",
                "content": content,
            }),
            count_tokens(content),
        ),
        SyntheticReply::ToolCall { name, arguments } => (
            json!({
                "role": "assistant",
                "content": Value::Null,
                "tool_calls": [{
                    "id": format!("call_{}", nanoid::nanoid!(21)),
                    "type": "function",
                    "function": {"name": name, "arguments": arguments},
                }],
            }),
            count_tokens(name) + count_tokens(arguments),
        ),
    };

    let body = json!({
        "id": format!("chatcmpl-{id}"),
        "object": "chat.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": "stop",
        }],
        "usage": {
            "prompt_tokens": prompt_tokens,
            "completion_tokens": completion_tokens,
            "total_tokens": prompt_tokens + completion_tokens,
        },
    });

    CapturedResponse::from_json(200, &body)
}

/// Whitespace token count. Crude but stable, and only used to keep the
/// fabricated `usage` block plausible.
fn count_tokens(text: &str) -> usize {
    text.split_whitespace().count()
}
