use crate::normalize::{CanonicalRequest, content_to_text};
use serde::Serialize;
use serde_json::Value;

/// Which client-facing response shape an endpoint produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseShape {
    Generate,
    Chat,
}

impl ResponseShape {
    pub fn endpoint(self) -> &'static str {
        match self {
            ResponseShape::Generate => "generate",
            ResponseShape::Chat => "chat",
        }
    }
}

/// Word-count based token estimate. Never an exact count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UsageEstimate {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub approximate: bool,
}

impl UsageEstimate {
    pub fn from_texts<'a>(inputs: impl IntoIterator<Item = &'a str>, output: &str) -> Self {
        let prompt_words = inputs.into_iter().map(count_words).sum();
        let prompt_tokens = estimate_tokens(prompt_words);
        let completion_tokens = estimate_tokens(count_words(output));
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            approximate: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerateResponse {
    pub model: String,
    pub created_at: String,
    pub response: String,
    pub done: bool,
    pub context: Vec<u64>,
    pub total_duration: u64,
    pub load_duration: u64,
    pub prompt_eval_count: u64,
    pub prompt_eval_duration: u64,
    pub eval_count: u64,
    pub eval_duration: u64,
    pub usage: UsageEstimate,
}

#[derive(Debug, Clone, Serialize)]
pub struct AssistantMessage {
    pub role: &'static str,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatResponse {
    pub model: String,
    pub created_at: String,
    pub message: AssistantMessage,
    pub done: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum OutboundResponse {
    Generate(GenerateResponse),
    Chat(ChatResponse),
}

impl OutboundResponse {
    pub fn content(&self) -> &str {
        match self {
            OutboundResponse::Generate(g) => &g.response,
            OutboundResponse::Chat(c) => &c.message.content,
        }
    }
}

/// Reshapes a buffered chat-completion body into the requested shape.
pub fn translate(
    shape: ResponseShape,
    model: &str,
    request: &CanonicalRequest,
    upstream: &Value,
) -> OutboundResponse {
    let content = extract_content(upstream);
    let created_at = now_rfc3339();
    match shape {
        ResponseShape::Chat => OutboundResponse::Chat(ChatResponse {
            model: model.to_string(),
            created_at,
            message: AssistantMessage {
                role: "assistant",
                content,
            },
            done: true,
        }),
        ResponseShape::Generate => {
            let usage = UsageEstimate::from_texts(request.input_texts(), &content);
            OutboundResponse::Generate(GenerateResponse {
                model: model.to_string(),
                created_at,
                response: content,
                done: true,
                context: Vec::new(),
                total_duration: 0,
                load_duration: 0,
                prompt_eval_count: 0,
                prompt_eval_duration: 0,
                eval_count: 0,
                eval_duration: 0,
                usage,
            })
        }
    }
}

/// Text of the first choice's message; empty when the body has any other shape.
pub fn extract_content(upstream: &Value) -> String {
    let content = upstream
        .get("choices")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first())
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"));
    match content {
        Some(v) => content_to_text(v),
        None => {
            tracing::debug!("upstream body has no first choice content");
            String::new()
        }
    }
}

pub fn count_words(text: &str) -> u64 {
    text.split_whitespace().count() as u64
}

/// `round(words * 1.3)` with halves rounded up, at least 1 for non-empty text.
pub fn estimate_tokens(words: u64) -> u64 {
    if words == 0 {
        return 0;
    }
    (words.saturating_mul(13).saturating_add(5) / 10).max(1)
}

pub(crate) fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::normalize;
    use serde_json::json;

    fn echo(content: &str) -> Value {
        json!({ "choices": [{ "message": { "role": "assistant", "content": content } }] })
    }

    #[test]
    fn estimate_rounds_half_up_and_floors_at_one() {
        assert_eq!(estimate_tokens(0), 0);
        assert_eq!(estimate_tokens(1), 1);
        assert_eq!(estimate_tokens(5), 7);
        assert_eq!(estimate_tokens(10), 13);
        assert_eq!(estimate_tokens(15), 20);
    }

    #[test]
    fn usage_counts_words_across_all_messages() {
        let req = normalize(&json!({
            "messages": [
                { "role": "system", "content": "one two three four" },
                { "role": "user", "content": "five six  seven\neight nine ten" }
            ]
        }))
        .unwrap();
        let out = translate(
            ResponseShape::Generate,
            "m",
            &req,
            &echo("a b c d e"),
        );
        let OutboundResponse::Generate(g) = out else {
            panic!("expected generate shape");
        };
        assert_eq!(g.usage.prompt_tokens, 13);
        assert_eq!(g.usage.completion_tokens, 7);
        assert_eq!(g.usage.total_tokens, 20);
        assert!(g.usage.approximate);
    }

    #[test]
    fn generate_shape_defaults_counters() {
        let req = normalize(&json!({ "prompt": "hi" })).unwrap();
        let out = translate(ResponseShape::Generate, "org/m", &req, &echo("hello world"));
        let v = serde_json::to_value(&out).unwrap();
        assert_eq!(v["model"], "org/m");
        assert_eq!(v["response"], "hello world");
        assert_eq!(v["done"], true);
        assert_eq!(v["context"], json!([]));
        assert_eq!(v["eval_count"], 0);
        assert_eq!(v["total_duration"], 0);
        assert!(v["created_at"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn chat_shape_wraps_assistant_message() {
        let req = normalize(&json!({ "prompt": "hi" })).unwrap();
        let out = translate(ResponseShape::Chat, "org/m", &req, &echo("hey"));
        let v = serde_json::to_value(&out).unwrap();
        assert_eq!(v["message"], json!({ "role": "assistant", "content": "hey" }));
        assert_eq!(v["done"], true);
        assert!(v.get("response").is_none());
        assert!(v.get("usage").is_none());
    }

    #[test]
    fn malformed_bodies_degrade_to_empty_content() {
        assert_eq!(extract_content(&json!({ "choices": [] })), "");
        assert_eq!(extract_content(&json!({ "choices": "nope" })), "");
        assert_eq!(extract_content(&json!({ "choices": [{}] })), "");
        assert_eq!(extract_content(&json!({ "choices": [{ "message": { "content": null } }] })), "");
        assert_eq!(extract_content(&Value::Null), "");
    }

    #[test]
    fn empty_choices_still_translate() {
        let req = normalize(&json!({ "prompt": "hi" })).unwrap();
        let out = translate(ResponseShape::Generate, "m", &req, &json!({ "choices": [] }));
        assert_eq!(out.content(), "");
        let OutboundResponse::Generate(g) = out else {
            panic!("expected generate shape");
        };
        assert_eq!(g.usage.completion_tokens, 0);
    }

    #[test]
    fn array_content_parts_are_joined() {
        let body = json!({ "choices": [{ "message": { "content": [{ "type": "text", "text": "a" }, { "type": "text", "text": "b" }] } }] });
        assert_eq!(extract_content(&body), "ab");
    }
}
