use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const DEFAULT_MAX_TOKENS: u64 = 512;
pub const DEFAULT_TEMPERATURE: f64 = 0.7;
pub const DEFAULT_TOP_P: f64 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    fn parse(raw: Option<&str>) -> Self {
        match raw {
            Some("system") => Role::System,
            Some("assistant") => Role::Assistant,
            _ => Role::User,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOptions {
    pub max_tokens: u64,
    pub temperature: f64,
    pub top_p: f64,
    pub stream: bool,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
            top_p: DEFAULT_TOP_P,
            stream: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalRequest {
    pub model_alias: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub options: GenerationOptions,
}

impl CanonicalRequest {
    pub fn input_texts(&self) -> impl Iterator<Item = &str> {
        self.messages.iter().map(|m| m.content.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NormalizeError {
    #[error("request body must be a JSON object")]
    NotAnObject,
    #[error("either a non-empty prompt or messages is required")]
    MissingInput,
}

/// Builds a [`CanonicalRequest`] from either the single-prompt or the
/// multi-message request shape.
///
/// Each generation option is resolved on its own: a top-level field wins over
/// the matching `options.*` field, which wins over the default. Values outside
/// their valid range are skipped so the next level applies.
pub fn normalize(body: &Value) -> Result<CanonicalRequest, NormalizeError> {
    let obj = body.as_object().ok_or(NormalizeError::NotAnObject)?;
    let messages = read_messages(obj);
    if messages.is_empty() {
        return Err(NormalizeError::MissingInput);
    }

    let nested = obj.get("options").and_then(|v| v.as_object());
    let nested_field = |key: &str| nested.and_then(|o| o.get(key));

    let defaults = GenerationOptions::default();
    let max_tokens = first_valid(
        [obj.get("max_tokens"), nested_field("num_predict")],
        positive_count,
    )
    .unwrap_or(defaults.max_tokens);
    let temperature = first_valid(
        [obj.get("temperature"), nested_field("temperature")],
        |v| v.as_f64().filter(|t| (0.0..=2.0).contains(t)),
    )
    .unwrap_or(defaults.temperature);
    let top_p = first_valid([obj.get("top_p"), nested_field("top_p")], |v| {
        v.as_f64().filter(|p| *p > 0.0 && *p <= 1.0)
    })
    .unwrap_or(defaults.top_p);
    let stream = obj
        .get("stream")
        .and_then(|v| v.as_bool())
        .unwrap_or(defaults.stream);

    let model_alias = obj
        .get("model")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    Ok(CanonicalRequest {
        model_alias,
        messages,
        options: GenerationOptions {
            max_tokens,
            temperature,
            top_p,
            stream,
        },
    })
}

fn first_valid<T, const N: usize>(
    candidates: [Option<&Value>; N],
    parse: impl Fn(&Value) -> Option<T>,
) -> Option<T> {
    candidates.into_iter().flatten().find_map(parse)
}

/// A positive whole number, given either as an integer or as an integral
/// float such as `64.0`.
fn positive_count(v: &Value) -> Option<u64> {
    if let Some(n) = v.as_u64() {
        return (n > 0).then_some(n);
    }
    let f = v.as_f64()?;
    (f.is_finite() && f >= 1.0 && f.fract() == 0.0 && f <= u64::MAX as f64).then(|| f as u64)
}

/// Messages count as input only if at least one carries non-blank text;
/// otherwise the prompt is used, under the same rule.
fn read_messages(obj: &Map<String, Value>) -> Vec<ChatMessage> {
    let mut messages = Vec::new();
    if let Some(raw) = obj.get("messages").and_then(|v| v.as_array()) {
        for raw_msg in raw {
            let Some(msg_obj) = raw_msg.as_object() else {
                continue;
            };
            let role = Role::parse(msg_obj.get("role").and_then(|v| v.as_str()));
            let content = msg_obj
                .get("content")
                .map(content_to_text)
                .unwrap_or_default();
            messages.push(ChatMessage { role, content });
        }
    }
    if messages.iter().any(|m| !m.content.trim().is_empty()) {
        return messages;
    }

    match obj.get("prompt").and_then(|v| v.as_str()) {
        Some(prompt) if !prompt.trim().is_empty() => vec![ChatMessage::user(prompt)],
        _ => Vec::new(),
    }
}

/// Flattens string content or an array of text parts into plain text.
pub(crate) fn content_to_text(content: &Value) -> String {
    if let Some(s) = content.as_str() {
        return s.to_string();
    }
    let Some(parts) = content.as_array() else {
        return String::new();
    };
    let mut out = String::new();
    for part in parts {
        if let Some(s) = part.as_str() {
            out.push_str(s);
        } else if let Some(t) = part.get("text").and_then(|v| v.as_str()) {
            out.push_str(t);
        }
    }
    out
}
