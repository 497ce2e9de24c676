//! Model discovery and Ollama management endpoints. None of these touch the
//! upstream; they describe the advertised aliases or acknowledge no-op calls.

use crate::app::AppState;
use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use bytes::Bytes;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};

const MODIFIED_AT: &str = "2024-01-01T00:00:00Z";

pub async fn root(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "ollamize",
        "model": state.aliases.default_model(),
    }))
}

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let status = if state.upstream.config().has_api_key() {
        "healthy"
    } else {
        "missing_api_key"
    };
    Json(json!({ "status": status, "model": state.aliases.default_model() }))
}

pub async fn tags(State(state): State<AppState>) -> impl IntoResponse {
    let models: Vec<Value> = state
        .aliases
        .advertised()
        .iter()
        .map(|entry| {
            let details = ModelDetails::infer(&entry.upstream_model);
            json!({
                "name": entry.alias,
                "model": entry.alias,
                "modified_at": MODIFIED_AT,
                "size": details.approx_size_bytes(),
                "digest": digest(&entry.alias),
                "details": details.to_value(),
            })
        })
        .collect();
    Json(json!({ "models": models }))
}

/// OpenAI-style model list over the same aliases.
pub async fn list_models(State(state): State<AppState>) -> impl IntoResponse {
    let data: Vec<Value> = state
        .aliases
        .advertised()
        .iter()
        .map(|entry| {
            json!({
                "id": entry.alias,
                "object": "model",
                "created": 0,
                "owned_by": "ollamize"
            })
        })
        .collect();
    Json(json!({ "object": "list", "data": data }))
}

pub async fn version() -> impl IntoResponse {
    Json(json!({ "version": env!("CARGO_PKG_VERSION") }))
}

pub async fn show(State(state): State<AppState>, body: Bytes) -> impl IntoResponse {
    let requested = serde_json::from_slice::<Value>(&body)
        .ok()
        .and_then(|v| {
            v.get("model")
                .or_else(|| v.get("name"))
                .and_then(|m| m.as_str())
                .map(|s| s.to_string())
        });
    let canonical = state.aliases.resolve(requested.as_deref());
    let details = ModelDetails::infer(canonical);
    Json(json!({
        "modelfile": "",
        "parameters": "",
        "template": "",
        "details": details.to_value(),
        "model_info": { "general.upstream_model": canonical },
        "modified_at": MODIFIED_AT,
    }))
}

pub async fn pull() -> impl IntoResponse {
    Json(json!({ "status": "success" }))
}

pub async fn copy() -> StatusCode {
    StatusCode::OK
}

pub async fn delete() -> StatusCode {
    StatusCode::OK
}

fn digest(alias: &str) -> String {
    hex::encode(Sha256::digest(alias.as_bytes()))
}

/// Family and size hints read off a model id such as
/// `meta-llama/Llama-3.2-3B-Instruct`.
#[derive(Debug, Clone, PartialEq)]
struct ModelDetails {
    family: String,
    parameter_billions: Option<f64>,
}

impl ModelDetails {
    fn infer(model: &str) -> Self {
        let short = model
            .trim_end_matches("/fp8")
            .trim_end_matches("/fp16")
            .rsplit('/')
            .next()
            .unwrap_or(model)
            .to_ascii_lowercase();
        let family: String = short
            .chars()
            .take_while(|c| c.is_ascii_alphabetic())
            .collect();
        let parameter_billions = short
            .split(['-', '_', ':'])
            .filter_map(|seg| seg.strip_suffix('b'))
            .find_map(|n| n.parse::<f64>().ok())
            .filter(|n| *n > 0.0);
        Self {
            family: if family.is_empty() {
                "unknown".to_string()
            } else {
                family
            },
            parameter_billions,
        }
    }

    fn parameter_size(&self) -> String {
        match self.parameter_billions {
            Some(n) => format!("{n}B"),
            None => "unknown".to_string(),
        }
    }

    fn approx_size_bytes(&self) -> u64 {
        self.parameter_billions
            .map(|n| (n * 1e9).round() as u64)
            .unwrap_or(0)
    }

    fn to_value(&self) -> Value {
        json!({
            "format": "gguf",
            "family": self.family,
            "parameter_size": self.parameter_size(),
        })
    }
}
