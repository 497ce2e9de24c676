use crate::error::{AppError, AppResult};
use axum::http::StatusCode;
use serde::{Deserialize, Serialize};

pub const DEFAULT_UPSTREAM_URL: &str = "https://api.hyperbolic.xyz/v1";
pub const DEFAULT_MODEL: &str = "meta-llama/Llama-3.2-3B-Instruct";
pub const DEFAULT_TIMEOUT_MS: u64 = 60_000;

/// Backend connection and translation settings. Built once at startup and
/// shared read-only by every request.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub api_key: String,
    pub default_model: String,
    pub aliases: Vec<ModelMapEntry>,
    pub timeout_ms: u64,
    /// Whether the backend may be asked for a streamed response. When false,
    /// streaming clients are served by emulating a stream from a buffered call.
    pub streaming: bool,
    pub stream_delay_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ModelMapEntry {
    pub alias: String,
    pub upstream_model: String,
}

impl UpstreamConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        let default_model = DEFAULT_MODEL.to_string();
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            aliases: default_aliases(&default_model),
            default_model,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            streaming: false,
            stream_delay_ms: 0,
        }
    }

    pub fn from_env() -> AppResult<Self> {
        let base_url = env_non_empty("OLLAMIZE_UPSTREAM_URL")
            .unwrap_or_else(|| DEFAULT_UPSTREAM_URL.to_string());
        let api_key = std::env::var("OLLAMIZE_API_KEY").unwrap_or_default();
        let default_model =
            env_non_empty("OLLAMIZE_DEFAULT_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let aliases = match env_non_empty("OLLAMIZE_MODEL_ALIASES") {
            Some(raw) => parse_aliases(&raw)?,
            None => default_aliases(&default_model),
        };
        let timeout_ms = match env_non_empty("OLLAMIZE_TIMEOUT_MS") {
            Some(raw) => parse_u64("OLLAMIZE_TIMEOUT_MS", &raw)?.max(1),
            None => DEFAULT_TIMEOUT_MS,
        };
        let streaming = env_non_empty("OLLAMIZE_UPSTREAM_STREAMING")
            .map(|v| parse_bool(&v))
            .unwrap_or(false);
        let stream_delay_ms = match env_non_empty("OLLAMIZE_STREAM_DELAY_MS") {
            Some(raw) => parse_u64("OLLAMIZE_STREAM_DELAY_MS", &raw)?,
            None => 0,
        };

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            default_model,
            aliases,
            timeout_ms,
            streaming,
            stream_delay_ms,
        })
    }

    pub fn has_api_key(&self) -> bool {
        !self.api_key.trim().is_empty()
    }
}

/// Alias strings advertised for a canonical model: the id itself, its
/// precision-suffixed variants and its lowercase short name.
pub fn default_aliases(canonical: &str) -> Vec<ModelMapEntry> {
    let short = canonical
        .rsplit('/')
        .next()
        .unwrap_or(canonical)
        .to_ascii_lowercase();
    let mut names = vec![
        canonical.to_string(),
        format!("{canonical}/fp16"),
        format!("{canonical}/fp8"),
    ];
    if short != canonical {
        names.push(short.clone());
        names.push(format!("{short}:latest"));
    }
    names
        .into_iter()
        .map(|alias| ModelMapEntry {
            alias,
            upstream_model: canonical.to_string(),
        })
        .collect()
}

pub fn parse_aliases(raw: &str) -> AppResult<Vec<ModelMapEntry>> {
    let entries: Vec<ModelMapEntry> = serde_json::from_str(raw).map_err(|err| {
        AppError::new(
            StatusCode::BAD_REQUEST,
            "model_aliases_invalid",
            err.to_string(),
        )
    })?;
    if let Some(entry) = entries
        .iter()
        .find(|e| e.alias.trim().is_empty() || e.upstream_model.trim().is_empty())
    {
        return Err(AppError::new(
            StatusCode::BAD_REQUEST,
            "model_aliases_invalid",
            format!("blank alias entry: {entry:?}"),
        ));
    }
    Ok(entries)
}

pub(crate) fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_u64(name: &str, raw: &str) -> AppResult<u64> {
    raw.trim().parse::<u64>().map_err(|err| {
        AppError::new(
            StatusCode::BAD_REQUEST,
            "config_invalid",
            format!("{name}: {err}"),
        )
    })
}

fn parse_bool(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
