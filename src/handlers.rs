use crate::app::AppState;
use crate::error::{AppError, AppResult};
use crate::normalize::{NormalizeError, normalize};
use crate::stream::{passthrough_sse, synthetic_sse};
use crate::translate::{ResponseShape, extract_content, translate};
use crate::upstream::{UpstreamCallError, UpstreamMode, UpstreamRequest};
use axum::Json;
use axum::extract::State;
use axum::http::{StatusCode, Uri};
use axum::response::sse::Event;
use axum::response::{IntoResponse, Response, Sse};
use bytes::Bytes;
use futures_util::Stream;
use serde_json::{Map, Value};
use std::convert::Infallible;

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

pub async fn not_found(uri: Uri) -> AppError {
    AppError::new(
        StatusCode::NOT_FOUND,
        "not_found",
        format!("no route for {}", uri.path()),
    )
}

pub async fn generate(State(state): State<AppState>, body: Bytes) -> AppResult<Response> {
    translate_call(&state, ResponseShape::Generate, &body).await
}

pub async fn chat(State(state): State<AppState>, body: Bytes) -> AppResult<Response> {
    translate_call(&state, ResponseShape::Chat, &body).await
}

/// Ollama-style endpoints: normalize, resolve, call upstream, reshape.
async fn translate_call(
    state: &AppState,
    shape: ResponseShape,
    body: &Bytes,
) -> AppResult<Response> {
    metrics::counter!("ollamize_requests_total", "endpoint" => shape.endpoint()).increment(1);
    let raw = parse_body(body)?;
    let req = normalize(&raw).map_err(normalize_error_to_app)?;
    let model = state.aliases.resolve(req.model_alias.as_deref());
    let mode = UpstreamMode::select(req.options.stream, state.upstream.config().streaming);
    tracing::debug!(
        endpoint = shape.endpoint(),
        requested_model = ?req.model_alias,
        model,
        mode = mode.as_str(),
        messages = req.messages.len(),
        "forwarding request"
    );

    let wire = UpstreamRequest::from_canonical(&req, model, mode);
    match mode {
        UpstreamMode::Streamed => {
            let lines = state
                .upstream
                .open_stream(&wire)
                .await
                .map_err(upstream_error_to_app)?;
            Ok(sse_response(passthrough_sse(lines)))
        }
        UpstreamMode::Buffered => {
            let reply = state
                .upstream
                .complete(&wire)
                .await
                .map_err(upstream_error_to_app)?;
            let out = translate(shape, model, &req, &reply.json());
            if req.options.stream {
                let delay = state.upstream.config().stream_delay_ms;
                return Ok(sse_response(synthetic_sse(out.content(), model, delay)));
            }
            Ok(Json(out).into_response())
        }
    }
}

/// OpenAI-compatible passthrough. The body is forwarded untouched apart from
/// `model`, which is replaced by the resolved canonical id.
pub async fn chat_completions(State(state): State<AppState>, body: Bytes) -> AppResult<Response> {
    metrics::counter!("ollamize_requests_total", "endpoint" => "chat_completions").increment(1);
    let mut raw = parse_body(&body)?;
    let obj = raw.as_object_mut().ok_or_else(|| {
        AppError::new(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "request body must be a JSON object",
        )
    })?;
    let model = state
        .aliases
        .resolve(obj.get("model").and_then(|v| v.as_str()))
        .to_string();
    obj.insert("model".to_string(), Value::String(model.clone()));
    let client_stream = obj
        .get("stream")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let mode = UpstreamMode::select(client_stream, state.upstream.config().streaming);
    if client_stream && mode == UpstreamMode::Buffered {
        obj.insert("stream".to_string(), Value::Bool(false));
    }
    tracing::debug!(model = %model, mode = mode.as_str(), "passthrough chat completion");

    match mode {
        UpstreamMode::Streamed => match state.upstream.open_stream(&raw).await {
            Ok(lines) => Ok(sse_response(passthrough_sse(lines))),
            Err(err) => Ok(passthrough_error(err)),
        },
        UpstreamMode::Buffered => match state.upstream.complete(&raw).await {
            Ok(reply) if client_stream => {
                let content = extract_content(&reply.json());
                let delay = state.upstream.config().stream_delay_ms;
                Ok(sse_response(synthetic_sse(&content, &model, delay)))
            }
            Ok(reply) => Ok(reply.into_response()),
            Err(err) => Ok(passthrough_error(err)),
        },
    }
}

fn sse_response(
    stream: impl Stream<Item = Result<Event, Infallible>> + Send + 'static,
) -> Response {
    Sse::new(stream).into_response()
}

/// Parses the request body as JSON regardless of content type. An empty body
/// reads as an empty object.
fn parse_body(body: &Bytes) -> AppResult<Value> {
    if body.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(Value::Object(Map::new()));
    }
    serde_json::from_slice(body).map_err(|err| {
        AppError::new(
            StatusCode::BAD_REQUEST,
            "invalid_json",
            format!("request body is not valid JSON: {err}"),
        )
    })
}

fn normalize_error_to_app(err: NormalizeError) -> AppError {
    let code = match err {
        NormalizeError::NotAnObject => "invalid_request",
        NormalizeError::MissingInput => "missing_input",
    };
    AppError::new(StatusCode::BAD_REQUEST, code, err.to_string())
}

fn upstream_error_to_app(err: UpstreamCallError) -> AppError {
    tracing::warn!(
        kind = ?err.kind,
        upstream_status = ?err.status,
        error = %err,
        "upstream call failed"
    );
    AppError::from(err)
}

fn passthrough_error(err: UpstreamCallError) -> Response {
    tracing::warn!(
        kind = ?err.kind,
        upstream_status = ?err.status,
        error = %err,
        "upstream passthrough failed"
    );
    err.into_passthrough_response()
}

#[cfg(test)]
mod tests {
    use super::{normalize_error_to_app, parse_body};
    use crate::normalize::NormalizeError;
    use axum::http::StatusCode;
    use bytes::Bytes;
    use serde_json::json;

    #[test]
    fn empty_body_reads_as_empty_object() {
        assert_eq!(parse_body(&Bytes::new()).unwrap(), json!({}));
        assert_eq!(parse_body(&Bytes::from_static(b"  \n")).unwrap(), json!({}));
    }

    #[test]
    fn invalid_json_is_a_client_error() {
        let err = parse_body(&Bytes::from_static(b"{nope")).unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.code, "invalid_json");
    }

    #[test]
    fn missing_input_maps_to_bad_request() {
        let err = normalize_error_to_app(NormalizeError::MissingInput);
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert_eq!(err.code, "missing_input");
    }
}
