use crate::config::UpstreamConfig;
use crate::error::AppError;
use crate::normalize::{CanonicalRequest, ChatMessage};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use bytes::{Bytes, BytesMut};
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";

/// Longest upstream line held while waiting for its newline.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Wire payload for the backend's chat-completion endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [ChatMessage],
    pub max_tokens: u64,
    pub temperature: f64,
    pub top_p: f64,
    pub stream: bool,
}

impl<'a> UpstreamRequest<'a> {
    pub fn from_canonical(req: &'a CanonicalRequest, model: &'a str, mode: UpstreamMode) -> Self {
        Self {
            model,
            messages: &req.messages,
            max_tokens: req.options.max_tokens,
            temperature: req.options.temperature,
            top_p: req.options.top_p,
            stream: mode == UpstreamMode::Streamed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamMode {
    Buffered,
    Streamed,
}

impl UpstreamMode {
    /// Streams from the backend only when the client wants a stream and the
    /// backend is configured to produce one.
    pub fn select(client_stream: bool, upstream_streaming: bool) -> Self {
        if client_stream && upstream_streaming {
            UpstreamMode::Streamed
        } else {
            UpstreamMode::Buffered
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UpstreamMode::Buffered => "buffered",
            UpstreamMode::Streamed => "streamed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    Network,
    Timeout,
    Http,
    /// The backend broke the line framing, e.g. a line longer than the cap.
    Protocol,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct UpstreamCallError {
    pub kind: UpstreamErrorKind,
    pub status: Option<StatusCode>,
    pub content_type: Option<String>,
    pub body: Option<String>,
    pub message: String,
}

impl UpstreamCallError {
    pub fn new(kind: UpstreamErrorKind, status: Option<StatusCode>, message: String) -> Self {
        Self {
            kind,
            status,
            content_type: None,
            body: None,
            message,
        }
    }

    fn from_reqwest(err: reqwest::Error, timeout_ms: u64) -> Self {
        if err.is_timeout() {
            Self::timeout(timeout_ms)
        } else {
            Self::new(UpstreamErrorKind::Network, err.status(), err.to_string())
        }
    }

    fn timeout(timeout_ms: u64) -> Self {
        Self::new(
            UpstreamErrorKind::Timeout,
            None,
            format!("upstream did not answer within {timeout_ms} ms"),
        )
    }

    /// Client-facing status: backend statuses pass through, transport failures
    /// become 502.
    pub fn client_status(&self) -> StatusCode {
        match self.kind {
            UpstreamErrorKind::Http => self.status.unwrap_or(StatusCode::BAD_GATEWAY),
            UpstreamErrorKind::Network
            | UpstreamErrorKind::Timeout
            | UpstreamErrorKind::Protocol => StatusCode::BAD_GATEWAY,
        }
    }

    /// Backend reply forwarded as-is, for the OpenAI-compatible passthrough.
    /// Transport failures have no backend reply and fall back to a JSON error.
    pub fn into_passthrough_response(self) -> Response {
        match (self.kind, self.status, self.body) {
            (UpstreamErrorKind::Http, Some(status), Some(body)) => {
                let content_type = self
                    .content_type
                    .unwrap_or_else(|| mime::APPLICATION_JSON.to_string());
                (
                    status,
                    [(axum::http::header::CONTENT_TYPE, content_type)],
                    body,
                )
                    .into_response()
            }
            (kind, status, body) => AppError::from(UpstreamCallError {
                kind,
                status,
                content_type: self.content_type,
                body,
                message: self.message,
            })
            .into_response(),
        }
    }
}

impl From<UpstreamCallError> for AppError {
    fn from(err: UpstreamCallError) -> Self {
        let status = err.client_status();
        let code = match err.kind {
            UpstreamErrorKind::Network => "upstream_unreachable",
            UpstreamErrorKind::Timeout => "upstream_timeout",
            UpstreamErrorKind::Http => "upstream_error",
            UpstreamErrorKind::Protocol => "upstream_protocol_error",
        };
        AppError::new(status, code, err.message)
            .with_upstream(err.status.map(|s| s.as_u16()), err.body)
    }
}

/// A complete, successful backend reply.
#[derive(Debug, Clone)]
pub struct BufferedReply {
    pub status: StatusCode,
    pub content_type: Option<String>,
    pub body: Bytes,
}

impl BufferedReply {
    /// Decoded body, or `Value::Null` when the backend sent something that is
    /// not JSON.
    pub fn json(&self) -> Value {
        match serde_json::from_slice(&self.body) {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(error = %err, bytes = self.body.len(), "malformed upstream body");
                Value::Null
            }
        }
    }

    pub fn into_response(self) -> Response {
        let content_type = self
            .content_type
            .unwrap_or_else(|| mime::APPLICATION_JSON.to_string());
        (
            self.status,
            [(axum::http::header::CONTENT_TYPE, content_type)],
            self.body,
        )
            .into_response()
    }
}

pub type LineStream = BoxStream<'static, Result<String, UpstreamCallError>>;

#[derive(Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    config: Arc<UpstreamConfig>,
}

impl UpstreamClient {
    pub fn new(http: reqwest::Client, config: Arc<UpstreamConfig>) -> Self {
        Self { http, config }
    }

    pub fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.timeout_ms)
    }

    fn request<T: Serialize + ?Sized>(&self, body: &T) -> reqwest::RequestBuilder {
        let url = join_url(&self.config.base_url, CHAT_COMPLETIONS_PATH);
        self.http
            .post(url)
            .bearer_auth(&self.config.api_key)
            .json(body)
    }

    /// Single call that waits for the whole body. The configured timeout
    /// bounds the entire exchange.
    pub async fn complete<T: Serialize + ?Sized>(
        &self,
        body: &T,
    ) -> Result<BufferedReply, UpstreamCallError> {
        let result = self.send_buffered(body).await;
        record_call(UpstreamMode::Buffered, &result);
        result
    }

    /// Opens a streamed call. The timeout covers only connection setup and
    /// the response headers; the returned lines are read lazily, and dropping
    /// the stream closes the upstream connection.
    pub async fn open_stream<T: Serialize + ?Sized>(
        &self,
        body: &T,
    ) -> Result<LineStream, UpstreamCallError> {
        let result = self.send_streamed(body).await;
        record_call(UpstreamMode::Streamed, &result);
        result
    }

    async fn send_buffered<T: Serialize + ?Sized>(
        &self,
        body: &T,
    ) -> Result<BufferedReply, UpstreamCallError> {
        let timeout_ms = self.config.timeout_ms;
        let resp = self
            .request(body)
            .timeout(self.timeout())
            .send()
            .await
            .map_err(|err| UpstreamCallError::from_reqwest(err, timeout_ms))?;
        let resp = check_status(resp).await?;
        let status = resp.status();
        let content_type = header_content_type(&resp);
        let body = resp
            .bytes()
            .await
            .map_err(|err| UpstreamCallError::from_reqwest(err, timeout_ms))?;
        Ok(BufferedReply {
            status,
            content_type,
            body,
        })
    }

    async fn send_streamed<T: Serialize + ?Sized>(
        &self,
        body: &T,
    ) -> Result<LineStream, UpstreamCallError> {
        let timeout_ms = self.config.timeout_ms;
        let resp = tokio::time::timeout(self.timeout(), self.request(body).send())
            .await
            .map_err(|_| UpstreamCallError::timeout(timeout_ms))?
            .map_err(|err| UpstreamCallError::from_reqwest(err, timeout_ms))?;
        let resp = tokio::time::timeout(self.timeout(), check_status(resp))
            .await
            .map_err(|_| UpstreamCallError::timeout(timeout_ms))??;
        let body = resp.bytes_stream().map(move |chunk| {
            chunk.map_err(move |err| UpstreamCallError::from_reqwest(err, timeout_ms))
        });
        Ok(split_lines(body, MAX_LINE_BYTES).boxed())
    }
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, UpstreamCallError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let content_type = header_content_type(&resp);
    let text = resp.text().await.unwrap_or_default();
    tracing::warn!(upstream_status = %status, "upstream returned an error status");
    let mut err = UpstreamCallError::new(
        UpstreamErrorKind::Http,
        Some(status),
        format!("upstream status {}", status),
    );
    err.content_type = content_type;
    err.body = Some(text);
    Err(err)
}

fn header_content_type(resp: &reqwest::Response) -> Option<String> {
    resp.headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

fn record_call<T>(mode: UpstreamMode, result: &Result<T, UpstreamCallError>) {
    let outcome = match result {
        Ok(_) => "ok",
        Err(err) => match err.kind {
            UpstreamErrorKind::Network => "network",
            UpstreamErrorKind::Timeout => "timeout",
            UpstreamErrorKind::Http => "http",
            UpstreamErrorKind::Protocol => "protocol",
        },
    };
    metrics::counter!(
        "ollamize_upstream_calls_total",
        "mode" => mode.as_str(),
        "outcome" => outcome
    )
    .increment(1);
}

struct LineSplitter<S> {
    inner: Pin<Box<S>>,
    buf: BytesMut,
    // bytes of `buf` already known to hold no newline
    scanned: usize,
    finished: bool,
}

/// Splits a byte stream into lines without the trailing `\n` or `\r\n`.
///
/// At most `max_line` bytes of an unterminated line are held; past that the
/// stream yields a `Protocol` error and ends. A read error is yielded once
/// and also ends the stream.
pub fn split_lines<S>(
    body: S,
    max_line: usize,
) -> impl Stream<Item = Result<String, UpstreamCallError>> + Send + 'static
where
    S: Stream<Item = Result<Bytes, UpstreamCallError>> + Send + 'static,
{
    let state = LineSplitter {
        inner: Box::pin(body),
        buf: BytesMut::new(),
        scanned: 0,
        finished: false,
    };
    futures_util::stream::unfold(state, move |mut st| async move {
        loop {
            if let Some(pos) = st.buf[st.scanned..].iter().position(|b| *b == b'\n') {
                let line = st.buf.split_to(st.scanned + pos + 1);
                st.scanned = 0;
                return Some((Ok(decode_line(&line)), st));
            }
            st.scanned = st.buf.len();
            if st.buf.len() > max_line {
                st.finished = true;
                st.buf.clear();
                st.scanned = 0;
                let err = UpstreamCallError::new(
                    UpstreamErrorKind::Protocol,
                    None,
                    format!("upstream line exceeds {max_line} bytes"),
                );
                return Some((Err(err), st));
            }
            if st.finished {
                if st.buf.is_empty() {
                    return None;
                }
                let rest = st.buf.split();
                st.scanned = 0;
                return Some((Ok(decode_line(&rest)), st));
            }
            match st.inner.next().await {
                Some(Ok(chunk)) => st.buf.extend_from_slice(&chunk),
                Some(Err(err)) => {
                    st.finished = true;
                    st.buf.clear();
                    st.scanned = 0;
                    return Some((Err(err), st));
                }
                None => st.finished = true,
            }
        }
    })
}

fn decode_line(raw: &[u8]) -> String {
    let mut end = raw.len();
    if end > 0 && raw[end - 1] == b'\n' {
        end -= 1;
    }
    if end > 0 && raw[end - 1] == b'\r' {
        end -= 1;
    }
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

fn join_url(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let mut path = path.trim_start_matches('/');
    if base.ends_with("/v1") {
        if path == "v1" {
            path = "";
        } else if let Some(stripped) = path.strip_prefix("v1/") {
            path = stripped;
        }
    }
    if path.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_url_avoids_duplicate_version_segment() {
        assert_eq!(
            join_url("https://api.example.com/v1", CHAT_COMPLETIONS_PATH),
            "https://api.example.com/v1/chat/completions"
        );
        assert_eq!(
            join_url("http://127.0.0.1:8080/", CHAT_COMPLETIONS_PATH),
            "http://127.0.0.1:8080/v1/chat/completions"
        );
    }

    #[test]
    fn mode_requires_client_and_upstream_streaming() {
        assert_eq!(UpstreamMode::select(true, true), UpstreamMode::Streamed);
        assert_eq!(UpstreamMode::select(true, false), UpstreamMode::Buffered);
        assert_eq!(UpstreamMode::select(false, true), UpstreamMode::Buffered);
    }

    #[test]
    fn client_status_maps_transport_failures_to_bad_gateway() {
        let net = UpstreamCallError::new(UpstreamErrorKind::Network, None, "refused".into());
        assert_eq!(net.client_status(), StatusCode::BAD_GATEWAY);
        let timeout = UpstreamCallError::timeout(10);
        assert_eq!(timeout.client_status(), StatusCode::BAD_GATEWAY);
        let http = UpstreamCallError::new(
            UpstreamErrorKind::Http,
            Some(StatusCode::TOO_MANY_REQUESTS),
            "slow down".into(),
        );
        assert_eq!(http.client_status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn upstream_request_serializes_wire_fields() {
        let req = crate::normalize::normalize(&serde_json::json!({ "prompt": "hi" })).unwrap();
        let wire = UpstreamRequest::from_canonical(&req, "org/model", UpstreamMode::Buffered);
        let v = serde_json::to_value(&wire).unwrap();
        assert_eq!(v["model"], "org/model");
        assert_eq!(v["messages"][0]["role"], "user");
        assert_eq!(v["messages"][0]["content"], "hi");
        assert_eq!(v["max_tokens"], 512);
        assert_eq!(v["stream"], false);
    }

    #[test]
    fn malformed_body_decodes_to_null() {
        let reply = BufferedReply {
            status: StatusCode::OK,
            content_type: None,
            body: Bytes::from_static(b"<html>"),
        };
        assert_eq!(reply.json(), Value::Null);
    }

    fn chunks(parts: Vec<Result<&'static str, &'static str>>) -> Vec<Result<Bytes, UpstreamCallError>> {
        parts
            .into_iter()
            .map(|p| {
                p.map(|s| Bytes::from_static(s.as_bytes())).map_err(|msg| {
                    UpstreamCallError::new(UpstreamErrorKind::Network, None, msg.to_string())
                })
            })
            .collect()
    }

    async fn lines_of(
        parts: Vec<Result<&'static str, &'static str>>,
        max_line: usize,
    ) -> Vec<Result<String, UpstreamErrorKind>> {
        split_lines(futures_util::stream::iter(chunks(parts)), max_line)
            .map(|item| item.map_err(|err| err.kind))
            .collect()
            .await
    }

    #[tokio::test]
    async fn split_lines_handles_chunk_boundaries_and_crlf() {
        let lines = lines_of(
            vec![
                Ok("data: {\"a\""),
                Ok(":1}\r\n\r\ndata: [DO"),
                Ok("NE]"),
            ],
            MAX_LINE_BYTES,
        )
        .await;
        assert_eq!(
            lines,
            vec![
                Ok("data: {\"a\":1}".to_string()),
                Ok(String::new()),
                Ok("data: [DONE]".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn split_lines_finds_newline_after_many_small_chunks() {
        let lines = lines_of(
            vec![Ok("ab"), Ok("cd"), Ok("ef"), Ok("\ngh\n")],
            MAX_LINE_BYTES,
        )
        .await;
        assert_eq!(lines, vec![Ok("abcdef".to_string()), Ok("gh".to_string())]);
    }

    #[tokio::test]
    async fn split_lines_stops_after_read_error() {
        let lines = lines_of(
            vec![Ok("partial"), Err("reset"), Ok("never\n")],
            MAX_LINE_BYTES,
        )
        .await;
        assert_eq!(lines, vec![Err(UpstreamErrorKind::Network)]);
    }

    #[tokio::test]
    async fn split_lines_caps_unterminated_line() {
        let lines = lines_of(
            vec![Ok("ok\n"), Ok("0123456789"), Ok("0123456789"), Ok("tail\n")],
            16,
        )
        .await;
        assert_eq!(
            lines,
            vec![Ok("ok".to_string()), Err(UpstreamErrorKind::Protocol)]
        );
    }

    #[test]
    fn protocol_errors_map_to_bad_gateway() {
        let err = UpstreamCallError::new(UpstreamErrorKind::Protocol, None, "long".into());
        assert_eq!(err.client_status(), StatusCode::BAD_GATEWAY);
        assert_eq!(AppError::from(err).code, "upstream_protocol_error");
    }
}
