//! SSE emission for streaming clients.
//!
//! Both emitters are lazy streams polled by the HTTP transport. An event is
//! produced only when the transport asks for the next one, and a client
//! disconnect drops the stream, which stops emulation and releases any
//! upstream connection it owns.

use crate::upstream::LineStream;
use axum::response::sse::Event;
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use serde_json::{Value, json};
use std::borrow::Cow;
use std::collections::VecDeque;
use std::convert::Infallible;
use std::time::Duration;

pub const DONE_SENTINEL: &str = "[DONE]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    Init,
    Streaming,
    Done,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Delta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEvent {
    pub delta: Delta,
    pub finish_reason: Option<&'static str>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Event(StreamEvent),
    Done,
}

/// Shared `chat.completion.chunk` fields for every event of one stream.
#[derive(Debug, Clone)]
pub struct ChunkEnvelope {
    id: String,
    created: i64,
    model: String,
}

impl ChunkEnvelope {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4().simple()),
            created: chrono::Utc::now().timestamp(),
            model: model.into(),
        }
    }

    pub fn chunk(&self, event: &StreamEvent) -> Value {
        json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": event.delta,
                "finish_reason": event.finish_reason,
            }]
        })
    }

    fn render(&self, frame: &Frame) -> Event {
        match frame {
            Frame::Event(event) => Event::default().data(self.chunk(event).to_string()),
            Frame::Done => Event::default().data(DONE_SENTINEL),
        }
    }
}

/// Word-by-word frames for a complete text: one event per word, a `stop`
/// event, then the sentinel. Empty text still yields one empty fragment.
#[derive(Debug)]
pub struct SyntheticFrames {
    words: VecDeque<String>,
    phase: StreamPhase,
    finished: bool,
}

impl SyntheticFrames {
    pub fn new(text: &str) -> Self {
        let mut words: VecDeque<String> = text
            .split_whitespace()
            .map(|w| format!("{w} "))
            .collect();
        if words.is_empty() {
            words.push_back(String::new());
        }
        Self {
            words,
            phase: StreamPhase::Init,
            finished: false,
        }
    }

    pub fn phase(&self) -> StreamPhase {
        self.phase
    }
}

impl Iterator for SyntheticFrames {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        if self.phase == StreamPhase::Done {
            return None;
        }
        if let Some(word) = self.words.pop_front() {
            let role = (self.phase == StreamPhase::Init).then_some("assistant");
            self.phase = StreamPhase::Streaming;
            return Some(Frame::Event(StreamEvent {
                delta: Delta {
                    role,
                    content: Some(word),
                },
                finish_reason: None,
            }));
        }
        if !self.finished {
            self.finished = true;
            return Some(Frame::Event(StreamEvent {
                delta: Delta::default(),
                finish_reason: Some("stop"),
            }));
        }
        self.phase = StreamPhase::Done;
        Some(Frame::Done)
    }
}

struct SyntheticState {
    frames: SyntheticFrames,
    envelope: ChunkEnvelope,
    delay: Option<Duration>,
}

impl Drop for SyntheticState {
    fn drop(&mut self) {
        if self.frames.phase() != StreamPhase::Done {
            tracing::debug!(model = %self.envelope.model, "synthetic stream cancelled by client");
        }
    }
}

/// Emulates an incremental stream from an already complete response text.
pub fn synthetic_sse(
    text: &str,
    model: &str,
    delay_ms: u64,
) -> impl Stream<Item = Result<Event, Infallible>> + Send + 'static {
    let state = SyntheticState {
        frames: SyntheticFrames::new(text),
        envelope: ChunkEnvelope::new(model),
        delay: (delay_ms > 0).then(|| Duration::from_millis(delay_ms)),
    };
    futures_util::stream::unfold(state, |mut st| async move {
        let started = st.frames.phase() != StreamPhase::Init;
        let frame = st.frames.next()?;
        if let (true, Some(delay)) = (started, st.delay) {
            tokio::time::sleep(delay).await;
        }
        metrics::counter!("ollamize_stream_events_total", "kind" => "synthetic").increment(1);
        let event = st.envelope.render(&frame);
        Some((Ok(event), st))
    })
}

/// What to do with one raw upstream line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineAction<'a> {
    Skip,
    Comment(Cow<'a, str>),
    Data(Cow<'a, str>),
    Done,
}

/// Ensures the `data:` framing of a line. Lines without the prefix are sent
/// whole as data; SSE comments stay comments.
pub fn reframe_line(line: &str) -> LineAction<'_> {
    if line.trim().is_empty() {
        return LineAction::Skip;
    }
    if let Some(comment) = line.strip_prefix(':') {
        return LineAction::Comment(strip_cr(comment.trim_start()));
    }
    let payload = match line.strip_prefix("data:") {
        Some(rest) => rest.trim_start(),
        None => line,
    };
    if payload.trim() == DONE_SENTINEL {
        return LineAction::Done;
    }
    LineAction::Data(strip_cr(payload))
}

fn strip_cr(s: &str) -> Cow<'_, str> {
    if s.contains('\r') {
        Cow::Owned(s.replace('\r', ""))
    } else {
        Cow::Borrowed(s)
    }
}

struct PassthroughState {
    lines: LineStream,
    phase: StreamPhase,
}

impl Drop for PassthroughState {
    fn drop(&mut self) {
        if self.phase != StreamPhase::Done {
            tracing::debug!("passthrough stream cancelled, releasing upstream connection");
        }
    }
}

/// Re-frames an upstream stream line by line and guarantees a final
/// `[DONE]`. An upstream read error closes the stream without one.
pub fn passthrough_sse(
    lines: LineStream,
) -> impl Stream<Item = Result<Event, Infallible>> + Send + 'static {
    let state = PassthroughState {
        lines,
        phase: StreamPhase::Init,
    };
    futures_util::stream::unfold(state, |mut st| async move {
        if st.phase == StreamPhase::Done {
            return None;
        }
        loop {
            let event = match st.lines.next().await {
                Some(Ok(line)) => match reframe_line(&line) {
                    LineAction::Skip => continue,
                    LineAction::Comment(text) => Event::default().comment(text),
                    LineAction::Data(payload) => Event::default().data(payload),
                    LineAction::Done => {
                        st.phase = StreamPhase::Done;
                        Event::default().data(DONE_SENTINEL)
                    }
                },
                Some(Err(err)) => {
                    tracing::warn!(error = %err, "upstream stream failed mid-response");
                    st.phase = StreamPhase::Done;
                    drop(st);
                    return None;
                }
                None => {
                    st.phase = StreamPhase::Done;
                    Event::default().data(DONE_SENTINEL)
                }
            };
            if st.phase == StreamPhase::Init {
                st.phase = StreamPhase::Streaming;
            }
            metrics::counter!("ollamize_stream_events_total", "kind" => "passthrough")
                .increment(1);
            return Some((Ok(event), st));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::{UpstreamCallError, UpstreamErrorKind};

    fn events(frames: &[Frame]) -> Vec<&StreamEvent> {
        frames
            .iter()
            .filter_map(|f| match f {
                Frame::Event(e) => Some(e),
                Frame::Done => None,
            })
            .collect()
    }

    #[test]
    fn three_words_yield_four_events_and_sentinel() {
        let frames: Vec<Frame> = SyntheticFrames::new("a b c").collect();
        assert_eq!(frames.len(), 5);
        assert_eq!(frames.last(), Some(&Frame::Done));
        let evs = events(&frames);
        assert_eq!(evs.len(), 4);
        assert_eq!(evs[0].delta.role, Some("assistant"));
        assert!(evs[1..].iter().all(|e| e.delta.role.is_none()));
        assert_eq!(evs[3].finish_reason, Some("stop"));
        assert_eq!(evs[3].delta, Delta::default());

        let text: String = evs[..3]
            .iter()
            .filter_map(|e| e.delta.content.as_deref())
            .collect();
        assert_eq!(text, "a b c ");
        assert_eq!(text.trim_end(), "a b c");
    }

    #[test]
    fn empty_text_still_emits_one_fragment() {
        let frames: Vec<Frame> = SyntheticFrames::new("  ").collect();
        let evs = events(&frames);
        assert_eq!(evs.len(), 2);
        assert_eq!(evs[0].delta.content.as_deref(), Some(""));
        assert_eq!(evs[0].delta.role, Some("assistant"));
        assert_eq!(evs[1].finish_reason, Some("stop"));
        assert_eq!(frames.last(), Some(&Frame::Done));
    }

    #[test]
    fn frames_walk_init_streaming_done() {
        let mut frames = SyntheticFrames::new("x");
        assert_eq!(frames.phase(), StreamPhase::Init);
        frames.next();
        assert_eq!(frames.phase(), StreamPhase::Streaming);
        frames.next();
        frames.next();
        assert_eq!(frames.phase(), StreamPhase::Done);
        assert_eq!(frames.next(), None);
    }

    #[test]
    fn chunk_serializes_openai_delta_shape() {
        let env = ChunkEnvelope::new("org/m");
        let first = env.chunk(&StreamEvent {
            delta: Delta {
                role: Some("assistant"),
                content: Some("hi ".to_string()),
            },
            finish_reason: None,
        });
        assert_eq!(first["object"], "chat.completion.chunk");
        assert_eq!(first["model"], "org/m");
        assert_eq!(
            first["choices"][0]["delta"],
            json!({ "role": "assistant", "content": "hi " })
        );
        assert_eq!(first["choices"][0]["finish_reason"], Value::Null);

        let last = env.chunk(&StreamEvent {
            delta: Delta::default(),
            finish_reason: Some("stop"),
        });
        assert_eq!(last["choices"][0]["delta"], json!({}));
        assert_eq!(last["choices"][0]["finish_reason"], "stop");
        assert_eq!(first["id"], last["id"]);
    }

    #[test]
    fn reframe_line_ensures_data_prefix() {
        assert_eq!(
            reframe_line("data: {\"a\":1}"),
            LineAction::Data(Cow::Borrowed("{\"a\":1}"))
        );
        assert_eq!(
            reframe_line("{\"a\":1}"),
            LineAction::Data(Cow::Borrowed("{\"a\":1}"))
        );
        assert_eq!(reframe_line("data:[DONE]"), LineAction::Done);
        assert_eq!(reframe_line("data: [DONE]"), LineAction::Done);
        assert_eq!(reframe_line(""), LineAction::Skip);
        assert_eq!(
            reframe_line(": keep-alive"),
            LineAction::Comment(Cow::Borrowed("keep-alive"))
        );
    }

    fn lines(items: Vec<Result<String, UpstreamCallError>>) -> LineStream {
        futures_util::stream::iter(items).boxed()
    }

    #[tokio::test]
    async fn passthrough_appends_missing_sentinel() {
        let out: Vec<_> = passthrough_sse(lines(vec![
            Ok("data: {\"x\":1}".to_string()),
            Ok(String::new()),
            Ok("{\"x\":2}".to_string()),
        ]))
        .collect()
        .await;
        assert_eq!(out.len(), 3);
    }

    #[tokio::test]
    async fn passthrough_does_not_duplicate_sentinel() {
        let out: Vec<_> = passthrough_sse(lines(vec![
            Ok("data: {\"x\":1}".to_string()),
            Ok("data: [DONE]".to_string()),
            Ok("data: {\"ignored\":true}".to_string()),
        ]))
        .collect()
        .await;
        assert_eq!(out.len(), 2);
    }

    #[tokio::test]
    async fn passthrough_stops_on_upstream_error_without_sentinel() {
        let out: Vec<_> = passthrough_sse(lines(vec![
            Ok("data: {\"x\":1}".to_string()),
            Err(UpstreamCallError::new(
                UpstreamErrorKind::Network,
                None,
                "reset".to_string(),
            )),
            Ok("data: {\"x\":2}".to_string()),
        ]))
        .collect()
        .await;
        assert_eq!(out.len(), 1);
    }

    #[tokio::test]
    async fn synthetic_sse_emits_every_frame() {
        let out: Vec<_> = synthetic_sse("one two", "m", 0).collect().await;
        assert_eq!(out.len(), 4);
    }

    #[tokio::test]
    async fn dropping_passthrough_stream_releases_upstream_lines() {
        use std::sync::Arc;
        use std::sync::atomic::{AtomicBool, Ordering};

        struct ReleaseFlag(Arc<AtomicBool>);
        impl Drop for ReleaseFlag {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let released = Arc::new(AtomicBool::new(false));
        let guard = ReleaseFlag(Arc::clone(&released));
        let upstream = futures_util::stream::iter(vec![Ok("data: {\"x\":1}".to_string())])
            .chain(futures_util::stream::pending())
            .map(move |line| {
                let _held = &guard;
                line
            })
            .boxed();

        let mut stream = Box::pin(passthrough_sse(upstream));
        assert!(stream.next().await.is_some());
        assert!(!released.load(Ordering::SeqCst));
        drop(stream);
        assert!(released.load(Ordering::SeqCst));
    }
}
