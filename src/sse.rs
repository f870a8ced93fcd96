//! Incremental decoder for the `event:`/`data:` framing used by the text stream.
//!
//! [`FrameDecoder`] is push-based: feed it whatever bytes the network handed
//! over and it returns the frames whose terminating blank line has been seen.
//! Anything after the last terminator, including half of a multi-byte UTF-8
//! sequence, stays buffered until the next push.
//!
//! Comment lines (leading `:`) are keep-alives. They never produce a frame
//! and never split one, so a stream with comments interleaved decodes to the
//! same frames as the stream without them.

use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::Stream;

use crate::error::DecodeError;
use crate::protocol::StreamEvent;

#[derive(Debug, Clone, PartialEq, Eq)]
enum SseLine {
    Data(String),
    Event(String),
    Id(String),
    Empty,
    Comment,
}

/// A complete frame, assembled from the lines before a blank line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

fn field_value<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(name)?.strip_prefix(':')?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

fn parse_line(line: &str) -> SseLine {
    if line.is_empty() {
        return SseLine::Empty;
    }
    if line.starts_with(':') {
        return SseLine::Comment;
    }
    if let Some(data) = field_value(line, "data") {
        return SseLine::Data(data.to_string());
    }
    if let Some(event) = field_value(line, "event") {
        return SseLine::Event(event.trim().to_string());
    }
    if let Some(id) = field_value(line, "id") {
        return SseLine::Id(id.to_string());
    }
    // `retry:` and unknown fields carry nothing we act on.
    SseLine::Comment
}

#[derive(Debug, Default)]
struct FrameBuilder {
    data_lines: Vec<String>,
    event: Option<String>,
    id: Option<String>,
}

impl FrameBuilder {
    fn has_content(&self) -> bool {
        !self.data_lines.is_empty() || self.event.is_some()
    }

    fn build(&mut self) -> SseFrame {
        let frame = SseFrame {
            event: self.event.take(),
            data: self.data_lines.join("\n"),
            id: self.id.take(),
        };
        self.data_lines.clear();
        frame
    }
}

#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    builder: FrameBuilder,
    keep_alives: u64,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds raw bytes and returns every frame completed by them, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);

        let mut frames = Vec::new();
        let mut start = 0;
        while let Some(pos) = self.buffer[start..].iter().position(|b| *b == b'\n') {
            let end = start + pos;
            let mut raw = &self.buffer[start..end];
            if raw.last() == Some(&b'\r') {
                raw = &raw[..raw.len() - 1];
            }
            let line = String::from_utf8_lossy(raw).into_owned();
            start = end + 1;

            if let Some(frame) = self.accept_line(&line) {
                frames.push(frame);
            }
        }
        self.buffer.drain(..start);

        frames
    }

    /// Flushes an unterminated trailing frame once the byte stream has ended.
    pub fn finish(&mut self) -> Option<SseFrame> {
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&rest).into_owned();
            let line = line.trim_end_matches('\r');
            if let Some(frame) = self.accept_line(line) {
                return Some(frame);
            }
        }

        if self.builder.has_content() {
            Some(self.builder.build())
        } else {
            None
        }
    }

    /// Number of comment (keep-alive) lines seen so far.
    pub fn keep_alives(&self) -> u64 {
        self.keep_alives
    }

    /// Bytes held back waiting for a line terminator.
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }

    fn accept_line(&mut self, line: &str) -> Option<SseFrame> {
        match parse_line(line) {
            SseLine::Empty => {
                if self.builder.has_content() {
                    return Some(self.builder.build());
                }
            }
            SseLine::Comment => self.keep_alives += 1,
            SseLine::Data(data) => self.builder.data_lines.push(data),
            SseLine::Event(event) => self.builder.event = Some(event),
            SseLine::Id(id) => self.builder.id = Some(id),
        }
        None
    }
}

/// Turns a frame into a typed event.
///
/// When the JSON document carries no `type`, the frame's `event:` name is
/// used as the tag.
pub fn decode_event(frame: &SseFrame) -> Result<StreamEvent, DecodeError> {
    let data = frame.data.trim();
    if data.is_empty() {
        return Err(DecodeError::Empty);
    }

    let mut value: serde_json::Value = serde_json::from_str(data)?;
    if let (Some(object), Some(event)) = (value.as_object_mut(), frame.event.as_ref()) {
        if !object.contains_key("type") {
            object.insert("type".to_string(), serde_json::Value::String(event.clone()));
        }
    }

    Ok(serde_json::from_value(value)?)
}

/// Adapts a byte stream into a stream of frames.
pub struct SseEventStream<S> {
    inner: S,
    decoder: FrameDecoder,
    ready: VecDeque<SseFrame>,
    done: bool,
}

impl<S> SseEventStream<S> {
    #[must_use]
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            decoder: FrameDecoder::new(),
            ready: VecDeque::new(),
            done: false,
        }
    }
}

impl<S, E> Stream for SseEventStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    type Item = Result<SseFrame, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(frame) = self.ready.pop_front() {
                return Poll::Ready(Some(Ok(frame)));
            }
            if self.done {
                return Poll::Ready(None);
            }

            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    let frames = self.decoder.push(&bytes);
                    self.ready.extend(frames);
                }
                Poll::Ready(Some(Err(e))) => return Poll::Ready(Some(Err(e))),
                Poll::Ready(None) => {
                    self.done = true;
                    if let Some(frame) = self.decoder.finish() {
                        self.ready.push_back(frame);
                    }
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
