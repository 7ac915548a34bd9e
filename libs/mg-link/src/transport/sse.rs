//! Incremental `text/event-stream` decoding.

use bytes::BytesMut;
use std::time::Duration;

/// One dispatched server-sent event
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    /// `data:` lines joined with `\n`
    pub data: Option<String>,
    pub id: Option<String>,
    /// Reconnection delay requested by the server
    pub retry: Option<Duration>,
}

/// What a frame means to a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Carries one GraphQL result
    Next,
    /// The server finished the subscription
    Complete,
    /// Anything else; ignored
    Other,
}

impl SseFrame {
    #[must_use]
    pub fn kind(&self) -> FrameKind {
        match self.event.as_deref() {
            Some("complete") => FrameKind::Complete,
            None | Some("next" | "message") if self.data.is_some() => FrameKind::Next,
            _ => FrameKind::Other,
        }
    }
}

/// Position of the decoder within the event stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderState {
    /// Between frames, nothing buffered
    AwaitingHeader,
    /// Lines of a frame (or part of a line) are buffered
    BufferingFrame,
    /// A frame was just dispatched
    FrameComplete,
}

/// Turns arbitrary byte chunks into [`SseFrame`]s.
///
/// Chunks may split lines and frames anywhere, including between the `\r` and
/// `\n` of a line ending. Frames whose lines add up to more than
/// `max_frame_bytes` are dropped and counted in [`corrupt_frames`].
///
/// [`corrupt_frames`]: FrameDecoder::corrupt_frames
#[derive(Debug)]
pub struct FrameDecoder {
    line: BytesMut,
    line_bytes: usize,
    frame: SseFrame,
    frame_bytes: usize,
    oversized: bool,
    skip_lf: bool,
    state: DecoderState,
    max_frame_bytes: usize,
    last_event_id: Option<String>,
    retry_hint: Option<Duration>,
    corrupt_frames: usize,
}

impl FrameDecoder {
    #[must_use]
    pub fn new(max_frame_bytes: usize) -> Self {
        Self {
            line: BytesMut::new(),
            line_bytes: 0,
            frame: SseFrame::default(),
            frame_bytes: 0,
            oversized: false,
            skip_lf: false,
            state: DecoderState::AwaitingHeader,
            max_frame_bytes,
            last_event_id: None,
            retry_hint: None,
            corrupt_frames: 0,
        }
    }

    #[must_use]
    pub fn state(&self) -> DecoderState {
        self.state
    }

    /// Most recent `id:` seen on this stream, kept across [`reset`](Self::reset)
    #[must_use]
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    /// Most recent `retry:` seen on this stream
    #[must_use]
    pub fn retry_hint(&self) -> Option<Duration> {
        self.retry_hint
    }

    /// Frames dropped for exceeding the size limit
    #[must_use]
    pub fn corrupt_frames(&self) -> usize {
        self.corrupt_frames
    }

    /// Feed a chunk and collect every frame it completes, in order
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        let mut frames = Vec::new();
        let mut rest = chunk;

        if self.skip_lf && !rest.is_empty() {
            self.skip_lf = false;
            if rest[0] == b'\n' {
                rest = &rest[1..];
            }
        }

        while let Some(pos) = rest.iter().position(|b| *b == b'\n' || *b == b'\r') {
            self.extend_line(&rest[..pos]);
            let terminator = rest[pos];
            rest = &rest[pos + 1..];

            if terminator == b'\r' {
                match rest.first() {
                    Some(b'\n') => rest = &rest[1..],
                    None => self.skip_lf = true,
                    Some(_) => {}
                }
            }

            let blank = std::mem::take(&mut self.line_bytes) == 0;
            let line = self.line.split();
            if let Some(frame) = self.process_line(blank, &line) {
                frames.push(frame);
            }
        }

        self.extend_line(rest);
        frames
    }

    /// Forget any partial frame before reading a new connection
    pub fn reset(&mut self) {
        self.line.clear();
        self.line_bytes = 0;
        self.frame = SseFrame::default();
        self.frame_bytes = 0;
        self.oversized = false;
        self.skip_lf = false;
        self.state = DecoderState::AwaitingHeader;
    }

    fn extend_line(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        self.state = DecoderState::BufferingFrame;
        self.line_bytes += bytes.len();
        self.frame_bytes += bytes.len();
        if self.frame_bytes > self.max_frame_bytes {
            self.oversized = true;
            self.line.clear();
            self.frame = SseFrame::default();
        }
        if !self.oversized {
            self.line.extend_from_slice(bytes);
        }
    }

    fn process_line(&mut self, blank: bool, line: &[u8]) -> Option<SseFrame> {
        if blank {
            return self.finish_frame();
        }
        if self.oversized {
            return None;
        }

        let line = String::from_utf8_lossy(line);
        let line = line.strip_prefix('\u{feff}').unwrap_or(&line);
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.frame.event = Some(value.to_owned()),
            "data" => match &mut self.frame.data {
                Some(data) => {
                    data.push('\n');
                    data.push_str(value);
                }
                None => self.frame.data = Some(value.to_owned()),
            },
            "id" if !value.contains('\0') => {
                self.frame.id = Some(value.to_owned());
                self.last_event_id = Some(value.to_owned());
            }
            "retry" => {
                if let Ok(ms) = value.parse::<u64>() {
                    let retry = Duration::from_millis(ms);
                    self.frame.retry = Some(retry);
                    self.retry_hint = Some(retry);
                }
            }
            _ => {}
        }
        None
    }

    fn finish_frame(&mut self) -> Option<SseFrame> {
        let frame = std::mem::take(&mut self.frame);
        let oversized = std::mem::replace(&mut self.oversized, false);
        self.frame_bytes = 0;

        if oversized {
            self.corrupt_frames += 1;
            self.state = DecoderState::AwaitingHeader;
            tracing::warn!(
                limit = self.max_frame_bytes,
                "dropping event frame over size limit"
            );
            return None;
        }

        if frame.data.is_none() && frame.event.is_none() {
            self.state = DecoderState::AwaitingHeader;
            return None;
        }

        self.state = DecoderState::FrameComplete;
        Some(frame)
    }
}
