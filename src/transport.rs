//! Event Transport (C8).
//!
//! Frames the client-facing protocol: a `Request` crosses in, a sequence
//! of `Event`s (framing events, throttled content deltas, terminal events)
//! streams out, ending in a `Response`, with periodic `Heartbeat`s keeping
//! idle connections alive. Every frame on a connection gets a
//! monotonically increasing `seq` so a client can detect drops.
//! Backpressure is a bounded channel with no drop-oldest — a slow client
//! is allowed to make the sender wait rather than silently lose events.
//! Every terminal condition (`session_end`/`session_stopped`/`error`)
//! produces exactly one terminal event so the client knows rendering is
//! final.

use crate::error::{Error, ProtocolError, Result};
use crate::provider::{ContentDelta, StreamEvent};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Default channel capacity for a connection's outbound event queue.
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Minimum gap between two `Event::ContentDelta` frames for the same
/// block index, so a fast token stream doesn't flood a slow client with
/// one frame per token.
const DEFAULT_DELTA_THROTTLE: Duration = Duration::from_millis(40);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum Request {
    SendMessage { text: String },
    HitlSubmit { request_id: String, approved: bool, text: Option<String> },
    Stop,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Event { seq: u64, event: Event },
    Response { seq: u64, response: Response },
    Heartbeat { seq: u64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    MessageStart,
    ContentStart { index: usize },
    ContentDelta { index: usize, text: String },
    ContentStop { index: usize },
    MessageStop,
    ToolCallStarted { index: usize, id: String, name: String },
    ToolCallFinished { id: String, is_error: bool },
    HitlConfirm { request_id: String, question: String },
    RollbackOptions { options: Vec<String> },
    RollbackCompleted,
    LongRunningConfirm { request_id: String, description: String },
    SessionStopped { reason: String },
    SessionEnd,
    PlaybookSuggestion { entry_id: String, summary: String },
    Notification { message: String },
    Error { message: String },
    SessionStateChanged { state: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Response {
    Completed,
    Stopped,
    Error { message: String },
}

/// One connection's framed event stream: monotonic sequencing plus a
/// throttled `ContentDelta` emitter sitting in front of a bounded
/// `mpsc::Sender`. Cloning shares the same sequence counter and channel,
/// mirroring the provider router's handle-sharing pattern.
#[derive(Clone)]
pub struct ConnectionHandle {
    seq: Arc<AtomicU64>,
    sender: mpsc::Sender<Frame>,
    last_delta_at: Arc<tokio::sync::Mutex<std::collections::HashMap<usize, tokio::time::Instant>>>,
    pending_delta: Arc<tokio::sync::Mutex<std::collections::HashMap<usize, String>>>,
    throttle: Duration,
}

impl ConnectionHandle {
    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    pub async fn send_event(&self, event: Event) -> Result<()> {
        if let Event::ContentDelta { index, text } = &event {
            let mut last = self.last_delta_at.lock().await;
            let now = tokio::time::Instant::now();
            if let Some(previous) = last.get(index) {
                if now.duration_since(*previous) < self.throttle {
                    self.pending_delta.lock().await.entry(*index).or_default().push_str(text);
                    return Ok(());
                }
            }
            last.insert(*index, now);
        }

        let frame = Frame::Event { seq: self.next_seq(), event };
        self.sender.send(frame).await.map_err(|_| Error::Protocol(ProtocolError::InvalidFrame("connection closed".into())))
    }

    /// Send whatever delta text is still buffered for `index` from a
    /// throttled-away send, so a block's final `content_stop` never drops
    /// trailing text. No-op if nothing is pending.
    async fn flush_pending_delta(&self, index: usize) -> Result<()> {
        let pending = self.pending_delta.lock().await.remove(&index);
        if let Some(text) = pending {
            let frame = Frame::Event { seq: self.next_seq(), event: Event::ContentDelta { index, text } };
            self.sender.send(frame).await.map_err(|_| Error::Protocol(ProtocolError::InvalidFrame("connection closed".into())))?;
        }
        Ok(())
    }

    pub async fn send_response(&self, response: Response) -> Result<()> {
        let frame = Frame::Response { seq: self.next_seq(), response };
        self.sender.send(frame).await.map_err(|_| Error::Protocol(ProtocolError::InvalidFrame("connection closed".into())))
    }

    pub async fn send_heartbeat(&self) -> Result<()> {
        let frame = Frame::Heartbeat { seq: self.next_seq() };
        self.sender.send(frame).await.map_err(|_| Error::Protocol(ProtocolError::InvalidFrame("connection closed".into())))
    }

    /// Translate one canonical [`StreamEvent`] into framed [`Event`]s,
    /// applying content-delta throttling. `ContentBlockStop` always
    /// flushes any delta text withheld by the throttle before emitting
    /// `content_stop`, so the final chunk of a block is never lost.
    /// `MessageDelta` carries the stop reason, which `message_stop` itself
    /// doesn't need, so it is absorbed without its own wire event.
    pub async fn forward_stream_event(&self, event: StreamEvent) -> Result<()> {
        match event {
            StreamEvent::MessageStart => self.send_event(Event::MessageStart).await,
            StreamEvent::ContentBlockStart { index, kind } => match kind {
                crate::provider::ContentBlockKind::Text => self.send_event(Event::ContentStart { index }).await,
                crate::provider::ContentBlockKind::ToolUse { id, name } => self.send_event(Event::ToolCallStarted { index, id, name }).await,
            },
            StreamEvent::ContentBlockDelta { index, delta } => match delta {
                ContentDelta::TextDelta(text) => self.send_event(Event::ContentDelta { index, text }).await,
                ContentDelta::ToolInputDelta(_) => Ok(()),
            },
            StreamEvent::ContentBlockStop { index } => {
                self.flush_pending_delta(index).await?;
                self.send_event(Event::ContentStop { index }).await
            }
            StreamEvent::MessageDelta { .. } => Ok(()),
            StreamEvent::MessageStop => self.send_event(Event::MessageStop).await,
        }
    }
}

/// One connection's transport state: the handle callers use to emit
/// frames, and the receiving half a network adapter drains to actually
/// write bytes to the socket/websocket.
pub struct Connection {
    pub handle: ConnectionHandle,
    pub receiver: mpsc::Receiver<Frame>,
}

impl Connection {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity);
        Self {
            handle: ConnectionHandle {
                seq: Arc::new(AtomicU64::new(0)),
                sender,
                last_delta_at: Arc::new(tokio::sync::Mutex::new(std::collections::HashMap::new())),
                pending_delta: Arc::new(tokio::sync::Mutex::new(std::collections::HashMap::new())),
                throttle: DEFAULT_DELTA_THROTTLE,
            },
            receiver,
        }
    }

    pub fn with_throttle(mut self, throttle: Duration) -> Self {
        self.handle.throttle = throttle;
        self
    }
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse an inbound wire message into a [`Request`], rejecting anything
/// that doesn't match the protocol's tagged-union shape.
pub fn parse_request(raw: &str) -> Result<Request> {
    serde_json::from_str(raw).map_err(|e| Error::Protocol(ProtocolError::InvalidFrame(e.to_string())))
}
