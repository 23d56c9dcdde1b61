//! The call driver's event queue.
//!
//! Device threads, the WebSocket reader and the bridge itself only ever
//! push into this queue; a single consumer applies the events in order.

use tokio::sync::mpsc;

use super::protocol::LiveServerMessage;
use super::session::SessionError;

/// Identifier of a scheduled playback fragment, unique within a call.
pub type FragmentId = u64;

/// One fixed-size frame of mono capture audio at the input rate.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedFrame {
    /// Monotonic per-call capture index.
    pub seq: u64,
    /// Normalized samples, -1.0..1.0.
    pub samples: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    /// The remote session finished its handshake (`onopen`).
    SessionOpened,
    /// A message from the remote service (`onmessage`).
    Server(LiveServerMessage),
    /// The session reported an error (`onerror`).
    SessionError(SessionError),
    /// The remote side closed the session (`onclose`).
    SessionClosed { reason: Option<String> },
    /// The frame processor produced a frame.
    FrameCaptured(CapturedFrame),
    /// A fragment finished playing on its own.
    FragmentEnded(FragmentId),
}

pub type EventSender = mpsc::UnboundedSender<BridgeEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<BridgeEvent>;

pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
