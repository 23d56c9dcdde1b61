//! Remote session seam.
//!
//! A [`LiveConnector`] opens one [`LiveSession`] per call. After `connect`
//! returns, the session reports everything it hears through the call's
//! [`EventSender`]: `SessionOpened` once, then `Server` messages, and
//! `SessionError` / `SessionClosed` as they happen.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::error::VoiceResult;
use super::events::EventSender;
use super::protocol::{RealtimeInput, SessionSetup};

/// Coarse classification of a mid-session failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionErrorKind {
    /// Transport failed: socket reset, TLS failure, write to a dead socket.
    Network,
    /// The service sent something the client could not understand.
    Protocol,
    /// The service reported an application error in an `error` message.
    Server,
}

impl SessionErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Protocol => "protocol",
            Self::Server => "server",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionError {
    pub kind: SessionErrorKind,
    pub message: String,
}

impl SessionError {
    pub fn new(kind: SessionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(SessionErrorKind::Network, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(SessionErrorKind::Protocol, message)
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::new(SessionErrorKind::Server, message)
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error: {}", self.kind.as_str(), self.message)
    }
}

/// Which mid-session errors end the call.
///
/// Fatal errors report `Error` and tear the call down. Everything else is
/// logged and reported through the status callback while the call keeps
/// running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPolicy {
    #[serde(default = "ErrorPolicy::default_fatal")]
    pub fatal: Vec<SessionErrorKind>,
}

impl ErrorPolicy {
    fn default_fatal() -> Vec<SessionErrorKind> {
        vec![SessionErrorKind::Network]
    }

    /// Every error ends the call.
    pub fn strict() -> Self {
        Self {
            fatal: vec![
                SessionErrorKind::Network,
                SessionErrorKind::Protocol,
                SessionErrorKind::Server,
            ],
        }
    }

    pub fn is_fatal(&self, kind: SessionErrorKind) -> bool {
        self.fatal.contains(&kind)
    }
}

impl Default for ErrorPolicy {
    fn default() -> Self {
        Self {
            fatal: Self::default_fatal(),
        }
    }
}

/// Opens remote sessions. Implementations resolve credentials per call.
#[async_trait]
pub trait LiveConnector: Send + Sync {
    /// Open a session and complete its handshake.
    ///
    /// On success the session has already queued `SessionOpened` on
    /// `events`, or will do so before any `Server` event.
    async fn connect(
        &self,
        call_id: &str,
        setup: &SessionSetup,
        events: EventSender,
    ) -> VoiceResult<Box<dyn LiveSession>>;
}

/// An open bidirectional session.
#[async_trait]
pub trait LiveSession: Send {
    /// Send one captured frame. Frames must reach the wire in call order.
    async fn send_realtime_input(&mut self, input: RealtimeInput) -> VoiceResult<()>;

    /// Close the session. Must be safe to call more than once.
    async fn close(&mut self) -> VoiceResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_only_network_is_fatal() {
        let policy = ErrorPolicy::default();
        assert!(policy.is_fatal(SessionErrorKind::Network));
        assert!(!policy.is_fatal(SessionErrorKind::Protocol));
        assert!(!policy.is_fatal(SessionErrorKind::Server));
    }

    #[test]
    fn strict_policy_is_fatal_for_all() {
        let policy = ErrorPolicy::strict();
        assert!(policy.is_fatal(SessionErrorKind::Server));
        assert!(policy.is_fatal(SessionErrorKind::Protocol));
    }

    #[test]
    fn policy_deserializes_from_toml() {
        let policy: ErrorPolicy = toml::from_str(r#"fatal = ["network", "server"]"#).unwrap();
        assert!(policy.is_fatal(SessionErrorKind::Server));
        assert!(!policy.is_fatal(SessionErrorKind::Protocol));

        let empty: ErrorPolicy = toml::from_str("").unwrap();
        assert_eq!(empty, ErrorPolicy::default());
    }

    #[test]
    fn session_error_display() {
        let err = SessionError::network("connection reset");
        assert_eq!(err.to_string(), "network error: connection reset");
    }
}
