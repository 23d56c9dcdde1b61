//! Connection status of a voice call.
//!
//! `Uninitialized → Initializing → Connecting → Connected →
//! {Disconnected | Error | FailedToConnect}`. A new `start` may begin
//! again from any state.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionStatus {
    #[default]
    Uninitialized,
    Initializing,
    Connecting,
    Connected,
    Disconnected,
    Error,
    FailedToConnect,
}

impl ConnectionStatus {
    /// Human-readable string shown to the user.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "Uninitialized",
            Self::Initializing => "Initializing…",
            Self::Connecting => "Connecting…",
            Self::Connected => "Connected",
            Self::Disconnected => "Disconnected",
            Self::Error => "Error",
            Self::FailedToConnect => "Failed to connect",
        }
    }

    /// Terminal states end the call and trigger teardown.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Disconnected | Self::Error | Self::FailedToConnect
        )
    }

    /// Only a connected call transmits capture frames.
    pub fn is_streaming(self) -> bool {
        self == Self::Connected
    }

    pub fn can_transition_to(self, next: ConnectionStatus) -> bool {
        use ConnectionStatus::*;
        match next {
            Uninitialized => false,
            Initializing => true,
            Connecting => self == Initializing,
            Connected => self == Connecting,
            Disconnected => self == Connected,
            Error => matches!(self, Initializing | Connecting | Connected),
            FailedToConnect => matches!(self, Initializing | Connecting),
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::ConnectionStatus::*;
    use super::*;

    #[test]
    fn user_facing_strings() {
        assert_eq!(Initializing.to_string(), "Initializing…");
        assert_eq!(Connecting.to_string(), "Connecting…");
        assert_eq!(Connected.to_string(), "Connected");
        assert_eq!(Disconnected.to_string(), "Disconnected");
        assert_eq!(Error.to_string(), "Error");
        assert_eq!(FailedToConnect.to_string(), "Failed to connect");
    }

    #[test]
    fn happy_path_transitions() {
        assert!(Uninitialized.can_transition_to(Initializing));
        assert!(Initializing.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Disconnected));
    }

    #[test]
    fn rejects_skipped_and_backward_transitions() {
        assert!(!Uninitialized.can_transition_to(Connected));
        assert!(!Initializing.can_transition_to(Connected));
        assert!(!Connected.can_transition_to(Connecting));
        assert!(!Connected.can_transition_to(FailedToConnect));
        assert!(!Disconnected.can_transition_to(Error));
        assert!(!Error.can_transition_to(Uninitialized));
    }

    #[test]
    fn any_state_can_restart() {
        for s in [Uninitialized, Connected, Disconnected, Error, FailedToConnect] {
            assert!(s.can_transition_to(Initializing));
        }
    }

    #[test]
    fn only_connected_streams() {
        assert!(Connected.is_streaming());
        for s in [Uninitialized, Initializing, Connecting, Disconnected, Error] {
            assert!(!s.is_streaming());
        }
        assert!(Error.is_terminal() && FailedToConnect.is_terminal() && Disconnected.is_terminal());
        assert!(!Connected.is_terminal());
    }
}
