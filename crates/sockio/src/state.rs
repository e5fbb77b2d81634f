//! Connection state of a socket client.

/// Current state of a TCP connection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionState {
    /// No transport handle is held.
    #[default]
    Disconnected,
    /// A connect attempt is in flight.
    Connecting,
    /// Connected and ready to send/receive data.
    Connected,
}

impl ConnectionState {
    /// Whether a transport handle is held.
    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
        }
    }
}
