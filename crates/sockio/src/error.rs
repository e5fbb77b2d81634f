//! Error types for the socket client.

use std::io;

use thiserror::Error;

/// Errors raised by [`TcpClient`](crate::TcpClient) operations.
#[derive(Error, Debug, Clone)]
pub enum SocketError {
    /// The peer refused the connection or could not be reached.
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    /// A connect attempt or an operation exceeded its deadline.
    #[error("{0}")]
    ConnectionTimeout(String),

    /// The peer closed the stream before the requested frame was complete.
    #[error("connection closed by peer (eof)")]
    ConnectionEof,

    /// The peer reset the connection while it was in use.
    #[error("connection reset: {0}")]
    ConnectionReset(String),

    /// `open` was called on a connected client.
    #[error("socket already open")]
    AlreadyConnected,

    /// `open` was called while another connect attempt is in flight.
    #[error("socket is already connecting")]
    AlreadyConnecting,

    /// An operation was issued on a disconnected client with auto-reconnect off.
    #[error("socket is not connected")]
    NotConnected,

    /// Transport failure not otherwise classified.
    #[error("connection error: {0}")]
    Connection(String),

    /// Invalid or unreadable configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl SocketError {
    /// Whether this error is a deadline expiry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::ConnectionTimeout(_))
    }

    /// Whether this error reports the peer's end of stream.
    pub fn is_eof(&self) -> bool {
        matches!(self, Self::ConnectionEof)
    }

    /// Whether this error left the client disconnected.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            Self::ConnectionRefused(_)
                | Self::ConnectionEof
                | Self::ConnectionReset(_)
                | Self::Connection(_)
                | Self::NotConnected
        )
    }
}

impl From<io::Error> for SocketError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => Self::ConnectionRefused(err.to_string()),
            io::ErrorKind::TimedOut => Self::ConnectionTimeout(err.to_string()),
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => Self::ConnectionReset(err.to_string()),
            io::ErrorKind::UnexpectedEof => Self::ConnectionEof,
            _ => Self::Connection(err.to_string()),
        }
    }
}

impl From<toml::de::Error> for SocketError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(err.to_string())
    }
}

/// A specialized Result type for socket operations.
pub type Result<T> = std::result::Result<T, SocketError>;
