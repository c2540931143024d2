use std::io;
use std::time::Duration;

use crate::session::StreamId;

/// Errors surfaced by the tunnel core.
///
/// The variants follow the scope they affect: spec and frame errors are
/// local to the caller, stream errors are isolated to one logical stream,
/// and protocol/transport errors take the whole session down.
#[derive(thiserror::Error, Debug)]
pub enum TunnelError {
    #[error("malformed tunnel spec: {0}")]
    MalformedSpec(String),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("invalid tunnel: {0}")]
    InvalidTunnel(String),

    #[error("stream {0} is closed")]
    StreamClosed(StreamId),

    #[error("stream {id} rejected by peer: {reason}")]
    StreamRejected { id: StreamId, reason: String },

    #[error("stream {id} reset: {reason}")]
    StreamReset { id: StreamId, reason: String },

    #[error("stream {0} was not acknowledged within {1:?}")]
    OpenTimeout(StreamId, Duration),

    #[error("remote listen rejected: {0}")]
    ListenRejected(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("session closed")]
    SessionClosed,

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl TunnelError {
    /// Whether this error means the shared transport can no longer be trusted.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            TunnelError::MalformedFrame(_)
                | TunnelError::ProtocolViolation(_)
                | TunnelError::SessionClosed
        )
    }
}

impl From<TunnelError> for io::Error {
    fn from(value: TunnelError) -> Self {
        match value {
            TunnelError::Io(err) => err,
            TunnelError::SessionClosed => io::Error::new(io::ErrorKind::BrokenPipe, value),
            TunnelError::StreamClosed(_) => io::Error::new(io::ErrorKind::BrokenPipe, value),
            TunnelError::StreamReset { .. } => {
                io::Error::new(io::ErrorKind::ConnectionReset, value)
            }
            TunnelError::OpenTimeout(..) => io::Error::new(io::ErrorKind::TimedOut, value),
            TunnelError::MalformedSpec(_) | TunnelError::InvalidTunnel(_) => {
                io::Error::new(io::ErrorKind::InvalidInput, value)
            }
            other => io::Error::new(io::ErrorKind::Other, other),
        }
    }
}

pub type Result<T> = std::result::Result<T, TunnelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_errors_are_session_fatal() {
        assert!(TunnelError::ProtocolViolation("bad".into()).is_session_fatal());
        assert!(TunnelError::MalformedFrame("bad".into()).is_session_fatal());
        assert!(TunnelError::SessionClosed.is_session_fatal());
    }

    #[test]
    fn stream_errors_are_not_session_fatal() {
        assert!(!TunnelError::StreamClosed(3).is_session_fatal());
        assert!(!TunnelError::ListenRejected("in use".into()).is_session_fatal());
        assert!(!TunnelError::MalformedSpec("x".into()).is_session_fatal());
    }

    #[test]
    fn should_map_reset_into_connection_reset() {
        // Arrange
        let error = TunnelError::StreamReset {
            id: 5,
            reason: "dial failed".into(),
        };

        // Act
        let io_error: io::Error = error.into();

        // Assert
        assert_eq!(io::ErrorKind::ConnectionReset, io_error.kind());
    }
}
