//! Structured error types for intrace
//!
//! Using thiserror for automatic Display implementation and error chaining.

use thiserror::Error;

/// Frame codec failures (malformed or oversize frames, closed transport)
pub use intrace_common::FrameError as ProtocolError;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Failed to bind {what} port {port}: {source}")]
    Bind {
        what: &'static str,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to connect back to observer on port {port}: {source}")]
    Callback {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Pattern(#[from] PatternError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Per-unit failure; never fatal to an instrumentation pass
#[derive(Error, Debug)]
pub enum InstrumentationError {
    #[error("Cannot instrument {unit}: {reason}")]
    Unsupported { unit: String, reason: String },

    #[error("Failed to save instrumented description of {unit}: {source}")]
    SaveFailed {
        unit: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PatternError {
    #[error("Invalid pattern \"{pattern}\": {reason}")]
    Invalid { pattern: String, reason: String },
}

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Not connected")]
    NotConnected,

    #[error("Failed to connect to {addr}: {source}")]
    ConnectFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Control channel closed")]
    ChannelClosed,

    #[error("Unexpected reply to {command}: {reply}")]
    UnexpectedReply { command: String, reply: String },

    #[error("Filter thread stopped")]
    FilterStopped,

    #[error(transparent)]
    Pattern(#[from] PatternError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_error_display() {
        let err = AgentError::Bind {
            what: "control",
            port: 9123,
            source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use"),
        };
        assert_eq!(err.to_string(), "Failed to bind control port 9123: in use");
    }

    #[test]
    fn test_instrumentation_error_display() {
        let err = InstrumentationError::Unsupported {
            unit: "demo::Sealed".to_string(),
            reason: "unit is sealed".to_string(),
        };
        assert_eq!(err.to_string(), "Cannot instrument demo::Sealed: unit is sealed");
    }

    #[test]
    fn test_pattern_error_display() {
        let err = PatternError::Invalid { pattern: "(".to_string(), reason: "unclosed".to_string() };
        assert_eq!(err.to_string(), "Invalid pattern \"(\": unclosed");
    }

    #[test]
    fn test_client_error_display() {
        let err = ClientError::UnexpectedReply {
            command: "[out-network".to_string(),
            reply: "OK".to_string(),
        };
        assert_eq!(err.to_string(), "Unexpected reply to [out-network: OK");
        assert_eq!(ClientError::NotConnected.to_string(), "Not connected");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: ClientError = io_err.into();
        assert!(matches!(err, ClientError::Io(_)));
    }
}
