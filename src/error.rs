//! Error taxonomy for the connection engine.
//!
//! Errors that fan out to many waiters (one transport fault failing every queued write and
//! every pending transaction) are `Clone`, so the same value reaches each of them.

use std::io;

use thiserror::Error;

/// Failure of the underlying byte stream.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// I/O operation failed.
    #[error("I/O error ({kind:?}): {message}")]
    Io { kind: io::ErrorKind, message: String },

    /// Peer closed the stream.
    #[error("connection closed by peer")]
    Eof,

    /// Channel was closed locally.
    #[error("channel closed")]
    Closed,

    /// Peer stopped answering keepalive echoes.
    #[error("no response to keepalive echo")]
    KeepaliveTimeout,

    /// Connection was dropped after the peer violated the protocol.
    #[error("connection aborted: {0}")]
    Aborted(String),
}

impl From<io::Error> for TransportError {
    fn from(error: io::Error) -> Self {
        match error.kind() {
            io::ErrorKind::UnexpectedEof => TransportError::Eof,
            kind => TransportError::Io {
                kind,
                message: error.to_string(),
            },
        }
    }
}

/// A message body could not be decoded.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("truncated {what}: need {needed} bytes, have {available}")]
    Truncated {
        what: &'static str,
        needed: usize,
        available: usize,
    },

    #[error("invalid {what}: {detail}")]
    Invalid { what: &'static str, detail: String },
}

impl DecodeError {
    pub fn invalid(what: &'static str, detail: impl Into<String>) -> Self {
        DecodeError::Invalid {
            what,
            detail: detail.into(),
        }
    }
}

impl From<io::Error> for DecodeError {
    fn from(error: io::Error) -> Self {
        DecodeError::invalid("message body", error.to_string())
    }
}

/// The peer violated the protocol.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("header length {length} is shorter than the 8-byte header")]
    BadLength { length: u16 },

    #[error("frame of {length} bytes does not fit the 16-bit length field")]
    FrameTooLarge { length: usize },

    #[error("malformed handshake: {0}")]
    MalformedHandshake(String),

    #[error("no common protocol version (local {local:?}, peer {peer:?})")]
    Incompatible { local: Vec<u8>, peer: Vec<u8> },

    #[error("transaction id {0} is already pending")]
    DuplicateXid(u32),

    #[error("xid {xid}: expected reply type {expected}, got {actual}")]
    UnexpectedReply { xid: u32, expected: u8, actual: u8 },

    #[error("message type {0} has no registered reply type")]
    NotARequest(u8),

    #[error("decode failure: {0}")]
    Decode(#[from] DecodeError),
}

/// Why an established channel stopped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl ChannelError {
    /// The transport-level outcome handed to everything still waiting on the channel.
    pub fn to_transport(&self) -> TransportError {
        match self {
            ChannelError::Transport(e) => e.clone(),
            ChannelError::Protocol(e) => TransportError::Aborted(e.to_string()),
        }
    }
}

/// Why version negotiation failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("negotiation timed out")]
    Timeout,

    #[error("transport error during negotiation: {0}")]
    Transport(#[from] TransportError),

    #[error("protocol error during negotiation: {0}")]
    Protocol(#[from] ProtocolError),
}

impl From<ChannelError> for NegotiationError {
    fn from(error: ChannelError) -> Self {
        match error {
            ChannelError::Transport(e) => NegotiationError::Transport(e),
            ChannelError::Protocol(e) => NegotiationError::Protocol(e),
        }
    }
}

/// An error frame returned by the peer for a specific request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReport {
    pub err_type: u16,
    pub code: u16,
    pub data: Vec<u8>,
}

/// Why a request did not produce its reply.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransactionError {
    #[error("transaction timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("peer rejected request (type {}, code {})", .0.err_type, .0.code)]
    Application(ErrorReport),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// Configuration could not be loaded.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[from] io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Main error type for controller operations.
#[derive(Error, Debug)]
pub enum OfpError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl From<DecodeError> for OfpError {
    fn from(error: DecodeError) -> Self {
        OfpError::Protocol(ProtocolError::Decode(error))
    }
}

/// Result type alias using `OfpError`.
pub type Result<T> = std::result::Result<T, OfpError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unexpected_eof_maps_to_eof() {
        let err: TransportError = io::Error::new(io::ErrorKind::UnexpectedEof, "eof").into();
        assert_eq!(err, TransportError::Eof);
    }

    #[test]
    fn io_errors_keep_their_kind() {
        let err: TransportError =
            io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer").into();
        match err {
            TransportError::Io { kind, message } => {
                assert_eq!(kind, io::ErrorKind::ConnectionReset);
                assert!(message.contains("reset by peer"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn protocol_failure_reaches_waiters_as_aborted_transport() {
        let err = ChannelError::Protocol(ProtocolError::BadLength { length: 2 });
        match err.to_transport() {
            TransportError::Aborted(message) => assert!(message.contains("length 2")),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(
            ChannelError::Transport(TransportError::Eof).to_transport(),
            TransportError::Eof
        );
    }

    #[test]
    fn application_error_display_names_type_and_code() {
        let err = TransactionError::Application(ErrorReport {
            err_type: 1,
            code: 5,
            data: vec![],
        });
        assert_eq!(err.to_string(), "peer rejected request (type 1, code 5)");
    }
}
