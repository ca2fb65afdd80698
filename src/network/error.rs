use crate::messages::{CloseCode, WireProtocolError};
use std::time::Duration;
use thiserror::Error;

/// Errors reported by a transport connection.
#[derive(Debug, Error)]
pub enum TransportError {
    /// This side closed the connection.
    #[error("The connection was closed by the client")]
    ClosedByClient,

    /// The peer closed the connection with a WebSocket close code.
    #[error("The connection was closed by the server: {reason} (code {code})")]
    ClosedByServer { code: u16, reason: String },

    /// The WebSocket upgrade was refused with an HTTP status.
    #[error("The relay rejected the connection with HTTP status {status}")]
    HandshakeRejected { status: u16 },

    #[error("Incoming message of {size} bytes does not fit into a {capacity} byte buffer")]
    MessageTooLarge { size: usize, capacity: usize },

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    pub fn closed_by_server(code: impl Into<u16>, reason: impl Into<String>) -> Self {
        TransportError::ClosedByServer {
            code: code.into(),
            reason: reason.into(),
        }
    }
}

/// Error kinds callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed, truncated or out-of-range wire data.
    ProtocolViolation,
    /// The relay refused access. Prompt for credentials, do not retry.
    AccessDenied,
    /// The relay refused to resume the session.
    SessionInvalid,
    /// The relay could not reach the backend.
    BackendUnreachable,
    /// The connection broke. A new stream may succeed.
    TransientBreak,
    /// The stream was closed locally.
    LocalClosure,
    /// A bounded operation did not finish in time.
    Timeout,
    /// The caller passed an argument the stream cannot accept.
    Usage,
}

/// Errors surfaced by relay sessions and streams.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("The server denied access: {0}")]
    AccessDenied(String),

    #[error("The server closed the connection unexpectedly and reestablishing the connection failed: {0}")]
    ReconnectFailed(String),

    #[error("The server could not connect to the backend: {0}")]
    BackendConnectFailed(String),

    #[error("The backend could not be found: {0}")]
    BackendNotFound(String),

    #[error("Connection failed after {attempts} attempts: {source}")]
    ConnectionFailed {
        attempts: u32,
        #[source]
        source: TransportError,
    },

    #[error("The server did not respond within {0:?}")]
    ProbeTimeout(Duration),

    #[error("Write buffer too large ({size}), must be at most {max}")]
    WriteTooLarge { size: usize, max: usize },

    #[error("Read buffer too small ({size}), must be at least {min}")]
    ReadBufferTooSmall { size: usize, min: usize },

    #[error("Invalid relay endpoint: {0}")]
    InvalidEndpoint(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl From<WireProtocolError> for RelayError {
    fn from(error: WireProtocolError) -> Self {
        RelayError::ProtocolViolation(error.to_string())
    }
}

impl RelayError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            RelayError::ProtocolViolation(_) => ErrorKind::ProtocolViolation,
            RelayError::AccessDenied(_) | RelayError::BackendNotFound(_) => ErrorKind::AccessDenied,
            RelayError::ReconnectFailed(_) => ErrorKind::SessionInvalid,
            RelayError::BackendConnectFailed(_) => ErrorKind::BackendUnreachable,
            RelayError::ConnectionFailed { .. } => ErrorKind::TransientBreak,
            RelayError::ProbeTimeout(_) => ErrorKind::Timeout,
            RelayError::WriteTooLarge { .. }
            | RelayError::ReadBufferTooSmall { .. }
            | RelayError::InvalidEndpoint(_) => ErrorKind::Usage,
            RelayError::Transport(TransportError::ClosedByClient) => ErrorKind::LocalClosure,
            RelayError::Transport(TransportError::HandshakeRejected { status: 401 | 403 }) => {
                ErrorKind::AccessDenied
            }
            RelayError::Transport(_) => ErrorKind::TransientBreak,
        }
    }

    /// Whether opening a new stream could plausibly succeed
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::TransientBreak
    }

    /// Close code reported by the server, if this error carries one
    pub fn close_code(&self) -> Option<CloseCode> {
        match self {
            RelayError::Transport(TransportError::ClosedByServer { code, .. })
            | RelayError::ConnectionFailed {
                source: TransportError::ClosedByServer { code, .. },
                ..
            } => Some(CloseCode::from_u16(*code)),
            _ => None,
        }
    }
}
