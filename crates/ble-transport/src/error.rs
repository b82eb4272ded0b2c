//! Error types for BLE link transport operations

use crate::peer::PeerId;
use std::time::Duration;
use thiserror::Error;

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Reasons an inbound frame is refused by the reassembler
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame too short: {len} bytes (min {min})")]
    FrameTooShort { len: usize, min: usize },

    #[error("Invalid fragment type: 0x{0:02x}")]
    InvalidType(u8),

    #[error("Invalid sequence {sequence} >= total {total}")]
    SequenceOutOfRange { sequence: u16, total: u16 },

    #[error("Fragment {sequence}/{total} arrived with no transfer in progress")]
    MissingStart { sequence: u16, total: u16 },

    #[error("Fragment total mismatch: expected {expected}, got {got}")]
    TotalMismatch { expected: u16, got: u16 },
}

/// Errors that can occur during transport operations
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Malformed frame: {0}")]
    MalformedFrame(#[from] FrameError),

    #[error("{kind} operation timed out after {after:?}")]
    OperationTimeout { kind: &'static str, after: Duration },

    #[error("Link operation failed: {0}")]
    OperationFailed(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Peer not connected: {0}")]
    NotConnected(PeerId),

    #[error("Peer blacklisted for another {remaining:?}: {peer}")]
    Blacklisted { peer: PeerId, remaining: Duration },

    #[error("Transport shut down")]
    ShutDown,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TransportError {
    /// Whether the error came from a link primitive rather than from the caller
    pub fn is_link_failure(&self) -> bool {
        matches!(
            self,
            TransportError::OperationTimeout { .. }
                | TransportError::OperationFailed(_)
                | TransportError::ConnectionFailed(_)
        )
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        TransportError::InvalidInput(err.to_string())
    }
}
