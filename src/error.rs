//! Transfer error taxonomy shared by the sender and the receiver.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::protocol::ProtocolError;
use crate::signature::SignatureError;

/// Errors surfaced by [`crate::sender::Sender`] and by a single
/// receiver connection
///
/// On the receiving side every variant is contained to the connection
/// that produced it.
#[derive(Error, Debug)]
pub enum TransferError {
    /// Source file missing at send time; raised before connecting
    #[error("File not found: {0:?}")]
    FileNotFound(PathBuf),

    /// Peer closed the stream in the middle of a frame
    #[error("Transfer interrupted: expected {expected} bytes, received {received}")]
    TransferInterrupted { expected: u64, received: u64 },

    /// Unexpected flag value or malformed frame
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Signing failed: {0}")]
    SigningFailed(String),

    #[error("TLS handshake failed: {0}")]
    TransportHandshake(#[source] io::Error),

    #[error("Failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl From<ProtocolError> for TransferError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Io(e) => TransferError::Io(e),
            ProtocolError::TransferInterrupted { expected, received } => {
                TransferError::TransferInterrupted { expected, received }
            }
            ProtocolError::Violation(msg) => TransferError::ProtocolViolation(msg),
            e @ ProtocolError::InvalidName { .. } => TransferError::ProtocolViolation(e.to_string()),
            ProtocolError::Timeout(after) => TransferError::Timeout(after),
        }
    }
}

impl From<SignatureError> for TransferError {
    fn from(err: SignatureError) -> Self {
        match err {
            SignatureError::FileNotFound(path) => TransferError::FileNotFound(path),
            SignatureError::SigningFailed(msg) => TransferError::SigningFailed(msg),
            SignatureError::Io(e) => TransferError::Io(e),
        }
    }
}
