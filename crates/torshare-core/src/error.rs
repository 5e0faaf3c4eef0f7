//! Error types for Torshare

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("Handshake rejected: receiver answered {0:?}")]
    HandshakeRejected(String),

    #[error("Chunk {index} I/O failed: {reason}")]
    ChunkIo { index: u64, reason: String },

    #[error("Chunk {index} not acknowledged: got {got:?}")]
    ChunkAckMismatch { index: u64, got: String },

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Crypto error: {0}")]
    Crypto(String),

    #[error("Invalid metadata: {0}")]
    InvalidMetadata(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;
