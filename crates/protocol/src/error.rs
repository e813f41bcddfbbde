//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Serialization errors
    /// Failed to encode a frame or record.
    #[error("encode failed: {0}")]
    Encode(String),

    /// Failed to decode a frame or record.
    #[error("decode failed: {0}")]
    Decode(String),

    // Cryptographic errors
    /// Sealing a message failed.
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// A token could not be opened under the local key.
    #[error("decryption failed: {0}")]
    Decryption(String),

    /// Invalid or malformed shared key.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    // Frame errors
    /// A line on the stream exceeded the frame limit.
    #[error("frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Bytes read before giving up.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    // Connection errors
    /// Connection was closed unexpectedly.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Any other transport failure.
    #[error("I/O error: {0}")]
    Io(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl ProtocolError {
    /// Returns true for errors that only affect a single frame and leave the
    /// connection usable.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ProtocolError::Decode(_) | ProtocolError::Decryption(_)
        )
    }
}

// Conversions from underlying crate errors

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Decode(err.to_string())
        } else {
            ProtocolError::Encode(err.to_string())
        }
    }
}

impl From<base64::DecodeError> for ProtocolError {
    fn from(err: base64::DecodeError) -> Self {
        ProtocolError::Decryption(format!("token is not valid base64: {}", err))
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => ProtocolError::ConnectionClosed(err.to_string()),
            _ => ProtocolError::Io(err.to_string()),
        }
    }
}
