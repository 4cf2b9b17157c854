//! Protocol errors

use thiserror::Error;

/// Errors raised while encoding commands or decoding responses
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Header, length, checksum or tail did not match the frame format
    #[error("Malformed frame: {0}")]
    Malformed(String),

    /// The caller supplied a value that cannot be encoded
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl ProtocolError {
    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        ProtocolError::Malformed(msg.into())
    }

    /// True for decode failures, as opposed to rejected caller input
    pub fn is_malformed(&self) -> bool {
        matches!(self, ProtocolError::Malformed(_))
    }
}
