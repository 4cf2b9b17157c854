//! Device errors

use thiserror::Error;

use crate::protocol::ProtocolError;
use crate::waveform::DecodeError;

/// Errors returned by channels, connections, discovery and the session
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("No device discovered within {0} ms")]
    DiscoveryTimeout(u64),

    #[error("No device found: {0}")]
    NoDeviceFound(String),

    #[error("Channel {0} not found")]
    ChannelNotFound(u8),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to device")]
    NotConnected,

    #[error("Device busy: {0}")]
    Busy(String),

    #[error("Command timed out")]
    Timeout,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Protocol(ProtocolError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DeviceError {
    /// True for failures that mean no device could be found at all
    pub fn is_discovery_failure(&self) -> bool {
        matches!(
            self,
            DeviceError::PermissionDenied(_)
                | DeviceError::TransportUnavailable(_)
                | DeviceError::DiscoveryTimeout(_)
                | DeviceError::NoDeviceFound(_)
        )
    }
}

impl From<ProtocolError> for DeviceError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::InvalidInput(msg) => DeviceError::InvalidInput(msg),
            other => DeviceError::Protocol(other),
        }
    }
}

impl From<tokio::time::error::Elapsed> for DeviceError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        DeviceError::Timeout
    }
}
