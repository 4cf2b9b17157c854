//! Transport abstraction
//!
//! A [`Connection`] owns one transport handle (a GATT client or a serial port)
//! and hands out numbered [`Channel`]s over it. Channel 1 carries
//! command/response traffic, channel 2 the waveform stream.

pub mod ble;
#[cfg(feature = "btleplug")]
#[cfg_attr(docsrs, doc(cfg(feature = "btleplug")))]
pub mod btleplug;
pub mod serial;
pub mod usb;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use crate::error::DeviceError;

pub use ble::{Advertisement, BleAdapter, BleConnection, GattChannel, GattClient};
pub use usb::{CdcChannel, CdcTransfer, ReadWriteBuffer, SerialIo, UsbConnection, UsbDeviceInfo, UsbHost};

/// Live byte sequence produced by [`Channel::listen`]
pub type ByteStream = mpsc::Receiver<Result<Vec<u8>, DeviceError>>;

/// Channel number, 1 through 9
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u8);

impl ChannelId {
    /// Command/response channel
    pub const COMMAND: ChannelId = ChannelId(1);
    /// Waveform stream channel
    pub const STREAM: ChannelId = ChannelId(2);

    /// Validate a channel number
    pub fn new(n: u8) -> Result<Self, DeviceError> {
        if (1..=9).contains(&n) {
            Ok(ChannelId(n))
        } else {
            Err(DeviceError::ChannelNotFound(n))
        }
    }

    /// Channel number
    pub fn get(&self) -> u8 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel{}", self.0)
    }
}

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    /// Never connected
    Idle,
    /// Handshake in progress
    Connecting,
    /// Connected and ready
    Connected,
    /// Link closed or lost; `connect` may be called again
    Disconnected,
}

/// One logical pipe of a connection
#[async_trait]
pub trait Channel: Send + Sync {
    /// Channel number
    fn id(&self) -> ChannelId;

    /// Human-readable name
    fn name(&self) -> String {
        self.id().to_string()
    }

    /// Send `request` and return the matching response
    async fn read(&self, request: &[u8], timeout: Duration) -> Result<Vec<u8>, DeviceError>;

    /// Send `data` without waiting for a response
    async fn write(&self, data: &[u8], timeout: Duration) -> Result<(), DeviceError>;

    /// Subscribe to incoming data. A second call replaces the first subscription.
    async fn listen(&self) -> Result<ByteStream, DeviceError>;

    /// End the current subscription, if any
    async fn stop_listen(&self) -> Result<(), DeviceError>;
}

/// A transport link to one device
#[async_trait]
pub trait Connection: Send + Sync {
    /// Connection name, for logs
    fn name(&self) -> &str;

    /// Look up a channel. Channels are created on first access and live as
    /// long as the underlying transport handle.
    fn channel(&self, id: ChannelId) -> Result<Arc<dyn Channel>, DeviceError>;

    /// Command/response channel
    fn channel1(&self) -> Result<Arc<dyn Channel>, DeviceError> {
        self.channel(ChannelId::COMMAND)
    }

    /// Streaming channel
    fn channel2(&self) -> Result<Arc<dyn Channel>, DeviceError> {
        self.channel(ChannelId::STREAM)
    }

    /// Open the transport. Returns immediately when already connected;
    /// concurrent callers are serialized.
    async fn connect(&self) -> Result<(), DeviceError>;

    /// Close the transport. Errors are logged, never returned.
    async fn disconnect(&self);

    /// Subscribe to state changes
    fn state(&self) -> watch::Receiver<State>;
}

/// Channel that delivers `err` and ends
pub(crate) fn error_stream(err: DeviceError) -> ByteStream {
    let (tx, rx) = mpsc::channel(1);
    // capacity 1 and a fresh channel: cannot fail
    let _ = tx.try_send(Err(err));
    rx
}
