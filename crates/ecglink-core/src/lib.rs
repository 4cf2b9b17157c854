//! # ECGLink Core Library
//!
//! Device communication for portable 12-lead ECG monitors.
//!
//! This library provides:
//! - BLE GATT and USB CDC serial transports behind one `Connection` interface
//! - Concurrent USB/BLE discovery, first success wins
//! - The command/response protocol (serial number, firmware version, collection)
//! - Decoding of the 31-byte waveform stream into 12-lead samples
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use ecglink_core::prelude::*;
//! use ecglink_core::transport::{btleplug::BtleplugAdapter, serial::SerialPortHost};
//!
//! let session = EcgSession::new(
//!     SessionConfig::default(),
//!     Arc::new(SerialPortHost::new()),
//!     Arc::new(BtleplugAdapter::new()),
//! );
//!
//! let device = session.setup(false).await?;
//! println!("{} SN {}", device.name(), session.read_sn(false, false).await?);
//!
//! let (mut points, _stats) = spawn_decoder(session.listen(false).await, 256);
//! while let Some(point) = points.recv().await {
//!     println!("II = {:?}", point?.lead(LeadName::II));
//! }
//! ```

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod config;
pub mod demo;
pub mod device;
pub mod discovery;
pub mod error;
pub mod protocol;
pub mod session;
pub mod transport;
pub mod waveform;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::SessionConfig;
    pub use crate::device::{DeviceFilter, EcgDevice, Gen, Transmission};
    pub use crate::error::DeviceError;
    pub use crate::protocol::{EcgCommands, ProtocolError};
    pub use crate::session::EcgSession;
    pub use crate::transport::{ByteStream, Channel, Connection, State};
    pub use crate::waveform::{spawn_decoder, EcgPoint, ElectrodeName, LeadName};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
