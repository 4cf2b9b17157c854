//! Session configuration
//!
//! Timeouts, BLE name filter, serial parameters and stream bounds. Every field
//! has a default, so a partial JSON document is enough to override a few.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::DeviceError;
use crate::protocol::ChecksumPolicy;

/// Advertised name of Gen3 BLE monitors
pub const DEFAULT_BLE_NAME: &str = "WWKECG12E";

/// Default baud rate of the USB CDC link
pub const DEFAULT_BAUD_RATE: u32 = 921_600;

/// Default USB receive buffer size (1000 waveform frames)
pub const DEFAULT_USB_BUFFER_CAPACITY: usize = 31 * 1000;

/// Serial parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    /// No parity bit
    #[default]
    None,
    /// Odd parity
    Odd,
    /// Even parity
    Even,
}

/// Serial line parameters for USB CDC devices
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits (5-8)
    pub data_bits: u8,
    /// Stop bits (1 or 2)
    pub stop_bits: u8,
    /// Parity
    pub parity: Parity,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
        }
    }
}

/// Round-trip timeouts for one transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandTimeouts {
    /// Read SN, read version and write SN
    pub command_ms: u64,
    /// Start collect
    pub start_collect_ms: u64,
    /// Stop collect
    pub stop_collect_ms: u64,
}

impl CommandTimeouts {
    /// Timeouts for BLE monitors
    pub fn ble() -> Self {
        Self {
            command_ms: 500,
            start_collect_ms: 500,
            stop_collect_ms: 500,
        }
    }

    /// Timeouts for USB monitors
    pub fn usb() -> Self {
        Self {
            command_ms: 2000,
            start_collect_ms: 100,
            stop_collect_ms: 2000,
        }
    }

    /// Command round-trip timeout
    pub fn command(&self) -> Duration {
        Duration::from_millis(self.command_ms)
    }

    /// Start-collect write timeout
    pub fn start_collect(&self) -> Duration {
        Duration::from_millis(self.start_collect_ms)
    }

    /// Stop-collect write timeout
    pub fn stop_collect(&self) -> Duration {
        Duration::from_millis(self.stop_collect_ms)
    }
}

/// Configuration of an [`EcgSession`](crate::session::EcgSession)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// USB discovery bound, including the wait for an attachment
    pub usb_discovery_timeout_ms: u64,

    /// BLE scan bound
    pub ble_discovery_timeout_ms: u64,

    /// How long to wait for the user to answer a USB permission prompt
    pub usb_permission_timeout_ms: u64,

    /// Advertised name a BLE monitor must carry
    pub ble_device_name: String,

    /// Optional name prefix that also matches
    pub ble_name_mask: String,

    /// Verify checksum and tail of command responses
    pub verify_checksum: bool,

    /// USB serial line parameters
    pub serial: SerialSettings,

    /// USB command timeouts
    pub usb_timeouts: CommandTimeouts,

    /// BLE command timeouts
    pub ble_timeouts: CommandTimeouts,

    /// Bound of every listen stream; producers wait when it is full
    pub stream_capacity: usize,

    /// Interval of the USB stream poller
    pub usb_poll_interval_ms: u64,

    /// USB receive buffer size in bytes
    pub usb_buffer_capacity: usize,

    /// Bound on unsubscribe and close; an unresponsive link is abandoned after it
    pub teardown_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            usb_discovery_timeout_ms: 2000,
            ble_discovery_timeout_ms: 5000,
            usb_permission_timeout_ms: 30_000,
            ble_device_name: DEFAULT_BLE_NAME.to_string(),
            ble_name_mask: String::new(),
            verify_checksum: true,
            serial: SerialSettings::default(),
            usb_timeouts: CommandTimeouts::usb(),
            ble_timeouts: CommandTimeouts::ble(),
            stream_capacity: 64,
            usb_poll_interval_ms: 5,
            usb_buffer_capacity: DEFAULT_USB_BUFFER_CAPACITY,
            teardown_timeout_ms: 2000,
        }
    }
}

impl SessionConfig {
    /// Parse a JSON document
    pub fn from_json_str(json: &str) -> Result<Self, DeviceError> {
        serde_json::from_str(json).map_err(|e| DeviceError::InvalidInput(e.to_string()))
    }

    /// Load from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, DeviceError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// Save as pretty-printed JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), DeviceError> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| DeviceError::InvalidInput(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Response verification policy derived from `verify_checksum`
    pub fn checksum_policy(&self) -> ChecksumPolicy {
        if self.verify_checksum {
            ChecksumPolicy::Enforce
        } else {
            ChecksumPolicy::Lenient
        }
    }

    /// USB discovery bound
    pub fn usb_discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.usb_discovery_timeout_ms)
    }

    /// BLE discovery bound
    pub fn ble_discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.ble_discovery_timeout_ms)
    }

    /// USB permission prompt bound
    pub fn usb_permission_timeout(&self) -> Duration {
        Duration::from_millis(self.usb_permission_timeout_ms)
    }

    /// Unsubscribe and close bound
    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_millis(self.teardown_timeout_ms)
    }

    /// USB stream poll interval, at least 1 ms
    pub fn usb_poll_interval(&self) -> Duration {
        Duration::from_millis(self.usb_poll_interval_ms.max(1))
    }
}
