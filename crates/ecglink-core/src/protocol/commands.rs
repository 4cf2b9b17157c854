//! Protocol commands
//!
//! Defines the commands understood by the monitor and the per-transport
//! command bundles.

use serde::{Deserialize, Serialize};

use super::{responses, Frame, ProtocolError};
use crate::device::Transmission;

/// Protocol commands for monitor communication
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Write the serial number (payload = UTF-8 SN)
    WriteSn,

    /// Start waveform streaming over USB
    StartCollectUsb,

    /// Stop waveform streaming
    StopCollect,

    /// Read the firmware version
    ReadVersion,

    /// Read the serial number
    ReadSn,

    /// Start waveform streaming over BLE
    StartCollectBle,
}

impl Command {
    /// Get the command byte
    pub fn byte(&self) -> u8 {
        match self {
            Command::WriteSn => 0x02,
            Command::StartCollectUsb => 0x03,
            Command::StopCollect => 0x04,
            Command::ReadVersion => 0x05,
            Command::ReadSn => 0x06,
            Command::StartCollectBle => 0x09,
        }
    }

    /// Look up a command by its byte
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x02 => Some(Command::WriteSn),
            0x03 => Some(Command::StartCollectUsb),
            0x04 => Some(Command::StopCollect),
            0x05 => Some(Command::ReadVersion),
            0x06 => Some(Command::ReadSn),
            0x09 => Some(Command::StartCollectBle),
            _ => None,
        }
    }

    /// Encoded frame for this command without payload
    pub fn frame(&self) -> Vec<u8> {
        Frame::empty(self.byte()).to_bytes()
    }
}

/// Whether response checksums and tails are verified
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecksumPolicy {
    /// Reject responses whose checksum or tail byte is wrong
    #[default]
    Enforce,
    /// Accept any response with a valid header and enough payload bytes
    Lenient,
}

/// Command set of one transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EcgCommands {
    /// Read-SN request frame
    pub read_sn: Vec<u8>,
    /// Read-version request frame
    pub read_version: Vec<u8>,
    /// Start-collect request frame
    pub start_collect: Vec<u8>,
    /// Stop-collect request frame
    pub stop_collect: Vec<u8>,
    /// Response verification policy
    pub checksum: ChecksumPolicy,
}

impl EcgCommands {
    /// Commands spoken over BLE
    pub fn ble() -> Self {
        Self::with_start(Command::StartCollectBle)
    }

    /// Commands spoken over USB CDC
    pub fn usb() -> Self {
        Self::with_start(Command::StartCollectUsb)
    }

    /// Commands for the given transport
    pub fn for_transmission(transmission: Transmission) -> Self {
        match transmission {
            Transmission::Ble => Self::ble(),
            Transmission::Usb => Self::usb(),
        }
    }

    fn with_start(start: Command) -> Self {
        Self {
            read_sn: Command::ReadSn.frame(),
            read_version: Command::ReadVersion.frame(),
            start_collect: start.frame(),
            stop_collect: Command::StopCollect.frame(),
            checksum: ChecksumPolicy::default(),
        }
    }

    /// Replace the response verification policy
    pub fn with_checksum(mut self, policy: ChecksumPolicy) -> Self {
        self.checksum = policy;
        self
    }

    /// Decode a read-version response
    pub fn parse_version(&self, bytes: &[u8]) -> Result<String, ProtocolError> {
        responses::parse_version_with(bytes, self.checksum)
    }

    /// Decode a read-SN response
    pub fn parse_sn(&self, bytes: &[u8]) -> Result<String, ProtocolError> {
        responses::parse_sn_with(bytes, self.checksum)
    }

    /// Encode a write-SN request
    pub fn pack_sn(&self, sn: &str) -> Result<Vec<u8>, ProtocolError> {
        responses::pack_write_sn(sn)
    }
}
