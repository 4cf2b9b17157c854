//! Command/response protocol
//!
//! Implements the framed binary protocol spoken on the command channel of the
//! monitor, over BLE and USB alike.
//!
//! Frame format:
//! - 1 byte: head (`0xA5`)
//! - 1 byte: command
//! - 1 byte: payload length
//! - N bytes: payload
//! - 1 byte: XOR of command, length and payload
//! - 1 byte: tail (`0x5A`)

pub mod commands;
mod error;
mod frame;
pub mod responses;

pub use commands::{ChecksumPolicy, Command, EcgCommands};
pub use error::ProtocolError;
pub use frame::{checksum, hex, Frame, FrameBuilder};
pub use responses::{pack_write_sn, parse_sn, parse_sn_with, parse_version, parse_version_with};

/// First byte of every command and response frame
pub const FRAME_HEAD: u8 = 0xA5;

/// Last byte of every command and response frame
pub const FRAME_TAIL: u8 = 0x5A;

/// Head, command, length, checksum and tail
pub const FRAME_OVERHEAD: usize = 5;

/// The length field is a single byte
pub const MAX_PAYLOAD_LEN: usize = u8::MAX as usize;

/// Key applied to every serial number byte on the wire
pub const SN_XOR_KEY: u8 = 0x11;

/// Bytes preceding the obfuscated serial number inside a read-SN payload
pub const SN_SUB_HEADER_LEN: usize = 4;
