//! 31-byte frame decoder
//!
//! Frame layout:
//! - bytes 0..4: continuation bits (byte 0 bits 5..0, bytes 1..3 bits 6..0)
//! - bytes 4..7: lead-state bytes
//! - bytes 7..31: 8 big-endian 24-bit channel samples
//!
//! Data bytes travel with their high bit cleared. A set continuation bit
//! restores it, so `0x80..=0xFF` never appears on the wire.

use byteorder::{BigEndian, ByteOrder};
use std::slice::ChunksExact;
use thiserror::Error;

use super::{EcgPoint, Electrode, ElectrodeName, Lead, LeadName};

/// Size of one waveform frame
pub const FRAME_LEN: usize = 31;

const BITS_LEN: usize = 4;
const LEAD_STATE_LEN: usize = 3;
const DATA_LEN: usize = 24;
const CONTINUATION_BITS: usize = LEAD_STATE_LEN + DATA_LEN;

/// Electrodes whose off flag is sensed, in bit order
const SENSED_ELECTRODES: [ElectrodeName; 9] = [
    ElectrodeName::V3,
    ElectrodeName::V4,
    ElectrodeName::V5,
    ElectrodeName::V6,
    ElectrodeName::RA,
    ElectrodeName::LA,
    ElectrodeName::LL,
    ElectrodeName::V1,
    ElectrodeName::V2,
];

/// Errors for a single waveform frame
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Invalid frame header {0:#04x}")]
    InvalidHeader(u8),

    #[error("{0} trailing bytes do not form a complete frame")]
    TrailingBytes(usize),
}

/// Decode one frame
pub fn decode_frame(frame: &[u8; FRAME_LEN]) -> Result<EcgPoint, DecodeError> {
    if frame[0] & 0x80 != 0 {
        return Err(DecodeError::InvalidHeader(frame[0]));
    }

    let bits = continuation_bits(frame);
    let restore = |offset: usize, idx: usize| -> u8 {
        let b = frame[offset + idx];
        if bits[idx + offset - BITS_LEN] {
            b | 0x80
        } else {
            b
        }
    };

    let mut lead_state = [0u8; LEAD_STATE_LEN];
    for (i, b) in lead_state.iter_mut().enumerate() {
        *b = restore(BITS_LEN, i);
    }
    let mut data = [0u8; DATA_LEN];
    for (i, b) in data.iter_mut().enumerate() {
        *b = restore(BITS_LEN + LEAD_STATE_LEN, i);
    }

    let mut raw = [0i32; 8];
    for (i, value) in raw.iter_mut().enumerate() {
        *value = BigEndian::read_i24(&data[i * 3..i * 3 + 3]);
    }

    Ok(EcgPoint {
        package_no: lead_state[0],
        leads: derive_leads(&raw),
        electrodes: electrodes(&lead_state),
        pace: lead_state[2] & 0x01 == 1,
    })
}

/// Decode a buffer of concatenated frames.
///
/// Yields one result per complete frame, in order, then a
/// [`DecodeError::TrailingBytes`] if the length is not a multiple of 31.
pub fn decode(bytes: &[u8]) -> Frames<'_> {
    Frames {
        chunks: bytes.chunks_exact(FRAME_LEN),
        remainder_reported: false,
    }
}

/// Iterator returned by [`decode`]
pub struct Frames<'a> {
    chunks: ChunksExact<'a, u8>,
    remainder_reported: bool,
}

impl Iterator for Frames<'_> {
    type Item = Result<EcgPoint, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(chunk) = self.chunks.next() {
            let mut frame = [0u8; FRAME_LEN];
            frame.copy_from_slice(chunk);
            return Some(decode_frame(&frame));
        }
        if self.remainder_reported {
            return None;
        }
        self.remainder_reported = true;
        match self.chunks.remainder().len() {
            0 => None,
            n => Some(Err(DecodeError::TrailingBytes(n))),
        }
    }
}

fn continuation_bits(frame: &[u8; FRAME_LEN]) -> [bool; CONTINUATION_BITS] {
    let mut bits = [false; CONTINUATION_BITS];
    let mut cnt = 0;
    for (j, byte) in frame[..BITS_LEN].iter().enumerate() {
        let top = if j == 0 { 5 } else { 6 };
        for shift in (0..=top).rev() {
            bits[cnt] = (byte >> shift) & 1 == 1;
            cnt += 1;
        }
    }
    bits
}

fn electrodes(lead_state: &[u8; LEAD_STATE_LEN]) -> Vec<Electrode> {
    // byte 1 bits 0..4, then byte 2 bits 4..7
    let mut flags = Vec::with_capacity(SENSED_ELECTRODES.len());
    flags.extend((0..5).map(|bit| (lead_state[1] >> bit) & 1 == 1));
    flags.extend((4..8).map(|bit| (lead_state[2] >> bit) & 1 == 1));

    let mut electrodes: Vec<Electrode> = SENSED_ELECTRODES
        .iter()
        .zip(flags)
        .map(|(name, off)| Electrode { name: *name, off })
        .collect();
    // RL is the driven reference; its contact is not sensed
    electrodes.push(Electrode {
        name: ElectrodeName::RL,
        off: false,
    });
    electrodes
}

fn derive_leads(raw: &[i32; 8]) -> Vec<Lead> {
    let (i, ii) = (raw[0], raw[1]);
    let values = [
        i,
        ii,
        ii - i,
        -((i + ii) >> 1),
        i - (ii >> 1),
        ii - (i >> 1),
        raw[2],
        raw[3],
        raw[4],
        raw[5],
        raw[6],
        raw[7],
    ];
    LeadName::ALL
        .iter()
        .zip(values)
        .map(|(name, value)| Lead { name: *name, value })
        .collect()
}
