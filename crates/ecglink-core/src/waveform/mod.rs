//! Waveform decoding
//!
//! The streaming channel carries fixed 31-byte frames. Each frame holds one
//! 12-lead sample, the electrode contact flags and the pacer flag.

mod decoder;
mod sequence;
mod stream;

use serde::{Deserialize, Serialize};
use std::fmt;

pub use decoder::{decode, decode_frame, DecodeError, Frames, FRAME_LEN};
pub use sequence::{SequenceTracker, PACKAGE_MODULUS};
pub use stream::{spawn_decoder, DecoderStats, PointStream, WaveformDecoder};

/// One of the 12 standard ECG leads
#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LeadName {
    I,
    II,
    III,
    AVR,
    AVL,
    AVF,
    V1,
    V2,
    V3,
    V4,
    V5,
    V6,
}

impl LeadName {
    /// Leads in the order they appear in an [`EcgPoint`]
    pub const ALL: [LeadName; 12] = [
        LeadName::I,
        LeadName::II,
        LeadName::III,
        LeadName::AVR,
        LeadName::AVL,
        LeadName::AVF,
        LeadName::V1,
        LeadName::V2,
        LeadName::V3,
        LeadName::V4,
        LeadName::V5,
        LeadName::V6,
    ];

    /// Clinical label, e.g. `aVR`
    pub fn label(&self) -> &'static str {
        match self {
            LeadName::I => "I",
            LeadName::II => "II",
            LeadName::III => "III",
            LeadName::AVR => "aVR",
            LeadName::AVL => "aVL",
            LeadName::AVF => "aVF",
            LeadName::V1 => "V1",
            LeadName::V2 => "V2",
            LeadName::V3 => "V3",
            LeadName::V4 => "V4",
            LeadName::V5 => "V5",
            LeadName::V6 => "V6",
        }
    }
}

impl fmt::Display for LeadName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A physical skin contact
#[allow(clippy::upper_case_acronyms)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElectrodeName {
    V3,
    V4,
    V5,
    V6,
    RA,
    LA,
    LL,
    V1,
    V2,
    RL,
}

impl ElectrodeName {
    /// Electrodes in the order they appear in an [`EcgPoint`]
    pub const ALL: [ElectrodeName; 10] = [
        ElectrodeName::V3,
        ElectrodeName::V4,
        ElectrodeName::V5,
        ElectrodeName::V6,
        ElectrodeName::RA,
        ElectrodeName::LA,
        ElectrodeName::LL,
        ElectrodeName::V1,
        ElectrodeName::V2,
        ElectrodeName::RL,
    ];
}

impl fmt::Display for ElectrodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A lead sample (24-bit signed, sign-extended)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lead {
    /// Lead
    pub name: LeadName,
    /// Sample value in ADC counts
    pub value: i32,
}

/// Electrode contact state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Electrode {
    /// Electrode
    pub name: ElectrodeName,
    /// Poor or no skin contact detected
    pub off: bool,
}

/// One decoded waveform frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EcgPoint {
    /// Frame counter, increments modulo 64
    pub package_no: u8,
    /// I, II, III, aVR, aVL, aVF, V1..V6
    pub leads: Vec<Lead>,
    /// V3, V4, V5, V6, RA, LA, LL, V1, V2, RL
    pub electrodes: Vec<Electrode>,
    /// Pacemaker spike detected
    pub pace: bool,
}

impl EcgPoint {
    /// Sample of the given lead
    pub fn lead(&self, name: LeadName) -> Option<i32> {
        self.leads.iter().find(|l| l.name == name).map(|l| l.value)
    }

    /// Whether the given electrode is reported off
    pub fn electrode_off(&self, name: ElectrodeName) -> Option<bool> {
        self.electrodes
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.off)
    }

    /// True when any electrode has lost contact
    pub fn any_electrode_off(&self) -> bool {
        self.electrodes.iter().any(|e| e.off)
    }
}
