//! Demo Mode - Simulated ECG waveform generator for testing
//!
//! Produces valid 31-byte waveform frames for host-side testing without a
//! monitor attached. [`encode_frame`] is the exact inverse of
//! [`decode_frame`](crate::waveform::decode_frame); [`DemoSimulator`] drives it
//! with a synthetic sinus rhythm.

use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::transport::ByteStream;
use crate::waveform::{ElectrodeName, FRAME_LEN, PACKAGE_MODULUS};

/// Largest value a 24-bit sample can carry
pub const SAMPLE_MAX: i32 = 0x7F_FFFF;

/// Smallest value a 24-bit sample can carry
pub const SAMPLE_MIN: i32 = -0x80_0000;

/// Samples per second produced by the simulator
pub const DEFAULT_SAMPLE_RATE: u32 = 500;

/// Content of one waveform frame
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameSpec {
    /// Sequence counter, stored as-is in lead-state byte 0
    pub package_no: u8,
    /// Raw channels: I, II, V1..V6. Clamped to the 24-bit range.
    pub raw: [i32; 8],
    /// Electrodes to flag as off. RL is never sensed and is ignored.
    pub electrodes_off: Vec<ElectrodeName>,
    /// Pacer spike detected
    pub pace: bool,
}

/// Position of an electrode's off flag: (lead-state byte, bit)
fn electrode_bit(name: ElectrodeName) -> Option<(usize, u8)> {
    match name {
        ElectrodeName::V3 => Some((1, 0)),
        ElectrodeName::V4 => Some((1, 1)),
        ElectrodeName::V5 => Some((1, 2)),
        ElectrodeName::V6 => Some((1, 3)),
        ElectrodeName::RA => Some((1, 4)),
        ElectrodeName::LA => Some((2, 4)),
        ElectrodeName::LL => Some((2, 5)),
        ElectrodeName::V1 => Some((2, 6)),
        ElectrodeName::V2 => Some((2, 7)),
        ElectrodeName::RL => None,
    }
}

/// Encode one waveform frame
pub fn encode_frame(spec: &FrameSpec) -> [u8; FRAME_LEN] {
    let mut lead_state = [spec.package_no, 0u8, 0u8];
    for name in &spec.electrodes_off {
        if let Some((byte, bit)) = electrode_bit(*name) {
            lead_state[byte] |= 1 << bit;
        }
    }
    if spec.pace {
        lead_state[2] |= 0x01;
    }

    let mut body = [0u8; 27];
    body[..3].copy_from_slice(&lead_state);
    for (i, value) in spec.raw.iter().enumerate() {
        let v = (*value).clamp(SAMPLE_MIN, SAMPLE_MAX) as u32;
        body[3 + i * 3] = (v >> 16) as u8;
        body[4 + i * 3] = (v >> 8) as u8;
        body[5 + i * 3] = v as u8;
    }

    // strip each high bit into the continuation vector
    let mut frame = [0u8; FRAME_LEN];
    for (k, b) in body.iter().enumerate() {
        if b & 0x80 != 0 {
            let (byte, shift) = if k < 6 {
                (0, 5 - k)
            } else {
                (1 + (k - 6) / 7, 6 - (k - 6) % 7)
            };
            frame[byte] |= 1 << shift;
        }
        frame[4 + k] = b & 0x7F;
    }
    frame
}

/// Synthetic 12-lead ECG source
pub struct DemoSimulator {
    /// Samples per second
    sample_rate: u32,
    /// Beats per minute
    heart_rate: f64,
    /// Peak R-wave amplitude in ADC counts
    amplitude: f64,
    /// Noise amplitude in ADC counts
    noise: i32,
    /// Samples generated so far
    sample: u64,
    package_no: u8,
    rng: StdRng,
}

impl Default for DemoSimulator {
    fn default() -> Self {
        Self::new()
    }
}

impl DemoSimulator {
    /// Create a simulator at 72 bpm with random noise
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Create a reproducible simulator
    pub fn seeded(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            heart_rate: 72.0,
            amplitude: 1200.0,
            noise: 8,
            sample: 0,
            package_no: 0,
            rng,
        }
    }

    /// Set the heart rate in beats per minute
    pub fn heart_rate(mut self, bpm: f64) -> Self {
        self.heart_rate = bpm.clamp(20.0, 300.0);
        self
    }

    /// Set the noise amplitude (0 disables noise)
    pub fn noise(mut self, counts: i32) -> Self {
        self.noise = counts.max(0);
        self
    }

    /// Samples per second
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Package number the next frame will carry
    pub fn package_no(&self) -> u8 {
        self.package_no
    }

    /// Lead II shape over one beat, phase in `[0, 1)`
    fn beat(phase: f64) -> f64 {
        let wave = |center: f64, width: f64, height: f64| {
            height * (-((phase - center) / width).powi(2)).exp()
        };
        // P, Q, R, S, T
        wave(0.2, 0.04, 0.12)
            + wave(0.38, 0.01, -0.1)
            + wave(0.4, 0.012, 1.0)
            + wave(0.42, 0.01, -0.2)
            + wave(0.65, 0.06, 0.3)
    }

    fn jitter(&mut self) -> i32 {
        if self.noise == 0 {
            0
        } else {
            self.rng.gen_range(-self.noise..=self.noise)
        }
    }

    /// Generate the next frame's content
    pub fn next_spec(&mut self) -> FrameSpec {
        let t = self.sample as f64 / self.sample_rate as f64;
        let phase = (t * self.heart_rate / 60.0).fract();
        let ii = Self::beat(phase) * self.amplitude;
        let i = ii * 0.6;

        // chest leads: same beat, scaled and slightly shifted per electrode
        let chest = [-0.4, 0.2, 0.8, 1.1, 0.9, 0.7];
        let mut raw = [0i32; 8];
        raw[0] = i as i32 + self.jitter();
        raw[1] = ii as i32 + self.jitter();
        for (n, gain) in chest.iter().enumerate() {
            let shifted = (phase + n as f64 * 0.002).fract();
            raw[2 + n] = (Self::beat(shifted) * self.amplitude * gain) as i32 + self.jitter();
        }

        let spec = FrameSpec {
            package_no: self.package_no,
            raw,
            electrodes_off: Vec::new(),
            pace: false,
        };
        self.sample += 1;
        self.package_no = (self.package_no + 1) % PACKAGE_MODULUS;
        spec
    }

    /// Generate and encode the next frame
    pub fn next_frame(&mut self) -> [u8; FRAME_LEN] {
        encode_frame(&self.next_spec())
    }

    /// Generate `count` consecutive frames as one buffer
    pub fn frames(&mut self, count: usize) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(count * FRAME_LEN);
        for _ in 0..count {
            bytes.extend_from_slice(&self.next_frame());
        }
        bytes
    }

    /// Stream frames in real time, `frames_per_chunk` frames per item.
    ///
    /// The stream ends when the receiver is dropped.
    pub fn spawn_stream(mut self, frames_per_chunk: usize, capacity: usize) -> ByteStream {
        let frames_per_chunk = frames_per_chunk.max(1);
        let period = Duration::from_secs_f64(frames_per_chunk as f64 / self.sample_rate as f64);
        let (tx, rx) = mpsc::channel(capacity.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                if tx.send(Ok(self.frames(frames_per_chunk))).await.is_err() {
                    break;
                }
            }
        });
        rx
    }
}
