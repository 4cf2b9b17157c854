//! Decoding of live byte streams

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{decode, DecodeError, EcgPoint, SequenceTracker};
use crate::error::DeviceError;
use crate::transport::ByteStream;

/// Stream of decoded waveform points
pub type PointStream = mpsc::Receiver<Result<EcgPoint, DeviceError>>;

/// Counters shared between a decoding task and its consumer
#[derive(Debug, Default)]
pub struct DecoderStats {
    frames: AtomicU64,
    gaps: AtomicU64,
    errors: AtomicU64,
}

impl DecoderStats {
    /// Frames decoded successfully
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    /// Package number discontinuities
    pub fn gaps(&self) -> u64 {
        self.gaps.load(Ordering::Relaxed)
    }

    /// Frames that failed to decode
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}

/// Decodes chunks as they arrive and tracks frame continuity
#[derive(Debug, Default)]
pub struct WaveformDecoder {
    tracker: SequenceTracker,
    stats: Arc<DecoderStats>,
}

impl WaveformDecoder {
    /// Create a decoder with fresh counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode one received chunk, in frame order
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<EcgPoint, DecodeError>> {
        let results: Vec<_> = decode(chunk).collect();
        for result in &results {
            match result {
                Ok(point) => {
                    self.stats.frames.fetch_add(1, Ordering::Relaxed);
                    if self.tracker.observe(point.package_no) {
                        self.stats.gaps.fetch_add(1, Ordering::Relaxed);
                        debug!("waveform: package number gap before {}", point.package_no);
                    }
                }
                Err(e) => {
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    debug!("waveform: {}", e);
                }
            }
        }
        results
    }

    /// Counters of this decoder
    pub fn stats(&self) -> Arc<DecoderStats> {
        self.stats.clone()
    }
}

/// Decode a listen stream on a background task.
///
/// Transport errors are forwarded unchanged; decode errors become
/// [`DeviceError::Decode`] items and do not end the stream.
pub fn spawn_decoder(mut bytes: ByteStream, capacity: usize) -> (PointStream, Arc<DecoderStats>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let mut decoder = WaveformDecoder::new();
    let stats = decoder.stats();

    tokio::spawn(async move {
        while let Some(item) = bytes.recv().await {
            let chunk = match item {
                Ok(chunk) => chunk,
                Err(e) => {
                    if tx.send(Err(e)).await.is_err() {
                        return;
                    }
                    continue;
                }
            };
            for result in decoder.push(&chunk) {
                if tx.send(result.map_err(DeviceError::from)).await.is_err() {
                    return;
                }
            }
        }
        let stats = decoder.stats();
        if stats.gaps() > 0 {
            warn!(
                "waveform stream ended: {} frames, {} gaps, {} errors",
                stats.frames(),
                stats.gaps(),
                stats.errors()
            );
        }
    });

    (rx, stats)
}
