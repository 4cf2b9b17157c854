//! Package number continuity

/// Package numbers wrap at this value
pub const PACKAGE_MODULUS: u8 = 64;

/// Counts dropped frames by watching the mod-64 package counter
#[derive(Debug, Clone, Default)]
pub struct SequenceTracker {
    last: Option<u8>,
    gaps: u64,
    frames: u64,
}

impl SequenceTracker {
    /// Create a tracker with no history
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the next package number. Returns `true` if it does not follow
    /// the previous one.
    pub fn observe(&mut self, package_no: u8) -> bool {
        self.frames += 1;
        let current = package_no % PACKAGE_MODULUS;
        let gap = match self.last {
            Some(prev) => (prev + 1) % PACKAGE_MODULUS != current,
            None => false,
        };
        if gap {
            self.gaps += 1;
        }
        self.last = Some(current);
        gap
    }

    /// Number of discontinuities seen so far
    pub fn gaps(&self) -> u64 {
        self.gaps
    }

    /// Number of package numbers observed
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Forget the previous package number, e.g. after a restart of the stream
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gaps_for(seq: &[u8]) -> u64 {
        let mut tracker = SequenceTracker::new();
        for p in seq {
            tracker.observe(*p);
        }
        tracker.gaps()
    }

    #[test]
    fn test_continuous_sequence_with_wrap() {
        let seq: Vec<u8> = (0..200u32).map(|n| (n % 64) as u8).collect();
        assert_eq!(gaps_for(&seq), 0);
    }

    #[test]
    fn test_each_discontinuity_counts_once() {
        assert_eq!(gaps_for(&[0, 1, 3, 4, 4, 5, 63, 0]), 3);
    }

    #[test]
    fn test_gap_count_matches_definition() {
        let seq = [5u8, 6, 10, 11, 62, 63, 0, 2, 1, 2, 3, 63];
        let expected = seq
            .windows(2)
            .filter(|w| (w[0] + 1) % 64 != w[1] % 64)
            .count() as u64;
        assert_eq!(gaps_for(&seq), expected);
    }

    #[test]
    fn test_high_bit_package_numbers_wrap() {
        // a restored high bit still compares modulo 64
        assert_eq!(gaps_for(&[63, 0x80, 0x81]), 0);
    }

    #[test]
    fn test_reset() {
        let mut tracker = SequenceTracker::new();
        tracker.observe(1);
        tracker.observe(9);
        assert_eq!(tracker.gaps(), 1);
        tracker.reset();
        assert!(!tracker.observe(30));
        assert_eq!(tracker.gaps(), 0);
        assert_eq!(tracker.frames(), 1);
    }
}
