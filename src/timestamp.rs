//! Frame timestamps in the DAB single-frequency-network time domain.
//!
//! Every transmission frame carries an absolute timestamp made of a full
//! second and a fraction-of-second counter in units of 1/16 384 000 s, the
//! resolution of the ETI TIST field. Transmitters in an SFN use these stamps
//! to emit the same frame at the same instant, so the arithmetic here has to
//! be exact: advancing a stamp by N samples at the modulator sample rate
//! must land on the tick the next frame's stamp will carry.

use std::fmt;

/// Fraction-of-second resolution of DAB timestamps, in ticks per second.
pub const PPS_RATE: u64 = 16_384_000;

/// Absolute timestamp of one transmission frame.
///
/// `pps_ticks` is always in `[0, PPS_RATE)`. The `refresh` flag is set on
/// the first frame of a run and after any timestamp discontinuity, telling
/// the transmitter to re-arm device timing on the next burst. `fct` is the
/// ETI frame count; −1 marks a frame that must be dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameTimestamp {
    pub seconds: u32,
    pub pps_ticks: u32,
    pub valid: bool,
    pub refresh: bool,
    pub fct: i32,
}

impl FrameTimestamp {
    /// Create a valid timestamp at the given second and tick offset.
    pub fn new(seconds: u32, pps_ticks: u32) -> Self {
        Self {
            seconds: seconds.wrapping_add((pps_ticks as u64 / PPS_RATE) as u32),
            pps_ticks: (pps_ticks as u64 % PPS_RATE) as u32,
            valid: true,
            refresh: false,
            fct: 0,
        }
    }

    /// A timestamp that carries no usable time information.
    pub fn invalid() -> Self {
        Self {
            seconds: 0,
            pps_ticks: 0,
            valid: false,
            refresh: false,
            fct: 0,
        }
    }

    /// Set the frame count tag.
    pub fn with_fct(mut self, fct: i32) -> Self {
        self.fct = fct;
        self
    }

    /// Mark this stamp as the start of a (re-)armed burst sequence.
    pub fn with_refresh(mut self, refresh: bool) -> Self {
        self.refresh = refresh;
        self
    }

    /// Advance the stamp in place by a number of samples at the given rate.
    ///
    /// The tick increment is `samples · 16 384 000 / sample_rate`, carried
    /// into the seconds field. All DAB output rates divide the tick rate
    /// evenly, so the increment is exact.
    pub fn add_samples(&mut self, samples: u64, sample_rate: u32) {
        let ticks = samples * PPS_RATE / sample_rate as u64;
        let total = self.pps_ticks as u64 + ticks;
        self.seconds = self.seconds.wrapping_add((total / PPS_RATE) as u32);
        self.pps_ticks = (total % PPS_RATE) as u32;
    }

    /// Return a copy of the stamp advanced by `samples` at `sample_rate`.
    pub fn advanced_by(mut self, samples: u64, sample_rate: u32) -> Self {
        self.add_samples(samples, sample_rate);
        self
    }

    /// The stamp as a real-valued second count, for device time comparisons.
    pub fn to_real_secs(&self) -> f64 {
        self.seconds as f64 + self.pps_ticks as f64 / PPS_RATE as f64
    }
}

impl fmt::Display for FrameTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.valid {
            write!(f, "{}+{:.6}({})", self.seconds, self.pps_ticks as f64 / PPS_RATE as f64, self.pps_ticks)
        } else {
            write!(f, "invalid")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RATE: u32 = 2_048_000;

    #[test]
    fn test_new_normalises_ticks() {
        let ts = FrameTimestamp::new(10, PPS_RATE as u32 + 5);
        assert_eq!(ts.seconds, 11);
        assert_eq!(ts.pps_ticks, 5);
    }

    #[test]
    fn test_add_samples_exact_increment() {
        // One mode 2 frame at 2.048 MS/s is 49 152 samples = 393 216 ticks.
        let mut ts = FrameTimestamp::new(100, 0);
        ts.add_samples(49_152, RATE);
        assert_eq!(ts.seconds, 100);
        assert_eq!(ts.pps_ticks, 393_216);
    }

    #[test]
    fn test_add_samples_carries_into_seconds() {
        let mut ts = FrameTimestamp::new(7, PPS_RATE as u32 - 8);
        ts.add_samples(2, RATE); // 16 ticks
        assert_eq!(ts.seconds, 8);
        assert_eq!(ts.pps_ticks, 8);
    }

    #[test]
    fn test_add_samples_associative() {
        for &(n, m) in &[(0u64, 0u64), (1, 1), (49_152, 49_152), (123_456, 654_321), (2_048_000, 7)] {
            let two_steps = FrameTimestamp::new(55, 1_000_000)
                .advanced_by(n, RATE)
                .advanced_by(m, RATE);
            let one_step = FrameTimestamp::new(55, 1_000_000).advanced_by(n + m, RATE);
            assert_eq!(two_steps, one_step, "n={} m={}", n, m);
        }
    }

    #[test]
    fn test_ticks_stay_in_range() {
        let mut ts = FrameTimestamp::new(0, 0);
        for _ in 0..1000 {
            ts.add_samples(49_152, RATE);
            assert!((ts.pps_ticks as u64) < PPS_RATE);
        }
        // 1000 frames of 24 ms = 24 s
        assert_eq!(ts.seconds, 24);
    }

    #[test]
    fn test_to_real_secs() {
        let ts = FrameTimestamp::new(2, (PPS_RATE / 2) as u32);
        assert!((ts.to_real_secs() - 2.5).abs() < 1e-12);
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", FrameTimestamp::invalid()), "invalid");
        let ts = FrameTimestamp::new(3, 0);
        assert_eq!(format!("{}", ts), "3+0.000000(0)");
    }
}
