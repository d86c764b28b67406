//! Core sample and framing types shared across the output pipeline.

use num_complex::Complex;
use serde::Deserialize;
use std::time::Duration;

use crate::timestamp::FrameTimestamp;

/// A single complex baseband sample: 32-bit float I and Q.
pub type IQSample = Complex<f32>;

/// DAB transmission mode (ETSI EN 300 401, table 2).
///
/// The mode fixes the transmission frame duration and therefore the number
/// of samples per frame at a given sample rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum DabMode {
    Mode1,
    Mode2,
    Mode3,
    Mode4,
}

impl DabMode {
    /// Transmission frame duration in milliseconds.
    pub fn frame_duration_ms(self) -> u64 {
        match self {
            DabMode::Mode1 => 96,
            DabMode::Mode2 => 24,
            DabMode::Mode3 => 24,
            DabMode::Mode4 => 48,
        }
    }

    /// Transmission frame duration.
    pub fn frame_duration(self) -> Duration {
        Duration::from_millis(self.frame_duration_ms())
    }

    /// Number of complex samples in one transmission frame at `sample_rate`.
    pub fn frame_samples(self, sample_rate: u32) -> usize {
        self.frame_duration_ms() as usize * sample_rate as usize / 1000
    }
}

/// One transmission frame travelling through the output pipeline.
///
/// Frames are produced by the modulation chain, normalised by the gain
/// stage, predistorted, and handed to the transmitter through the frame
/// queue. The sample buffer length is fixed for the lifetime of a run.
#[derive(Debug, Clone)]
pub struct FrameEnvelope {
    pub samples: Vec<IQSample>,
    pub ts: FrameTimestamp,
}

impl FrameEnvelope {
    pub fn new(samples: Vec<IQSample>, ts: FrameTimestamp) -> Self {
        Self { samples, ts }
    }
}
