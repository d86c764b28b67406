//! # dabtx — real-time SDR output for a DAB modulator
//!
//! This crate implements the output subsystem of a DAB (Digital Audio
//! Broadcasting) modulator: everything between the modulated symbol stream
//! and the antenna connector of a software-defined radio. It normalises the
//! stream, predistorts it against the power amplifier's non-linearity,
//! paces it through a bounded queue, and transmits every frame at the
//! absolute instant its SFN timestamp demands — aligned to a
//! GPS-disciplined 1-PPS edge when the network requires it.
//!
//! ## Pipeline
//!
//! ```text
//! modulator ──▶ GainControl ──▶ Predistorter ──▶ FrameQueue ──▶ Transmitter ──▶ SDR
//!                                   ▲                               │
//!                               coeffile                      FeedbackServer
//!                               (remote)                     (TX/RX capture)
//! ```
//!
//! The [`transmitter::Transmitter`] owns the SDR handle, programs reference
//! clock and PPS sources, waits for the GPS fix, and runs the transmit and
//! async-event threads. The [`feedback::FeedbackServer`] captures receive
//! samples time-aligned with a chosen transmit burst and serves them to an
//! external DPD estimator, which feeds new coefficients back into the
//! [`predistorter::Predistorter`] through the remote-control surface.
//!
//! The SDR itself sits behind the [`device::SdrDevice`] capability trait;
//! [`sim::SimDevice`] is the software implementation the test suite runs
//! against.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dabtx::config::OutputConfig;
//! use dabtx::sim::SimDevice;
//! use dabtx::transmitter::Transmitter;
//!
//! let config = OutputConfig {
//!     sample_rate: 2_048_000,
//!     frequency: 222_064_000.0,
//!     ..OutputConfig::default()
//! };
//! let device = Arc::new(SimDevice::new(32_768_000.0));
//! let transmitter = Transmitter::new(config, device)?;
//! # Ok::<(), dabtx::device::SdrError>(())
//! ```

pub mod config;
pub mod device;
pub mod feedback;
pub mod frame_queue;
pub mod gain_control;
pub mod gps;
pub mod predistorter;
pub mod remote;
pub mod rt;
pub mod sim;
pub mod timestamp;
pub mod transmitter;
pub mod types;

pub use config::{ClockLossBehaviour, OutputConfig, PpsSource, PredistorterConfig, RefClockSource};
pub use device::{AsyncEvent, DeviceTime, SdrDevice, SdrError, SdrResult};
pub use feedback::FeedbackServer;
pub use frame_queue::FrameQueue;
pub use gain_control::{GainControl, GainMode};
pub use predistorter::{DpdSettings, Predistorter};
pub use remote::{ParameterError, RemoteControllable};
pub use timestamp::FrameTimestamp;
pub use transmitter::{TransmitOutcome, Transmitter, TxCounters};
pub use types::{DabMode, FrameEnvelope, IQSample};
