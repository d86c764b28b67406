//! Typed configuration for the SDR output subsystem.
//!
//! Parsing a configuration file into these structs is the caller's concern;
//! the structs themselves are the interface between the wider modulator and
//! this subsystem.

use serde::Deserialize;
use std::path::PathBuf;

use crate::types::DabMode;

/// Reference clock input of the SDR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefClockSource {
    Internal,
    External,
    Mimo,
    Gpsdo,
    /// Ettus-style GPSDO. Selects the `gpsdo` clock source on the device but
    /// uses the `gps_locked` sensor instead of `gps_timelock`.
    #[serde(rename = "gpsdo-ettus")]
    GpsdoEttus,
}

impl RefClockSource {
    /// The clock source name passed to the driver.
    pub fn driver_name(self) -> &'static str {
        match self {
            RefClockSource::Internal => "internal",
            RefClockSource::External => "external",
            RefClockSource::Mimo => "mimo",
            RefClockSource::Gpsdo | RefClockSource::GpsdoEttus => "gpsdo",
        }
    }

    /// Whether this source is a GPS-disciplined oscillator.
    pub fn is_gpsdo(self) -> bool {
        matches!(self, RefClockSource::Gpsdo | RefClockSource::GpsdoEttus)
    }
}

/// PPS (1 pulse per second) input of the SDR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PpsSource {
    None,
    External,
    Mimo,
    Gpsdo,
}

impl PpsSource {
    /// The time source name passed to the driver.
    pub fn driver_name(self) -> &'static str {
        match self {
            PpsSource::None => "none",
            PpsSource::External => "external",
            PpsSource::Mimo => "mimo",
            PpsSource::Gpsdo => "gpsdo",
        }
    }
}

/// What to do when the external reference clock loses lock at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClockLossBehaviour {
    /// Log the loss and keep transmitting.
    Ignore,
    /// Abort the transmit loop with a fatal error.
    Crash,
}

/// Configuration of the transmitter and its SDR device.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Device selection string, `key=value` pairs separated by commas.
    pub device: String,
    /// TX subdevice specification, empty for the device default.
    pub subdevice: String,
    /// Expected master clock rate in Hz. 0 disables the check.
    pub master_clock_rate: f64,
    /// Modulator output sample rate in Hz.
    pub sample_rate: u32,
    /// Transmit centre frequency in Hz.
    pub frequency: f64,
    /// LO offset in Hz, used to push carrier leakage out of the signal band.
    /// Must stay below half the master clock rate.
    pub lo_offset: f64,
    pub tx_gain: f64,
    /// RX gain for the DPD feedback path.
    pub rx_gain: f64,
    /// RX antenna port for the DPD feedback path.
    pub rx_antenna: String,
    pub refclk_source: RefClockSource,
    pub pps_source: PpsSource,
    pub refclk_loss_behaviour: ClockLossBehaviour,
    /// Maximum tolerated GPS holdover in seconds. 0 disables the GPS gate.
    pub max_gps_holdover_time: u32,
    /// Full interval of the GPS fix supervisor in seconds. The supervisor
    /// alternates between launching a check and collecting its result at
    /// half this interval.
    pub gps_check_interval: u32,
    /// Synchronous (timestamp-driven) transmission.
    pub enable_sync: bool,
    /// Mute instead of transmitting when frames carry no usable timestamp.
    pub mute_no_timestamps: bool,
    pub dab_mode: DabMode,
    /// TCP port of the DPD feedback server. 0 disables the server.
    pub feedback_port: u16,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            device: String::new(),
            subdevice: String::new(),
            master_clock_rate: 0.0,
            sample_rate: 2_048_000,
            frequency: 0.0,
            lo_offset: 0.0,
            tx_gain: 0.0,
            rx_gain: 0.0,
            rx_antenna: "RX2".to_string(),
            refclk_source: RefClockSource::Internal,
            pps_source: PpsSource::None,
            refclk_loss_behaviour: ClockLossBehaviour::Ignore,
            max_gps_holdover_time: 0,
            gps_check_interval: 10,
            enable_sync: false,
            mute_no_timestamps: false,
            dab_mode: DabMode::Mode1,
            feedback_port: 0,
        }
    }
}

/// Configuration of the digital predistorter.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PredistorterConfig {
    /// Worker thread count. 0 selects the hardware concurrency.
    pub num_workers: usize,
    /// Coefficient file loaded at startup. None starts in pass-through.
    pub coef_file: Option<PathBuf>,
}

impl Default for PredistorterConfig {
    fn default() -> Self {
        Self {
            num_workers: 0,
            coef_file: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refclk_driver_names() {
        assert_eq!(RefClockSource::Internal.driver_name(), "internal");
        assert_eq!(RefClockSource::Gpsdo.driver_name(), "gpsdo");
        // The Ettus GPSDO is selected with the plain gpsdo clock source.
        assert_eq!(RefClockSource::GpsdoEttus.driver_name(), "gpsdo");
    }

    #[test]
    fn test_gpsdo_detection() {
        assert!(RefClockSource::Gpsdo.is_gpsdo());
        assert!(RefClockSource::GpsdoEttus.is_gpsdo());
        assert!(!RefClockSource::External.is_gpsdo());
    }

    #[test]
    fn test_default_config() {
        let config = OutputConfig::default();
        assert_eq!(config.sample_rate, 2_048_000);
        assert_eq!(config.pps_source, PpsSource::None);
        assert_eq!(config.gps_check_interval, 10);
        assert_eq!(config.feedback_port, 0);
    }
}
