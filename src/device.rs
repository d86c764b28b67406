//! Capability-set abstraction over the SDR driver.
//!
//! The transmitter does not talk to a vendor API directly; it talks to the
//! [`SdrDevice`] trait, which captures exactly the capabilities the output
//! subsystem needs: clock and time-source selection, tuning, gain, sensors,
//! time-register programming, timed TX bursts, timed one-shot RX captures
//! and the asynchronous event channel.
//!
//! The device handle is shared between threads, but ownership is split by
//! operation rather than by object: only the transmit thread sends, only
//! the feedback RX thread receives, and only the event thread polls the
//! async channel. Streams are therefore separate `Send` objects obtained
//! from the shared handle.

use std::collections::HashMap;
use std::time::Duration;

use crate::timestamp::{FrameTimestamp, PPS_RATE};
use crate::types::IQSample;

/// Result type for device operations.
pub type SdrResult<T> = Result<T, SdrError>;

/// Errors raised by the output subsystem and its device boundary.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SdrError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Hardware error: {0}")]
    HardwareError(String),

    #[error("Sensor unavailable: {0}")]
    SensorUnavailable(String),

    #[error("Timeout waiting for {0}")]
    Timeout(String),

    #[error("Timing error: {0}")]
    FatalTiming(String),

    #[error("Clock lost: {0}")]
    ClockLost(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

/// An absolute device time: full seconds plus a fractional second.
///
/// Mirrors the time-spec representation SDR drivers use for timed commands.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct DeviceTime {
    pub full_secs: u64,
    pub frac_secs: f64,
}

impl DeviceTime {
    /// Create a device time, carrying whole seconds out of the fraction.
    pub fn new(full_secs: u64, frac_secs: f64) -> Self {
        let carry = frac_secs.floor();
        Self {
            full_secs: (full_secs as i64 + carry as i64).max(0) as u64,
            frac_secs: frac_secs - carry,
        }
    }

    /// Device time from a real-valued second count.
    pub fn from_real_secs(secs: f64) -> Self {
        Self::new(0, secs.max(0.0))
    }

    /// The burst time of a frame timestamp.
    pub fn from_timestamp(ts: &FrameTimestamp) -> Self {
        Self {
            full_secs: ts.seconds as u64,
            frac_secs: ts.pps_ticks as f64 / PPS_RATE as f64,
        }
    }

    /// The time as a real-valued second count.
    pub fn real_secs(&self) -> f64 {
        self.full_secs as f64 + self.frac_secs
    }

    /// Return this time advanced by `secs` seconds.
    pub fn add_secs(self, secs: f64) -> Self {
        Self::new(self.full_secs, self.frac_secs + secs)
    }

    /// The fractional second expressed in DAB PPS ticks.
    pub fn pps_ticks(&self) -> u32 {
        ((self.frac_secs * PPS_RATE as f64).round() as u64 % PPS_RATE) as u32
    }
}

/// Metadata attached to a transmitted chunk.
#[derive(Debug, Clone, Copy, Default)]
pub struct TxMetadata {
    pub has_time_spec: bool,
    pub time_spec: DeviceTime,
    pub start_of_burst: bool,
    /// Forces the driver to re-arm burst timing on the next packet.
    pub end_of_burst: bool,
}

/// Asynchronous events reported by the device while streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncEvent {
    /// A burst was accepted; informational only.
    BurstAck,
    /// The device ran out of samples between packets.
    Underflow,
    /// The device ran out of samples inside a packet.
    UnderflowInPacket,
    /// Packet loss between host and device.
    SeqError,
    /// Packet loss within a burst.
    SeqErrorInBurst,
    /// A packet arrived after its scheduled time.
    TimeError,
}

impl AsyncEvent {
    pub fn description(&self) -> &'static str {
        match self {
            AsyncEvent::BurstAck => "burst acknowledged",
            AsyncEvent::Underflow => "underflow",
            AsyncEvent::UnderflowInPacket => "underflow occurred inside a packet",
            AsyncEvent::SeqError => "packet loss between host and device",
            AsyncEvent::SeqErrorInBurst => "packet loss within a burst",
            AsyncEvent::TimeError => "packet had late time",
        }
    }
}

/// A receive capture returned by a timed one-shot stream command.
#[derive(Debug, Clone)]
pub struct RxBurst {
    pub samples: Vec<IQSample>,
    /// The time the capture actually started, which may differ from the
    /// requested time.
    pub time: DeviceTime,
}

/// Transmit stream of the device. Owned by the transmit thread.
pub trait TxStream: Send {
    /// Largest number of samples the driver accepts per send call.
    fn max_num_samps(&self) -> usize;

    /// Send one chunk, returning the number of samples accepted.
    fn send(&mut self, samples: &[IQSample], md: &TxMetadata, timeout: Duration) -> SdrResult<usize>;
}

/// Receive stream of the device. Owned by the feedback RX thread.
pub trait RxStream: Send {
    /// Issue a timed `num samps and done` capture and block for its result.
    fn recv_burst(&mut self, num_samples: usize, at: DeviceTime, timeout: Duration) -> SdrResult<RxBurst>;
}

/// The SDR capability set required by the output subsystem.
///
/// All methods take `&self`: the handle is shared between the transmit,
/// feedback and event threads. Clock-source and time-register changes only
/// happen during bring-up, before the other threads start.
pub trait SdrDevice: Send + Sync {
    /// Human-readable device description for logs.
    fn description(&self) -> String;

    /// The device's actual master clock rate in Hz.
    fn master_clock_rate(&self) -> f64;

    /// Set the TX sample rate; returns the rate actually configured.
    fn set_tx_rate(&self, rate: f64) -> SdrResult<f64>;

    /// Set the RX sample rate; returns the rate actually configured.
    fn set_rx_rate(&self, rate: f64) -> SdrResult<f64>;

    fn set_clock_source(&self, source: &str) -> SdrResult<()>;
    fn set_time_source(&self, source: &str) -> SdrResult<()>;
    fn set_tx_subdevice(&self, spec: &str) -> SdrResult<()>;

    /// Tune the TX chain, optionally with an LO offset; returns the actual
    /// centre frequency.
    fn tune_tx(&self, frequency: f64, lo_offset: f64) -> SdrResult<f64>;

    /// Tune the RX chain for the feedback path.
    fn tune_rx(&self, frequency: f64) -> SdrResult<f64>;

    fn set_tx_gain(&self, gain: f64) -> SdrResult<f64>;
    fn set_rx_gain(&self, gain: f64) -> SdrResult<f64>;
    fn set_rx_antenna(&self, antenna: &str) -> SdrResult<()>;

    /// Read a boolean motherboard sensor (`ref_locked`, `gps_locked`,
    /// `gps_timelock`). Returns `SensorUnavailable` when the device does not
    /// expose the sensor.
    fn sensor_bool(&self, name: &str) -> SdrResult<bool>;

    /// The device's current time register.
    fn time_now(&self) -> DeviceTime;

    /// Set the time register immediately.
    fn set_time_now(&self, time: DeviceTime) -> SdrResult<()>;

    /// Set the time register at the next PPS edge.
    fn set_time_at_next_pps(&self, time: DeviceTime) -> SdrResult<()>;

    /// Obtain the transmit stream. Called once, by the transmit thread.
    fn tx_stream(&self) -> SdrResult<Box<dyn TxStream>>;

    /// Obtain the receive stream. Called once, by the feedback RX thread.
    fn rx_stream(&self) -> SdrResult<Box<dyn RxStream>>;

    /// Non-blocking read of the async event channel, waiting at most
    /// `timeout`. Returns `None` when no event arrived.
    fn recv_async_event(&self, timeout: Duration) -> Option<AsyncEvent>;
}

/// Parse a comma-separated `key=value` device selection string.
pub fn parse_device_args(args: &str) -> HashMap<String, String> {
    let mut result = HashMap::new();
    for part in args.split(',') {
        if let Some(pos) = part.find('=') {
            let key = part[..pos].trim().to_string();
            let value = part[pos + 1..].trim().to_string();
            result.insert(key, value);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_device_args() {
        let parsed = parse_device_args("type=b200, master_clock_rate=32768000");
        assert_eq!(parsed.get("type"), Some(&"b200".to_string()));
        assert_eq!(parsed.get("master_clock_rate"), Some(&"32768000".to_string()));
        assert!(parse_device_args("").is_empty());
    }

    #[test]
    fn test_device_time_normalises() {
        let t = DeviceTime::new(10, 1.25);
        assert_eq!(t.full_secs, 11);
        assert!((t.frac_secs - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_device_time_add_secs() {
        let t = DeviceTime::new(5, 0.9).add_secs(0.2);
        assert_eq!(t.full_secs, 6);
        assert!((t.frac_secs - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_device_time_from_timestamp() {
        let ts = FrameTimestamp::new(42, 8_192_000);
        let t = DeviceTime::from_timestamp(&ts);
        assert_eq!(t.full_secs, 42);
        assert!((t.frac_secs - 0.5).abs() < 1e-12);
        assert_eq!(t.pps_ticks(), 8_192_000);
    }
}
