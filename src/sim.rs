//! Software SDR device for exercising the output subsystem without radio
//! hardware.
//!
//! The sim device records every configuration call and every transmitted
//! burst, exposes scriptable sensor states, replays injectable async
//! events, and answers timed receive captures from a configurable sample
//! source. Its clock runs in real time from an adjustable offset, so the
//! transmitter's past/future timestamp checks behave as they would against
//! hardware.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::device::{
    parse_device_args, AsyncEvent, DeviceTime, RxBurst, RxStream, SdrDevice, SdrError, SdrResult,
    TxMetadata, TxStream,
};
use crate::types::IQSample;

/// One burst recorded by the sim transmit stream.
#[derive(Debug, Clone)]
pub struct SentBurst {
    pub samples: Vec<IQSample>,
    pub md: TxMetadata,
}

#[derive(Debug)]
struct SimState {
    tx_rate: f64,
    rx_rate: f64,
    clock_source: String,
    time_source: String,
    subdevice: String,
    tx_freq: f64,
    rx_freq: f64,
    tx_gain: f64,
    rx_gain: f64,
    rx_antenna: String,
    sensors: HashMap<String, bool>,
    max_num_samps: usize,
}

#[derive(Debug)]
struct SimClock {
    base: Instant,
    offset_secs: f64,
}

struct SimInner {
    master_clock_rate: f64,
    state: Mutex<SimState>,
    clock: Mutex<SimClock>,
    sent: Mutex<Vec<SentBurst>>,
    events: Mutex<VecDeque<AsyncEvent>>,
    rx_source: Mutex<Vec<IQSample>>,
}

/// In-memory SDR device. Clones share the same underlying device state.
#[derive(Clone)]
pub struct SimDevice {
    inner: Arc<SimInner>,
}

impl SimDevice {
    pub fn new(master_clock_rate: f64) -> Self {
        let mut sensors = HashMap::new();
        sensors.insert("ref_locked".to_string(), true);
        sensors.insert("gps_locked".to_string(), true);
        sensors.insert("gps_timelock".to_string(), true);
        Self {
            inner: Arc::new(SimInner {
                master_clock_rate,
                state: Mutex::new(SimState {
                    tx_rate: 0.0,
                    rx_rate: 0.0,
                    clock_source: "internal".to_string(),
                    time_source: "none".to_string(),
                    subdevice: String::new(),
                    tx_freq: 0.0,
                    rx_freq: 0.0,
                    tx_gain: 0.0,
                    rx_gain: 0.0,
                    rx_antenna: "TX/RX".to_string(),
                    sensors,
                    max_num_samps: 100_000,
                }),
                clock: Mutex::new(SimClock {
                    base: Instant::now(),
                    offset_secs: 0.0,
                }),
                sent: Mutex::new(Vec::new()),
                events: Mutex::new(VecDeque::new()),
                rx_source: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Create a device from a `key=value` selection string.
    ///
    /// Recognised keys: `master_clock_rate`.
    pub fn from_args(args: &str) -> Self {
        let parsed = parse_device_args(args);
        let mcr = parsed
            .get("master_clock_rate")
            .and_then(|v| v.parse().ok())
            .unwrap_or(32_768_000.0);
        Self::new(mcr)
    }

    /// Script a sensor state.
    pub fn set_sensor(&self, name: &str, value: bool) {
        self.inner
            .state
            .lock()
            .unwrap()
            .sensors
            .insert(name.to_string(), value);
    }

    /// Remove a sensor so reads report it unavailable.
    pub fn remove_sensor(&self, name: &str) {
        self.inner.state.lock().unwrap().sensors.remove(name);
    }

    /// Inject an async event for the event thread to pick up.
    pub fn push_event(&self, event: AsyncEvent) {
        self.inner.events.lock().unwrap().push_back(event);
    }

    /// Limit the per-call send size to force chunked transmission.
    pub fn set_max_num_samps(&self, n: usize) {
        self.inner.state.lock().unwrap().max_num_samps = n.max(1);
    }

    /// Samples the receive stream replays on a capture. Zeros when unset.
    pub fn set_rx_samples(&self, samples: Vec<IQSample>) {
        *self.inner.rx_source.lock().unwrap() = samples;
    }

    /// All bursts recorded so far.
    pub fn sent_bursts(&self) -> Vec<SentBurst> {
        self.inner.sent.lock().unwrap().clone()
    }

    /// Concatenation of all transmitted samples, in order.
    pub fn sent_samples(&self) -> Vec<IQSample> {
        let sent = self.inner.sent.lock().unwrap();
        sent.iter().flat_map(|b| b.samples.iter().copied()).collect()
    }

    pub fn clock_source(&self) -> String {
        self.inner.state.lock().unwrap().clock_source.clone()
    }

    pub fn time_source(&self) -> String {
        self.inner.state.lock().unwrap().time_source.clone()
    }

    pub fn tx_rate(&self) -> f64 {
        self.inner.state.lock().unwrap().tx_rate
    }

    pub fn tx_gain(&self) -> f64 {
        self.inner.state.lock().unwrap().tx_gain
    }
}

impl SdrDevice for SimDevice {
    fn description(&self) -> String {
        format!("sim device ({} Hz master clock)", self.inner.master_clock_rate)
    }

    fn master_clock_rate(&self) -> f64 {
        self.inner.master_clock_rate
    }

    fn set_tx_rate(&self, rate: f64) -> SdrResult<f64> {
        debug!(rate, "sim: set TX rate");
        self.inner.state.lock().unwrap().tx_rate = rate;
        Ok(rate)
    }

    fn set_rx_rate(&self, rate: f64) -> SdrResult<f64> {
        self.inner.state.lock().unwrap().rx_rate = rate;
        Ok(rate)
    }

    fn set_clock_source(&self, source: &str) -> SdrResult<()> {
        self.inner.state.lock().unwrap().clock_source = source.to_string();
        Ok(())
    }

    fn set_time_source(&self, source: &str) -> SdrResult<()> {
        self.inner.state.lock().unwrap().time_source = source.to_string();
        Ok(())
    }

    fn set_tx_subdevice(&self, spec: &str) -> SdrResult<()> {
        self.inner.state.lock().unwrap().subdevice = spec.to_string();
        Ok(())
    }

    fn tune_tx(&self, frequency: f64, lo_offset: f64) -> SdrResult<f64> {
        debug!(frequency, lo_offset, "sim: tune TX");
        self.inner.state.lock().unwrap().tx_freq = frequency;
        Ok(frequency)
    }

    fn tune_rx(&self, frequency: f64) -> SdrResult<f64> {
        self.inner.state.lock().unwrap().rx_freq = frequency;
        Ok(frequency)
    }

    fn set_tx_gain(&self, gain: f64) -> SdrResult<f64> {
        self.inner.state.lock().unwrap().tx_gain = gain;
        Ok(gain)
    }

    fn set_rx_gain(&self, gain: f64) -> SdrResult<f64> {
        self.inner.state.lock().unwrap().rx_gain = gain;
        Ok(gain)
    }

    fn set_rx_antenna(&self, antenna: &str) -> SdrResult<()> {
        self.inner.state.lock().unwrap().rx_antenna = antenna.to_string();
        Ok(())
    }

    fn sensor_bool(&self, name: &str) -> SdrResult<bool> {
        self.inner
            .state
            .lock()
            .unwrap()
            .sensors
            .get(name)
            .copied()
            .ok_or_else(|| SdrError::SensorUnavailable(name.to_string()))
    }

    fn time_now(&self) -> DeviceTime {
        let clock = self.inner.clock.lock().unwrap();
        DeviceTime::from_real_secs(clock.offset_secs + clock.base.elapsed().as_secs_f64())
    }

    fn set_time_now(&self, time: DeviceTime) -> SdrResult<()> {
        let mut clock = self.inner.clock.lock().unwrap();
        clock.base = Instant::now();
        clock.offset_secs = time.real_secs();
        Ok(())
    }

    fn set_time_at_next_pps(&self, time: DeviceTime) -> SdrResult<()> {
        // The sim has no PPS edge; the set takes effect immediately.
        self.set_time_now(time)
    }

    fn tx_stream(&self) -> SdrResult<Box<dyn TxStream>> {
        Ok(Box::new(SimTxStream {
            inner: Arc::clone(&self.inner),
        }))
    }

    fn rx_stream(&self) -> SdrResult<Box<dyn RxStream>> {
        Ok(Box::new(SimRxStream {
            inner: Arc::clone(&self.inner),
        }))
    }

    fn recv_async_event(&self, timeout: Duration) -> Option<AsyncEvent> {
        if let Some(event) = self.inner.events.lock().unwrap().pop_front() {
            return Some(event);
        }
        // Poll once more after a short wait so injected events are picked up
        // promptly without spinning.
        std::thread::sleep(timeout.min(Duration::from_millis(50)));
        self.inner.events.lock().unwrap().pop_front()
    }
}

struct SimTxStream {
    inner: Arc<SimInner>,
}

impl TxStream for SimTxStream {
    fn max_num_samps(&self) -> usize {
        self.inner.state.lock().unwrap().max_num_samps
    }

    fn send(&mut self, samples: &[IQSample], md: &TxMetadata, _timeout: Duration) -> SdrResult<usize> {
        self.inner.sent.lock().unwrap().push(SentBurst {
            samples: samples.to_vec(),
            md: *md,
        });
        Ok(samples.len())
    }
}

struct SimRxStream {
    inner: Arc<SimInner>,
}

impl RxStream for SimRxStream {
    fn recv_burst(&mut self, num_samples: usize, at: DeviceTime, _timeout: Duration) -> SdrResult<RxBurst> {
        let source = self.inner.rx_source.lock().unwrap();
        let mut samples = Vec::with_capacity(num_samples);
        if source.is_empty() {
            samples.resize(num_samples, IQSample::new(0.0, 0.0));
        } else {
            for i in 0..num_samples {
                samples.push(source[i % source.len()]);
            }
        }
        Ok(RxBurst { samples, time: at })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_args() {
        let dev = SimDevice::from_args("master_clock_rate=16384000,type=sim");
        assert_eq!(dev.master_clock_rate(), 16_384_000.0);
    }

    #[test]
    fn test_time_register() {
        let dev = SimDevice::new(32_768_000.0);
        dev.set_time_now(DeviceTime::new(1000, 0.5)).unwrap();
        let t = dev.time_now().real_secs();
        assert!(t >= 1000.5 && t < 1001.0, "time {}", t);
    }

    #[test]
    fn test_sensor_scripting() {
        let dev = SimDevice::new(32_768_000.0);
        assert!(dev.sensor_bool("ref_locked").unwrap());
        dev.set_sensor("ref_locked", false);
        assert!(!dev.sensor_bool("ref_locked").unwrap());
        dev.remove_sensor("ref_locked");
        assert!(matches!(
            dev.sensor_bool("ref_locked"),
            Err(SdrError::SensorUnavailable(_))
        ));
    }

    #[test]
    fn test_tx_stream_records_bursts() {
        let dev = SimDevice::new(32_768_000.0);
        let mut stream = dev.tx_stream().unwrap();
        let md = TxMetadata::default();
        stream
            .send(&[IQSample::new(1.0, 0.0); 8], &md, Duration::from_secs(1))
            .unwrap();
        assert_eq!(dev.sent_bursts().len(), 1);
        assert_eq!(dev.sent_samples().len(), 8);
    }

    #[test]
    fn test_rx_loopback() {
        let dev = SimDevice::new(32_768_000.0);
        dev.set_rx_samples(vec![IQSample::new(0.25, -0.25); 4]);
        let mut stream = dev.rx_stream().unwrap();
        let burst = stream
            .recv_burst(10, DeviceTime::new(5, 0.0), Duration::from_secs(1))
            .unwrap();
        assert_eq!(burst.samples.len(), 10);
        assert_eq!(burst.samples[0], IQSample::new(0.25, -0.25));
        assert_eq!(burst.time.full_secs, 5);
    }

    #[test]
    fn test_event_injection() {
        let dev = SimDevice::new(32_768_000.0);
        assert!(dev.recv_async_event(Duration::from_millis(1)).is_none());
        dev.push_event(AsyncEvent::Underflow);
        assert_eq!(
            dev.recv_async_event(Duration::from_millis(1)),
            Some(AsyncEvent::Underflow)
        );
    }
}
