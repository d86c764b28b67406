//! Timed transmission of frames through the SDR device.
//!
//! The transmitter owns the device bring-up, the alignment of the radio's
//! time register to wall clock at a PPS edge, and the real-time transmit
//! loop. Frames arrive from the modulator through [`process`]
//! (`Transmitter::process`), pass the static-delay ring, and are queued for
//! the transmit thread, which emits each burst at the absolute time its
//! timestamp demands. A second thread drains the device's asynchronous
//! event channel, counting underflows and late packets.
//!
//! Every frame handled by the transmit thread resolves to a
//! [`TransmitOutcome`]; the loop reacts to the outcome instead of
//! unwinding, so a dropped frame and a fatal timing error take clearly
//! separate paths.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, trace, warn};

use crate::config::{ClockLossBehaviour, OutputConfig, PpsSource, RefClockSource};
use crate::device::{AsyncEvent, DeviceTime, SdrDevice, SdrError, SdrResult, TxMetadata, TxStream};
use crate::feedback::FeedbackServer;
use crate::frame_queue::{FrameQueue, MAX_DEPTH};
use crate::gps::GpsFixSupervisor;
use crate::remote::{parse_bool, ParameterError, ParameterInfo, RemoteControllable};
use crate::timestamp::FrameTimestamp;
use crate::types::{FrameEnvelope, IQSample};

/// Transmit timeout: device send deadline, and how far in the past a
/// timestamp may lie before its frame is dropped.
const TX_TIMEOUT: Duration = Duration::from_secs(20);

/// Timestamps further ahead of the device clock than this abort the run.
const TIMESTAMP_ABORT_FUTURE_SECS: f64 = 50.0;

/// Sleep taken instead of transmitting a frame whose timestamp is unusable.
const INCOMPLETE_TIMESTAMP_SLEEP: Duration = Duration::from_millis(20);

/// Monotonic counters of the transmit path, readable by remote control.
///
/// The counters only reset on process restart.
#[derive(Debug, Default)]
pub struct TxCounters {
    underflows: AtomicU64,
    late_packets: AtomicU64,
    frames_modulated: AtomicU64,
}

impl TxCounters {
    pub fn underflows(&self) -> u64 {
        self.underflows.load(Ordering::Relaxed)
    }

    pub fn late_packets(&self) -> u64 {
        self.late_packets.load(Ordering::Relaxed)
    }

    pub fn frames_modulated(&self) -> u64 {
        self.frames_modulated.load(Ordering::Relaxed)
    }
}

/// What became of one frame handed to the transmit thread.
#[derive(Debug, Clone, PartialEq)]
pub enum TransmitOutcome {
    /// The frame went out (possibly in several chunks).
    Sent,
    /// Muting swallowed the frame.
    Muted,
    /// The frame was discarded; the reason is logged.
    Dropped(String),
    /// The transmit loop must stop.
    FatalStop(String),
}

/// State shared between the caller-facing side and the worker threads.
struct TxShared {
    device: Arc<dyn SdrDevice>,
    queue: FrameQueue,
    counters: TxCounters,
    running: AtomicBool,
    muting: AtomicBool,
    sample_rate: u32,
    frame_duration: Duration,
    enable_sync: bool,
    mute_no_timestamps: bool,
    refclk_needs_check: AtomicBool,
    refclk_loss_behaviour: ClockLossBehaviour,
}

/// State owned by the modulator-facing side.
struct FrontState {
    gate_passed: bool,
    started: bool,
    last_len: Option<usize>,
    delay_buf: Vec<IQSample>,
    gps: Option<GpsFixSupervisor>,
}

/// Remote-controllable settings.
struct RcState {
    tx_gain: f64,
    rx_gain: f64,
    frequency: f64,
    static_delay_us: u32,
}

const PARAMETERS: &[ParameterInfo] = &[
    ParameterInfo { name: "txgain", description: "TX gain of the SDR" },
    ParameterInfo { name: "rxgain", description: "RX gain of the DPD feedback path" },
    ParameterInfo { name: "freq", description: "Transmission frequency" },
    ParameterInfo { name: "muting", description: "Mute the output" },
    ParameterInfo { name: "staticdelay", description: "Static delay adjustment in microseconds, wrapped at the frame duration" },
    ParameterInfo { name: "underruns", description: "(Read-only) underrun counter" },
    ParameterInfo { name: "latepackets", description: "(Read-only) late packet counter" },
    ParameterInfo { name: "frames", description: "(Read-only) transmitted frame counter" },
];

/// The SDR output stage.
pub struct Transmitter {
    config: OutputConfig,
    shared: Arc<TxShared>,
    feedback: Option<Arc<FeedbackServer>>,
    front: Mutex<FrontState>,
    rc: Mutex<RcState>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    frame_samples: usize,
}

impl Transmitter {
    /// Bring up the device and construct the transmitter.
    ///
    /// Fatal configuration mismatches (wrong master clock, rate not
    /// accepted within 1 ppm, oversized LO offset) fail here, before any
    /// thread starts. The output starts muted; muting is released once the
    /// GPS gate has passed and the time register is aligned.
    pub fn new(config: OutputConfig, device: Arc<dyn SdrDevice>) -> SdrResult<Self> {
        if config.sample_rate == 0 {
            return Err(SdrError::ConfigError("sample rate must be non-zero".to_string()));
        }

        if !config.device.is_empty() {
            debug!(args = %config.device, "device selection");
        }
        info!(device = %device.description(), "configuring SDR output");

        if config.master_clock_rate != 0.0 {
            let actual = device.master_clock_rate();
            debug!(actual, "checking master clock rate");
            if (actual - config.master_clock_rate).abs() > config.master_clock_rate * 1e-6 {
                return Err(SdrError::ConfigError(format!(
                    "master clock rate is {} instead of {}",
                    actual, config.master_clock_rate
                )));
            }
            if config.lo_offset.abs() >= config.master_clock_rate / 2.0 && config.lo_offset != 0.0 {
                return Err(SdrError::ConfigError(format!(
                    "LO offset {} exceeds half the master clock rate",
                    config.lo_offset
                )));
            }
        }

        device.set_clock_source(config.refclk_source.driver_name())?;
        device.set_time_source(config.pps_source.driver_name())?;
        if !config.subdevice.is_empty() {
            device.set_tx_subdevice(&config.subdevice)?;
        }

        let rate = config.sample_rate as f64;
        let actual_rate = device.set_tx_rate(rate)?;
        debug!(requested = rate, actual = actual_rate, "set TX rate");
        if (actual_rate - rate).abs() > rate * 1e-6 {
            return Err(SdrError::ConfigError(format!(
                "cannot set TX rate to {} (device chose {})",
                rate, actual_rate
            )));
        }

        if config.lo_offset != 0.0 {
            info!(frequency = config.frequency, lo_offset = config.lo_offset, "tuning TX");
        } else {
            info!(frequency = config.frequency, "tuning TX");
        }
        let actual_freq = device.tune_tx(config.frequency, config.lo_offset)?;
        info!(frequency = actual_freq, "actual TX frequency");
        device.set_tx_gain(config.tx_gain)?;

        // RX path at the same rate and frequency for the DPD feedback.
        device.set_rx_rate(rate)?;
        device.tune_rx(config.frequency)?;
        device.set_rx_antenna(&config.rx_antenna)?;
        device.set_rx_gain(config.rx_gain)?;

        debug!(
            enabled = config.mute_no_timestamps,
            "mute on missing timestamps"
        );

        let feedback = if config.feedback_port != 0 {
            Some(FeedbackServer::start(
                Arc::clone(&device),
                config.feedback_port,
                config.sample_rate,
            ))
        } else {
            None
        };

        let gps = if config.refclk_source.is_gpsdo() && config.max_gps_holdover_time != 0 {
            Some(GpsFixSupervisor::new(
                Arc::clone(&device),
                config.refclk_source == RefClockSource::GpsdoEttus,
                Duration::from_secs(config.gps_check_interval as u64),
                Duration::from_secs(config.max_gps_holdover_time as u64),
            ))
        } else {
            None
        };

        let frame_samples = config.dab_mode.frame_samples(config.sample_rate);

        let shared = Arc::new(TxShared {
            device,
            queue: FrameQueue::new(),
            counters: TxCounters::default(),
            running: AtomicBool::new(false),
            // Muted until the GPS gate passes and time is aligned.
            muting: AtomicBool::new(true),
            sample_rate: config.sample_rate,
            frame_duration: config.dab_mode.frame_duration(),
            enable_sync: config.enable_sync,
            mute_no_timestamps: config.mute_no_timestamps,
            refclk_needs_check: AtomicBool::new(config.refclk_source != RefClockSource::Internal),
            refclk_loss_behaviour: config.refclk_loss_behaviour,
        });

        Ok(Self {
            rc: Mutex::new(RcState {
                tx_gain: config.tx_gain,
                rx_gain: config.rx_gain,
                frequency: actual_freq,
                static_delay_us: 0,
            }),
            front: Mutex::new(FrontState {
                gate_passed: false,
                started: false,
                last_len: None,
                delay_buf: vec![IQSample::new(0.0, 0.0); frame_samples],
                gps,
            }),
            config,
            shared,
            feedback,
            threads: Mutex::new(Vec::new()),
            frame_samples,
        })
    }

    /// Hand one frame to the output.
    ///
    /// Called by the modulator thread for every frame. Until the GPS gate
    /// has passed, frames are consumed without transmission. A change of
    /// the frame length is fatal; so are an exceeded GPS holdover budget
    /// and a dead transmit worker.
    pub fn process(&self, mut envelope: FrameEnvelope) -> SdrResult<()> {
        let mut front = self.front.lock().unwrap();

        if !front.gate_passed {
            if let Some(gps) = front.gps.as_mut() {
                if !gps.initial_check()? {
                    drop(front);
                    thread::sleep(self.shared.frame_duration);
                    return Ok(());
                }
            }
            self.align_device_time()?;
            front.gate_passed = true;
            self.shared.muting.store(false, Ordering::SeqCst);
        }

        if !front.started {
            debug!("starting transmit worker threads");
            self.shared.running.store(true, Ordering::SeqCst);
            let worker_shared = Arc::clone(&self.shared);
            let event_shared = Arc::clone(&self.shared);
            let mut threads = self.threads.lock().unwrap();
            threads.push(
                thread::Builder::new()
                    .name("sdr-transmit".to_string())
                    .spawn(move || transmit_loop(worker_shared))
                    .map_err(|e| SdrError::HardwareError(format!("spawn transmit thread: {}", e)))?,
            );
            threads.push(
                thread::Builder::new()
                    .name("sdr-async-events".to_string())
                    .spawn(move || async_event_loop(event_shared))
                    .map_err(|e| SdrError::HardwareError(format!("spawn event thread: {}", e)))?,
            );
            drop(threads);
            front.last_len = Some(envelope.samples.len());
            front.started = true;
        }

        if front.last_len != Some(envelope.samples.len()) {
            self.shared.running.store(false, Ordering::SeqCst);
            self.shared.queue.close();
            return Err(SdrError::ConfigError(format!(
                "input frame length changed from {} to {}",
                front.last_len.unwrap_or(0),
                envelope.samples.len()
            )));
        }

        if let Some(gps) = front.gps.as_mut() {
            if let Err(e) = gps.check() {
                self.shared.running.store(false, Ordering::SeqCst);
                self.shared.queue.close();
                return Err(e);
            }
        }

        if !self.shared.running.load(Ordering::SeqCst) {
            return Err(SdrError::HardwareError("transmit worker stopped".to_string()));
        }

        self.apply_static_delay(&mut front, &mut envelope);
        drop(front);

        if envelope.ts.fct == -1 {
            info!("dropping one frame with invalid FCT");
            return Ok(());
        }

        if let Some(feedback) = &self.feedback {
            feedback.set_tx_frame(&envelope.samples, &envelope.ts);
        }

        let queued = self
            .shared
            .queue
            .push_wait_if_full(envelope)
            .map_err(|_| SdrError::HardwareError("frame queue closed".to_string()))?;
        trace!(queued, "frame queued");
        Ok(())
    }

    /// Prefix the frame with the held-back tail of its predecessor.
    fn apply_static_delay(&self, front: &mut FrontState, envelope: &mut FrameEnvelope) {
        let delay_us = self.rc.lock().unwrap().static_delay_us as u64;
        let delay_samples =
            (delay_us * (self.shared.sample_rate as u64 / 1000) / 1000) as usize;
        if delay_samples == 0 {
            return;
        }
        let n = envelope.samples.len();
        let d = delay_samples.min(n);
        if front.delay_buf.len() < d {
            front.delay_buf.resize(d, IQSample::new(0.0, 0.0));
        }

        let mut delayed = Vec::with_capacity(n);
        delayed.extend_from_slice(&front.delay_buf[..d]);
        delayed.extend_from_slice(&envelope.samples[..n - d]);
        front.delay_buf[..d].copy_from_slice(&envelope.samples[n - d..]);
        envelope.samples = delayed;
    }

    /// Align the radio's time register before the first sample goes out.
    fn align_device_time(&self) -> SdrResult<()> {
        let wall_secs = || -> SdrResult<u64> {
            SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .map_err(|e| SdrError::HardwareError(format!("could not get time: {}", e)))
        };

        if self.config.pps_source == PpsSource::None {
            if self.config.enable_sync {
                warn!("synchronous transmission enabled without PPS input");
                let seconds = wall_secs()?;
                self.shared.device.set_time_now(DeviceTime::new(seconds, 0.0))?;
                info!(seconds, "set device time to wall clock");
            }
            return Ok(());
        }

        // Wait for the wall-clock second to tick over, stay clear of the
        // PPS edge by 200 ms, then arm the time register for the edge after
        // the next one.
        let seconds = wall_secs()?;
        while wall_secs()? <= seconds {
            thread::sleep(Duration::from_millis(1));
        }
        thread::sleep(Duration::from_millis(200));
        self.shared
            .device
            .set_time_at_next_pps(DeviceTime::new(seconds + 2, 0.0))?;
        info!(seconds = seconds + 2, "setting device time at next PPS");
        thread::sleep(Duration::from_secs(1));
        info!(
            device_time = self.shared.device.time_now().real_secs(),
            "device time after PPS alignment"
        );
        Ok(())
    }

    /// Stop all worker threads and release the queue.
    pub fn stop(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.queue.close();
        if let Some(feedback) = &self.feedback {
            feedback.stop();
        }
        let handles = std::mem::take(&mut *self.threads.lock().unwrap());
        for handle in handles {
            let _ = handle.join();
        }
    }

    pub fn counters(&self) -> &TxCounters {
        &self.shared.counters
    }

    pub fn is_muting(&self) -> bool {
        self.shared.muting.load(Ordering::SeqCst)
    }

    pub fn set_muting(&self, muting: bool) {
        self.shared.muting.store(muting, Ordering::SeqCst);
    }

    /// Number of samples in one transmission frame.
    pub fn frame_samples(&self) -> usize {
        self.frame_samples
    }

    pub fn feedback(&self) -> Option<&Arc<FeedbackServer>> {
        self.feedback.as_ref()
    }
}

impl Drop for Transmitter {
    fn drop(&mut self) {
        self.stop();
    }
}

impl RemoteControllable for Transmitter {
    fn rc_name(&self) -> &'static str {
        "sdr"
    }

    fn parameters(&self) -> &'static [ParameterInfo] {
        PARAMETERS
    }

    fn set_parameter(&self, parameter: &str, value: &str) -> Result<(), ParameterError> {
        match parameter {
            "txgain" => {
                let gain: f64 = value
                    .trim()
                    .parse()
                    .map_err(|e| ParameterError::invalid(parameter, e))?;
                let actual = self
                    .shared
                    .device
                    .set_tx_gain(gain)
                    .map_err(|e| ParameterError::invalid(parameter, e))?;
                self.rc.lock().unwrap().tx_gain = actual;
                Ok(())
            }
            "rxgain" => {
                let gain: f64 = value
                    .trim()
                    .parse()
                    .map_err(|e| ParameterError::invalid(parameter, e))?;
                let actual = self
                    .shared
                    .device
                    .set_rx_gain(gain)
                    .map_err(|e| ParameterError::invalid(parameter, e))?;
                self.rc.lock().unwrap().rx_gain = actual;
                Ok(())
            }
            "freq" => {
                let freq: f64 = value
                    .trim()
                    .parse()
                    .map_err(|e| ParameterError::invalid(parameter, e))?;
                let actual = self
                    .shared
                    .device
                    .tune_tx(freq, self.config.lo_offset)
                    .map_err(|e| ParameterError::invalid(parameter, e))?;
                self.shared
                    .device
                    .tune_rx(actual)
                    .map_err(|e| ParameterError::invalid(parameter, e))?;
                self.rc.lock().unwrap().frequency = actual;
                Ok(())
            }
            "muting" => {
                self.set_muting(parse_bool(parameter, value)?);
                Ok(())
            }
            "staticdelay" => {
                let adjust: i64 = value
                    .trim()
                    .parse()
                    .map_err(|e| ParameterError::invalid(parameter, e))?;
                let frame_us = self.shared.frame_duration.as_micros() as i64;
                let mut rc = self.rc.lock().unwrap();
                if adjust > frame_us {
                    // Out-of-range requests reset the delay.
                    rc.static_delay_us = 0;
                } else {
                    // The adjustment is added to the current delay and the
                    // result wrapped at the frame duration.
                    let mut new_delay = rc.static_delay_us as i64 + adjust;
                    if new_delay > frame_us {
                        new_delay -= frame_us;
                    } else if new_delay < 0 {
                        new_delay += frame_us;
                    }
                    rc.static_delay_us = new_delay.max(0) as u32;
                }
                Ok(())
            }
            "underruns" | "latepackets" | "frames" => {
                Err(ParameterError::ReadOnly(parameter.to_string()))
            }
            other => Err(ParameterError::Unknown(other.to_string())),
        }
    }

    fn get_parameter(&self, parameter: &str) -> Result<String, ParameterError> {
        match parameter {
            "txgain" => Ok(self.rc.lock().unwrap().tx_gain.to_string()),
            "rxgain" => Ok(self.rc.lock().unwrap().rx_gain.to_string()),
            "freq" => Ok(self.rc.lock().unwrap().frequency.to_string()),
            "muting" => Ok(if self.is_muting() { "1" } else { "0" }.to_string()),
            "staticdelay" => Ok(self.rc.lock().unwrap().static_delay_us.to_string()),
            "underruns" => Ok(self.shared.counters.underflows().to_string()),
            "latepackets" => Ok(self.shared.counters.late_packets().to_string()),
            "frames" => Ok(self.shared.counters.frames_modulated().to_string()),
            other => Err(ParameterError::Unknown(other.to_string())),
        }
    }
}

/// The real-time transmit thread: pop, handle, react to the outcome.
fn transmit_loop(shared: Arc<TxShared>) {
    if let Err(e) = crate::rt::set_realtime_priority(1) {
        warn!(error = %e, "could not set transmit thread priority");
    }

    let mut stream = match shared.device.tx_stream() {
        Ok(stream) => stream,
        Err(e) => {
            error!(error = %e, "could not open TX stream");
            shared.running.store(false, Ordering::SeqCst);
            return;
        }
    };

    let mut last_tx: Option<(u32, u32)> = None;
    // Fill the queue completely after cold start and after every underrun
    // to reduce the chance of the next one.
    let mut prebuffer = MAX_DEPTH;
    let mut last_underflows = 0u64;

    while shared.running.load(Ordering::SeqCst) {
        trace!("waiting for frame");
        let Some(frame) = shared.queue.wait_and_pop(prebuffer) else {
            break;
        };

        match handle_frame(&shared, stream.as_mut(), &mut last_tx, frame) {
            TransmitOutcome::Sent => {
                shared.counters.frames_modulated.fetch_add(1, Ordering::Relaxed);
            }
            TransmitOutcome::Muted => {}
            TransmitOutcome::Dropped(reason) => {
                debug!(%reason, "frame dropped");
            }
            TransmitOutcome::FatalStop(reason) => {
                error!(%reason, "transmit loop aborting");
                shared.running.store(false, Ordering::SeqCst);
                break;
            }
        }

        let underflows = shared.counters.underflows();
        prebuffer = if underflows > last_underflows { MAX_DEPTH } else { 1 };
        last_underflows = underflows;
    }
    shared.running.store(false, Ordering::SeqCst);
    warn!("transmit worker terminated");
}

/// Decide what to do with one dequeued frame.
fn handle_frame(
    shared: &TxShared,
    stream: &mut dyn TxStream,
    last_tx: &mut Option<(u32, u32)>,
    frame: FrameEnvelope,
) -> TransmitOutcome {
    if shared.refclk_needs_check.load(Ordering::SeqCst) {
        match shared.device.sensor_bool("ref_locked") {
            Ok(true) => {}
            Ok(false) => {
                error!("external reference clock lock lost");
                if shared.refclk_loss_behaviour == ClockLossBehaviour::Crash {
                    return TransmitOutcome::FatalStop(
                        "external reference clock lock lost".to_string(),
                    );
                }
            }
            Err(_) => {
                warn!("device has no ref_locked sensor, check disabled");
                shared.refclk_needs_check.store(false, Ordering::SeqCst);
            }
        }
    }

    let device_time = shared.device.time_now().real_secs();

    if shared.enable_sync && frame.ts.valid {
        let mut ts_update = false;
        if let Some((last_sec, last_pps)) = *last_tx {
            let expected = FrameTimestamp::new(last_sec, last_pps)
                .advanced_by(frame.samples.len() as u64, shared.sample_rate);
            if expected.seconds != frame.ts.seconds || expected.pps_ticks != frame.ts.pps_ticks {
                warn!(
                    expected = %expected,
                    got = %frame.ts,
                    "timestamp irregularity"
                );
                ts_update = true;
            }
        }
        *last_tx = Some((frame.ts.seconds, frame.ts.pps_ticks));

        let time_spec = DeviceTime::from_timestamp(&frame.ts);
        trace!(tist = time_spec.real_secs(), "burst time");

        if time_spec.real_secs() + TX_TIMEOUT.as_secs_f64() < device_time {
            info!(
                offset = time_spec.real_secs() - device_time,
                fct = frame.ts.fct,
                "timestamp in the past, dropping frame"
            );
            return TransmitOutcome::Dropped(format!(
                "timestamp {} behind device time {:.6}",
                frame.ts, device_time
            ));
        }

        if time_spec.real_secs() > device_time + TIMESTAMP_ABORT_FUTURE_SECS {
            return TransmitOutcome::FatalStop(format!(
                "timestamp {} too far in the future (device time {:.6})",
                frame.ts, device_time
            ));
        }

        send_frame(shared, stream, &frame, Some(time_spec), ts_update)
    } else if shared.enable_sync {
        // The source carries timestamps but this frame's is unusable.
        info!(fct = frame.ts.fct, "incomplete timestamp, dropping frame");
        thread::sleep(INCOMPLETE_TIMESTAMP_SLEEP);
        TransmitOutcome::Dropped("incomplete timestamp".to_string())
    } else {
        if shared.muting.load(Ordering::SeqCst) {
            debug!(fct = frame.ts.fct, "muting frame");
            thread::sleep(shared.frame_duration);
            return TransmitOutcome::Muted;
        }
        if shared.mute_no_timestamps {
            debug!(fct = frame.ts.fct, "muting frame without timestamp");
            thread::sleep(shared.frame_duration);
            return TransmitOutcome::Muted;
        }
        send_frame(shared, stream, &frame, None, false)
    }
}

/// Push one frame to the device in chunks of at most `max_num_samps`.
fn send_frame(
    shared: &TxShared,
    stream: &mut dyn TxStream,
    frame: &FrameEnvelope,
    time_spec: Option<DeviceTime>,
    ts_update: bool,
) -> TransmitOutcome {
    let samples = &frame.samples;
    let total = samples.len();
    let max_num_samps = stream.max_num_samps().max(1);

    let mut md = TxMetadata {
        has_time_spec: time_spec.is_some(),
        time_spec: time_spec.unwrap_or_default(),
        start_of_burst: false,
        end_of_burst: false,
    };

    let mut sent_total = 0usize;
    while shared.running.load(Ordering::SeqCst)
        && !shared.muting.load(Ordering::SeqCst)
        && sent_total < total
    {
        let chunk = (total - sent_total).min(max_num_samps);

        let mut md_tx = md;
        // The last chunk carries end-of-burst when timing has to be
        // re-armed, so the driver reconsiders the next burst's time spec.
        md_tx.end_of_burst = md.has_time_spec
            && (frame.ts.refresh || ts_update)
            && total - sent_total <= max_num_samps;

        let sent = match stream.send(&samples[sent_total..sent_total + chunk], &md_tx, TX_TIMEOUT) {
            Ok(sent) => sent,
            Err(e) => return TransmitOutcome::FatalStop(format!("device send failed: {}", e)),
        };
        trace!(sent, chunk, "sent chunk");

        if sent == 0 {
            warn!("unable to write to device, skipping frame");
            break;
        }
        sent_total += sent;
        md.time_spec = md.time_spec.add_secs(sent as f64 / shared.sample_rate as f64);
    }

    if sent_total == 0 {
        TransmitOutcome::Muted
    } else {
        TransmitOutcome::Sent
    }
}

/// Drain the device's asynchronous event channel.
fn async_event_loop(shared: Arc<TxShared>) {
    let mut last_print = Instant::now();
    let mut prev_underflows = 0u64;
    let mut prev_late = 0u64;

    while shared.running.load(Ordering::SeqCst) {
        if let Some(event) = shared.device.recv_async_event(Duration::from_secs(1)) {
            match event {
                AsyncEvent::BurstAck => {}
                AsyncEvent::Underflow => {
                    shared.counters.underflows.fetch_add(1, Ordering::Relaxed);
                }
                AsyncEvent::UnderflowInPacket => {
                    shared.counters.underflows.fetch_add(1, Ordering::Relaxed);
                    error!(event = event.description(), "async device event");
                }
                AsyncEvent::SeqError | AsyncEvent::SeqErrorInBurst => {
                    error!(event = event.description(), "async device event");
                }
                AsyncEvent::TimeError => {
                    shared.counters.late_packets.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        if last_print.elapsed() >= Duration::from_secs(1) {
            let underflows = shared.counters.underflows();
            let late = shared.counters.late_packets();
            if underflows > prev_underflows || late > prev_late {
                info!(
                    device_time = shared.device.time_now().real_secs(),
                    underruns = underflows,
                    late_packets = late,
                    "output status"
                );
            }
            prev_underflows = underflows;
            prev_late = late;
            last_print = Instant::now();
        }
    }
}
