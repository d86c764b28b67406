//! DPD feedback capture server.
//!
//! An external estimator computes the predistortion model from pairs of
//! transmitted and received samples. This server gives it those pairs: on
//! a client request the next transmitted frame is captured, a time-matched
//! receive burst is recorded through the radio's RX path, and both are
//! served back over a small binary protocol.
//!
//! Because a DAB frame starts with the silent NULL symbol, the transmit
//! capture takes the trailing samples of the frame and advances the
//! timestamp by the skipped length, so the receive burst aligns with
//! samples that actually carry power.
//!
//! Protocol, per connection (all integers host-native, client colocated):
//! client sends `u8` version (= 1) and `u32` sample count; the server
//! replies with `u32` count, `u32` TX seconds, `u32` TX PPS ticks, the TX
//! samples as complex f32, then `u32` RX seconds, `u32` RX PPS ticks and
//! the RX samples.

use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info};

use crate::device::{DeviceTime, SdrDevice};
use crate::timestamp::FrameTimestamp;
use crate::types::IQSample;

/// Protocol version accepted from clients.
const PROTOCOL_VERSION: u8 = 1;

/// Pause before the server loop retries after an error.
const RETRY_PAUSE: Duration = Duration::from_secs(5);

/// Timeout for the timed receive capture.
const RX_TIMEOUT: Duration = Duration::from_secs(60);

/// States of the burst capture cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BurstRequestState {
    None,
    SaveTransmitFrame,
    SaveReceiveFrame,
    Acquired,
}

#[derive(Debug)]
struct BurstRequest {
    state: BurstRequestState,
    num_samples: usize,
    tx_samples: Vec<IQSample>,
    rx_samples: Vec<IQSample>,
    tx_seconds: u32,
    tx_pps: u32,
    rx_seconds: u32,
    rx_pps: u32,
}

impl BurstRequest {
    fn new() -> Self {
        Self {
            state: BurstRequestState::None,
            num_samples: 0,
            tx_samples: Vec::new(),
            rx_samples: Vec::new(),
            tx_seconds: 0,
            tx_pps: 0,
            rx_seconds: 0,
            rx_pps: 0,
        }
    }
}

/// Single-client TCP server capturing time-aligned TX/RX burst pairs.
pub struct FeedbackServer {
    running: AtomicBool,
    burst: Mutex<BurstRequest>,
    burst_changed: Condvar,
    port: u16,
    sample_rate: u32,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl FeedbackServer {
    /// Start the RX capture and TCP serving threads.
    pub fn start(device: Arc<dyn SdrDevice>, port: u16, sample_rate: u32) -> Arc<Self> {
        let server = Arc::new(Self {
            running: AtomicBool::new(true),
            burst: Mutex::new(BurstRequest::new()),
            burst_changed: Condvar::new(),
            port,
            sample_rate,
            threads: Mutex::new(Vec::new()),
        });

        let rx_server = Arc::clone(&server);
        let rx_device = Arc::clone(&device);
        let rx_thread = thread::Builder::new()
            .name("dpd-feedback-rx".to_string())
            .spawn(move || rx_server.rx_loop(rx_device));

        let tcp_server = Arc::clone(&server);
        let tcp_thread = thread::Builder::new()
            .name("dpd-feedback-tcp".to_string())
            .spawn(move || tcp_server.tcp_loop());

        let mut threads = server.threads.lock().unwrap();
        for spawned in [rx_thread, tcp_thread] {
            match spawned {
                Ok(handle) => threads.push(handle),
                Err(e) => error!(error = %e, "could not spawn feedback thread"),
            }
        }
        drop(threads);
        server
    }

    /// Offer one transmitted frame to the capture cycle.
    ///
    /// Called by the transmitter for every frame it queues. Only a cycle in
    /// the `SaveTransmitFrame` state copies anything.
    pub fn set_tx_frame(&self, samples: &[IQSample], ts: &FrameTimestamp) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        let mut burst = self.burst.lock().unwrap();
        if burst.state != BurstRequestState::SaveTransmitFrame {
            return;
        }

        let n = burst.num_samples.min(samples.len());
        burst.num_samples = n;

        // Skip the frame head: the NULL symbol carries no power. The stamp
        // advances by the skipped samples so TX and RX stay aligned.
        let skip = samples.len() - n;
        burst.tx_samples = samples[skip..].to_vec();

        let adjusted = ts.advanced_by(skip as u64, self.sample_rate);
        burst.tx_seconds = adjusted.seconds;
        burst.tx_pps = adjusted.pps_ticks;
        burst.rx_seconds = adjusted.seconds;
        burst.rx_pps = adjusted.pps_ticks;
        burst.state = BurstRequestState::SaveReceiveFrame;
        drop(burst);
        self.burst_changed.notify_all();
    }

    /// Stop both threads and wake any waiter.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.burst_changed.notify_all();
        let handles = std::mem::take(&mut *self.threads.lock().unwrap());
        for handle in handles {
            let _ = handle.join();
        }
    }

    fn rx_loop(&self, device: Arc<dyn SdrDevice>) {
        let mut stream = match device.rx_stream() {
            Ok(stream) => stream,
            Err(e) => {
                error!(error = %e, "feedback RX stream unavailable");
                self.running.store(false, Ordering::SeqCst);
                return;
            }
        };

        while self.running.load(Ordering::SeqCst) {
            let (num_samples, at) = {
                let mut burst = self.burst.lock().unwrap();
                while burst.state != BurstRequestState::SaveReceiveFrame
                    && self.running.load(Ordering::SeqCst)
                {
                    let (guard, _) = self
                        .burst_changed
                        .wait_timeout(burst, Duration::from_millis(250))
                        .unwrap();
                    burst = guard;
                }
                if !self.running.load(Ordering::SeqCst) {
                    return;
                }
                (
                    burst.num_samples,
                    DeviceTime::from_timestamp(&FrameTimestamp::new(
                        burst.rx_seconds,
                        burst.rx_pps,
                    )),
                )
                // The lock is released while the capture runs so the
                // transmitter is never blocked on us.
            };

            match stream.recv_burst(num_samples, at, RX_TIMEOUT) {
                Ok(capture) => {
                    let mut burst = self.burst.lock().unwrap();
                    debug!(
                        samples = capture.samples.len(),
                        seconds = capture.time.full_secs,
                        "acquired RX feedback burst"
                    );
                    burst.rx_samples = capture.samples;
                    // The capture may have started at another time than
                    // requested; report the actual one.
                    burst.rx_seconds = capture.time.full_secs as u32;
                    burst.rx_pps = capture.time.pps_ticks();
                    burst.state = BurstRequestState::Acquired;
                    drop(burst);
                    self.burst_changed.notify_all();
                }
                Err(e) => {
                    error!(error = %e, "feedback RX capture failed");
                    self.running.store(false, Ordering::SeqCst);
                    return;
                }
            }
        }
    }

    fn tcp_loop(&self) {
        while self.running.load(Ordering::SeqCst) {
            if let Err(e) = self.serve() {
                error!(error = %e, "feedback server error, retrying");
            }
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            thread::sleep(RETRY_PAUSE);
        }
    }

    fn serve(&self) -> io::Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", self.port))?;
        listener.set_nonblocking(true)?;
        info!(port = self.port, "DPD feedback server listening");

        while self.running.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, peer)) => {
                    debug!(%peer, "feedback client connected");
                    stream.set_nonblocking(false)?;
                    self.handle_client(stream)?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(200));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn handle_client(&self, mut sock: TcpStream) -> io::Result<()> {
        let mut version = [0u8; 1];
        sock.read_exact(&mut version)?;
        if version[0] != PROTOCOL_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("wrong request version {}", version[0]),
            ));
        }

        let mut count = [0u8; 4];
        sock.read_exact(&mut count)?;
        let requested = u32::from_ne_bytes(count) as usize;

        {
            let mut burst = self.burst.lock().unwrap();
            burst.num_samples = requested;
            burst.state = BurstRequestState::SaveTransmitFrame;
        }
        self.burst_changed.notify_all();

        // Wait for the capture cycle to complete.
        let mut waited = Duration::ZERO;
        let reply = {
            let mut burst = self.burst.lock().unwrap();
            while burst.state != BurstRequestState::Acquired {
                if !self.running.load(Ordering::SeqCst) {
                    return Ok(());
                }
                if waited > RX_TIMEOUT {
                    burst.state = BurstRequestState::None;
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "burst capture did not complete",
                    ));
                }
                let (guard, _) = self
                    .burst_changed
                    .wait_timeout(burst, Duration::from_millis(250))
                    .unwrap();
                burst = guard;
                waited += Duration::from_millis(250);
            }
            burst.state = BurstRequestState::None;

            let n = burst
                .num_samples
                .min(burst.tx_samples.len())
                .min(burst.rx_samples.len());
            encode_reply(
                n,
                burst.tx_seconds,
                burst.tx_pps,
                &burst.tx_samples[..n],
                burst.rx_seconds,
                burst.rx_pps,
                &burst.rx_samples[..n],
            )
        };

        sock.write_all(&reply)?;
        sock.flush()
    }
}

impl Drop for FeedbackServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn encode_reply(
    num_samples: usize,
    tx_seconds: u32,
    tx_pps: u32,
    tx_samples: &[IQSample],
    rx_seconds: u32,
    rx_pps: u32,
    rx_samples: &[IQSample],
) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 * 4 + 8 * 2 * num_samples);
    out.extend_from_slice(&(num_samples as u32).to_ne_bytes());
    out.extend_from_slice(&tx_seconds.to_ne_bytes());
    out.extend_from_slice(&tx_pps.to_ne_bytes());
    for s in tx_samples {
        out.extend_from_slice(&s.re.to_ne_bytes());
        out.extend_from_slice(&s.im.to_ne_bytes());
    }
    out.extend_from_slice(&rx_seconds.to_ne_bytes());
    out.extend_from_slice(&rx_pps.to_ne_bytes());
    for s in rx_samples {
        out.extend_from_slice(&s.re.to_ne_bytes());
        out.extend_from_slice(&s.im.to_ne_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimDevice;

    #[test]
    fn test_tx_capture_takes_trailing_samples() {
        let sim = SimDevice::new(32_768_000.0);
        let server = FeedbackServer::start(Arc::new(sim), 0, 2_048_000);

        // Force the request state without a TCP client.
        {
            let mut burst = server.burst.lock().unwrap();
            burst.num_samples = 4;
            burst.state = BurstRequestState::SaveTransmitFrame;
        }

        let samples: Vec<IQSample> = (0..16).map(|i| IQSample::new(i as f32, 0.0)).collect();
        let ts = FrameTimestamp::new(10, 0);
        server.set_tx_frame(&samples, &ts);

        // Wait until the RX thread has finished the cycle.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            {
                let burst = server.burst.lock().unwrap();
                if burst.state == BurstRequestState::Acquired {
                    assert_eq!(burst.tx_samples.len(), 4);
                    assert_eq!(burst.tx_samples[0].re, 12.0);
                    // 12 skipped samples at 2.048 MS/s are 96 ticks.
                    assert_eq!(burst.tx_seconds, 10);
                    assert_eq!(burst.tx_pps, 96);
                    assert_eq!(burst.rx_samples.len(), 4);
                    break;
                }
            }
            assert!(std::time::Instant::now() < deadline, "capture never completed");
            thread::sleep(Duration::from_millis(10));
        }
        server.stop();
    }

    #[test]
    fn test_frames_ignored_while_idle() {
        let sim = SimDevice::new(32_768_000.0);
        let server = FeedbackServer::start(Arc::new(sim), 0, 2_048_000);
        let samples = vec![IQSample::new(1.0, 0.0); 8];
        server.set_tx_frame(&samples, &FrameTimestamp::new(0, 0));
        assert_eq!(server.burst.lock().unwrap().state, BurstRequestState::None);
        server.stop();
    }

    #[test]
    fn test_encode_reply_layout() {
        let tx = [IQSample::new(1.0, 2.0)];
        let rx = [IQSample::new(3.0, 4.0)];
        let reply = encode_reply(1, 7, 96, &tx, 8, 100, &rx);
        assert_eq!(reply.len(), 4 + 4 + 4 + 8 + 4 + 4 + 8);
        assert_eq!(u32::from_ne_bytes(reply[0..4].try_into().unwrap()), 1);
        assert_eq!(u32::from_ne_bytes(reply[4..8].try_into().unwrap()), 7);
        assert_eq!(u32::from_ne_bytes(reply[8..12].try_into().unwrap()), 96);
        assert_eq!(f32::from_ne_bytes(reply[12..16].try_into().unwrap()), 1.0);
        assert_eq!(f32::from_ne_bytes(reply[16..20].try_into().unwrap()), 2.0);
        assert_eq!(u32::from_ne_bytes(reply[20..24].try_into().unwrap()), 8);
        assert_eq!(u32::from_ne_bytes(reply[24..28].try_into().unwrap()), 100);
    }
}
