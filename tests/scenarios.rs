//! End-to-end scenarios for the output subsystem, run against the sim
//! device: synchronous startup without PPS, muting on missing timestamps,
//! the static-delay ring, the feedback round-trip, underflow recovery and
//! the GPS holdover budget.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use dabtx::config::{OutputConfig, RefClockSource};
use dabtx::device::{AsyncEvent, SdrDevice, SdrError};
use dabtx::feedback::FeedbackServer;
use dabtx::frame_queue::MAX_DEPTH;
use dabtx::remote::RemoteControllable;
use dabtx::sim::SimDevice;
use dabtx::timestamp::FrameTimestamp;
use dabtx::transmitter::Transmitter;
use dabtx::types::{DabMode, FrameEnvelope, IQSample};

const RATE: u32 = 2_048_000;

fn base_config(mode: DabMode) -> OutputConfig {
    OutputConfig {
        sample_rate: RATE,
        frequency: 222_064_000.0,
        master_clock_rate: 32_768_000.0,
        dab_mode: mode,
        ..OutputConfig::default()
    }
}

fn tagged_frame(tag: f32, len: usize, ts: FrameTimestamp) -> FrameEnvelope {
    FrameEnvelope::new(vec![IQSample::new(tag, 0.0); len], ts)
}

fn wait_for<F: Fn() -> bool>(what: &str, deadline: Duration, predicate: F) {
    let end = Instant::now() + deadline;
    while !predicate() {
        assert!(Instant::now() < end, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(10));
    }
}

/// S1: synchronous transmission without PPS input. The time register is set
/// to the wall clock and timestamped frames go out in order.
#[test]
fn sync_without_pps_emits_frames_in_order() {
    let sim = SimDevice::new(32_768_000.0);
    let config = OutputConfig {
        enable_sync: true,
        ..base_config(DabMode::Mode2)
    };
    let tx = Transmitter::new(config, Arc::new(sim.clone())).unwrap();

    let len = 4096usize;
    // First frame kicks off the gate, which sets the device time to the
    // wall clock; stamp the frames shortly after that.
    let wall = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
    let mut ts = FrameTimestamp::new(wall as u32 + 1, 0).with_refresh(true);

    for i in 0..10 {
        tx.process(tagged_frame(i as f32, len, ts)).unwrap();
        ts = ts.advanced_by(len as u64, RATE).with_refresh(false);
    }

    wait_for("all frames transmitted", Duration::from_secs(5), || {
        sim.sent_bursts().len() >= 10
    });
    tx.stop();

    // The device clock was aligned to the wall clock.
    let device_secs = sim.time_now().real_secs();
    assert!(
        (device_secs - wall as f64).abs() < 10.0,
        "device time {} not aligned to wall clock {}",
        device_secs,
        wall
    );

    let bursts = sim.sent_bursts();
    for (i, burst) in bursts.iter().take(10).enumerate() {
        assert_eq!(burst.samples[0].re, i as f32, "burst {} out of order", i);
        assert!(burst.md.has_time_spec);
    }
    // The first burst re-arms timing, later ones continue the stream.
    assert!(bursts[0].md.end_of_burst);
    assert!(!bursts[1].md.end_of_burst);
    assert_eq!(bursts[0].md.time_spec.full_secs, wall + 1);
    assert_eq!(tx.counters().frames_modulated(), bursts.len() as u64);
}

/// S2: a frame without a usable timestamp is consumed without transmitting
/// and without advancing the frame counter.
#[test]
fn missing_timestamp_mutes_the_frame() {
    let sim = SimDevice::new(32_768_000.0);
    let config = OutputConfig {
        enable_sync: true,
        mute_no_timestamps: true,
        ..base_config(DabMode::Mode1)
    };
    let tx = Transmitter::new(config, Arc::new(sim.clone())).unwrap();

    for i in 0..MAX_DEPTH {
        tx.process(tagged_frame(i as f32, 1024, FrameTimestamp::invalid()))
            .unwrap();
    }
    thread::sleep(Duration::from_millis(500));
    tx.stop();

    assert!(sim.sent_bursts().is_empty(), "muted frames were transmitted");
    assert_eq!(tx.counters().frames_modulated(), 0);
}

/// S3: a 1000 us static delay at 2.048 MS/s shifts the stream by exactly
/// 2048 samples.
#[test]
fn static_delay_shifts_the_stream() {
    let sim = SimDevice::new(32_768_000.0);
    let tx = Transmitter::new(base_config(DabMode::Mode2), Arc::new(sim.clone())).unwrap();
    tx.set_parameter("staticdelay", "1000").unwrap();

    let len = 4096usize;
    let mut impulse = vec![IQSample::new(0.0, 0.0); len];
    impulse[0] = IQSample::new(1.0, 0.0);
    tx.process(FrameEnvelope::new(impulse, FrameTimestamp::invalid()))
        .unwrap();
    for _ in 0..MAX_DEPTH {
        tx.process(tagged_frame(0.0, len, FrameTimestamp::invalid()))
            .unwrap();
    }

    wait_for("frames transmitted", Duration::from_secs(5), || {
        sim.sent_samples().len() >= 3 * len
    });
    tx.stop();

    let stream = sim.sent_samples();
    for (i, s) in stream[..3 * len].iter().enumerate() {
        if i == 2048 {
            assert_eq!(s.re, 1.0, "impulse missing at its delayed position");
        } else {
            assert_eq!(s.re, 0.0, "unexpected energy at sample {}", i);
        }
    }
}

/// S4: feedback round-trip. The served TX burst is the tail of the next
/// transmitted frame with its timestamp advanced accordingly, followed by
/// the time-matched RX capture.
#[test]
fn feedback_round_trip_serves_matched_bursts() {
    const PORT: u16 = 38471;
    const NUM: u32 = 4096;
    const FRAME_LEN: usize = 8192;

    let sim = SimDevice::new(32_768_000.0);
    sim.set_rx_samples(vec![IQSample::new(0.5, -0.5); 16]);
    let server = FeedbackServer::start(Arc::new(sim.clone()), PORT, RATE);

    let client = thread::spawn(move || -> std::io::Result<Vec<u8>> {
        // Retry until the listener is up.
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut sock = loop {
            match TcpStream::connect(("127.0.0.1", PORT)) {
                Ok(sock) => break sock,
                Err(e) if Instant::now() > deadline => return Err(e),
                Err(_) => thread::sleep(Duration::from_millis(50)),
            }
        };
        sock.write_all(&[1u8])?;
        sock.write_all(&NUM.to_ne_bytes())?;

        let mut reply = vec![0u8; 4 + 4 + 4 + NUM as usize * 8 + 4 + 4 + NUM as usize * 8];
        sock.read_exact(&mut reply)?;
        Ok(reply)
    });

    // Keep offering frames until the client is done, like the transmitter
    // does for every frame it queues. The samples ramp so the captured tail
    // is recognisable.
    let frame: Vec<IQSample> = (0..FRAME_LEN).map(|i| IQSample::new(i as f32, 0.0)).collect();
    let ts = FrameTimestamp::new(100, 0);
    while !client.is_finished() {
        server.set_tx_frame(&frame, &ts);
        thread::sleep(Duration::from_millis(10));
    }
    let reply = client.join().unwrap().unwrap();
    server.stop();

    let u32_at = |o: usize| u32::from_ne_bytes(reply[o..o + 4].try_into().unwrap());
    let f32_at = |o: usize| f32::from_ne_bytes(reply[o..o + 4].try_into().unwrap());

    assert_eq!(u32_at(0), NUM);
    // 4096 skipped samples at 2.048 MS/s are 32 768 ticks.
    assert_eq!(u32_at(4), 100);
    assert_eq!(u32_at(8), 32_768);

    // TX payload is the trailing half of the ramp.
    let tx_base = 12;
    assert_eq!(f32_at(tx_base), 4096.0);
    assert_eq!(f32_at(tx_base + (NUM as usize - 1) * 8), 8191.0);

    // RX header mirrors the adjusted request time, RX payload is the sim's
    // loopback pattern.
    let rx_base = tx_base + NUM as usize * 8;
    assert_eq!(u32_at(rx_base), 100);
    assert_eq!(u32_at(rx_base + 4), 32_768);
    assert_eq!(f32_at(rx_base + 8), 0.5);
    assert_eq!(f32_at(rx_base + 12), -0.5);
}

/// S5: after an underflow the transmitter refills the queue completely
/// before resuming, and frame order is preserved.
#[test]
fn underflow_reengages_prebuffering() {
    let sim = SimDevice::new(32_768_000.0);
    let tx = Transmitter::new(base_config(DabMode::Mode2), Arc::new(sim.clone())).unwrap();
    let len = 256usize;
    let mut tag = 0.0f32;
    let mut push = |tx: &Transmitter, n: usize| {
        for _ in 0..n {
            tx.process(tagged_frame(tag, len, FrameTimestamp::invalid())).unwrap();
            tag += 1.0;
        }
    };

    // Cold start: nothing goes out until the queue is full once.
    push(&tx, MAX_DEPTH);
    wait_for("cold-start frames", Duration::from_secs(5), || {
        sim.sent_bursts().len() >= MAX_DEPTH
    });

    // A stall in the modulator shows up as an underflow event.
    sim.push_event(AsyncEvent::Underflow);
    wait_for("underflow counted", Duration::from_secs(5), || {
        tx.counters().underflows() == 1
    });

    // The next frame is already being waited for with the old prebuffer;
    // after it, the transmitter demands a full queue again.
    push(&tx, 1);
    wait_for("post-underflow frame", Duration::from_secs(5), || {
        sim.sent_bursts().len() >= MAX_DEPTH + 1
    });

    push(&tx, MAX_DEPTH - 1);
    thread::sleep(Duration::from_millis(300));
    assert_eq!(
        sim.sent_bursts().len(),
        MAX_DEPTH + 1,
        "transmitter resumed before the queue was full"
    );

    push(&tx, 1);
    wait_for("resumed frames", Duration::from_secs(5), || {
        sim.sent_bursts().len() >= 2 * MAX_DEPTH + 1
    });
    tx.stop();

    // No reordering across the stall.
    for (i, burst) in sim.sent_bursts().iter().enumerate() {
        assert_eq!(burst.samples[0].re, i as f32, "burst {} out of order", i);
    }
}

/// S6: losing the GPS time lock beyond the holdover budget is fatal.
#[test]
fn gps_holdover_budget_is_fatal() {
    let sim = SimDevice::new(32_768_000.0);
    sim.set_sensor("gps_timelock", true);
    let config = OutputConfig {
        refclk_source: RefClockSource::Gpsdo,
        max_gps_holdover_time: 1,
        gps_check_interval: 1,
        ..base_config(DabMode::Mode2)
    };
    let tx = Transmitter::new(config, Arc::new(sim.clone())).unwrap();

    // The gate passes while the fix is present.
    tx.process(tagged_frame(0.0, 64, FrameTimestamp::invalid())).unwrap();
    assert!(!tx.is_muting());

    sim.set_sensor("gps_timelock", false);

    let deadline = Instant::now() + Duration::from_secs(10);
    let error = loop {
        assert!(Instant::now() < deadline, "holdover limit never enforced");
        match tx.process(tagged_frame(0.0, 64, FrameTimestamp::invalid())) {
            Ok(()) => thread::sleep(Duration::from_millis(50)),
            Err(e) => break e,
        }
    };
    assert!(matches!(error, SdrError::ClockLost(_)), "unexpected error {:?}", error);
}
