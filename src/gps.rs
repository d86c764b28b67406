//! GPS fix supervision for GPSDO-referenced transmitters.
//!
//! An SFN transmitter must not free-run for long once its GPSDO loses the
//! satellite fix: the oscillator drifts and the emitted frames slide away
//! from the other transmitters in the network. The supervisor polls the
//! GPSDO's lock sensor from within the frame loop, but because a sensor
//! read can take long enough to stall transmission it runs each read on a
//! short-lived worker thread, alternating between launching a check and
//! collecting its result on half the configured interval.

use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::device::{SdrDevice, SdrError, SdrResult};

/// How long the transmitter waits for the first fix before giving up.
pub const INITIAL_FIX_WAIT: Duration = Duration::from_secs(30);

/// Sensor name of the ODR LEA-M8F board GPSDO.
const SENSOR_TIMELOCK: &str = "gps_timelock";

/// Sensor name of the Ettus GPSDO.
const SENSOR_LOCKED: &str = "gps_locked";

struct PendingCheck {
    result: mpsc::Receiver<bool>,
    handle: JoinHandle<()>,
}

/// Watches the GPS time lock and enforces the holdover budget.
pub struct GpsFixSupervisor {
    device: Arc<dyn SdrDevice>,
    sensor: &'static str,
    check_interval: Duration,
    max_holdover: Duration,
    initial_fix_wait: Duration,
    first_check: Option<Instant>,
    last_check: Option<Instant>,
    pending: Option<PendingCheck>,
    checks_without_fix: u32,
}

impl GpsFixSupervisor {
    /// Create a supervisor for the given device.
    ///
    /// `ettus_gpsdo` selects the `gps_locked` sensor instead of
    /// `gps_timelock`.
    pub fn new(
        device: Arc<dyn SdrDevice>,
        ettus_gpsdo: bool,
        check_interval: Duration,
        max_holdover: Duration,
    ) -> Self {
        Self {
            device,
            sensor: if ettus_gpsdo { SENSOR_LOCKED } else { SENSOR_TIMELOCK },
            check_interval,
            max_holdover,
            initial_fix_wait: INITIAL_FIX_WAIT,
            first_check: None,
            last_check: None,
            pending: None,
            checks_without_fix: 0,
        }
    }

    /// Shorten the initial fix window, for tests that compress time.
    pub fn set_initial_fix_wait(&mut self, wait: Duration) {
        self.initial_fix_wait = wait;
    }

    /// Startup gate: poll the sensor synchronously until the fix appears.
    ///
    /// Returns `Ok(true)` once locked. Returns `Ok(false)` while still
    /// waiting inside the initial window; the caller paces the retries.
    /// Fails once the window has elapsed without a fix.
    pub fn initial_check(&mut self) -> SdrResult<bool> {
        let now = Instant::now();
        let first = *self.first_check.get_or_insert_with(|| {
            info!("waiting for GPS fix");
            now
        });

        if read_sensor(self.device.as_ref(), self.sensor) {
            self.checks_without_fix = 0;
            info!("GPS fix acquired");
            return Ok(true);
        }

        if now.duration_since(first) > self.initial_fix_wait {
            return Err(SdrError::ClockLost(format!(
                "GPS did not show time lock in {} seconds",
                self.initial_fix_wait.as_secs()
            )));
        }
        Ok(false)
    }

    /// Periodic supervision, called once per transmitted frame.
    ///
    /// Alternates between launching a sensor check on a worker thread and
    /// collecting its result, each on half the configured interval. Fails
    /// once the accumulated holdover exceeds the budget.
    pub fn check(&mut self) -> SdrResult<()> {
        let now = Instant::now();
        if let Some(last) = self.last_check {
            if now.duration_since(last) < self.check_interval / 2 {
                return Ok(());
            }
        }
        self.last_check = Some(now);

        match self.pending.take() {
            Some(pending) => {
                let locked = pending.result.recv().unwrap_or(false);
                let _ = pending.handle.join();

                if locked {
                    if self.checks_without_fix > 0 {
                        info!("GPS time lock recovered");
                    }
                    self.checks_without_fix = 0;
                } else {
                    if self.checks_without_fix == 0 {
                        error!("GPS time lock lost");
                    }
                    self.checks_without_fix += 1;

                    let holdover = self.check_interval * self.checks_without_fix;
                    if holdover > self.max_holdover {
                        return Err(SdrError::ClockLost(format!(
                            "lost GPS time lock for {} seconds",
                            holdover.as_secs()
                        )));
                    }
                }
            }
            None => {
                // The sensor read can be slow, so it runs off-thread; the
                // result is collected on the next half-interval tick.
                let device = Arc::clone(&self.device);
                let sensor = self.sensor;
                let (tx, rx) = mpsc::channel();
                let handle = thread::Builder::new()
                    .name("gps-fix-check".to_string())
                    .spawn(move || {
                        let _ = tx.send(read_sensor(device.as_ref(), sensor));
                    })
                    .map_err(|e| SdrError::HardwareError(format!("spawn gps check: {}", e)))?;
                self.pending = Some(PendingCheck { result: rx, handle });
            }
        }
        Ok(())
    }
}

fn read_sensor(device: &dyn SdrDevice, sensor: &str) -> bool {
    match device.sensor_bool(sensor) {
        Ok(locked) => locked,
        Err(e) => {
            warn!(sensor, error = %e, "GPS sensor read failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimDevice;

    fn supervisor(sim: &SimDevice, interval_ms: u64, holdover_ms: u64) -> GpsFixSupervisor {
        GpsFixSupervisor::new(
            Arc::new(sim.clone()),
            false,
            Duration::from_millis(interval_ms),
            Duration::from_millis(holdover_ms),
        )
    }

    #[test]
    fn test_initial_check_locks_immediately() {
        let sim = SimDevice::new(32_768_000.0);
        sim.set_sensor("gps_timelock", true);
        let mut gps = supervisor(&sim, 100, 1000);
        assert!(gps.initial_check().unwrap());
    }

    #[test]
    fn test_initial_check_times_out() {
        let sim = SimDevice::new(32_768_000.0);
        sim.set_sensor("gps_timelock", false);
        let mut gps = supervisor(&sim, 100, 1000);
        gps.set_initial_fix_wait(Duration::from_millis(50));
        assert!(!gps.initial_check().unwrap());
        thread::sleep(Duration::from_millis(80));
        assert!(matches!(gps.initial_check(), Err(SdrError::ClockLost(_))));
    }

    #[test]
    fn test_holdover_budget_enforced() {
        let sim = SimDevice::new(32_768_000.0);
        sim.set_sensor("gps_timelock", false);
        // 40 ms interval, 100 ms budget: the third failed collection
        // (3 × 40 ms = 120 ms of holdover) must be fatal.
        let mut gps = supervisor(&sim, 40, 100);
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut failed = false;
        while Instant::now() < deadline {
            if gps.check().is_err() {
                failed = true;
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert!(failed, "holdover budget was never enforced");
    }

    #[test]
    fn test_recovery_resets_budget() {
        let sim = SimDevice::new(32_768_000.0);
        sim.set_sensor("gps_timelock", false);
        let mut gps = supervisor(&sim, 40, 10_000);

        // Let a couple of failed checks accumulate.
        for _ in 0..6 {
            gps.check().unwrap();
            thread::sleep(Duration::from_millis(25));
        }
        assert!(gps.checks_without_fix > 0);

        sim.set_sensor("gps_timelock", true);
        let deadline = Instant::now() + Duration::from_secs(5);
        while gps.checks_without_fix > 0 && Instant::now() < deadline {
            gps.check().unwrap();
            thread::sleep(Duration::from_millis(25));
        }
        assert_eq!(gps.checks_without_fix, 0);
    }

    #[test]
    fn test_ettus_sensor_selection() {
        let sim = SimDevice::new(32_768_000.0);
        sim.set_sensor("gps_locked", true);
        sim.set_sensor("gps_timelock", false);
        let mut gps = GpsFixSupervisor::new(
            Arc::new(sim.clone()),
            true,
            Duration::from_millis(100),
            Duration::from_secs(1),
        );
        assert!(gps.initial_check().unwrap());
    }
}
