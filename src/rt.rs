//! Real-time scheduling for the transmit thread.
//!
//! The transmit loop competes with the modulator and the predistorter
//! workers for CPU time, but it is the only thread with a hard deadline
//! every frame. On Linux it is moved onto the SCHED_FIFO scheduler;
//! elsewhere the request is a no-op.

/// Put the calling thread on the real-time FIFO scheduler.
///
/// Requires CAP_SYS_NICE (or root) on Linux; failure is reported so the
/// caller can log it and continue with normal scheduling.
#[cfg(target_os = "linux")]
pub fn set_realtime_priority(priority: i32) -> Result<(), std::io::Error> {
    unsafe {
        let mut param: libc::sched_param = std::mem::zeroed();
        param.sched_priority = priority.clamp(1, 99);
        if libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn set_realtime_priority(_priority: i32) -> Result<(), std::io::Error> {
    tracing::debug!("real-time priority not supported on this platform");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_does_not_panic() {
        // Without CAP_SYS_NICE the request is allowed to fail, but it must
        // never panic or corrupt the thread.
        let _ = set_realtime_priority(1);
    }
}
