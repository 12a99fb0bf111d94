//! Per-thread CPU clocks
//!
//! On Linux each thread exposes its CPU clock through
//! `pthread_getcpuclockid`, which another thread may read while the owner is
//! alive. Elsewhere the clock falls back to wall time since attachment.

use std::time::Duration;

/// CPU clock of one thread, readable from any thread while it is alive
#[derive(Debug, Clone, Copy)]
pub struct CpuClock {
    #[cfg(target_os = "linux")]
    id: libc::clockid_t,
    #[cfg(not(target_os = "linux"))]
    started: std::time::Instant,
}

impl CpuClock {
    /// Clock of the calling thread
    #[cfg(target_os = "linux")]
    pub fn current() -> Option<Self> {
        let mut id: libc::clockid_t = 0;
        // SAFETY: pthread_self is always valid for the calling thread and
        // `id` is a valid out pointer
        let rc = unsafe { libc::pthread_getcpuclockid(libc::pthread_self(), &mut id) };
        (rc == 0).then_some(Self { id })
    }

    #[cfg(not(target_os = "linux"))]
    pub fn current() -> Option<Self> {
        Some(Self {
            started: std::time::Instant::now(),
        })
    }

    /// CPU time consumed so far; the owning thread must still be alive
    #[cfg(target_os = "linux")]
    pub fn elapsed(&self) -> Duration {
        read_clock(self.id)
    }

    #[cfg(not(target_os = "linux"))]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

#[cfg(target_os = "linux")]
fn read_clock(id: libc::clockid_t) -> Duration {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid out pointer; an invalid clock id yields EINVAL
    let rc = unsafe { libc::clock_gettime(id, &mut ts) };
    if rc != 0 {
        return Duration::ZERO;
    }
    Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32)
}
