//! Cycle counter and its frequency.
//!
//! On x86_64 this reads the TSC, calibrated once against the monotonic clock.
//! Elsewhere the "cycles" are nanoseconds since a process-wide epoch and the
//! frequency is 1 GHz.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

use tracing::info;

#[cfg(target_arch = "x86_64")]
use std::arch::x86_64::_rdtsc;

#[cfg(target_arch = "x86_64")]
const CALIBRATION: Duration = Duration::from_millis(20);

#[derive(Copy, Clone, Debug)]
pub struct Clock {
    hz: f64,
}

static GLOBAL: OnceLock<Clock> = OnceLock::new();
#[cfg(not(target_arch = "x86_64"))]
static EPOCH: OnceLock<Instant> = OnceLock::new();

impl Clock {
    /// The process-wide clock, calibrated on first use.
    pub fn global() -> Clock {
        *GLOBAL.get_or_init(|| {
            let clock = Clock::calibrate();
            info!(hz = clock.hz, "cycle counter calibrated");
            clock
        })
    }

    #[cfg(target_arch = "x86_64")]
    #[inline(always)]
    pub fn now() -> u64 {
        // SAFETY: rdtsc has no preconditions on x86_64.
        unsafe { _rdtsc() }
    }

    #[cfg(not(target_arch = "x86_64"))]
    #[inline(always)]
    pub fn now() -> u64 {
        EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
    }

    pub fn hz(&self) -> f64 {
        self.hz
    }

    #[cfg(target_arch = "x86_64")]
    fn calibrate() -> Clock {
        let wall = Instant::now();
        let start = Self::now();
        while wall.elapsed() < CALIBRATION {
            std::hint::spin_loop();
        }
        let cycles = Self::now().wrapping_sub(start);
        let secs = wall.elapsed().as_secs_f64();
        Clock {
            hz: (cycles as f64 / secs).max(1.0),
        }
    }

    #[cfg(not(target_arch = "x86_64"))]
    fn calibrate() -> Clock {
        let _ = EPOCH.get_or_init(Instant::now);
        Clock { hz: 1e9 }
    }
}
