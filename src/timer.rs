//! Monotone wall-clock with the best resolution the platform offers.
//!
//! The source is selected at build time: with the `tsc-timer` feature the
//! hardware cycle counter divided by the CPU frequency from
//! `/proc/cpuinfo`, otherwise `CLOCK_MONOTONIC` on unix, and a portable
//! `Instant` fallback elsewhere. Readings are monotone within one
//! process; they are not comparable across processes.

use std::time::Instant;

/// Reads seconds as a double from a per-process origin.
#[derive(Debug, Clone, Copy)]
pub struct Timer {
    source: Source,
    frequency: Option<f64>,
}

#[derive(Debug, Clone, Copy)]
#[allow(dead_code)]
enum Source {
    /// Hardware cycle counter scaled by the measured CPU frequency.
    /// Assumes an invariant TSC.
    ///
    /// The raw counter is used unshifted: like `CLOCK_MONOTONIC` it
    /// counts from boot, which keeps persisted start times meaningful to
    /// a later process on the same node.
    #[cfg(all(feature = "tsc-timer", target_os = "linux", any(target_arch = "x86", target_arch = "x86_64")))]
    Cycle { seconds_per_cycle: f64 },

    /// `clock_gettime(CLOCK_MONOTONIC)`.
    #[cfg(unix)]
    Monotonic,

    /// `std::time::Instant`, for targets with neither of the above.
    Portable { origin: Instant },
}

impl Timer {
    pub fn new() -> Timer {
        let frequency = core_frequency_hz();
        Timer {
            source: pick_source(frequency),
            frequency,
        }
    }

    /// Current time in seconds since an arbitrary per-process origin.
    pub fn now(&self) -> f64 {
        match self.source {
            #[cfg(all(feature = "tsc-timer", target_os = "linux", any(target_arch = "x86", target_arch = "x86_64")))]
            Source::Cycle { seconds_per_cycle } => {
                let cycles = unsafe { x86::time::rdtsc() };
                cycles as f64 * seconds_per_cycle
            }
            #[cfg(unix)]
            Source::Monotonic => monotonic_seconds(),
            Source::Portable { origin } => origin.elapsed().as_secs_f64(),
        }
    }

    /// The core clock frequency in Hz, when it could be measured.
    ///
    /// Shared with the HWPC layer for the peak-FLOPS constant.
    pub fn core_frequency(&self) -> Option<f64> {
        self.frequency
    }
}

impl Default for Timer {
    fn default() -> Timer {
        Timer::new()
    }
}

#[cfg(all(feature = "tsc-timer", target_os = "linux", any(target_arch = "x86", target_arch = "x86_64")))]
fn pick_source(frequency: Option<f64>) -> Source {
    match frequency {
        Some(hz) => Source::Cycle {
            seconds_per_cycle: 1.0 / hz,
        },
        None => Source::Monotonic,
    }
}

#[cfg(all(
    unix,
    not(all(feature = "tsc-timer", target_os = "linux", any(target_arch = "x86", target_arch = "x86_64")))
))]
fn pick_source(_frequency: Option<f64>) -> Source {
    Source::Monotonic
}

#[cfg(not(unix))]
fn pick_source(_frequency: Option<f64>) -> Source {
    Source::Portable {
        origin: Instant::now(),
    }
}

#[cfg(unix)]
fn monotonic_seconds() -> f64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // Cannot fail for CLOCK_MONOTONIC on any supported target.
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as f64 + ts.tv_nsec as f64 * 1.0e-9
}

/// The core clock in Hz, parsed once from `/proc/cpuinfo`.
#[cfg(target_os = "linux")]
pub(crate) fn core_frequency_hz() -> Option<f64> {
    let text = std::fs::read_to_string("/proc/cpuinfo").ok()?;
    for line in text.lines() {
        if line.starts_with("cpu MHz") {
            if let Some(value) = line.split(':').nth(1) {
                if let Ok(mhz) = value.trim().parse::<f64>() {
                    if mhz > 0.0 {
                        return Some(mhz * 1.0e6);
                    }
                }
            }
        }
    }
    None
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn core_frequency_hz() -> Option<f64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readings_are_monotone() {
        let timer = Timer::new();
        let mut last = timer.now();
        for _ in 0..1000 {
            let t = timer.now();
            assert!(t >= last);
            last = t;
        }
    }

    #[test]
    fn elapsed_time_is_plausible() {
        let timer = Timer::new();
        let before = timer.now();
        std::thread::sleep(std::time::Duration::from_millis(20));
        let after = timer.now();
        assert!(after - before >= 0.015, "elapsed {}", after - before);
        assert!(after - before < 5.0, "elapsed {}", after - before);
    }
}
