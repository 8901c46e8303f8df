//! The CPU cycle counter, the sole timekeeping source in the hot paths.
//!
//! Senders busy-wait on `rdtsc()` comparisons because the pacing precision
//! sits below OS sleep granularity; receivers spin on it for their
//! deadline. Dividing by [`tsc_hz`] converts cycle counts to seconds.
//!
//! On non-x86 targets the "cycle counter" degrades to nanoseconds from a
//! monotonic clock with an hz of 1e9, which keeps the arithmetic identical.

use std::sync::OnceLock;
use std::time::Instant;

#[cfg(not(target_arch = "x86_64"))]
static CLOCK_EPOCH: OnceLock<Instant> = OnceLock::new();

static TSC_HZ: OnceLock<u64> = OnceLock::new();

/// Read the cycle counter.
#[cfg(target_arch = "x86_64")]
#[inline(always)]
pub fn rdtsc() -> u64 {
    // Safe on every x86_64 the tester targets; constant_tsc is assumed, as
    // it is for any TSC-paced load generator
    unsafe { core::arch::x86_64::_rdtsc() }
}

/// Read the cycle counter (monotonic-clock fallback).
#[cfg(not(target_arch = "x86_64"))]
#[inline(always)]
pub fn rdtsc() -> u64 {
    let epoch = CLOCK_EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_nanos() as u64
}

/// Cycle-counter frequency in Hz, calibrated once against the monotonic
/// clock. The calibration sleeps briefly; call it before spawning workers,
/// never from a hot loop.
pub fn tsc_hz() -> u64 {
    *TSC_HZ.get_or_init(calibrate)
}

#[cfg(target_arch = "x86_64")]
fn calibrate() -> u64 {
    let wall_start = Instant::now();
    let tsc_start = rdtsc();
    std::thread::sleep(std::time::Duration::from_millis(100));
    let tsc_end = rdtsc();
    let elapsed = wall_start.elapsed();

    let hz = (tsc_end - tsc_start) as f64 / elapsed.as_secs_f64();
    hz as u64
}

#[cfg(not(target_arch = "x86_64"))]
fn calibrate() -> u64 {
    1_000_000_000
}
