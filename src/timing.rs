//! TSC sampling and one-shot frequency calibration.

use std::time::{Duration, Instant};

/// Read the timestamp counter.
#[inline]
pub fn rdtsc() -> u64 {
    #[cfg(target_arch = "x86_64")]
    {
        unsafe { std::arch::x86_64::_rdtsc() }
    }
    #[cfg(not(target_arch = "x86_64"))]
    {
        use std::sync::OnceLock;
        static START: OnceLock<Instant> = OnceLock::new();
        let start = START.get_or_init(Instant::now);
        start.elapsed().as_nanos() as u64
    }
}

/// Duration of the calibration sample.
const MEASURE_INTERVAL: Duration = Duration::from_millis(10);

/// Measure the TSC frequency in GHz by sampling the counter against the
/// monotonic clock. Expensive; the Nexus does this once at construction
/// and caches the result.
pub fn measure_rdtsc_freq() -> f64 {
    let start = Instant::now();
    let tsc_start = rdtsc();

    while start.elapsed() < MEASURE_INTERVAL {
        std::hint::spin_loop();
    }

    let cycles = rdtsc().wrapping_sub(tsc_start);
    let freq_ghz = cycles as f64 / start.elapsed().as_nanos() as f64;

    // The non-x86 fallback counts nanoseconds and lands at exactly 1.0.
    assert!(
        (0.1..=10.0).contains(&freq_ghz),
        "unreasonable TSC frequency: {} GHz",
        freq_ghz
    );
    freq_ghz
}

/// Convert a TSC delta to seconds.
#[inline]
pub fn to_sec(cycles: u64, freq_ghz: f64) -> f64 {
    cycles as f64 / (freq_ghz * 1e9)
}

/// Convert a TSC delta to microseconds.
#[inline]
pub fn to_usec(cycles: u64, freq_ghz: f64) -> f64 {
    cycles as f64 / (freq_ghz * 1e3)
}

/// Convert a TSC delta to milliseconds.
#[inline]
pub fn to_msec(cycles: u64, freq_ghz: f64) -> f64 {
    cycles as f64 / (freq_ghz * 1e6)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rdtsc_monotonic() {
        let a = rdtsc();
        let b = rdtsc();
        assert!(b >= a);
    }

    #[test]
    fn test_measure_freq_sane() {
        let freq = measure_rdtsc_freq();
        assert!(freq > 0.1 && freq < 10.0, "freq = {}", freq);
    }

    #[test]
    fn test_conversions() {
        // 2 GHz: 2e9 cycles per second.
        let freq = 2.0;
        assert_eq!(to_sec(2_000_000_000, freq), 1.0);
        assert_eq!(to_usec(2_000, freq), 1.0);
        assert_eq!(to_msec(2_000_000, freq), 1.0);
    }
}
