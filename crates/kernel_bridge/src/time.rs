//! Monotonic clock and small saturating-arithmetic helpers shared by the
//! virtual-time engine and the priority-cpu tracker.

use std::sync::OnceLock;
use std::time::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Nanoseconds since an arbitrary, process-local epoch established on first
/// call. Only differences between two calls are meaningful.
#[must_use]
pub fn now_ns() -> u64 {
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_nanos() as u64
}

/// `a - b`, clamped to zero instead of wrapping or panicking.
#[must_use]
pub const fn saturating_sub(a: u64, b: u64) -> u64 {
    if a > b {
        a - b
    } else {
        0
    }
}

/// Updates a running average with a new sample using a 3/4-1/4 exponential
/// blend, matching the smoothing used for the voluntary-context-switch
/// rate: `avg' = (avg * 3 + sample) / 4`.
#[must_use]
pub const fn calc_avg(old_avg: u64, sample: u64) -> u64 {
    (old_avg * 3 + sample) / 4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saturating_sub_never_underflows() {
        assert_eq!(saturating_sub(5, 10), 0);
        assert_eq!(saturating_sub(10, 5), 5);
        assert_eq!(saturating_sub(5, 5), 0);
    }

    #[test]
    fn calc_avg_converges_toward_sample() {
        let mut avg = 0u64;
        for _ in 0..100 {
            avg = calc_avg(avg, 100);
        }
        assert!(avg > 90, "avg should converge close to the steady sample, got {avg}");
    }

    #[test]
    fn now_ns_is_monotonic() {
        let a = now_ns();
        let b = now_ns();
        assert!(b >= a);
    }
}
