//! Shared batch-time estimate.
//!
//! One estimate record is shared by all batches of a compaction run. It
//! is written as a whole record swap and read without coordination: a
//! lost update is benign because the next batch corrects it, and stale
//! writers are rejected by stamp.

use crossbeam_utils::atomic::AtomicCell;
use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of the most recently accepted batch measurement. `lo_us` and
/// `hi_us` are the 75% / 125% band around the recorded per-thunk
/// average; measurements drifting outside the band displace the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Estimate {
    pub total_us: u64,
    pub count: u64,
    pub lo_us: u64,
    pub hi_us: u64,
    pub stamp: u64,
}

impl Estimate {
    fn record(total_us: u64, count: u64, stamp: u64) -> Self {
        let count = count.max(1);
        let avg = total_us / count;
        Self {
            total_us,
            count,
            lo_us: avg * 3 / 4,
            hi_us: avg * 5 / 4,
            stamp,
        }
    }
}

pub(crate) struct SharedEstimate {
    cell: AtomicCell<Option<Estimate>>,
    stamps: AtomicU64,
}

impl SharedEstimate {
    pub fn new() -> Self {
        Self {
            cell: AtomicCell::new(None),
            stamps: AtomicU64::new(0),
        }
    }

    /// Bootstrap from a caller-supplied expected thunk count. The record
    /// spreads the full target over `count` thunks, so the first
    /// suggestion is exactly `count`.
    pub fn seed(&self, target_us: u64, count: u64) {
        let count = count.max(1);
        let avg = target_us / count;
        self.cell.store(Some(Estimate {
            total_us: target_us.max(1),
            count,
            lo_us: avg * 3 / 4,
            hi_us: avg * 5 / 4,
            stamp: 0,
        }));
    }

    /// Stamps issued to batches start at 1; the seed's stamp 0 always
    /// loses to a real measurement.
    pub fn next_stamp(&self) -> u64 {
        self.stamps.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn load(&self) -> Option<Estimate> {
        self.cell.load()
    }

    /// Offer a measurement: a batch of `count` thunks ran in `time_us`.
    ///
    /// Accepted when it moves the total strictly closer to the target by
    /// more than a tenth of the recorded total, or when the per-thunk
    /// average drifts outside the recorded band. Stale stamps are
    /// discarded. Priming relaxes the rule: sub-5ms records are always
    /// displaced, and a size moving the right way at an unchanged total
    /// is accepted. Returns whether the measurement was recorded.
    pub fn update(&self, target_us: u64, time_us: u64, count: u64, stamp: u64, priming: bool) -> bool {
        let accept = match self.cell.load() {
            None => true,
            Some(cur) if stamp < cur.stamp => false,
            Some(cur) => {
                let closer = target_us.abs_diff(time_us) < target_us.abs_diff(cur.total_us)
                    && time_us.abs_diff(cur.total_us) > cur.total_us / 10;
                let avg = time_us / count.max(1);
                let drifted = avg < cur.lo_us || avg > cur.hi_us;
                let mut accept = closer || drifted;
                if priming && !accept {
                    let tiny = cur.total_us < 5_000;
                    let unchanged = time_us.abs_diff(cur.total_us) <= cur.total_us / 10;
                    let right_way = (cur.total_us <= target_us && count > cur.count)
                        || (cur.total_us > target_us && count < cur.count);
                    accept = tiny || (unchanged && right_way);
                }
                accept
            }
        };
        if accept {
            self.cell.store(Some(Estimate::record(time_us, count, stamp)));
        }
        accept
    }

    /// Batch size for the next group, geometric while far from the
    /// target, proportional once the scale factor would overshoot.
    /// Always at least 1. `None` until something is recorded.
    pub fn suggested(&self, target_us: u64, scale_up: u64, scale_down: u64) -> Option<usize> {
        let e = self.load()?;
        let total = e.total_us.max(1);
        let n = e.count.max(1);
        let up = scale_up.max(1);
        let down = scale_down.max(1);

        let size = if total > target_us {
            if total / down >= target_us {
                n / down
            } else {
                div_ceil(target_us * n, total)
            }
        } else if total.saturating_mul(up) <= target_us {
            n.saturating_mul(up)
        } else {
            div_ceil(target_us * n, total)
        };
        Some(size.max(1) as usize)
    }
}

fn div_ceil(a: u64, b: u64) -> u64 {
    (a + b - 1) / b
}

#[cfg(test)]
mod tests {
    use super::*;

    const TARGET: u64 = 10_000; // 10 ms

    #[test]
    fn test_first_measurement_is_recorded() {
        let shared = SharedEstimate::new();
        assert!(shared.update(TARGET, 500, 1, 1, false));
        let e = shared.load().unwrap();
        assert_eq!(e.total_us, 500);
        assert_eq!(e.count, 1);
        assert_eq!(e.stamp, 1);
    }

    #[test]
    fn test_stale_stamp_is_discarded() {
        let shared = SharedEstimate::new();
        assert!(shared.update(TARGET, 500, 1, 5, false));
        assert!(!shared.update(TARGET, 9_999, 10, 3, false));
        assert_eq!(shared.load().unwrap().total_us, 500);
    }

    #[test]
    fn test_closer_to_target_is_recorded() {
        let shared = SharedEstimate::new();
        shared.update(TARGET, 500, 1, 1, false);
        // 8ms is much closer to 10ms than 0.5ms was
        assert!(shared.update(TARGET, 8_000, 16, 2, false));
        assert_eq!(shared.load().unwrap().total_us, 8_000);
    }

    #[test]
    fn test_within_band_not_closer_is_skipped() {
        let shared = SharedEstimate::new();
        shared.update(TARGET, 8_000, 16, 1, false);
        // same average per thunk, no improvement on the target gap
        assert!(!shared.update(TARGET, 8_100, 16, 2, false));
        assert_eq!(shared.load().unwrap().total_us, 8_000);
    }

    #[test]
    fn test_band_drift_is_recorded() {
        let shared = SharedEstimate::new();
        shared.update(TARGET, 8_000, 16, 1, false);
        // per-thunk average doubles: outside the 125% band
        assert!(shared.update(TARGET, 8_000, 8, 2, false));
        assert_eq!(shared.load().unwrap().count, 8);
    }

    #[test]
    fn test_priming_accepts_tiny_totals() {
        let shared = SharedEstimate::new();
        shared.update(TARGET, 400, 2, 1, false);
        // within band, not closer, but the stored total is under 5 ms
        assert!(shared.update(TARGET, 410, 2, 2, true));
    }

    #[test]
    fn test_suggested_scales_geometrically_when_far() {
        let shared = SharedEstimate::new();
        shared.update(TARGET, 1_000, 4, 1, false);
        // 1ms * 2 is still under 10ms: double the count
        assert_eq!(shared.suggested(TARGET, 2, 2), Some(8));
    }

    #[test]
    fn test_suggested_is_proportional_when_close() {
        let shared = SharedEstimate::new();
        shared.update(TARGET, 6_000, 6, 1, false);
        // doubling would overshoot: 10ms * 6 / 6ms = 10
        assert_eq!(shared.suggested(TARGET, 2, 2), Some(10));
    }

    #[test]
    fn test_suggested_shrinks_when_over() {
        let shared = SharedEstimate::new();
        shared.update(TARGET, 40_000, 40, 1, false);
        // 40ms / 2 is still over 10ms: halve the count
        assert_eq!(shared.suggested(TARGET, 2, 2), Some(20));
    }

    #[test]
    fn test_suggested_floors_at_one() {
        let shared = SharedEstimate::new();
        shared.update(TARGET, 1_000_000, 1, 1, false);
        assert_eq!(shared.suggested(TARGET, 2, 2), Some(1));
    }

    #[test]
    fn test_seed_suggests_exactly_the_hint() {
        let shared = SharedEstimate::new();
        shared.seed(TARGET, 12);
        assert_eq!(shared.suggested(TARGET, 2, 2), Some(12));
    }

    #[test]
    fn test_real_measurement_displaces_seed() {
        let shared = SharedEstimate::new();
        shared.seed(TARGET, 12);
        let stamp = shared.next_stamp();
        assert!(shared.update(TARGET, 2_000, 12, stamp, false));
        assert_eq!(shared.load().unwrap().total_us, 2_000);
    }
}
