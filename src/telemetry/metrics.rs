//! Batch-duration metrics (feature `telemetry`).

use hdrhistogram::Histogram;
use parking_lot::Mutex;
use std::sync::OnceLock;

/// Histogram of batch run times in microseconds.
pub struct BatchMetrics {
    durations: Mutex<Histogram<u64>>,
}

impl BatchMetrics {
    fn new() -> Self {
        // 1 us .. 60 s, 3 significant digits
        let histogram = Histogram::new_with_bounds(1, 60_000_000, 3)
            .expect("histogram bounds are static and valid");
        Self {
            durations: Mutex::new(histogram),
        }
    }

    pub(crate) fn record(&self, micros: u64) {
        let _ = self.durations.lock().record(micros.max(1));
    }

    /// Number of recorded batches.
    pub fn count(&self) -> u64 {
        self.durations.lock().len()
    }

    /// A duration percentile in microseconds, e.g. `percentile(99.0)`.
    pub fn percentile(&self, q: f64) -> u64 {
        self.durations.lock().value_at_quantile(q / 100.0)
    }

    pub fn mean(&self) -> f64 {
        self.durations.lock().mean()
    }

    pub fn reset(&self) {
        self.durations.lock().reset();
    }
}

impl std::fmt::Debug for BatchMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchMetrics")
            .field("count", &self.count())
            .finish()
    }
}

static BATCH_METRICS: OnceLock<BatchMetrics> = OnceLock::new();

/// Global batch metrics instance.
pub fn batch_metrics() -> &'static BatchMetrics {
    BATCH_METRICS.get_or_init(BatchMetrics::new)
}
