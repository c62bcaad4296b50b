use hdrhistogram::Histogram;
use parking_lot::Mutex;
use serde::Serialize;

/// HdrHistogram range: 1 μs → 10 min, 3 significant figures
const HIST_LOW: u64 = 1;
const HIST_HIGH: u64 = 600_000_000;
const HIST_SIGFIG: u8 = 3;

/// Percentile breakdown of dispatcher response times, in microseconds.
/// Shipped with every harvest and every live snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct PercentileSet {
    pub min: u64,
    pub max: u64,
    pub mean: f64,
    pub p50: u64,
    pub p95: u64,
    pub p99: u64,
    pub p999: u64,
    pub count: u64,
}

impl PercentileSet {
    /// Extract a full percentile set from an HdrHistogram.
    /// Returns zeroed values if the histogram is empty.
    pub fn from_histogram(hist: &Histogram<u64>) -> Self {
        if hist.len() == 0 {
            return Self::empty();
        }

        Self {
            min: hist.min(),
            max: hist.max(),
            mean: hist.mean(),
            p50: hist.value_at_percentile(50.0),
            p95: hist.value_at_percentile(95.0),
            p99: hist.value_at_percentile(99.0),
            p999: hist.value_at_percentile(99.9),
            count: hist.len(),
        }
    }

    /// All-zero placeholder used before any samples are recorded.
    pub fn empty() -> Self {
        Self {
            min: 0,
            max: 0,
            mean: 0.0,
            p50: 0,
            p95: 0,
            p99: 0,
            p999: 0,
            count: 0,
        }
    }

    pub fn has_data(&self) -> bool {
        self.count > 0
    }
}

/// Response-time histogram for the current harvest window.
pub struct ResponseTimes {
    hist: Mutex<Histogram<u64>>,
}

impl ResponseTimes {
    pub fn new() -> Self {
        Self {
            hist: Mutex::new(new_histogram()),
        }
    }

    /// Record one dispatcher duration given in seconds (clamped to ≥ 1 μs
    /// and saturated at the histogram ceiling).
    pub fn record(&self, seconds: f64) {
        let micros = ((seconds * 1e6) as u64).clamp(HIST_LOW, HIST_HIGH);
        let _ = self.hist.lock().record(micros);
    }

    pub fn snapshot(&self) -> PercentileSet {
        PercentileSet::from_histogram(&self.hist.lock())
    }

    /// Percentiles for the window that just closed; the next window starts
    /// empty.
    pub fn harvest(&self) -> PercentileSet {
        let mut hist = self.hist.lock();
        let set = PercentileSet::from_histogram(&hist);
        hist.reset();
        set
    }
}

impl Default for ResponseTimes {
    fn default() -> Self {
        Self::new()
    }
}

fn new_histogram() -> Histogram<u64> {
    Histogram::<u64>::new_with_bounds(HIST_LOW, HIST_HIGH, HIST_SIGFIG)
        .expect("histogram creation")
}
