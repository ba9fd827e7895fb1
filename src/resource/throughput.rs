//! Download throughput estimate

use std::time::Duration;

const ALPHA: f64 = 0.3;
const SLOW_BYTES_PER_SEC: f64 = 512.0 * 1024.0;
const FAST_BYTES_PER_SEC: f64 = 2.0 * 1024.0 * 1024.0;

/// Exponentially weighted bytes-per-second average.
#[derive(Debug, Clone, Default)]
pub struct ThroughputTracker {
    estimate: Option<f64>,
    samples: u64,
}

impl ThroughputTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one completed download.
    pub fn record(&mut self, bytes: usize, elapsed: Duration) {
        // Sub-millisecond completions are cache-speed reads and would skew the average
        let secs = elapsed.as_secs_f64().max(0.001);
        let sample = bytes as f64 / secs;
        self.estimate = Some(match self.estimate {
            Some(current) => current + ALPHA * (sample - current),
            None => sample,
        });
        self.samples += 1;
    }

    pub fn bytes_per_second(&self) -> Option<f64> {
        self.estimate
    }

    pub fn samples(&self) -> u64 {
        self.samples
    }

    /// How many queued clips to fetch ahead, at most `max_ahead`.
    pub fn prefetch_depth(&self, max_ahead: usize) -> usize {
        let depth = match self.estimate {
            None => 1,
            Some(rate) if rate < SLOW_BYTES_PER_SEC => 1,
            Some(rate) if rate < FAST_BYTES_PER_SEC => 2,
            Some(_) => max_ahead,
        };
        depth.min(max_ahead)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_sample_seeds_the_average() {
        let mut tracker = ThroughputTracker::new();
        assert_eq!(tracker.bytes_per_second(), None);

        tracker.record(1000, Duration::from_secs(1));
        assert_eq!(tracker.bytes_per_second(), Some(1000.0));

        tracker.record(2000, Duration::from_secs(1));
        let rate = tracker.bytes_per_second().unwrap();
        assert!((rate - 1300.0).abs() < 1e-9);
        assert_eq!(tracker.samples(), 2);
    }

    #[test]
    fn depth_follows_bandwidth() {
        let mut tracker = ThroughputTracker::new();
        assert_eq!(tracker.prefetch_depth(4), 1);

        tracker.record(100 * 1024, Duration::from_secs(1));
        assert_eq!(tracker.prefetch_depth(4), 1);

        let mut fast = ThroughputTracker::new();
        fast.record(10 * 1024 * 1024, Duration::from_secs(1));
        assert_eq!(fast.prefetch_depth(4), 4);
        assert_eq!(fast.prefetch_depth(0), 0);
    }
}
