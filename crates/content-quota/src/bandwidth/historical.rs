//! Historical-speed source (§3, §4.3): a ring buffer of recently observed
//! transfer speeds, summarized as a median. Empty returns a sentinel lower
//! bound so the checker doesn't enforce a floor before enough samples exist.

use std::collections::VecDeque;

use parking_lot::Mutex;

/// `LimitSource::current()`'s sentinel when no history is available yet.
pub const NO_HISTORY_FLOOR_MB_PER_S: f64 = 0.0;

pub struct HistoricalSpeedSource {
    capacity: usize,
    samples: Mutex<VecDeque<f64>>,
}

impl HistoricalSpeedSource {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            samples: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
        }
    }

    pub fn push(&self, speed_mb_per_s: f64) {
        if !speed_mb_per_s.is_finite() || speed_mb_per_s < 0.0 {
            return;
        }
        let mut samples = self.samples.lock();
        if samples.len() == self.capacity {
            samples.pop_front();
        }
        samples.push_back(speed_mb_per_s);
    }

    /// Median of the stored samples, or [`NO_HISTORY_FLOOR_MB_PER_S`] if
    /// empty.
    pub fn current(&self) -> f64 {
        let samples = self.samples.lock();
        if samples.is_empty() {
            return NO_HISTORY_FLOOR_MB_PER_S;
        }
        let mut sorted: Vec<f64> = samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).expect("speed samples are finite"));
        let mid = sorted.len() / 2;
        if sorted.len() % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) / 2.0
        } else {
            sorted[mid]
        }
    }
}

/// Where the checker's speed floor comes from (§3 "limit_source").
pub enum LimitSource {
    Constant(f64),
    Historical(HistoricalSpeedSource),
}

impl LimitSource {
    pub fn current(&self) -> f64 {
        match self {
            LimitSource::Constant(mb_per_s) => *mb_per_s,
            LimitSource::Historical(history) => history.current(),
        }
    }

    pub fn record_observed_speed(&self, speed_mb_per_s: f64) {
        if let LimitSource::Historical(history) = self {
            history.push(speed_mb_per_s);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_history_returns_sentinel_floor() {
        let history = HistoricalSpeedSource::new(4);
        assert_eq!(history.current(), NO_HISTORY_FLOOR_MB_PER_S);
    }

    #[test]
    fn median_of_odd_sample_count() {
        let history = HistoricalSpeedSource::new(8);
        for speed in [1.0, 3.0, 2.0] {
            history.push(speed);
        }
        assert_eq!(history.current(), 2.0);
    }

    #[test]
    fn ring_buffer_drops_oldest_sample_past_capacity() {
        let history = HistoricalSpeedSource::new(2);
        history.push(1.0);
        history.push(2.0);
        history.push(10.0);
        // 1.0 was evicted; median of {2.0, 10.0} is 6.0.
        assert_eq!(history.current(), 6.0);
    }
}
