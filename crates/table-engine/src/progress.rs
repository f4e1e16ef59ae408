//! Progress and time-remaining estimate for the running pattern.

use std::collections::VecDeque;
use table_core::Progress;
use tokio::time::Instant;

/// Points kept for the throughput estimate.
const WINDOW: usize = 50;

/// Tracks completed points and estimates time remaining from recent throughput.
#[derive(Debug)]
pub struct ProgressTracker {
    total: usize,
    done: usize,
    started: Instant,
    recent: VecDeque<(Instant, usize)>,
}

impl ProgressTracker {
    /// Start tracking a pattern of `total` points.
    pub fn new(total: usize) -> Self {
        let started = Instant::now();
        let mut recent = VecDeque::with_capacity(WINDOW + 1);
        recent.push_back((started, 0));
        Self {
            total,
            done: 0,
            started,
            recent,
        }
    }

    /// Record that `done` points have been acknowledged.
    pub fn record(&mut self, done: usize) {
        self.done = done.min(self.total);
        self.recent.push_back((Instant::now(), self.done));
        while self.recent.len() > WINDOW {
            self.recent.pop_front();
        }
    }

    /// Forget throughput history, e.g. after a pause, so the idle time does
    /// not drag the estimate down.
    pub fn restart_window(&mut self) {
        self.recent.clear();
        self.recent.push_back((Instant::now(), self.done));
    }

    /// Current progress tuple.
    pub fn snapshot(&self) -> Progress {
        Progress {
            done: self.done,
            total: self.total,
            remaining_secs: self.remaining_secs(),
            elapsed_secs: self.started.elapsed().as_secs_f64(),
        }
    }

    fn remaining_secs(&self) -> Option<f64> {
        if self.done >= self.total {
            return Some(0.0);
        }
        let (&(t0, d0), &(t1, d1)) = (self.recent.front()?, self.recent.back()?);
        let points = d1.checked_sub(d0).filter(|p| *p > 0)?;
        let secs = t1.duration_since(t0).as_secs_f64();
        if secs <= 0.0 {
            return None;
        }
        let rate = points as f64 / secs;
        Some((self.total - self.done) as f64 / rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn estimate_from_steady_rate() {
        let mut tracker = ProgressTracker::new(100);
        assert_eq!(tracker.snapshot().remaining_secs, None);

        for done in 1..=10 {
            tokio::time::advance(Duration::from_millis(500)).await;
            tracker.record(done);
        }
        let progress = tracker.snapshot();
        assert_eq!(progress.done, 10);
        let remaining = progress.remaining_secs.unwrap();
        assert!((remaining - 45.0).abs() < 1e-6, "remaining {}", remaining);
        assert!((progress.elapsed_secs - 5.0).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_does_not_skew_estimate() {
        let mut tracker = ProgressTracker::new(20);
        for done in 1..=5 {
            tokio::time::advance(Duration::from_secs(1)).await;
            tracker.record(done);
        }
        tokio::time::advance(Duration::from_secs(600)).await;
        tracker.restart_window();
        for done in 6..=10 {
            tokio::time::advance(Duration::from_secs(1)).await;
            tracker.record(done);
        }
        let remaining = tracker.snapshot().remaining_secs.unwrap();
        assert!((remaining - 10.0).abs() < 1e-6);
    }

    #[test]
    fn complete_pattern_has_nothing_left() {
        let mut tracker = ProgressTracker::new(3);
        tracker.record(3);
        let progress = tracker.snapshot();
        assert_eq!(progress.remaining_secs, Some(0.0));
        assert_eq!(progress.percent(), 100.0);
    }
}
