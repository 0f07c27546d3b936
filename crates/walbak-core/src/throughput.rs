//! Moving-average throughput over a ~1 second window, and the stabilizer
//! that sleeps a producer to hold a configured rate.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Sample bucket granularity.
const INTERVAL_MS: u64 = 10;
/// After trimming, the window must still span at least this much.
const MIN_MS: u64 = 900;
/// Trim once the window grows past this.
const MAX_MS: u64 = 1100;

struct Record {
    at: Instant,
    progress_lb: u64,
}

#[derive(Default)]
pub struct ThroughputMonitor {
    progress_lb: u64,
    deq: VecDeque<Record>,
}

impl ThroughputMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `size_lb` blocks of progress; returns the current rate in
    /// logical blocks per second.
    pub fn add_and_get_lb_per_sec(&mut self, size_lb: u64) -> u64 {
        self.progress_lb += size_lb;
        let now = Instant::now();
        let sample_due = match self.deq.back() {
            None => true,
            Some(last) => now.duration_since(last.at) > Duration::from_millis(INTERVAL_MS),
        };
        if sample_due {
            self.deq.push_back(Record {
                at: now,
                progress_lb: self.progress_lb,
            });
        }
        self.gc(now);
        self.lb_per_sec_at(now)
    }

    pub fn get_lb_per_sec(&mut self) -> u64 {
        let now = Instant::now();
        self.gc(now);
        self.lb_per_sec_at(now)
    }

    /// Keep the window spanning [MIN_MS, MAX_MS].
    fn gc(&mut self, now: Instant) {
        let oldest_ok = match self.deq.front() {
            None => return,
            Some(front) => now.duration_since(front.at) < Duration::from_millis(MAX_MS),
        };
        if oldest_ok {
            return;
        }
        let keep_after = now - Duration::from_millis(MIN_MS);
        while let Some(front) = self.deq.front() {
            if front.at >= keep_after {
                break;
            }
            self.deq.pop_front();
        }
    }

    fn lb_per_sec_at(&self, now: Instant) -> u64 {
        let Some(front) = self.deq.front() else {
            return 0;
        };
        if self.deq.len() <= 1 {
            return 0;
        }
        let ms = now.duration_since(front.at).as_millis() as u64;
        if ms == 0 {
            return 0;
        }
        let size_lb = self.progress_lb - front.progress_lb;
        size_lb * 1000 / ms
    }
}

/// Holds a producer near a configured max rate. Zero means unlimited.
#[derive(Default)]
pub struct ThroughputStabilizer {
    max_lb_per_sec: u64,
    monitor: ThroughputMonitor,
}

impl ThroughputStabilizer {
    pub fn new(max_lb_per_sec: u64) -> Self {
        ThroughputStabilizer {
            max_lb_per_sec,
            monitor: ThroughputMonitor::new(),
        }
    }

    pub fn add_and_sleep_if_necessary(&mut self, size_lb: u64, sleep_ms: u64, max_sleep_ms: u64) {
        if self.max_lb_per_sec == 0 {
            return;
        }
        let mut rate = self.monitor.add_and_get_lb_per_sec(size_lb);
        let mut total = 0;
        while rate > self.max_lb_per_sec && total < max_sleep_ms {
            std::thread::sleep(Duration::from_millis(sleep_ms));
            total += sleep_ms;
            rate = self.monitor.get_lb_per_sec();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_monitor_reports_zero() {
        let mut mon = ThroughputMonitor::new();
        assert_eq!(mon.get_lb_per_sec(), 0);
    }

    #[test]
    fn rate_reflects_progress() {
        let mut mon = ThroughputMonitor::new();
        mon.add_and_get_lb_per_sec(1000);
        std::thread::sleep(Duration::from_millis(50));
        let rate = mon.add_and_get_lb_per_sec(1000);
        // 2000 blocks in ~50 ms: at least 10k lb/s, well below 1M lb/s.
        assert!(rate > 10_000, "rate {rate}");
        assert!(rate < 1_000_000, "rate {rate}");
    }

    #[test]
    fn unlimited_stabilizer_never_sleeps() {
        let mut st = ThroughputStabilizer::new(0);
        let before = Instant::now();
        for _ in 0..100 {
            st.add_and_sleep_if_necessary(1 << 20, 10, 1000);
        }
        assert!(before.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn stabilizer_slows_a_fast_producer() {
        let mut st = ThroughputStabilizer::new(100);
        let before = Instant::now();
        // Way over 100 lb/s; the stabilizer must inject sleeps.
        for _ in 0..5 {
            st.add_and_sleep_if_necessary(10_000, 5, 40);
        }
        assert!(before.elapsed() >= Duration::from_millis(40));
    }
}
