use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Counters of the pipelined scheduling loop, shared by every query.
#[derive(Debug, Default)]
pub struct SplitSchedulerStats {
    splits_scheduled: AtomicU64,
    scheduling_iterations: AtomicU64,
    waiting_for_source: AtomicU64,
    split_queues_full: AtomicU64,
    sleep_time_nanos: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SplitSchedulerStatsSnapshot {
    pub splits_scheduled: u64,
    pub scheduling_iterations: u64,
    pub waiting_for_source: u64,
    pub split_queues_full: u64,
    pub sleep_time: Duration,
}

impl SplitSchedulerStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_splits_scheduled(&self, count: usize) {
        self.scheduling_iterations.fetch_add(1, Ordering::Relaxed);
        self.splits_scheduled.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn record_waiting_for_source(&self) {
        self.waiting_for_source.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_split_queues_full(&self) {
        self.split_queues_full.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sleep_time(&self, duration: Duration) {
        let nanos = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.sleep_time_nanos.fetch_add(nanos, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SplitSchedulerStatsSnapshot {
        SplitSchedulerStatsSnapshot {
            splits_scheduled: self.splits_scheduled.load(Ordering::Relaxed),
            scheduling_iterations: self.scheduling_iterations.load(Ordering::Relaxed),
            waiting_for_source: self.waiting_for_source.load(Ordering::Relaxed),
            split_queues_full: self.split_queues_full.load(Ordering::Relaxed),
            sleep_time: Duration::from_nanos(self.sleep_time_nanos.load(Ordering::Relaxed)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot() {
        let stats = SplitSchedulerStats::new();
        stats.record_splits_scheduled(3);
        stats.record_splits_scheduled(0);
        stats.record_waiting_for_source();
        stats.record_sleep_time(Duration::from_millis(5));
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.splits_scheduled, 3);
        assert_eq!(snapshot.scheduling_iterations, 2);
        assert_eq!(snapshot.waiting_for_source, 1);
        assert_eq!(snapshot.split_queues_full, 0);
        assert_eq!(snapshot.sleep_time, Duration::from_millis(5));
    }
}
