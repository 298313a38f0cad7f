//! Aggregate dispatcher/worker statistics: throughput, drops, and
//! service-time min/max/total. The CAS-based min/max accumulation mirrors
//! the teacher's `HotPathStats`; the conservation counters themselves
//! (enqueued/completed/dropped/in-flight) mirror the original's
//! `TEST_TOTAL_PACKETS_COUNTER`/`TEST_RCVD_*` globals in `dp/core/worker.c`.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct DispatchStats {
    pub enqueued: AtomicU64,
    pub completed: AtomicU64,
    pub dropped: AtomicU64,
    pub preempted: AtomicU64,
    pub in_flight: AtomicU64,
    min_run_ns: AtomicU64,
    max_run_ns: AtomicU64,
    total_run_ns: AtomicU64,
}

impl DispatchStats {
    pub fn new() -> Self {
        Self {
            min_run_ns: AtomicU64::new(u64::MAX),
            ..Default::default()
        }
    }

    pub fn record_enqueued(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_preempted(&self) {
        self.preempted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self, run_ns: u64) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
        self.total_run_ns.fetch_add(run_ns, Ordering::Relaxed);

        let mut current = self.min_run_ns.load(Ordering::Relaxed);
        while run_ns < current {
            match self.min_run_ns.compare_exchange_weak(
                current,
                run_ns,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }

        let mut current = self.max_run_ns.load(Ordering::Relaxed);
        while run_ns > current {
            match self.max_run_ns.compare_exchange_weak(
                current,
                run_ns,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn min_run_ns(&self) -> Option<u64> {
        match self.min_run_ns.load(Ordering::Relaxed) {
            u64::MAX => None,
            v => Some(v),
        }
    }

    pub fn max_run_ns(&self) -> u64 {
        self.max_run_ns.load(Ordering::Relaxed)
    }

    pub fn mean_run_ns(&self) -> f64 {
        let completed = self.completed.load(Ordering::Relaxed);
        if completed == 0 {
            return 0.0;
        }
        self.total_run_ns.load(Ordering::Relaxed) as f64 / completed as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_max_track_extremes() {
        let stats = DispatchStats::new();
        stats.record_completed(500);
        stats.record_completed(100);
        stats.record_completed(900);
        assert_eq!(stats.min_run_ns(), Some(100));
        assert_eq!(stats.max_run_ns(), 900);
        assert!((stats.mean_run_ns() - 500.0).abs() < 1e-9);
    }

    #[test]
    fn enqueue_and_complete_balance_in_flight() {
        let stats = DispatchStats::new();
        stats.record_enqueued();
        stats.record_enqueued();
        assert_eq!(stats.in_flight.load(Ordering::Relaxed), 2);
        stats.record_completed(10);
        assert_eq!(stats.in_flight.load(Ordering::Relaxed), 1);
    }
}
