//! Scheduling policy: which per-class queue does the dispatcher pull from
//! next. Both variants mirror `original_source/inc/ix/dispatch.h` exactly:
//! `Fifo` is `naive_tskq_dequeue` (first non-empty class, scanned in
//! order), `SloWeighted` is `smart_tskq_dequeue` (pick the class with the
//! greatest `(now - head_timestamp) / slo[class]`, ties broken toward the
//! lowest class index because the original's comparison is strict `>`).

use crate::config::Config;
use crate::task::TaskQueue;

pub trait SchedulingPolicy: Send + Sync {
    /// Returns the index of the class to dequeue from next, or `None` if
    /// every queue is empty.
    fn select(&self, queues: &[TaskQueue], now_ns: u64, config: &Config) -> Option<usize>;
}

pub struct Fifo;

impl SchedulingPolicy for Fifo {
    fn select(&self, queues: &[TaskQueue], _now_ns: u64, _config: &Config) -> Option<usize> {
        queues.iter().position(|q| !q.is_empty())
    }
}

pub struct SloWeighted;

impl SchedulingPolicy for SloWeighted {
    fn select(&self, queues: &[TaskQueue], now_ns: u64, config: &Config) -> Option<usize> {
        // Mirrors `smart_tskq_dequeue`'s `index = -1; max = 0` seed exactly:
        // `best` only ever updates on strict `lateness > max_lateness`, so a
        // round where every non-empty class has non-positive lateness (the
        // clock-skew-clamped-to-zero case) correctly dequeues nothing.
        let mut best: Option<usize> = None;
        let mut max_lateness = 0.0f64;

        for (class, queue) in queues.iter().enumerate() {
            let Some(head_ts) = queue.peek_head_timestamp() else {
                continue;
            };
            // Clamp clock skew (now < head_ts) to zero rather than going
            // negative, per spec's own suggested resolution.
            let diff = now_ns.saturating_sub(head_ts);
            let lateness = diff as f64 / config.slo_ns(class) as f64;

            if lateness > max_lateness {
                max_lateness = lateness;
                best = Some(class);
            }
        }

        best
    }
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;
    use crate::config::ConfigBuilder;
    use crate::task::{Packet, RequestType, Task};

    fn config(num_classes: usize) -> Config {
        ConfigBuilder::new()
            .classes(vec![1_000; num_classes], vec![100; num_classes])
            .build()
            .unwrap()
    }

    fn queues_with(heads: &[Option<u64>]) -> Vec<TaskQueue> {
        heads
            .iter()
            .map(|head| {
                let mut q = TaskQueue::new();
                if let Some(ts) = head {
                    q.enqueue_tail(Task::fresh(RequestType::Synthetic, 0, Packet::new(vec![]), *ts));
                }
                q
            })
            .collect()
    }

    #[test]
    fn fifo_picks_first_nonempty_class() {
        let queues = queues_with(&[None, Some(5), Some(1)]);
        let cfg = config(3);
        assert_eq!(Fifo.select(&queues, 100, &cfg), Some(1));
    }

    // class 0: slo 1000ns, waited 500ns -> lateness 0.5
    // class 1: slo 100ns,  waited 500ns -> lateness 5.0 (most overdue)
    #[test_case(&[1_000, 100], &[Some(500), Some(500)], 1_000, Some(1); "most overdue class wins")]
    // Both classes tied at a positive lateness of 0.5; the scan only
    // replaces `best` on strict `>`, so the first (lowest-index) class to
    // reach that lateness wins the tie.
    #[test_case(&[1_000, 1_000], &[Some(0), Some(0)], 500, Some(0); "ties break toward lowest class")]
    // now is before the head timestamp, clamped to zero lateness rather than
    // going negative; a non-positive round dequeues nothing, matching
    // `smart_tskq_dequeue`'s `index = -1` seed.
    #[test_case(&[1_000], &[Some(1_000_000)], 0, None; "clock skew clamps to zero lateness")]
    fn slo_weighted_select_cases(slos_ns: &[u64], heads: &[Option<u64>], now_ns: u64, expected: Option<usize>) {
        let cfg = ConfigBuilder::new()
            .classes(slos_ns.to_vec(), vec![100; slos_ns.len()])
            .build()
            .unwrap();
        let queues = queues_with(heads);
        assert_eq!(SloWeighted.select(&queues, now_ns, &cfg), expected);
    }
}
