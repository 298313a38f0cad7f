//! The dispatcher loop: single thread, one iteration of which is
//! `run_once`. Implements the five steps of the scheduling loop exactly as
//! laid out for this core: drain worker completions, ingest new packets,
//! select the next task per policy, assign it to an idle worker, and check
//! whether any busy worker has exceeded its preemption budget.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::Config;
use crate::policy::SchedulingPolicy;
use crate::preempt::PreemptChannel;
use crate::registry::{Classifier, Networker};
use crate::slot::{Category, ResponseFlag, SlotTable};
use crate::stats::DispatchStats;
use crate::task::{Task, TaskQueue};
use crate::timer::{Clock, TscClock};

/// Per-worker bookkeeping the dispatcher needs to decide who is idle and
/// who has run too long without yielding.
struct WorkerSlotState {
    busy: bool,
    dispatched_at_ns: u64,
    class: usize,
}

pub struct Dispatcher {
    config: Arc<Config>,
    slots: Arc<SlotTable>,
    preempt: Arc<dyn PreemptChannel>,
    policy: Box<dyn SchedulingPolicy>,
    queues: Vec<TaskQueue>,
    workers: Vec<WorkerSlotState>,
    stats: Arc<DispatchStats>,
    packets_seen: u64,
    clock: Arc<dyn Clock>,
    /// `clock.now_ns()` at construction time; `stop_after_us` is measured
    /// relative to this, not to the Unix epoch.
    start_ns: u64,
    pub finished: AtomicBool,
}

impl Dispatcher {
    pub fn new(
        config: Arc<Config>,
        slots: Arc<SlotTable>,
        preempt: Arc<dyn PreemptChannel>,
        policy: Box<dyn SchedulingPolicy>,
        stats: Arc<DispatchStats>,
    ) -> Self {
        Self::with_clock(config, slots, preempt, policy, stats, Arc::new(TscClock))
    }

    /// Same as `new`, but with an injectable `Clock` in place of the real
    /// RDTSC-backed one — the seam integration tests use to drive the
    /// budget-check and `stop_after_us` paths deterministically.
    pub fn with_clock(
        config: Arc<Config>,
        slots: Arc<SlotTable>,
        preempt: Arc<dyn PreemptChannel>,
        policy: Box<dyn SchedulingPolicy>,
        stats: Arc<DispatchStats>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let queues = (0..config.num_classes).map(|_| TaskQueue::new()).collect();
        let workers = (0..config.num_workers)
            .map(|_| WorkerSlotState { busy: false, dispatched_at_ns: 0, class: 0 })
            .collect();
        let start_ns = clock.now_ns();

        Self {
            config,
            slots,
            preempt,
            policy,
            queues,
            workers,
            stats,
            packets_seen: 0,
            clock,
            start_ns,
            finished: AtomicBool::new(false),
        }
    }

    /// One full iteration of the five-step loop. Returns `true` if work
    /// was performed (a completion was drained, a packet ingested, or a
    /// task assigned) so callers can choose to spin less aggressively when
    /// the system is quiet.
    pub fn run_once(&mut self, networker: &mut dyn Networker, classifier: &dyn Classifier) -> bool {
        let mut did_work = false;

        // Step 1: drain worker completions/preemptions.
        for worker_id in 0..self.config.num_workers {
            let response = self.slots.response(worker_id);
            match response.observe() {
                ResponseFlag::Finished => {
                    let payload = response.reclaim();
                    if let Some(payload) = payload {
                        self.stats.record_completed(payload.run_ns);
                    }
                    self.workers[worker_id].busy = false;
                    did_work = true;
                }
                ResponseFlag::Preempted => {
                    if let Some(payload) = response.reclaim() {
                        let task = Task {
                            request_type: payload.request_type,
                            class: payload.class,
                            payload: crate::task::Packet::new(Vec::new()),
                            timestamp_ns: payload.timestamp_ns,
                            runnable: payload.runnable,
                        };
                        self.queues[task.class].enqueue_head(task);
                    } else {
                        warn!("preempted response carried no payload, task lost");
                    }
                    self.stats.record_preempted();
                    self.workers[worker_id].busy = false;
                    did_work = true;
                }
                ResponseFlag::Running | ResponseFlag::Processed => {}
            }
        }

        // Step 2: ingest new packets.
        let batch = networker.poll_batch(self.config.eth_rx_max_batch);
        for (packet, timestamp_ns) in batch.packets {
            self.packets_seen += 1;
            match classifier.classify(&packet) {
                Some((request_type, class)) if class < self.config.num_classes => {
                    self.queues[class].enqueue_tail(Task::fresh(request_type, class, packet, timestamp_ns));
                    self.stats.record_enqueued();
                    did_work = true;
                }
                _ => {
                    warn!("dropping packet with unknown or malformed classification");
                    self.stats.record_dropped();
                }
            }

            if let Some(stop_at) = self.config.stop_after_packets {
                if self.packets_seen >= stop_at {
                    debug!(packets_seen = self.packets_seen, "packet-count stop condition reached");
                    self.finished.store(true, Ordering::Release);
                }
            }
        }

        // Step 3 & 4: select the next task per policy and assign it to an
        // idle worker. `now_ns` is read once per iteration through the
        // injected clock and reused below for the time-based stop
        // condition and the budget check, rather than re-reading RDTSC
        // (or the fake clock) three times for what is logically one instant.
        let now_ns = self.clock.now_ns();

        if let Some(stop_after_us) = self.config.stop_after_us {
            if now_ns.saturating_sub(self.start_ns) >= stop_after_us.saturating_mul(1_000) {
                debug!(elapsed_ns = now_ns.saturating_sub(self.start_ns), "time-based stop condition reached");
                self.finished.store(true, Ordering::Release);
            }
        }

        for worker_id in 0..self.config.num_workers {
            if self.workers[worker_id].busy {
                continue;
            }
            let Some(class) = self.policy.select(&self.queues, now_ns, &self.config) else {
                break;
            };
            let Some(task) = self.queues[class].dequeue() else {
                continue;
            };

            let category = if task.is_resumed() { Category::Context } else { Category::Packet };
            self.slots.request(worker_id).publish(
                task.request_type,
                category,
                task.class,
                task.payload,
                task.timestamp_ns,
                task.runnable,
            );
            self.workers[worker_id] = WorkerSlotState {
                busy: true,
                dispatched_at_ns: now_ns,
                class,
            };
            did_work = true;
        }

        // Step 5: preempt-check. Any worker running longer than its
        // class's budget gets a preemption request; the worker's own
        // checkpoint decides when it is safe to actually suspend.
        for worker_id in 0..self.config.num_workers {
            let state = &self.workers[worker_id];
            if !state.busy {
                continue;
            }
            let budget_ns = self.config.budget_ns(state.class);
            if now_ns.saturating_sub(state.dispatched_at_ns) > budget_ns {
                self.preempt.fire(worker_id);
            }
        }

        did_work
    }

    /// Drives `run_once` until the stop condition is observed.
    pub fn run(&mut self, networker: &mut dyn Networker, classifier: &dyn Classifier) {
        while !self.finished.load(Ordering::Acquire) {
            if !self.run_once(networker, classifier) {
                std::hint::spin_loop();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigBuilder;
    use crate::policy::Fifo;
    use crate::preempt::CooperativeChannel;
    use crate::task::Packet;

    struct FixedNetworker {
        remaining: Vec<(Packet, u64)>,
    }

    impl Networker for FixedNetworker {
        fn poll_batch(&mut self, max_batch: usize) -> crate::registry::PacketBatch {
            let take = self.remaining.len().min(max_batch);
            crate::registry::PacketBatch {
                packets: self.remaining.drain(..take).collect(),
            }
        }
    }

    struct AlwaysSynthetic;

    impl Classifier for AlwaysSynthetic {
        fn classify(&self, _packet: &Packet) -> Option<(crate::task::RequestType, usize)> {
            Some((crate::task::RequestType::Synthetic, 0))
        }
    }

    fn dispatcher(num_workers: usize) -> Dispatcher {
        let config = Arc::new(
            ConfigBuilder::new()
                .num_workers(num_workers)
                .classes(vec![1_000_000], vec![2_000])
                .build()
                .unwrap(),
        );
        let slots = Arc::new(SlotTable::new(num_workers));
        let preempt = Arc::new(CooperativeChannel::new(num_workers));
        Dispatcher::new(config, slots, preempt, Box::new(Fifo), Arc::new(DispatchStats::new()))
    }

    /// A clock a test can move forward by hand, standing in for RDTSC.
    struct FakeClock(std::sync::atomic::AtomicU64);

    impl FakeClock {
        fn new(start_ns: u64) -> Arc<Self> {
            Arc::new(Self(std::sync::atomic::AtomicU64::new(start_ns)))
        }

        fn set(&self, ns: u64) {
            self.0.store(ns, std::sync::atomic::Ordering::Relaxed);
        }
    }

    impl Clock for FakeClock {
        fn now_ns(&self) -> u64 {
            self.0.load(std::sync::atomic::Ordering::Relaxed)
        }
    }

    #[test]
    fn ingests_and_assigns_a_single_packet() {
        let mut d = dispatcher(1);
        let mut networker = FixedNetworker { remaining: vec![(Packet::new(vec![1]), 0)] };
        let classifier = AlwaysSynthetic;

        assert!(d.run_once(&mut networker, &classifier));
        assert!(d.workers[0].busy);
        assert_eq!(d.slots.request(0).observe(), crate::slot::RequestFlag::Active);
    }

    #[test]
    fn stop_after_packets_sets_finished() {
        let mut d = dispatcher(1);
        d.config = Arc::new(
            ConfigBuilder::new()
                .num_workers(1)
                .classes(vec![1_000_000], vec![2_000])
                .stop_after_packets(1)
                .build()
                .unwrap(),
        );
        let mut networker = FixedNetworker { remaining: vec![(Packet::new(vec![1]), 0)] };
        let classifier = AlwaysSynthetic;

        d.run_once(&mut networker, &classifier);
        assert!(d.finished.load(Ordering::Acquire));
    }

    #[test]
    fn stop_after_us_sets_finished_once_elapsed() {
        let config = Arc::new(
            ConfigBuilder::new()
                .num_workers(1)
                .classes(vec![1_000_000], vec![2_000])
                .stop_after_us(5)
                .build()
                .unwrap(),
        );
        let slots = Arc::new(SlotTable::new(1));
        let preempt = Arc::new(CooperativeChannel::new(1));
        let clock = FakeClock::new(1_000);
        let mut d = Dispatcher::with_clock(
            config,
            slots,
            preempt,
            Box::new(Fifo),
            Arc::new(DispatchStats::new()),
            Arc::clone(&clock) as Arc<dyn Clock>,
        );
        let mut networker = FixedNetworker { remaining: vec![] };
        let classifier = AlwaysSynthetic;

        d.run_once(&mut networker, &classifier);
        assert!(!d.finished.load(Ordering::Acquire), "5us stop must not fire before 5us elapse");

        clock.set(1_000 + 5_000);
        d.run_once(&mut networker, &classifier);
        assert!(d.finished.load(Ordering::Acquire));
    }

    #[test]
    fn overrunning_worker_is_preempted_once_budget_elapses() {
        let config = Arc::new(
            ConfigBuilder::new()
                .num_workers(1)
                .classes(vec![1_000_000], vec![2_000])
                .build()
                .unwrap(),
        );
        let slots = Arc::new(SlotTable::new(1));
        let preempt = Arc::new(CooperativeChannel::new(1));
        let clock = FakeClock::new(0);
        let mut d = Dispatcher::with_clock(
            Arc::clone(&config),
            slots,
            Arc::clone(&preempt),
            Box::new(Fifo),
            Arc::new(DispatchStats::new()),
            Arc::clone(&clock) as Arc<dyn Clock>,
        );
        let mut networker = FixedNetworker { remaining: vec![(Packet::new(vec![1]), 0)] };
        let classifier = AlwaysSynthetic;

        // Assigns the packet to worker 0 at clock time 0.
        d.run_once(&mut networker, &classifier);
        assert!(!preempt.take_requested(0), "must not fire before the budget (2000ns) elapses");

        // Advance well past the class-0 budget (2000ns) with no new
        // packets; the dispatcher's own step-5 check should fire this time,
        // not a test calling `preempt.fire` by hand.
        clock.set(10_000);
        let mut idle_networker = FixedNetworker { remaining: vec![] };
        d.run_once(&mut idle_networker, &classifier);
        assert!(preempt.take_requested(0));
    }

    #[test]
    fn preempted_response_is_requeued_at_class_head_and_reassigned() {
        let mut d = dispatcher(1);
        let mut networker = FixedNetworker { remaining: vec![(Packet::new(vec![1]), 0)] };
        let classifier = AlwaysSynthetic;

        d.run_once(&mut networker, &classifier);
        assert_eq!(d.slots.request(0).observe(), crate::slot::RequestFlag::Active);
        let request = d.slots.request(0).take();

        d.slots.response(0).publish(
            ResponseFlag::Preempted,
            Some(crate::slot::ResponsePayload {
                request_type: request.request_type,
                class: 0,
                timestamp_ns: request.timestamp_ns,
                run_ns: 0,
                gen_ns: 0,
                runnable: None,
            }),
        );

        let mut empty_networker = FixedNetworker { remaining: vec![] };
        assert!(d.run_once(&mut empty_networker, &classifier));
        // The requeued task was immediately reassigned to the now-idle worker.
        assert_eq!(d.slots.request(0).observe(), crate::slot::RequestFlag::Active);
        assert!(d.queues[0].is_empty());
    }
}
