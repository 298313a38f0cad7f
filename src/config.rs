//! Process-wide configuration, built once at startup and immutable
//! afterward. Follows the teacher's `DescriptorBuilder` pattern
//! (`build()` validates and freezes, rather than a mutable struct that can
//! drift at runtime) rather than a config-file/env-var loader, which is
//! explicitly out of scope for this core.

use crate::context::DEFAULT_STACK_SIZE;
use crate::error::{DispatchError, DispatchResult};

/// Hard ceiling from `original_source/inc/ix/dispatch.h`'s `MAX_WORKERS`.
pub const MAX_WORKERS: usize = 18;

/// Compile-time cap on a single networker poll, matching
/// `original_source/inc/ix/dispatch.h`'s `ETH_RX_MAX_BATCH` (it sizes the
/// fixed-length `types`/`pkts` arrays in `networker_pointers_t`). A
/// `Config::eth_rx_max_batch` above this is rejected at `build()` rather
/// than silently truncated.
pub const ETH_RX_MAX_BATCH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreemptionMode {
    /// No preemption channel at all: workers run every job to completion
    /// uninterrupted. Used to benchmark raw dispatch throughput with
    /// checkpoint overhead compiled out of the picture.
    None,
    /// Worker checks an atomic "yield requested" counter at checkpoints.
    Cooperative,
    /// Dispatcher signals the worker's thread directly; requires the
    /// `interrupt-preempt` feature and Linux.
    Interrupt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulingPolicyKind {
    Fifo,
    SloWeighted,
}

/// Frozen runtime configuration shared (read-only) by the dispatcher and
/// every worker.
#[derive(Debug, Clone)]
pub struct Config {
    pub num_workers: usize,
    pub num_classes: usize,
    /// Per-class SLO target, in nanoseconds. Index-aligned with task
    /// `class`.
    pub slos_ns: Vec<u64>,
    /// Per-class preemption budget, in nanoseconds.
    pub budgets_ns: Vec<u64>,
    pub context_pool_size: usize,
    pub stack_size_bytes: usize,
    pub eth_rx_max_batch: usize,
    pub preemption_mode: PreemptionMode,
    pub scheduling_policy: SchedulingPolicyKind,
    /// Benchmark-harness stop condition: dispatcher halts after this many
    /// packets have been observed. `None` means run until externally
    /// stopped. Mirrors `BENCHMARK_STOP_AT_PACKET` in
    /// `dp/core/worker.c`'s `handle_fake_new_packet`.
    pub stop_after_packets: Option<u64>,
    /// Benchmark-harness stop condition: dispatcher halts after this many
    /// microseconds have elapsed since it started. `None` means no
    /// time-based stop. Mirrors `BENCHMARK_STOP_AT_TIME` in
    /// `dp/core/worker.c`, the elapsed-wall-clock twin of
    /// `stop_after_packets`.
    pub stop_after_us: Option<u64>,
}

impl Config {
    pub fn budget_ns(&self, class: usize) -> u64 {
        self.budgets_ns.get(class).copied().unwrap_or(u64::MAX)
    }

    pub fn slo_ns(&self, class: usize) -> u64 {
        self.slos_ns.get(class).copied().unwrap_or(u64::MAX)
    }
}

pub struct ConfigBuilder {
    num_workers: usize,
    num_classes: usize,
    slos_ns: Vec<u64>,
    budgets_ns: Vec<u64>,
    context_pool_size: usize,
    stack_size_bytes: usize,
    eth_rx_max_batch: usize,
    preemption_mode: PreemptionMode,
    scheduling_policy: SchedulingPolicyKind,
    stop_after_packets: Option<u64>,
    stop_after_us: Option<u64>,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self {
            num_workers: 1,
            num_classes: 1,
            slos_ns: vec![1_000_000],
            budgets_ns: vec![2_000],
            context_pool_size: 64,
            stack_size_bytes: DEFAULT_STACK_SIZE,
            eth_rx_max_batch: 32,
            preemption_mode: PreemptionMode::Cooperative,
            scheduling_policy: SchedulingPolicyKind::Fifo,
            stop_after_packets: None,
            stop_after_us: None,
        }
    }
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_workers(mut self, n: usize) -> Self {
        self.num_workers = n;
        self
    }

    /// Sizes `num_workers` to the machine's available cores, reserving one
    /// for the dispatcher itself (spec.md §5: "one dispatcher thread and N
    /// worker threads", each pinned to a distinct core). Falls back to a
    /// single worker on a uniprocessor box rather than zero.
    pub fn num_workers_from_available_cpus(mut self) -> Self {
        self.num_workers = num_cpus::get().saturating_sub(1).max(1);
        self
    }

    pub fn classes(mut self, slos_ns: Vec<u64>, budgets_ns: Vec<u64>) -> Self {
        self.num_classes = slos_ns.len();
        self.slos_ns = slos_ns;
        self.budgets_ns = budgets_ns;
        self
    }

    pub fn context_pool_size(mut self, n: usize) -> Self {
        self.context_pool_size = n;
        self
    }

    pub fn stack_size_bytes(mut self, n: usize) -> Self {
        self.stack_size_bytes = n;
        self
    }

    pub fn eth_rx_max_batch(mut self, n: usize) -> Self {
        self.eth_rx_max_batch = n;
        self
    }

    pub fn preemption_mode(mut self, mode: PreemptionMode) -> Self {
        self.preemption_mode = mode;
        self
    }

    pub fn scheduling_policy(mut self, policy: SchedulingPolicyKind) -> Self {
        self.scheduling_policy = policy;
        self
    }

    pub fn stop_after_packets(mut self, n: u64) -> Self {
        self.stop_after_packets = Some(n);
        self
    }

    pub fn stop_after_us(mut self, n: u64) -> Self {
        self.stop_after_us = Some(n);
        self
    }

    pub fn build(self) -> DispatchResult<Config> {
        if self.num_workers == 0 {
            return Err(DispatchError::InvalidConfig(
                "num_workers must be at least 1".into(),
            ));
        }
        if self.num_workers > MAX_WORKERS {
            return Err(DispatchError::TooManyWorkers {
                requested: self.num_workers,
                max: MAX_WORKERS,
            });
        }
        if self.slos_ns.len() != self.num_classes || self.budgets_ns.len() != self.num_classes {
            return Err(DispatchError::InvalidConfig(
                "slos_ns and budgets_ns must have exactly num_classes entries".into(),
            ));
        }
        if self.slos_ns.iter().any(|&s| s == 0) {
            return Err(DispatchError::InvalidConfig(
                "per-class SLO must be nonzero".into(),
            ));
        }
        if self.context_pool_size == 0 {
            return Err(DispatchError::InvalidConfig(
                "context_pool_size must be at least 1".into(),
            ));
        }
        if self.eth_rx_max_batch == 0 || self.eth_rx_max_batch > ETH_RX_MAX_BATCH {
            return Err(DispatchError::InvalidConfig(format!(
                "eth_rx_max_batch must be in 1..={ETH_RX_MAX_BATCH}"
            )));
        }
        #[cfg(not(feature = "interrupt-preempt"))]
        if self.preemption_mode == PreemptionMode::Interrupt {
            return Err(DispatchError::InvalidConfig(
                "PreemptionMode::Interrupt requires building with the `interrupt-preempt` feature".into(),
            ));
        }

        Ok(Config {
            num_workers: self.num_workers,
            num_classes: self.num_classes,
            slos_ns: self.slos_ns,
            budgets_ns: self.budgets_ns,
            context_pool_size: self.context_pool_size,
            stack_size_bytes: self.stack_size_bytes,
            eth_rx_max_batch: self.eth_rx_max_batch,
            preemption_mode: self.preemption_mode,
            scheduling_policy: self.scheduling_policy,
            stop_after_packets: self.stop_after_packets,
            stop_after_us: self.stop_after_us,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_too_many_workers() {
        let result = ConfigBuilder::new().num_workers(MAX_WORKERS + 1).build();
        assert!(matches!(result, Err(DispatchError::TooManyWorkers { .. })));
    }

    #[test]
    fn rejects_mismatched_class_vectors() {
        let mut builder = ConfigBuilder::new();
        builder.num_classes = 2;
        let result = builder.build();
        assert!(matches!(result, Err(DispatchError::InvalidConfig(_))));
    }

    #[test]
    fn default_config_is_valid() {
        assert!(ConfigBuilder::new().build().is_ok());
    }

    #[test]
    fn stop_after_us_defaults_to_none_and_is_settable() {
        let default = ConfigBuilder::new().build().unwrap();
        assert_eq!(default.stop_after_us, None);

        let configured = ConfigBuilder::new().stop_after_us(250).build().unwrap();
        assert_eq!(configured.stop_after_us, Some(250));
    }

    #[test]
    fn preemption_mode_none_is_constructible() {
        let cfg = ConfigBuilder::new().preemption_mode(PreemptionMode::None).build().unwrap();
        assert_eq!(cfg.preemption_mode, PreemptionMode::None);
    }

    #[test]
    #[cfg(not(feature = "interrupt-preempt"))]
    fn interrupt_mode_is_rejected_without_the_feature() {
        let result = ConfigBuilder::new().preemption_mode(PreemptionMode::Interrupt).build();
        assert!(matches!(result, Err(DispatchError::InvalidConfig(_))));
    }

    #[test]
    fn rejects_eth_rx_max_batch_above_the_compile_time_cap() {
        let result = ConfigBuilder::new().eth_rx_max_batch(ETH_RX_MAX_BATCH + 1).build();
        assert!(matches!(result, Err(DispatchError::InvalidConfig(_))));
    }

    #[test]
    fn num_workers_from_available_cpus_is_at_least_one() {
        let builder = ConfigBuilder::new().num_workers_from_available_cpus();
        // A box with more than MAX_WORKERS+1 cores would (correctly) fail
        // validation here; this crate's worker count is hard-capped (spec
        // §6), so that case is TooManyWorkers, not a bug in the helper.
        match builder.build() {
            Ok(cfg) => assert!(cfg.num_workers >= 1),
            Err(DispatchError::TooManyWorkers { .. }) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
}
