//! RDTSC-based cycle counting and tick/nanosecond budget tracking.
//!
//! The dispatcher and workers both need to reason about time in two units:
//! raw TSC ticks (cheapest to read, used for the preemption budget check in
//! the worker's checkpoint) and nanoseconds (used for SLO lateness and for
//! configuration, since `Config::slos` is expressed in nanoseconds).
//! `calibrate_tsc` establishes the ticks-per-ns conversion once at startup.

use std::sync::atomic::{AtomicU64, Ordering};

use smallvec::SmallVec;

pub use crate::platform::{read_tsc, read_tsc_fenced, read_tsc_serialized};

static CPU_FREQUENCY_HZ: AtomicU64 = AtomicU64::new(0);
static RDTSC_OVERHEAD: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy)]
pub struct CalibrationResult {
    pub cpu_freq_hz: u64,
    pub rdtsc_overhead_ticks: u64,
    pub ticks_per_ns: f64,
    pub confidence: f64,
}

/// Convert a tick count to nanoseconds using the last calibration result.
/// Returns 0 if `calibrate_tsc` has not been called yet.
pub fn ticks_to_ns(ticks: u64) -> u64 {
    let hz = CPU_FREQUENCY_HZ.load(Ordering::Relaxed);
    if hz == 0 {
        return 0;
    }
    ((ticks as u128 * 1_000_000_000u128) / hz as u128) as u64
}

pub fn ns_to_ticks(ns: u64) -> u64 {
    let hz = CPU_FREQUENCY_HZ.load(Ordering::Relaxed);
    ((ns as u128 * hz as u128) / 1_000_000_000u128) as u64
}

/// Abstracts "now" (in nanoseconds) for the dispatcher's time-based
/// decisions — the per-worker preemption budget check and the
/// `stop_after_us` benchmark condition — so they can be driven
/// deterministically in tests instead of depending on real RDTSC timing,
/// which isn't reproducible in a test harness.
pub trait Clock: Send + Sync {
    fn now_ns(&self) -> u64;
}

/// The real clock: RDTSC converted through the calibrated tick/ns ratio.
/// `Dispatcher::new` uses this by default; tests inject a fake one via
/// `Dispatcher::with_clock`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TscClock;

impl Clock for TscClock {
    fn now_ns(&self) -> u64 {
        ticks_to_ns(read_tsc())
    }
}

/// A single hot-path timer reading, compensated for measured RDTSC
/// overhead.
pub struct HotPathTimer {
    start_ticks: u64,
    overhead: u64,
}

impl HotPathTimer {
    #[inline(always)]
    pub fn start() -> Self {
        Self {
            start_ticks: read_tsc(),
            overhead: RDTSC_OVERHEAD.load(Ordering::Relaxed),
        }
    }

    #[inline(always)]
    pub fn start_serialized() -> Self {
        Self {
            start_ticks: read_tsc_serialized(),
            overhead: RDTSC_OVERHEAD.load(Ordering::Relaxed),
        }
    }

    #[inline(always)]
    pub fn elapsed_ticks(&self) -> u64 {
        read_tsc()
            .saturating_sub(self.start_ticks)
            .saturating_sub(self.overhead)
    }

    #[inline(always)]
    pub fn elapsed_ns(&self) -> u64 {
        ticks_to_ns(self.elapsed_ticks())
    }

    #[inline(always)]
    pub fn reset(&mut self) {
        self.start_ticks = read_tsc();
    }
}

/// Measure RDTSC frequency against the wall clock and cache the result.
/// Called once during `crate::init`.
pub fn calibrate_tsc() -> CalibrationResult {
    const CALIBRATION_ROUNDS: usize = 100;
    const CALIBRATION_DURATION_MS: u64 = 10;

    let overhead = measure_rdtsc_overhead();
    RDTSC_OVERHEAD.store(overhead, Ordering::Relaxed);

    let mut frequencies = Vec::with_capacity(CALIBRATION_ROUNDS);
    for _ in 0..CALIBRATION_ROUNDS {
        let start_wall = std::time::Instant::now();
        let start_tsc = read_tsc_serialized();

        while start_wall.elapsed().as_millis() < CALIBRATION_DURATION_MS as u128 {
            std::hint::spin_loop();
        }

        let end_tsc = read_tsc_serialized();
        let elapsed_wall = start_wall.elapsed();

        let ticks = end_tsc.saturating_sub(start_tsc);
        let nanos = elapsed_wall.as_nanos().max(1) as u64;
        let freq_hz = (ticks as f64 * 1_000_000_000.0 / nanos as f64) as u64;
        frequencies.push(freq_hz);
    }

    frequencies.sort_unstable();
    let median_freq = frequencies[frequencies.len() / 2];

    let mean = frequencies.iter().sum::<u64>() as f64 / frequencies.len() as f64;
    let variance = frequencies
        .iter()
        .map(|&f| {
            let diff = f as f64 - mean;
            diff * diff
        })
        .sum::<f64>()
        / frequencies.len() as f64;
    let std_dev = variance.sqrt();
    let confidence = if std_dev > 0.0 {
        1.0 / (1.0 + std_dev / mean)
    } else {
        1.0
    };

    CPU_FREQUENCY_HZ.store(median_freq, Ordering::Relaxed);

    CalibrationResult {
        cpu_freq_hz: median_freq,
        rdtsc_overhead_ticks: overhead,
        ticks_per_ns: median_freq as f64 / 1_000_000_000.0,
        confidence,
    }
}

fn measure_rdtsc_overhead() -> u64 {
    const ROUNDS: usize = 10_000;
    let mut measurements = Vec::with_capacity(ROUNDS);

    for _ in 0..100 {
        let _ = read_tsc();
    }

    for _ in 0..ROUNDS {
        let start = read_tsc_serialized();
        std::hint::black_box(read_tsc());
        let end = read_tsc_serialized();
        measurements.push(end.saturating_sub(start));
    }

    measurements.sort_unstable();
    measurements[ROUNDS / 10]
}

/// Tracks ticks spent against a per-task preemption budget. The dispatcher
/// derives the budget from `Config::budget_ns(class)`; the worker charges
/// it at each checkpoint and yields once exhausted.
#[derive(Debug)]
pub struct TickBudget {
    budget: u64,
    spent: u64,
    /// A handful of checkpoint labels per task at most (the original's own
    /// `handle_request`/`handle_context`/`finish_request` split); inline
    /// storage avoids a heap allocation on the hot path for the common case
    /// of a task that never spills past a few checkpoints.
    breakdown: SmallVec<[(&'static str, u64); 8]>,
}

impl TickBudget {
    pub fn with_budget_ticks(budget: u64) -> Self {
        Self {
            budget,
            spent: 0,
            breakdown: SmallVec::new(),
        }
    }

    pub fn with_budget_ns(budget_ns: u64) -> Self {
        Self::with_budget_ticks(ns_to_ticks(budget_ns))
    }

    #[inline]
    pub fn charge(&mut self, label: &'static str, ticks: u64) {
        self.spent = self.spent.saturating_add(ticks);
        self.breakdown.push((label, ticks));
    }

    #[inline(always)]
    pub fn remaining(&self) -> u64 {
        self.budget.saturating_sub(self.spent)
    }

    #[inline(always)]
    pub fn exhausted(&self) -> bool {
        self.spent >= self.budget
    }

    pub fn reset(&mut self) {
        self.spent = 0;
        self.breakdown.clear();
    }

    pub fn breakdown(&self) -> &[(&'static str, u64)] {
        &self.breakdown
    }
}

pub struct ScopedTickMeasurement<'a> {
    budget: &'a mut TickBudget,
    label: &'static str,
    start: u64,
}

impl<'a> ScopedTickMeasurement<'a> {
    pub fn new(budget: &'a mut TickBudget, label: &'static str) -> Self {
        Self {
            budget,
            label,
            start: read_tsc(),
        }
    }
}

impl<'a> Drop for ScopedTickMeasurement<'a> {
    fn drop(&mut self) {
        let elapsed = read_tsc().saturating_sub(self.start);
        self.budget.charge(self.label, elapsed);
    }
}

#[macro_export]
macro_rules! measure_ticks {
    ($budget:expr, $label:literal, $code:block) => {{
        let _guard = $crate::timer::ScopedTickMeasurement::new($budget, $label);
        $code
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_tracks_remaining() {
        let mut budget = TickBudget::with_budget_ticks(8);
        budget.charge("setup", 2);
        budget.charge("work", 3);
        assert_eq!(budget.remaining(), 3);
        assert!(!budget.exhausted());
        budget.charge("teardown", 3);
        assert_eq!(budget.remaining(), 0);
        assert!(budget.exhausted());
    }

    #[test]
    fn calibration_reports_plausible_frequency() {
        let result = calibrate_tsc();
        assert!(result.cpu_freq_hz > 0);
        assert!(result.confidence > 0.0);
    }
}
