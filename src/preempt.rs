//! The preemption channel: how the dispatcher tells a worker to suspend
//! its current task and how the worker's hot path finds out it's been
//! asked to.
//!
//! Two implementations, selected by `Config::preemption_mode`. Both honor
//! the same contract: the request slot is left alone until after the
//! worker finishes publishing its response (whether a completion or a
//! preemption), so the dispatcher never observes a half-updated slot.

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;

#[cfg(feature = "interrupt-preempt")]
use tracing::warn;

use crate::config::{Config, PreemptionMode};
use crate::error::DispatchResult;

pub trait PreemptChannel: Send + Sync {
    /// Dispatcher side: ask worker `worker_id` to preempt its current task.
    fn fire(&self, worker_id: usize);

    /// Worker side: has a preemption been requested of me since my last
    /// check? Clears the request as a side effect.
    fn take_requested(&self, worker_id: usize) -> bool;

    /// Mask this channel's preemption mechanism for `worker_id` around a
    /// critical section the worker must not be interrupted inside —
    /// response-slot publication, matching spec.md's "interrupts on a
    /// worker core are masked while it manipulates its response slot".
    /// Cooperative mode has no real interrupt to mask (a fired request just
    /// sits in an atomic counter until the next checkpoint poll, which
    /// never races a response-slot write), so the default is a no-op.
    fn mask(&self, _worker_id: usize) {}

    /// Undo the most recent `mask` call for `worker_id`.
    fn unmask(&self, _worker_id: usize) {}
}

/// Builds the `PreemptChannel` a `Config` selects, so `preemption_mode`
/// actually governs construction rather than sitting unread next to a
/// caller that builds its own channel by hand.
pub fn build_channel(config: &Config) -> DispatchResult<Arc<dyn PreemptChannel>> {
    match config.preemption_mode {
        PreemptionMode::None => Ok(Arc::new(NullChannel)),
        PreemptionMode::Cooperative => Ok(Arc::new(CooperativeChannel::new(config.num_workers))),
        #[cfg(feature = "interrupt-preempt")]
        PreemptionMode::Interrupt => {
            let signum = unsafe { libc::SIGRTMIN() };
            InterruptChannel::new(config.num_workers, signum).map(|chan| Arc::new(chan) as Arc<dyn PreemptChannel>)
        }
        // `ConfigBuilder::build` rejects `PreemptionMode::Interrupt` before a
        // `Config` can reach this function without the feature enabled.
        #[cfg(not(feature = "interrupt-preempt"))]
        PreemptionMode::Interrupt => unreachable!(
            "PreemptionMode::Interrupt cannot be constructed without the `interrupt-preempt` feature"
        ),
    }
}

/// No preemption channel at all: `fire` is a no-op and `take_requested`
/// never reports a pending request. Backs `PreemptionMode::None`.
pub struct NullChannel;

impl PreemptChannel for NullChannel {
    fn fire(&self, _worker_id: usize) {}

    fn take_requested(&self, _worker_id: usize) -> bool {
        false
    }
}

/// Per-worker atomic counter, bumped by the dispatcher and polled by the
/// worker at checkpoints (`ExecutionContext` boundaries / loop-body
/// iterations in the work function). No real interrupt involved — this is
/// the fallback mode and the only one available off Linux/x86_64.
pub struct CooperativeChannel {
    requested: Vec<AtomicU32>,
}

impl CooperativeChannel {
    pub fn new(num_workers: usize) -> Self {
        Self {
            requested: (0..num_workers).map(|_| AtomicU32::new(0)).collect(),
        }
    }
}

impl PreemptChannel for CooperativeChannel {
    fn fire(&self, worker_id: usize) {
        self.requested[worker_id].fetch_add(1, Ordering::Release);
    }

    fn take_requested(&self, worker_id: usize) -> bool {
        self.requested[worker_id].swap(0, Ordering::Acquire) > 0
    }
}

/// Real-time-signal-based cross-core preemption. The userland analogue of
/// the original's `PREEMPT_VECTOR` inter-processor interrupt
/// (`dp/core/worker.c`): `fire` sends a signal via `pthread_kill`, the
/// worker's signal handler (installed with `sigaltstack`, see
/// `platform::signal`) flips the same per-worker flag a cooperative
/// checkpoint would, and the worker's hot path polls it identically to the
/// cooperative case. Requires the `interrupt-preempt` feature and Linux.
#[cfg(feature = "interrupt-preempt")]
pub struct InterruptChannel {
    thread_ids: Vec<AtomicI32>,
    requested: Vec<AtomicU32>,
    /// One gate per worker so `mask`/`unmask` only touch `pthread_sigmask`
    /// at the outermost nesting transition, matching `concord_disable`/
    /// `concord_enable`'s ref-counted semantics in the original.
    gates: Vec<PreemptGate>,
    signum: i32,
}

#[cfg(feature = "interrupt-preempt")]
static FLAGS_PTR: std::sync::atomic::AtomicPtr<AtomicU32> = std::sync::atomic::AtomicPtr::new(std::ptr::null_mut());
#[cfg(feature = "interrupt-preempt")]
static FLAGS_LEN: AtomicU32 = AtomicU32::new(0);

#[cfg(feature = "interrupt-preempt")]
extern "C" fn interrupt_preempt_handler(_signum: i32) {
    // Signal-safe: only atomic stores, no allocation, no locks. The worker
    // id is recovered from a thread-local set by `InterruptChannel::arm_self`.
    CURRENT_WORKER_ID.with(|id| {
        let id = id.get();
        if id == usize::MAX {
            return;
        }
        let ptr = FLAGS_PTR.load(Ordering::Acquire);
        let len = FLAGS_LEN.load(Ordering::Acquire) as usize;
        if ptr.is_null() || id >= len {
            return;
        }
        unsafe {
            (*ptr.add(id)).fetch_add(1, Ordering::Release);
        }
    });
}

#[cfg(feature = "interrupt-preempt")]
thread_local! {
    static CURRENT_WORKER_ID: std::cell::Cell<usize> = std::cell::Cell::new(usize::MAX);
}

#[cfg(feature = "interrupt-preempt")]
impl InterruptChannel {
    pub fn new(num_workers: usize, signum: i32) -> DispatchResult<Self> {
        let chan = Self {
            thread_ids: (0..num_workers).map(|_| AtomicI32::new(0)).collect(),
            requested: (0..num_workers).map(|_| AtomicU32::new(0)).collect(),
            gates: (0..num_workers).map(|_| PreemptGate::new()).collect(),
            signum,
        };
        FLAGS_PTR.store(chan.requested.as_ptr() as *mut AtomicU32, Ordering::Release);
        FLAGS_LEN.store(chan.requested.len() as u32, Ordering::Release);
        crate::platform::signal::register_handler(signum, interrupt_preempt_handler)
            .map_err(crate::error::DispatchError::SignalRegistration)?;
        Ok(chan)
    }

    /// Called once by each worker thread after pinning, before entering
    /// its run loop: records this thread's id (for `pthread_kill` targets)
    /// and worker index (for the handler to recover).
    pub fn arm_self(&self, worker_id: usize) {
        self.thread_ids[worker_id].store(
            crate::platform::signal::current_thread() as i32,
            Ordering::Release,
        );
        CURRENT_WORKER_ID.with(|id| id.set(worker_id));
    }
}

#[cfg(feature = "interrupt-preempt")]
impl PreemptChannel for InterruptChannel {
    fn fire(&self, worker_id: usize) {
        let tid = self.thread_ids[worker_id].load(Ordering::Acquire);
        if tid == 0 {
            return;
        }
        let _ = crate::platform::signal::send_signal(tid as libc::pthread_t, self.signum);
    }

    fn take_requested(&self, worker_id: usize) -> bool {
        self.requested[worker_id].swap(0, Ordering::Acquire) > 0
    }

    /// Actually blocks the preemption signal at the OS level on the outer
    /// `mask` call of a (possibly nested) pair, so the handler cannot run
    /// mid-response-publication — not merely a flag the handler happens to
    /// ignore.
    fn mask(&self, worker_id: usize) {
        if self.gates[worker_id].disable() {
            if let Err(err) = crate::platform::signal::block_signal(self.signum) {
                warn!(%err, "failed to mask preemption signal");
            }
        }
    }

    fn unmask(&self, worker_id: usize) {
        if self.gates[worker_id].enable() {
            if let Err(err) = crate::platform::signal::unblock_signal(self.signum) {
                warn!(%err, "failed to unmask preemption signal");
            }
        }
    }
}

/// Reference-counted preemption gate, modeled on `concord_disable`/
/// `concord_enable` in `dp/core/worker.c`: a positive count disables
/// preemption (used to mask the window around response-slot publication),
/// zero or negative enables it.
#[derive(Default)]
pub struct PreemptGate {
    count: std::sync::atomic::AtomicI32,
}

impl PreemptGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` exactly when this call is the outermost `disable`
    /// (count was `0`, the enabled state, before this call) — the moment a
    /// caller layering real masking on top should actually engage it.
    pub fn disable(&self) -> bool {
        self.count.fetch_add(1, Ordering::AcqRel) == 0
    }

    /// Returns `true` exactly when this call is the outermost `enable`
    /// (count was `1` before this call, about to return to the enabled
    /// state) — the moment to actually disengage real masking.
    pub fn enable(&self) -> bool {
        self.count.fetch_sub(1, Ordering::AcqRel) == 1
    }

    pub fn is_enabled(&self) -> bool {
        self.count.load(Ordering::Acquire) <= 0
    }
}
