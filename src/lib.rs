// Microsecond-scale request dispatcher core: the scheduling loop, worker
// execution engine, preemption protocol, and SPSC control slots that sit
// between a networker and a storage/compute work function.
#![warn(clippy::all)]
#![warn(rust_2018_idioms)]
// Unsafe code is isolated to `platform` and documented there with safety
// justifications; everything else in the crate is safe Rust.

//! # dispatch-core
//!
//! One dispatcher thread and up to [`config::MAX_WORKERS`] pinned worker
//! threads exchange requests and responses through lock-free SPSC slots.
//! The dispatcher classifies inbound packets into per-class FIFO queues,
//! picks the next task per a pluggable [`policy::SchedulingPolicy`], and
//! preempts a worker that has overrun its class's budget. Workers run
//! interruptible work functions on pooled, reusable execution contexts.
//!
//! ## Layout
//!
//! - [`slot`]: the SPSC request/response slot pair.
//! - [`task`]: `Task` and the per-class FIFO `TaskQueue`.
//! - [`context`]: the bounded, per-worker context pool.
//! - [`platform`]: RDTSC, CPU affinity, the x86_64 context switch, signal
//!   plumbing for interrupt-mode preemption.
//! - [`preempt`]: the cooperative and interrupt preemption channels.
//! - [`policy`]: FIFO and SLO-weighted scheduling.
//! - [`registry`]: the external interfaces (networker, transmitter,
//!   classifier, work function registry) a caller implements.
//! - [`dispatcher`] / [`worker`]: the two run loops.
//! - [`config`]: frozen startup configuration.
//! - [`stats`]: throughput and service-time counters.
//! - [`error`]: fallible, non-hot-path error types.

pub mod config;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod platform;
pub mod policy;
pub mod preempt;
pub mod registry;
pub mod slot;
pub mod stats;
pub mod task;
pub mod timer;
pub mod worker;

pub mod prelude {
    pub use crate::config::{Config, ConfigBuilder, PreemptionMode, SchedulingPolicyKind};
    pub use crate::dispatcher::Dispatcher;
    pub use crate::error::{DispatchError, DispatchResult};
    pub use crate::policy::{Fifo, SchedulingPolicy, SloWeighted};
    pub use crate::preempt::{build_channel, CooperativeChannel, NullChannel, PreemptChannel};
    pub use crate::registry::{Classifier, Networker, Transmitter, WorkRegistry};
    pub use crate::slot::SlotTable;
    pub use crate::task::{Packet, RequestType, Task};
    pub use crate::timer::{Clock, TscClock};
    pub use crate::worker::Worker;
}

/// Calibrates the TSC. Call once, before spawning the dispatcher or any
/// worker threads.
pub fn init() -> error::DispatchResult<()> {
    let calibration = timer::calibrate_tsc();
    if calibration.confidence < 0.9 {
        return Err(error::DispatchError::CalibrationFailed {
            confidence: calibration.confidence,
        });
    }
    Ok(())
}
