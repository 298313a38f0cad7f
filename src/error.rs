//! Fallible, non-hot-path error types.
//!
//! Hot-path operations (slot rendezvous, queue ops, policy selection) never
//! return `Result`: a protocol violation there is fatal and handled by
//! `panic!` at the call site (see `slot.rs`), matching the disposition table
//! in spec §7. `DispatchError` covers only startup and configuration.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("worker count {requested} exceeds MAX_WORKERS ({max})")]
    TooManyWorkers { requested: usize, max: usize },

    #[error("context pool construction failed: {0}")]
    PoolInit(String),

    #[error("failed to register preemption signal handler: {0}")]
    SignalRegistration(String),

    #[error("failed to pin thread to cpu {cpu_id}: {reason}")]
    CpuPin { cpu_id: usize, reason: String },

    #[error("TSC calibration confidence too low: {confidence:.2}")]
    CalibrationFailed { confidence: f64 },
}

pub type DispatchResult<T> = Result<T, DispatchError>;
