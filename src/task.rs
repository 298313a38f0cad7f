//! Task representation and the per-class FIFO task queue.
//!
//! `TaskQueue` mirrors `original_source/inc/ix/dispatch.h`'s singly linked
//! `task_queue` / `tskq_enqueue_head` / `tskq_enqueue_tail` / `tskq_dequeue`:
//! head insertion for a task resumed after preemption, tail insertion for a
//! freshly arrived packet, and O(1) dequeue from the head. A `VecDeque`
//! gives us those four operations directly without reimplementing a linked
//! list; nothing outside this module is allowed to index into the queue.

use std::collections::VecDeque;

use crate::context::ContextHandle;

/// Work-function identity. The registry (`registry.rs`) maps this to a
/// `WorkFn`; the original dispatched on `db_pkg->type` inside
/// `do_db_generic_work` (GET/PUT/DELETE/SCAN/SEEK) plus a raw CPU-burn
/// benchmark type in `handle_fake_new_packet`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestType {
    Get,
    Put,
    Delete,
    Scan,
    Seek,
    /// Synthetic fixed-duration work used by the benchmark harness (S1/S2).
    Synthetic,
}

/// Opaque payload handle carried from the networker through to the work
/// function. Replaces the original's 32-bit pointer-half packing
/// (`msw`/`lsw` in `handle_new_packet`) with a typed owning handle, per
/// spec's Design Notes.
#[derive(Debug)]
pub struct Packet {
    pub bytes: Vec<u8>,
}

impl Packet {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }
}

/// A unit of dispatchable work. `runnable` is `Some` only for a task that
/// was preempted mid-execution and is waiting to be resumed; a freshly
/// arrived packet has no context yet (one is allocated by the worker at
/// dispatch time, from its local `ContextPool`).
#[derive(Debug)]
pub struct Task {
    pub request_type: RequestType,
    pub class: usize,
    pub payload: Packet,
    pub timestamp_ns: u64,
    pub runnable: Option<ContextHandle>,
}

impl Task {
    pub fn fresh(request_type: RequestType, class: usize, payload: Packet, timestamp_ns: u64) -> Self {
        Self {
            request_type,
            class,
            payload,
            timestamp_ns,
            runnable: None,
        }
    }

    pub fn is_resumed(&self) -> bool {
        self.runnable.is_some()
    }
}

/// Per-class FIFO queue. Only `enqueue_head`, `enqueue_tail`, `dequeue`, and
/// `peek_head_timestamp` are exposed — the queue never supports arbitrary
/// access, matching spec §4.2.
#[derive(Debug, Default)]
pub struct TaskQueue {
    tasks: VecDeque<Task>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self { tasks: VecDeque::new() }
    }

    /// Reinsert a preempted task at the front so it is the next one
    /// dequeued from this class.
    pub fn enqueue_head(&mut self, task: Task) {
        self.tasks.push_front(task);
    }

    /// Append a freshly arrived task at the back.
    pub fn enqueue_tail(&mut self, task: Task) {
        self.tasks.push_back(task);
    }

    pub fn dequeue(&mut self) -> Option<Task> {
        self.tasks.pop_front()
    }

    /// Timestamp of the head task, used by the scheduling policy without
    /// removing the task from the queue.
    pub fn peek_head_timestamp(&self) -> Option<u64> {
        self.tasks.front().map(|t| t.timestamp_ns)
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }
}
