//! The SPSC request/response slot pair, one per worker.
//!
//! Layout and flag encodings follow `original_source/inc/ix/dispatch.h`'s
//! `dispatcher_request` / `worker_response` structs exactly: a request flag
//! with a `WAITING`/`ACTIVE` domain, a response flag with a
//! `RUNNING`/`FINISHED`/`PREEMPTED`/`PROCESSED` domain, and a category byte
//! distinguishing a fresh packet from a resumed context. The dispatcher is
//! the sole producer of request slots and sole consumer of response slots;
//! each worker is the reverse. No other thread touches a given pair.

use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::context::ContextHandle;
use crate::task::{Packet, RequestType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestFlag {
    Waiting = 0x00,
    Active = 0x01,
}

impl RequestFlag {
    fn from_u8(v: u8) -> Self {
        match v {
            0x00 => RequestFlag::Waiting,
            0x01 => RequestFlag::Active,
            other => panic!("request slot flag out of domain: {other:#x}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseFlag {
    Running = 0x00,
    Finished = 0x01,
    Preempted = 0x02,
    Processed = 0x03,
}

impl ResponseFlag {
    fn from_u8(v: u8) -> Self {
        match v {
            0x00 => ResponseFlag::Running,
            0x01 => ResponseFlag::Finished,
            0x02 => ResponseFlag::Preempted,
            0x03 => ResponseFlag::Processed,
            other => panic!("response slot flag out of domain: {other:#x}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    NoContent,
    Packet,
    Context,
}

/// Dispatcher-to-worker handoff. `publish` is called by the dispatcher
/// only while `observe` reports `Waiting`; `observe` is polled by the
/// worker in a tight spin loop.
pub struct RequestPayload {
    pub request_type: RequestType,
    pub category: Category,
    pub class: usize,
    pub packet: Packet,
    pub timestamp_ns: u64,
    /// Present only when `category == Context`: the suspended coroutine to
    /// resume, carried from the dispatcher's re-queued task (spec §3's
    /// Request Slot `runnable` field).
    pub runnable: Option<ContextHandle>,
}

#[repr(C, align(64))]
pub struct RequestSlot {
    flag: CachePadded<AtomicU8>,
    /// Not an atomic: the dispatcher is this slot's sole writer and only
    /// ever writes while `flag` reads `Waiting`; the worker is the sole
    /// reader and only ever reads after observing `Active`. The `flag`'s
    /// release (on publish) / acquire (on observe) pair is the entire
    /// happens-before edge, matching `dispatcher_request`'s plain struct
    /// fields in the original, which carry no synchronization of their own.
    payload: UnsafeCell<Option<RequestPayload>>,
}

// SAFETY: see the field comment above — access is disciplined by the
// flag's own release/acquire ordering, not by any lock.
unsafe impl Sync for RequestSlot {}

impl Default for RequestSlot {
    fn default() -> Self {
        Self {
            flag: CachePadded::new(AtomicU8::new(RequestFlag::Waiting as u8)),
            payload: UnsafeCell::new(None),
        }
    }
}

impl RequestSlot {
    pub fn observe(&self) -> RequestFlag {
        RequestFlag::from_u8(self.flag.load(Ordering::Acquire))
    }

    /// Called by the dispatcher: stashes the payload then raises the flag
    /// to `Active`, establishing happens-before for the worker's read.
    pub fn publish(
        &self,
        request_type: RequestType,
        category: Category,
        class: usize,
        packet: Packet,
        timestamp_ns: u64,
        runnable: Option<ContextHandle>,
    ) {
        debug_assert_eq!(self.observe(), RequestFlag::Waiting);
        // SAFETY: only the dispatcher calls `publish`, and only while the
        // flag is `Waiting`, so no worker is reading `payload` concurrently.
        unsafe {
            *self.payload.get() = Some(RequestPayload {
                request_type,
                category,
                class,
                packet,
                timestamp_ns,
                runnable,
            });
        }
        self.flag.store(RequestFlag::Active as u8, Ordering::Release);
    }

    /// Called by the worker immediately after observing `Active`: takes
    /// the payload and resets the flag to `Waiting` before doing anything
    /// else, matching the original's reset-before-dispatch ordering in
    /// `handle_request`.
    pub fn take(&self) -> RequestPayload {
        // SAFETY: only the worker calls `take`, and only after `observe`
        // returned `Active`, whose Acquire load pairs with the dispatcher's
        // Release store in `publish` that made this write visible.
        let payload = unsafe { (*self.payload.get()).take() }.expect("request slot active with no payload");
        self.flag.store(RequestFlag::Waiting as u8, Ordering::Release);
        payload
    }
}

/// Worker-to-dispatcher handoff. Conceptually the reverse of
/// `RequestSlot`: the worker publishes a completion, preemption, or
/// acknowledgement; the dispatcher reclaims it on its next loop iteration.
#[repr(C, align(64))]
pub struct ResponseSlot {
    flag: CachePadded<AtomicU8>,
    /// Same discipline as `RequestSlot::payload`, mirrored: the worker is
    /// the sole writer (only while the flag reads `Running`/`Processed`,
    /// i.e. never while the dispatcher might be reclaiming), the dispatcher
    /// the sole reader (only after observing `Finished`/`Preempted`).
    payload: UnsafeCell<Option<ResponsePayload>>,
}

// SAFETY: see the field comment above.
unsafe impl Sync for ResponseSlot {}

/// Worker→dispatcher completion/preemption record. On `Finished`, `run_ns`
/// and `gen_ns` are the work function's own timing; `runnable` is `None`.
/// On `Preempted`, `run_ns`/`gen_ns` are zero and `runnable` carries the
/// suspended coroutine plus the echoed `request_type`/`class`/
/// `timestamp_ns` the dispatcher needs to rebuild a `Task` and
/// `enqueue_head` it, matching the original's unconditional `.type`/
/// `.mbuf`/`.timestamp` echo in `finish_request` (`dp/core/worker.c`).
/// `class` is not part of the original's wire struct (there `type` doubles
/// as the NIC port/class index); this crate's `Classifier` separates the
/// two, so the worker echoes the class explicitly rather than requiring
/// the dispatcher to re-derive it from a `RequestType` it may not map
/// bijectively to one class.
pub struct ResponsePayload {
    pub request_type: RequestType,
    pub class: usize,
    pub timestamp_ns: u64,
    pub run_ns: u64,
    pub gen_ns: u64,
    pub runnable: Option<ContextHandle>,
}

impl Default for ResponseSlot {
    fn default() -> Self {
        Self {
            flag: CachePadded::new(AtomicU8::new(ResponseFlag::Processed as u8)),
            payload: UnsafeCell::new(None),
        }
    }
}

impl ResponseSlot {
    pub fn observe(&self) -> ResponseFlag {
        ResponseFlag::from_u8(self.flag.load(Ordering::Acquire))
    }

    /// Called by the worker when a request either completes or is
    /// preempted.
    pub fn publish(&self, flag: ResponseFlag, payload: Option<ResponsePayload>) {
        // SAFETY: only the worker calls `publish`, and only after the
        // dispatcher has already reclaimed the previous response (the
        // dispatcher never re-reads a slot it has reclaimed until the
        // worker raises the flag again).
        unsafe {
            *self.payload.get() = payload;
        }
        self.flag.store(flag as u8, Ordering::Release);
    }

    /// Called by the dispatcher after observing `Finished`/`Preempted`:
    /// takes the payload (if any) and resets the flag to `Processed`.
    pub fn reclaim(&self) -> Option<ResponsePayload> {
        // SAFETY: only the dispatcher calls `reclaim`, and only after
        // `observe` returned `Finished`/`Preempted`, whose Acquire load
        // pairs with the worker's Release store in `publish`.
        let payload = unsafe { (*self.payload.get()).take() };
        self.flag.store(ResponseFlag::Processed as u8, Ordering::Release);
        payload
    }
}

/// One request/response slot pair per worker, indexed by worker id.
pub struct SlotTable {
    requests: Vec<RequestSlot>,
    responses: Vec<ResponseSlot>,
}

impl SlotTable {
    pub fn new(num_workers: usize) -> Self {
        Self {
            requests: (0..num_workers).map(|_| RequestSlot::default()).collect(),
            responses: (0..num_workers).map(|_| ResponseSlot::default()).collect(),
        }
    }

    pub fn request(&self, worker_id: usize) -> &RequestSlot {
        &self.requests[worker_id]
    }

    pub fn response(&self, worker_id: usize) -> &ResponseSlot {
        &self.responses[worker_id]
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_rendezvous_round_trip() {
        let slot = RequestSlot::default();
        assert_eq!(slot.observe(), RequestFlag::Waiting);
        slot.publish(RequestType::Get, Category::Packet, 0, Packet::new(vec![1, 2, 3]), 10, None);
        assert_eq!(slot.observe(), RequestFlag::Active);
        let payload = slot.take();
        assert_eq!(payload.request_type, RequestType::Get);
        assert_eq!(payload.category, Category::Packet);
        assert_eq!(payload.packet.bytes, vec![1, 2, 3]);
        assert_eq!(payload.timestamp_ns, 10);
        assert!(payload.runnable.is_none());
        assert_eq!(slot.observe(), RequestFlag::Waiting);
    }

    #[test]
    fn response_rendezvous_round_trip() {
        let slot = ResponseSlot::default();
        slot.publish(
            ResponseFlag::Finished,
            Some(ResponsePayload {
                request_type: RequestType::Get,
                class: 0,
                timestamp_ns: 99,
                run_ns: 1500,
                gen_ns: 99,
                runnable: None,
            }),
        );
        assert_eq!(slot.observe(), ResponseFlag::Finished);
        let payload = slot.reclaim().unwrap();
        assert_eq!(payload.run_ns, 1500);
        assert_eq!(payload.gen_ns, 99);
        assert_eq!(slot.observe(), ResponseFlag::Processed);
    }

    #[test]
    #[should_panic(expected = "out of domain")]
    fn out_of_domain_request_flag_is_fatal() {
        let _ = RequestFlag::from_u8(0x7f);
    }
}
