//! External interfaces the core depends on but does not implement:
//! pulling a batch of packets off the wire, classifying them, sending a
//! response, and running the actual work. Concrete NIC/PCI plumbing, wire
//! parsing, and the storage engine body are all out of scope (spec §1) —
//! these traits are the seam a caller plugs a real implementation into.

use arrayvec::ArrayVec;
use rustc_hash::FxHashMap;

use crate::config::ETH_RX_MAX_BATCH;
use crate::task::{Packet, RequestType};

/// A batch of packets pulled from the networker in one poll, matching the
/// bounded-batch shape of `networker_pointers_t` in `dispatch.h`: a
/// fixed-capacity array rather than a heap-growable `Vec`, since the
/// original's `types`/`pkts` fields are themselves fixed-size C arrays
/// sized by the same `ETH_RX_MAX_BATCH` constant.
pub type PacketEntries = ArrayVec<(Packet, u64), ETH_RX_MAX_BATCH>;

pub struct PacketBatch {
    pub packets: PacketEntries,
}

/// Single-producer/single-consumer source of inbound traffic; the
/// dispatcher is the sole consumer.
pub trait Networker: Send {
    fn poll_batch(&mut self, max_batch: usize) -> PacketBatch;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct IpTuple {
    pub src_addr: u32,
    pub dst_addr: u32,
    pub src_port: u16,
    pub dst_port: u16,
}

#[derive(Debug, thiserror::Error)]
#[error("transmit failed: {0}")]
pub struct SendError(pub String);

/// Non-blocking response transmission, matching `udp_send`'s contract in
/// spec §6: failures are logged and the request is still counted complete.
pub trait Transmitter: Send + Sync {
    fn send(&self, payload: &[u8], dest: IpTuple) -> Result<(), SendError>;
}

/// Maps a packet's wire type to a traffic class and a `RequestType`.
/// Classification failures (malformed / unknown type) are drop cases, not
/// protocol violations (spec §7).
pub trait Classifier: Send + Sync {
    fn classify(&self, packet: &Packet) -> Option<(RequestType, usize)>;
}

/// Result of running a work function to completion.
pub struct Completion {
    pub run_ns: u64,
    pub gen_ns: u64,
}

/// Interruptible work body: receives the packet, the time the request
/// arrived, and a `yield_hook` it should call periodically at a checkpoint
/// of its own choosing. `yield_hook` returns only once it is safe (and
/// time) to keep going: on a fresh activation it is a no-op; if a
/// preemption has been requested, calling it actually suspends the
/// surrounding stackful coroutine and returns only when `worker.rs` later
/// resumes this exact context, mid-function, on (possibly) a different
/// worker core. The function must run to completion across however many
/// checkpoints it takes — it never aborts early — and returns the
/// `Completion` only once truly done, matching spec §4.6 / §9's work
/// function registry contract.
pub type WorkFn = fn(&Packet, u64, &mut dyn FnMut()) -> Completion;

/// Replaces the original's `switch`-on-type dispatch
/// (`do_db_generic_work`) with a registry lookup, per spec's own Design
/// Notes recommendation. Grounded in the teacher's `FxHashMap`-backed
/// pattern index (`descriptor.rs`'s `Descriptor::pattern_index`).
pub struct WorkRegistry {
    functions: FxHashMap<RequestType, WorkFn>,
}

impl WorkRegistry {
    pub fn new() -> Self {
        Self {
            functions: FxHashMap::default(),
        }
    }

    pub fn register(&mut self, request_type: RequestType, f: WorkFn) {
        self.functions.insert(request_type, f);
    }

    pub fn lookup(&self, request_type: RequestType) -> Option<WorkFn> {
        self.functions.get(&request_type).copied()
    }
}

impl Default for WorkRegistry {
    fn default() -> Self {
        Self::new()
    }
}
