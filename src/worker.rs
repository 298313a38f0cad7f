//! The worker loop: pinned to one core, spins on its request slot, and
//! either resumes a preempted context or starts a fresh one. Implements
//! the five steps of the worker protocol: wait for a request, reset the
//! slot before touching anything else (matching the original's
//! reset-before-dispatch ordering in `handle_request`), run (or resume)
//! the work function while polling for preemption, publish a response, and
//! loop.
//!
//! A fresh packet's work function runs on its own stack inside an
//! `ExecutionContext`, entered via `platform::switch_context` from the
//! worker's own ("main") register file — the stackful-coroutine strategy
//! spec §9's Design Notes calls for in place of the original's `ucontext`
//! calls (`getcontext_fast`/`makecontext`/`swapcontext_fast` in
//! `dp/core/worker.c`). The work function's `yield_hook` checkpoint
//! switches straight back to the worker's main context when a preemption
//! is pending, suspending mid-function; the worker observes that it
//! returned without the job having finished and publishes `Preempted`
//! with the context attached, to be resumed — on this worker or another —
//! the next time the dispatcher reassigns that class to it.

use std::sync::Arc;

use tracing::warn;

use crate::config::Config;
use crate::context::{ContextHandle, ContextPool};
use crate::platform::RegisterContext;
use crate::preempt::PreemptChannel;
use crate::registry::{Completion, IpTuple, Transmitter, WorkFn, WorkRegistry};
use crate::slot::{Category, RequestFlag, ResponseFlag, ResponsePayload, SlotTable};
use crate::task::{Packet, RequestType};

pub struct Worker {
    worker_id: usize,
    config: Arc<Config>,
    slots: Arc<SlotTable>,
    preempt: Arc<dyn PreemptChannel>,
    registry: Arc<WorkRegistry>,
    transmitter: Arc<dyn Transmitter>,
    context_pool: ContextPool,
    /// This worker's own register file, the switch target every job
    /// context's `yield_hook` and completion return to. The "main"
    /// context in spec §9's Design Notes vocabulary.
    main_regs: RegisterContext,
}

impl Worker {
    pub fn new(
        worker_id: usize,
        config: Arc<Config>,
        slots: Arc<SlotTable>,
        preempt: Arc<dyn PreemptChannel>,
        registry: Arc<WorkRegistry>,
        transmitter: Arc<dyn Transmitter>,
    ) -> Self {
        let context_pool = ContextPool::new(config.context_pool_size, config.stack_size_bytes);
        Self {
            worker_id,
            config,
            slots,
            preempt,
            registry,
            transmitter,
            context_pool,
            main_regs: RegisterContext::new(),
        }
    }

    /// Pins the calling OS thread to this worker's core. Call once before
    /// `run`.
    pub fn pin(&self) -> Result<(), String> {
        crate::platform::pin_to_cpu(self.worker_id)
    }

    /// Drives the worker loop forever (or until the caller's thread is
    /// torn down externally — the worker has no stop condition of its own,
    /// matching spec §5: only the dispatcher observes the global stop
    /// condition).
    pub fn run(&mut self) {
        loop {
            self.run_once();
        }
    }

    /// One iteration: wait for a request, dispatch or resume, run the
    /// preemption-aware work body, publish a response.
    pub fn run_once(&mut self) {
        let request_slot = self.slots.request(self.worker_id);

        // Step 1: spin-wait for the dispatcher to publish a request.
        while request_slot.observe() == RequestFlag::Waiting {
            std::hint::spin_loop();
        }

        // Step 2: reset the slot to Waiting immediately, before touching
        // the payload, exactly as `handle_request` does in the original.
        let request = request_slot.take();

        let outcome = match request.category {
            Category::Packet => self.run_fresh(request.request_type, request.packet, request.timestamp_ns),
            Category::Context => {
                let ctx = request
                    .runnable
                    .expect("CONTEXT-category request must carry a runnable");
                self.resume(ctx)
            }
            Category::NoContent => WorkOutcome::Completed(Completion { run_ns: 0, gen_ns: request.timestamp_ns }),
        };

        // Step 4 & 5: publish the response and (if it completed) transmit
        // it. The preemption channel is masked around slot publication
        // (spec §5), matching the original's `cli`/`sti` pair in
        // `finish_request`; in interrupt mode this actually blocks the
        // signal via `pthread_sigmask`, cooperative mode has nothing to
        // mask.
        self.preempt.mask(self.worker_id);
        match outcome {
            WorkOutcome::Completed(completion) => {
                let payload = [completion.run_ns.to_le_bytes(), completion.gen_ns.to_le_bytes()].concat();
                if let Err(err) = self.transmitter.send(&payload, IpTuple::default()) {
                    warn!(?err, "response transmit failed");
                }
                self.slots.response(self.worker_id).publish(
                    ResponseFlag::Finished,
                    Some(ResponsePayload {
                        request_type: request.request_type,
                        class: request.class,
                        timestamp_ns: request.timestamp_ns,
                        run_ns: completion.run_ns,
                        gen_ns: completion.gen_ns,
                        runnable: None,
                    }),
                );
            }
            WorkOutcome::Preempted(ctx) => {
                self.slots.response(self.worker_id).publish(
                    ResponseFlag::Preempted,
                    Some(ResponsePayload {
                        request_type: request.request_type,
                        class: request.class,
                        timestamp_ns: request.timestamp_ns,
                        run_ns: 0,
                        gen_ns: 0,
                        runnable: Some(ctx),
                    }),
                );
            }
        }
        self.preempt.unmask(self.worker_id);
    }

    fn run_fresh(&mut self, request_type: RequestType, packet: Packet, timestamp_ns: u64) -> WorkOutcome {
        let Some(work_fn) = self.registry.lookup(request_type) else {
            warn!("no work function registered for request type");
            return WorkOutcome::Completed(Completion { run_ns: 0, gen_ns: timestamp_ns });
        };

        let mut ctx_handle = match self.context_pool.alloc() {
            Some(h) => h,
            None => {
                warn!("context pool exhausted, dropping request");
                return WorkOutcome::Completed(Completion { run_ns: 0, gen_ns: timestamp_ns });
            }
        };

        let job_regs = ctx_handle.context_mut().registers_mut() as *mut RegisterContext;
        let job = Box::new(JobBookkeeping {
            work_fn,
            packet,
            timestamp_ns,
            preempt: Arc::clone(&self.preempt),
            worker_id: self.worker_id,
            job_regs,
            main_regs: &mut self.main_regs as *mut RegisterContext,
            finished: false,
            result: None,
        });
        let job_ptr = Box::into_raw(job);

        ctx_handle.context_mut().prepare(job_trampoline, job_ptr as usize);
        self.switch_into(&ctx_handle);

        self.finish_or_suspend(ctx_handle, job_ptr)
    }

    fn resume(&mut self, mut ctx_handle: ContextHandle) -> WorkOutcome {
        let job_ptr = ctx_handle
            .take_job()
            .expect("a preempted context must carry its job bookkeeping")
            as *mut JobBookkeeping;

        // SAFETY: `job_ptr` was produced by `run_fresh` on some (possibly
        // different) worker and has not been freed — only a `Finished`
        // context is ever torn down, and a finished context is never
        // requeued (spec §4.3).
        unsafe {
            (*job_ptr).worker_id = self.worker_id;
            (*job_ptr).main_regs = &mut self.main_regs as *mut RegisterContext;
        }

        self.switch_into(&ctx_handle);

        self.finish_or_suspend(ctx_handle, job_ptr)
    }

    /// Switch from this worker's main context into `ctx`'s saved register
    /// file, returning once `ctx` either finishes or yields back via a
    /// checkpoint.
    fn switch_into(&mut self, ctx: &ContextHandle) {
        // SAFETY: `ctx.context().registers()` is a live, fully initialized
        // register file (either freshly `prepare`d or previously saved by
        // a checkpoint's own `switch_context` call), and `self.main_regs`
        // is valid for the lifetime of this worker.
        unsafe {
            crate::platform::switch_context(&mut self.main_regs as *mut RegisterContext, ctx.context().registers());
        }
    }

    /// After `switch_into` returns: if the job finished, reclaim its
    /// result and return the context to the pool; otherwise it yielded at
    /// a checkpoint and must be carried forward as a preempted task.
    fn finish_or_suspend(&mut self, mut ctx_handle: ContextHandle, job_ptr: *mut JobBookkeeping) -> WorkOutcome {
        // SAFETY: `job_ptr` is valid until we drop it below; nothing else
        // holds a reference to it while this worker owns `ctx_handle`.
        let job = unsafe { &mut *job_ptr };
        if job.finished {
            let completion = job.result.take().expect("finished job must carry a result");
            // SAFETY: reconstructs the box this pointer came from; done
            // exactly once, here, on the only path that observes `finished`.
            unsafe {
                drop(Box::from_raw(job_ptr));
            }
            self.context_pool.free(ctx_handle);
            WorkOutcome::Completed(completion)
        } else {
            ctx_handle.set_job(job_ptr as *mut ());
            WorkOutcome::Preempted(ctx_handle)
        }
    }
}

/// Heap-allocated state shared between a suspended coroutine and whichever
/// worker is driving it. Lives for as long as the underlying job is
/// in-flight (possibly across several preemptions and worker handoffs);
/// freed exactly once, when `finished` is observed true.
struct JobBookkeeping {
    work_fn: WorkFn,
    packet: Packet,
    timestamp_ns: u64,
    preempt: Arc<dyn PreemptChannel>,
    /// Refreshed by `Worker::resume` before every switch-in, since a
    /// preempted context may be resumed by a different worker than the one
    /// that started it.
    worker_id: usize,
    /// Stable for the job's whole lifetime: points at the `RegisterContext`
    /// embedded in its `ExecutionContext`, which never moves once boxed.
    job_regs: *mut RegisterContext,
    /// Refreshed on every switch-in: the calling worker's own register
    /// file, the "link" the checkpoint switches back to.
    main_regs: *mut RegisterContext,
    finished: bool,
    result: Option<Completion>,
}

/// The first `rip` target for a freshly prepared job context (via
/// `platform::context_trampoline`, which loads this function's argument
/// from a callee-saved register and jumps here). Runs the work function to
/// completion, funneling every yield through a checkpoint closure that
/// performs the actual context switch back to the worker's main context.
extern "C" fn job_trampoline(arg: usize) -> ! {
    let job_ptr = arg as *mut JobBookkeeping;
    // SAFETY: `arg` is the pointer `Worker::run_fresh` passed to `prepare`.
    let job = unsafe { &mut *job_ptr };
    let work_fn = job.work_fn;
    let timestamp_ns = job.timestamp_ns;
    let packet_ptr: *const Packet = &job.packet;

    let mut yield_hook = || {
        // SAFETY: `job_ptr` stays valid for this coroutine's whole
        // lifetime; `worker_id`/`main_regs` are refreshed by the resuming
        // worker before every switch-in, so this always checks and
        // targets the *current* activation, not a stale one.
        let job = unsafe { &*job_ptr };
        if job.preempt.take_requested(job.worker_id) {
            // SAFETY: `job_regs` is this coroutine's own (stable) register
            // slot; `main_regs` is the current worker's, kept live for the
            // duration of the switch by its own stack frame.
            unsafe {
                crate::platform::switch_context(job.job_regs, job.main_regs);
            }
            // Execution resumes here once some worker switches back in.
        }
    };

    // SAFETY: `packet_ptr` points at `job.packet`, owned by this same
    // heap allocation for the coroutine's entire lifetime.
    let completion = work_fn(unsafe { &*packet_ptr }, timestamp_ns, &mut yield_hook);

    job.finished = true;
    job.result = Some(completion);
    // SAFETY: same as the checkpoint's switch above; this is the job's
    // last activation, so `job_regs` is never read again after this call.
    unsafe {
        crate::platform::switch_context(job.job_regs, job.main_regs);
    }
    unreachable!("a finished job context is never resumed");
}

enum WorkOutcome {
    Completed(Completion),
    Preempted(ContextHandle),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigBuilder;
    use crate::preempt::{CooperativeChannel, PreemptChannel as _};
    use crate::task::RequestType;

    struct NullTransmitter;
    impl Transmitter for NullTransmitter {
        fn send(&self, _payload: &[u8], _dest: IpTuple) -> Result<(), crate::registry::SendError> {
            Ok(())
        }
    }

    fn synthetic_work(_p: &Packet, _ts: u64, _yield_hook: &mut dyn FnMut()) -> Completion {
        Completion { run_ns: 1500, gen_ns: 7 }
    }

    fn test_worker(
        config: Arc<Config>,
        registry: WorkRegistry,
    ) -> (Worker, Arc<SlotTable>, Arc<dyn Transmitter>) {
        let slots = Arc::new(SlotTable::new(1));
        let preempt: Arc<dyn PreemptChannel> = Arc::new(CooperativeChannel::new(1));
        let registry = Arc::new(registry);
        let transmitter: Arc<dyn Transmitter> = Arc::new(NullTransmitter);
        let worker = Worker::new(0, config, Arc::clone(&slots), preempt, registry, Arc::clone(&transmitter));
        (worker, slots, transmitter)
    }

    #[test]
    fn single_request_completes_and_publishes_response() {
        let config = Arc::new(
            ConfigBuilder::new()
                .num_workers(1)
                .classes(vec![1_000_000], vec![u64::MAX])
                .build()
                .unwrap(),
        );
        let mut registry = WorkRegistry::new();
        registry.register(RequestType::Synthetic, synthetic_work);
        let (mut worker, slots, _transmitter) = test_worker(config, registry);

        slots
            .request(0)
            .publish(RequestType::Synthetic, Category::Packet, 0, Packet::new(vec![]), 0, None);
        worker.run_once();

        assert_eq!(slots.response(0).observe(), ResponseFlag::Finished);
        let payload = slots.response(0).reclaim().unwrap();
        assert_eq!(payload.run_ns, 1500);
        assert_eq!(payload.gen_ns, 7);
        assert!(payload.runnable.is_none());
    }

    fn yielding_work(_p: &Packet, _ts: u64, yield_hook: &mut dyn FnMut()) -> Completion {
        yield_hook();
        Completion { run_ns: 42, gen_ns: 0 }
    }

    #[test]
    fn preempted_job_is_resumed_to_completion() {
        let config = Arc::new(
            ConfigBuilder::new()
                .num_workers(1)
                .classes(vec![1_000_000], vec![u64::MAX])
                .build()
                .unwrap(),
        );
        let mut registry = WorkRegistry::new();
        registry.register(RequestType::Synthetic, yielding_work);
        let (mut worker, slots, _transmitter) = test_worker(config, registry);

        // Force the checkpoint to suspend on the first call.
        worker.preempt.fire(0);

        slots
            .request(0)
            .publish(RequestType::Synthetic, Category::Packet, 0, Packet::new(vec![]), 0, None);
        worker.run_once();

        assert_eq!(slots.response(0).observe(), ResponseFlag::Preempted);
        let payload = slots.response(0).reclaim().unwrap();
        let ctx = payload.runnable.expect("preempted response must carry a context");

        // Re-dispatch the same context as a resumed task; this time the
        // checkpoint finds nothing pending and the job runs to completion.
        slots
            .request(0)
            .publish(RequestType::Synthetic, Category::Context, 0, Packet::new(vec![]), 0, Some(ctx));
        worker.run_once();

        assert_eq!(slots.response(0).observe(), ResponseFlag::Finished);
        let payload = slots.response(0).reclaim().unwrap();
        assert_eq!(payload.run_ns, 42);
    }
}
