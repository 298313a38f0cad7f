// Platform-specific unsafe operations. This module contains ONLY unavoidable
// unsafe code that has no safe alternative: RDTSC, CPU affinity, the
// stackful context switch, and the signal plumbing used for interrupt-mode
// preemption. Everything else in the crate is safe Rust built on top of
// these primitives.

use std::sync::atomic::{AtomicU64, Ordering};

/// CPU frequency in Hz, filled in by `crate::timer::calibrate_tsc`.
pub(crate) static CPU_FREQUENCY: AtomicU64 = AtomicU64::new(0);

#[cfg(target_arch = "x86_64")]
#[inline(always)]
pub fn read_tsc() -> u64 {
    unsafe { std::arch::x86_64::_rdtsc() }
}

#[cfg(target_arch = "x86_64")]
#[inline(always)]
pub fn read_tsc_serialized() -> u64 {
    unsafe {
        std::arch::x86_64::__cpuid(0);
        std::arch::x86_64::_rdtsc()
    }
}

#[cfg(target_arch = "x86_64")]
#[inline(always)]
pub fn read_tsc_fenced() -> u64 {
    unsafe {
        std::arch::x86_64::_mm_mfence();
        let tsc = std::arch::x86_64::_rdtsc();
        std::arch::x86_64::_mm_mfence();
        tsc
    }
}

#[cfg(not(target_arch = "x86_64"))]
#[inline(always)]
pub fn read_tsc() -> u64 {
    std::time::Instant::now().elapsed().as_nanos() as u64
}

#[cfg(not(target_arch = "x86_64"))]
#[inline(always)]
pub fn read_tsc_serialized() -> u64 {
    read_tsc()
}

#[cfg(not(target_arch = "x86_64"))]
#[inline(always)]
pub fn read_tsc_fenced() -> u64 {
    read_tsc()
}

/// Pin the calling thread to a single CPU core.
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub fn pin_to_cpu(cpu_id: usize) -> Result<(), String> {
    unsafe {
        let mut cpu_set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_SET(cpu_id, &mut cpu_set);

        let result = libc::pthread_setaffinity_np(
            libc::pthread_self(),
            std::mem::size_of::<libc::cpu_set_t>(),
            &cpu_set,
        );

        if result == 0 {
            Ok(())
        } else {
            Err(format!("failed to pin to cpu {}: errno {}", cpu_id, result))
        }
    }
}

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
pub fn pin_to_cpu(_cpu_id: usize) -> Result<(), String> {
    Err("cpu pinning not supported on this platform".to_string())
}

/// Saved callee-saved register set for one suspended x86_64 execution
/// context, System V ABI: rsp, rbp, rbx, r12-r15, plus a saved resume
/// address (`rip`). A fresh context's `rip` points at `context_trampoline`;
/// a preempted context's `rip` is wherever `switch_context` left it.
///
/// The register set (and the strategy of stashing the entry argument in a
/// callee-saved register so the trampoline can recover it after the first
/// switch) is a direct x86_64 port of the riscv64 `TaskContext`/
/// `switch_context` pair used for cooperative green threads elsewhere in
/// this pack: same idea (sp/ra/s-registers there, rsp/rip/r12-r15 here),
/// same "asm swaps the register file, trampoline bootstraps the first
/// call" structure.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct RegisterContext {
    rsp: u64,
    rbp: u64,
    rbx: u64,
    r12: u64,
    r13: u64,
    r14: u64,
    r15: u64,
    rip: u64,
}

impl RegisterContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lay out `stack_top`'s frame so the first `switch_context` into this
    /// context starts `entry(arg)` on it. `entry` must never return.
    pub fn prepare(&mut self, stack_top: *mut u8, entry: extern "C" fn(usize) -> !, arg: usize) {
        let aligned = (stack_top as usize) & !0xf;
        *self = Self {
            rsp: aligned as u64,
            rbp: 0,
            rbx: 0,
            r12: arg as u64,
            r13: entry as usize as u64,
            r14: 0,
            r15: 0,
            rip: context_trampoline as usize as u64,
        };
    }
}

#[cfg(target_arch = "x86_64")]
std::arch::global_asm!(
    ".global context_trampoline",
    "context_trampoline:",
    "mov rdi, r12",
    "jmp r13",
);

#[cfg(target_arch = "x86_64")]
extern "C" {
    fn context_trampoline();
}

#[cfg(not(target_arch = "x86_64"))]
extern "C" fn context_trampoline() {}

/// Switch from `old` to `new`: save the caller's register file into `old`,
/// restore `new`'s, and transfer control to wherever `new.rip` points
/// (either a fresh context's trampoline or a previously preempted context's
/// resume point). Returns once something later switches back into `old`.
///
/// SAFETY: `old` and `new` must be valid, non-overlapping, properly
/// initialized `RegisterContext` pointers, and `new`'s stack must still be
/// live. This is the one place in the crate that hand-rolls a calling
/// convention; every caller goes through the safe `ContextHandle`/
/// `ExecutionContext` wrappers in `context.rs`.
#[cfg(target_arch = "x86_64")]
#[inline(never)]
pub unsafe fn switch_context(old: *mut RegisterContext, new: *const RegisterContext) {
    std::arch::asm!(
        "lea rax, [rip + 2f]",
        "mov [rdi + 0x38], rax",
        "mov [rdi + 0x00], rsp",
        "mov [rdi + 0x08], rbp",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x20], r13",
        "mov [rdi + 0x28], r14",
        "mov [rdi + 0x30], r15",
        "mov rsp, [rsi + 0x00]",
        "mov rbp, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov r12, [rsi + 0x18]",
        "mov r13, [rsi + 0x20]",
        "mov r14, [rsi + 0x28]",
        "mov r15, [rsi + 0x30]",
        "jmp qword ptr [rsi + 0x38]",
        "2:",
        in("rdi") old,
        in("rsi") new,
        out("rax") _,
        clobber_abi("C"),
    );
}

#[cfg(not(target_arch = "x86_64"))]
pub unsafe fn switch_context(_old: *mut RegisterContext, _new: *const RegisterContext) {
    unimplemented!("stackful context switch is only implemented for x86_64");
}

pub mod signal {
    //! Signal-based cross-core preemption: the userland analogue of the
    //! original's `dune_register_intr_handler(PREEMPT_VECTOR, test_handler)`
    //! inter-processor interrupt. A real-time signal plays the role of the
    //! interrupt vector; `pthread_kill` plays the role of sending it;
    //! `sigaltstack` gives the handler its own stack so it can run even if
    //! the worker's own stack is in a context-switched, partially-unwound
    //! state.

    use std::mem::MaybeUninit;

    /// Reserve an alternate signal stack for the calling thread. Must be
    /// called once per worker thread before `register_handler`.
    pub fn install_alt_stack(stack: &mut [u8]) -> Result<(), String> {
        unsafe {
            let ss = libc::stack_t {
                ss_sp: stack.as_mut_ptr() as *mut libc::c_void,
                ss_flags: 0,
                ss_size: stack.len(),
            };
            if libc::sigaltstack(&ss, std::ptr::null_mut()) != 0 {
                return Err(format!(
                    "sigaltstack failed: errno {}",
                    std::io::Error::last_os_error()
                ));
            }
        }
        Ok(())
    }

    /// Register `handler` for `signum` with `SA_ONSTACK`, so it runs on the
    /// stack installed by `install_alt_stack` rather than the worker's own.
    pub fn register_handler(signum: i32, handler: extern "C" fn(i32)) -> Result<(), String> {
        unsafe {
            let mut sa: MaybeUninit<libc::sigaction> = MaybeUninit::zeroed();
            let sa_ptr = sa.as_mut_ptr();
            (*sa_ptr).sa_sigaction = handler as usize;
            (*sa_ptr).sa_flags = libc::SA_ONSTACK;
            libc::sigemptyset(&mut (*sa_ptr).sa_mask);

            if libc::sigaction(signum, sa_ptr, std::ptr::null_mut()) != 0 {
                return Err(format!(
                    "sigaction failed: errno {}",
                    std::io::Error::last_os_error()
                ));
            }
        }
        Ok(())
    }

    /// Signal `target` (a `pthread_t`) with `signum`, the preemption-fire
    /// primitive used by `crate::preempt::InterruptChannel`.
    pub fn send_signal(target: libc::pthread_t, signum: i32) -> Result<(), String> {
        let rc = unsafe { libc::pthread_kill(target, signum) };
        if rc == 0 {
            Ok(())
        } else {
            Err(format!("pthread_kill failed: errno {}", rc))
        }
    }

    pub fn current_thread() -> libc::pthread_t {
        unsafe { libc::pthread_self() }
    }

    /// Block `signum` for the calling thread (`pthread_sigmask(SIG_BLOCK,
    /// ...)`). Used to mask interrupt-mode preemption around a critical
    /// section — the POSIX-signal translation of the original's `cli`.
    pub fn block_signal(signum: i32) -> Result<(), String> {
        set_mask(libc::SIG_BLOCK, signum)
    }

    /// Undo a prior `block_signal` (`pthread_sigmask(SIG_UNBLOCK, ...)`),
    /// the `sti` half of the pair.
    pub fn unblock_signal(signum: i32) -> Result<(), String> {
        set_mask(libc::SIG_UNBLOCK, signum)
    }

    fn set_mask(how: i32, signum: i32) -> Result<(), String> {
        unsafe {
            let mut set: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut set);
            libc::sigaddset(&mut set, signum);
            if libc::pthread_sigmask(how, &set, std::ptr::null_mut()) != 0 {
                return Err(format!(
                    "pthread_sigmask failed: errno {}",
                    std::io::Error::last_os_error()
                ));
            }
        }
        Ok(())
    }
}
