// Build-time checks for the platform-specific primitives in `src/platform.rs`.

use std::env;

fn main() {
    let arch = env::var("CARGO_CFG_TARGET_ARCH").unwrap_or_default();
    let os = env::var("CARGO_CFG_TARGET_OS").unwrap_or_default();

    if arch != "x86_64" {
        println!(
            "cargo:warning=dispatch-core's stackful context switch is only implemented for \
             x86_64; context resumption will be a stub on {arch}"
        );
    }

    if env::var("CARGO_FEATURE_INTERRUPT_PREEMPT").is_ok() && os != "linux" {
        panic!("the `interrupt-preempt` feature requires a Linux target (signal-based cross-core preemption)");
    }
}
