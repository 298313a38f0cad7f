// Shared test-only helper, not itself a test binary (cargo only treats
// direct children of `tests/` as separate targets).

/// Installs a `tracing` subscriber controlled by `RUST_LOG`, once per test
/// process. Idempotent: later calls from other test functions in the same
/// binary are no-ops once the global subscriber is set.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).with_test_writer().try_init();
}
