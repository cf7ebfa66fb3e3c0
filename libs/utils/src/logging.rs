//! A ready-made `tracing` subscriber for binaries and tests that want one.
//!
//! The engine crates never call this themselves -- a library must not
//! install global process state on its caller's behalf -- it exists for the
//! host binary (or a test's `#[ctor]`-style setup) to opt into, the same way
//! `attachment_service::main` calls `utils::logging::init` once at startup.

/// Installs a `fmt` subscriber honoring `RUST_LOG`, defaulting to `info`.
///
/// Returns an error if a global subscriber was already installed; callers
/// that might run this more than once (e.g. in tests) should ignore it.
pub fn init_tracing() -> Result<(), tracing_subscriber::util::TryInitError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .try_init()
}
