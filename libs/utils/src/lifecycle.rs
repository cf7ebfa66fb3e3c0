//! A small trait-and-struct substitute for the deep "StartupShutdownBase"
//! inheritance hierarchies this kind of component traditionally uses.
//!
//! [`LifecycleState`] carries the four observable booleans plus the
//! shutdown-cancellation token. [`SingleUse`] and [`RefCounted`] compose a
//! `LifecycleState` to give the two startup/shutdown disciplines described in
//! the owning component's contract, rather than each component re-deriving
//! the bookkeeping by hand.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("component already started")]
    AlreadyStarted,
    #[error("component already shut down")]
    AlreadyShutdown,
    #[error("component '{0}' has shut down")]
    ComponentShutDown(&'static str),
}

/// The four observable booleans and the shutdown-cancellation token, with no
/// opinion on ref-counting. Embedded by [`SingleUse`] and [`RefCounted`].
#[derive(Debug)]
pub struct LifecycleState {
    startup_started: AtomicBool,
    startup_completed: AtomicBool,
    shutdown_started: AtomicBool,
    shutdown_completed: AtomicBool,
    shutdown_token: CancellationToken,
}

impl Default for LifecycleState {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleState {
    pub fn new() -> Self {
        Self {
            startup_started: AtomicBool::new(false),
            startup_completed: AtomicBool::new(false),
            shutdown_started: AtomicBool::new(false),
            shutdown_completed: AtomicBool::new(false),
            shutdown_token: CancellationToken::new(),
        }
    }

    pub fn startup_started(&self) -> bool {
        self.startup_started.load(Ordering::Acquire)
    }

    pub fn startup_completed(&self) -> bool {
        self.startup_completed.load(Ordering::Acquire)
    }

    pub fn shutdown_started(&self) -> bool {
        self.shutdown_started.load(Ordering::Acquire)
    }

    pub fn shutdown_completed(&self) -> bool {
        self.shutdown_completed.load(Ordering::Acquire)
    }

    /// Fires exactly when shutdown begins. Any in-flight operation can race
    /// on this token to abandon work rather than block shutdown.
    pub fn shutdown_started_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    /// Fail any operation that must not run once shutdown has begun.
    pub fn ensure_running(&self, name: &'static str) -> Result<(), LifecycleError> {
        if self.shutdown_started() {
            Err(LifecycleError::ComponentShutDown(name))
        } else {
            Ok(())
        }
    }

    fn complete_startup(&self) {
        self.startup_completed.store(true, Ordering::Release);
    }

    fn begin_shutdown(&self) {
        self.shutdown_started.store(true, Ordering::Release);
        self.shutdown_token.cancel();
    }

    fn complete_shutdown(&self) {
        self.shutdown_completed.store(true, Ordering::Release);
    }
}

/// Lifecycle discipline for a component with exactly one owner: a second
/// `startup`/`shutdown` call is a caller error, not a no-op.
#[derive(Debug, Default)]
pub struct SingleUse {
    state: LifecycleState,
}

impl SingleUse {
    pub fn new() -> Self {
        Self {
            state: LifecycleState::new(),
        }
    }

    pub fn state(&self) -> &LifecycleState {
        &self.state
    }

    /// Marks startup as begun. Fails if called more than once.
    pub fn begin_startup(&self) -> Result<(), LifecycleError> {
        if self
            .state
            .startup_started
            .swap(true, Ordering::AcqRel)
        {
            return Err(LifecycleError::AlreadyStarted);
        }
        Ok(())
    }

    pub fn complete_startup(&self) {
        self.state.complete_startup();
    }

    /// Marks shutdown as begun. Fails with [`LifecycleError::AlreadyShutdown`]
    /// if shutdown was already requested by someone else.
    pub fn begin_shutdown(&self) -> Result<(), LifecycleError> {
        if self
            .state
            .shutdown_started
            .swap(true, Ordering::AcqRel)
        {
            return Err(LifecycleError::AlreadyShutdown);
        }
        self.state.shutdown_token.cancel();
        Ok(())
    }

    pub fn complete_shutdown(&self) {
        self.state.complete_shutdown();
    }
}

/// Lifecycle discipline for a component shared by multiple owners: startup
/// logic runs exactly once no matter how many callers invoke `startup`, and
/// shutdown logic runs only for the last caller to release their reference.
#[derive(Debug, Default)]
pub struct RefCounted {
    state: LifecycleState,
    refs: AtomicUsize,
}

impl RefCounted {
    pub fn new() -> Self {
        Self {
            state: LifecycleState::new(),
            refs: AtomicUsize::new(0),
        }
    }

    pub fn state(&self) -> &LifecycleState {
        &self.state
    }

    /// Registers one more owner. Returns `true` exactly for the caller that
    /// should run the (idempotent, expensive) initialization logic.
    pub fn startup(&self) -> bool {
        let previous = self.refs.fetch_add(1, Ordering::AcqRel);
        if previous == 0 {
            self.state.startup_started.store(true, Ordering::Release);
            true
        } else {
            false
        }
    }

    pub fn complete_startup(&self) {
        self.state.complete_startup();
    }

    /// Releases one owner's reference. Returns `true` exactly for the caller
    /// that observed the last reference and should run shutdown logic.
    pub fn shutdown(&self) -> bool {
        let previous = self.refs.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "shutdown() called more times than startup()");
        if previous == 1 {
            self.state.begin_shutdown();
            true
        } else {
            false
        }
    }

    pub fn complete_shutdown(&self) {
        self.state.complete_shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_use_rejects_double_shutdown() {
        let lc = SingleUse::new();
        lc.begin_startup().unwrap();
        lc.complete_startup();
        lc.begin_shutdown().unwrap();
        assert!(matches!(
            lc.begin_shutdown(),
            Err(LifecycleError::AlreadyShutdown)
        ));
    }

    #[test]
    fn single_use_rejects_double_startup() {
        let lc = SingleUse::new();
        lc.begin_startup().unwrap();
        assert!(matches!(
            lc.begin_startup(),
            Err(LifecycleError::AlreadyStarted)
        ));
    }

    #[test]
    fn ref_counted_startup_runs_once_for_first_caller_only() {
        let lc = RefCounted::new();
        assert!(lc.startup());
        assert!(!lc.startup());
    }

    #[test]
    fn ref_counted_last_caller_runs_shutdown() {
        let lc = RefCounted::new();
        assert!(lc.startup());
        assert!(!lc.startup());
        assert!(!lc.shutdown());
        assert!(!lc.state().shutdown_started());
        assert!(lc.shutdown());
        assert!(lc.state().shutdown_started());
    }

    #[test]
    fn shutdown_token_fires_on_begin_shutdown() {
        let lc = SingleUse::new();
        let token = lc.state().shutdown_started_token();
        assert!(!token.is_cancelled());
        lc.begin_shutdown().unwrap();
        assert!(token.is_cancelled());
    }

    #[test]
    fn ensure_running_fails_after_shutdown() {
        let lc = SingleUse::new();
        lc.state().ensure_running("widget").unwrap();
        lc.begin_shutdown().unwrap();
        assert!(matches!(
            lc.state().ensure_running("widget"),
            Err(LifecycleError::ComponentShutDown("widget"))
        ));
    }
}
