//! Request/response plumbing between callers and the single reservation-
//! processing consumer task (§3 "Reservation request", §4.2.1).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::oneshot;

use crate::error::QuotaError;

/// The three counters from §3, kept lock-free: reads use relaxed ordering,
/// updates are adds/subs (§9 "Mutable counters").
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub all_content_size: AtomicU64,
    pub requested_size: AtomicU64,
    pub reserved_size: AtomicU64,
}

impl Counters {
    pub fn new(initial_size: u64) -> Self {
        Self {
            all_content_size: AtomicU64::new(initial_size),
            requested_size: AtomicU64::new(0),
            reserved_size: AtomicU64::new(0),
        }
    }

    pub fn current_size(&self) -> u64 {
        self.all_content_size.load(Ordering::Relaxed)
    }

    pub fn candidate_total(&self) -> u64 {
        self.all_content_size.load(Ordering::Relaxed) + self.requested_size.load(Ordering::Relaxed)
    }
}

/// Outcome handed back to a `ReservationTx` when its `Reserve` request
/// resolves successfully.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ReserveOutcome {
    pub reserved_from_eviction: bool,
}

/// A request entering the keeper's single-consumer processor (§3).
pub(crate) enum QuotaRequest {
    Reserve {
        size: u64,
        completion: oneshot::Sender<Result<ReserveOutcome, QuotaError>>,
    },
    Purge {
        completion: oneshot::Sender<Result<(), QuotaError>>,
    },
    Calibrate {
        completion: oneshot::Sender<Result<(), QuotaError>>,
    },
    Synchronize {
        completion: oneshot::Sender<Result<(), QuotaError>>,
    },
}

/// Handle returned by [`crate::quota::keeper::QuotaKeeper::reserve`]. Resolves
/// once the keeper has either admitted the reservation or failed it; the
/// caller must then call exactly one of [`commit`](Self::commit) or
/// [`rollback`](Self::rollback).
pub struct ReservationTx {
    size: u64,
    counters: Arc<Counters>,
    rx: Option<oneshot::Receiver<Result<ReserveOutcome, QuotaError>>>,
    outcome: Option<ReserveOutcome>,
    settled: bool,
}

impl ReservationTx {
    pub(crate) fn new(
        size: u64,
        counters: Arc<Counters>,
        rx: oneshot::Receiver<Result<ReserveOutcome, QuotaError>>,
    ) -> Self {
        Self {
            size,
            counters,
            rx: Some(rx),
            outcome: None,
            settled: false,
        }
    }

    /// Waits for the keeper's admission decision. On failure the request's
    /// share of `requested_size` is released automatically; on success the
    /// caller must still call `commit()` or `rollback()`.
    pub async fn wait(&mut self) -> Result<(), QuotaError> {
        let rx = self.rx.take().expect("ReservationTx::wait called twice");
        match rx.await {
            Ok(Ok(outcome)) => {
                self.outcome = Some(outcome);
                Ok(())
            }
            Ok(Err(e)) => {
                self.release_on_failure();
                Err(e)
            }
            Err(_) => {
                // The only way this sender is dropped without a value is a
                // panic caught by the processor's dispatch loop -- every
                // other path (normal completion, shutdown drain) sends an
                // explicit error before dropping.
                self.release_on_failure();
                Err(QuotaError::Internal(
                    "the reservation processor panicked while handling this request".to_string(),
                ))
            }
        }
    }

    fn release_on_failure(&mut self) {
        self.settled = true;
        self.counters
            .requested_size
            .fetch_sub(self.size, Ordering::AcqRel);
    }

    /// Moves `size` bytes from `requested_size` to `all_content_size`.
    pub fn commit(&mut self) {
        debug_assert!(!self.settled, "commit() on an already-settled ReservationTx");
        self.settled = true;
        self.counters
            .requested_size
            .fetch_sub(self.size, Ordering::AcqRel);
        self.counters
            .all_content_size
            .fetch_add(self.size, Ordering::AcqRel);
        if self.reserved_from_eviction() {
            self.counters
                .reserved_size
                .fetch_sub(self.size, Ordering::AcqRel);
        }
    }

    /// Releases `size` bytes back out of `requested_size` without accounting
    /// them as stored content.
    pub fn rollback(&mut self) {
        debug_assert!(!self.settled, "rollback() on an already-settled ReservationTx");
        self.settled = true;
        self.counters
            .requested_size
            .fetch_sub(self.size, Ordering::AcqRel);
        if self.reserved_from_eviction() {
            self.counters
                .reserved_size
                .fetch_sub(self.size, Ordering::AcqRel);
        }
    }

    fn reserved_from_eviction(&self) -> bool {
        self.outcome
            .map(|o| o.reserved_from_eviction)
            .unwrap_or(false)
    }
}

impl Drop for ReservationTx {
    fn drop(&mut self) {
        if !self.settled {
            tracing::warn!(
                size = self.size,
                "ReservationTx dropped without commit() or rollback()"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx_with_outcome(counters: &Arc<Counters>, size: u64, outcome: ReserveOutcome) -> ReservationTx {
        let (_tx, rx) = oneshot::channel();
        let mut tx = ReservationTx::new(size, counters.clone(), rx);
        tx.outcome = Some(outcome);
        tx
    }

    #[test]
    fn candidate_total_sums_stored_and_pending_bytes() {
        let counters = Counters::new(100);
        counters.requested_size.fetch_add(20, Ordering::Relaxed);
        assert_eq!(counters.current_size(), 100);
        assert_eq!(counters.candidate_total(), 120);
    }

    #[test]
    fn commit_moves_bytes_from_requested_to_stored() {
        let counters = Arc::new(Counters::new(0));
        counters.requested_size.fetch_add(10, Ordering::Relaxed);
        let mut tx = tx_with_outcome(&counters, 10, ReserveOutcome::default());

        tx.commit();

        assert_eq!(counters.requested_size.load(Ordering::Relaxed), 0);
        assert_eq!(counters.all_content_size.load(Ordering::Relaxed), 10);
    }

    #[test]
    fn commit_of_an_eviction_reserved_request_also_releases_reserved_size() {
        let counters = Arc::new(Counters::new(0));
        counters.requested_size.fetch_add(10, Ordering::Relaxed);
        counters.reserved_size.fetch_add(10, Ordering::Relaxed);
        let mut tx = tx_with_outcome(
            &counters,
            10,
            ReserveOutcome {
                reserved_from_eviction: true,
            },
        );

        tx.commit();

        assert_eq!(counters.reserved_size.load(Ordering::Relaxed), 0);
        assert_eq!(counters.all_content_size.load(Ordering::Relaxed), 10);
    }

    #[test]
    fn rollback_releases_requested_bytes_without_touching_stored_size() {
        let counters = Arc::new(Counters::new(5));
        counters.requested_size.fetch_add(10, Ordering::Relaxed);
        let mut tx = tx_with_outcome(&counters, 10, ReserveOutcome::default());

        tx.rollback();

        assert_eq!(counters.requested_size.load(Ordering::Relaxed), 0);
        assert_eq!(counters.all_content_size.load(Ordering::Relaxed), 5);
    }

    #[tokio::test]
    async fn wait_releases_requested_size_when_the_keeper_fails_the_request() {
        let counters = Arc::new(Counters::new(0));
        counters.requested_size.fetch_add(7, Ordering::Relaxed);
        let (completion, rx) = oneshot::channel();
        let mut tx = ReservationTx::new(7, counters.clone(), rx);
        completion
            .send(Err(QuotaError::ShutdownInProgress))
            .unwrap();

        let result = tx.wait().await;

        assert!(result.is_err());
        assert_eq!(counters.requested_size.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn wait_releases_requested_size_when_the_sender_is_dropped() {
        // A sender dropped without a value only happens when the processor's
        // dispatch panicked mid-request; this is reported as `Internal`, not
        // `ShutdownInProgress` (which is always sent explicitly).
        let counters = Arc::new(Counters::new(0));
        counters.requested_size.fetch_add(3, Ordering::Relaxed);
        let (completion, rx) = oneshot::channel::<Result<ReserveOutcome, QuotaError>>();
        drop(completion);
        let mut tx = ReservationTx::new(3, counters.clone(), rx);

        let result = tx.wait().await;

        assert!(matches!(result, Err(QuotaError::Internal(_))));
        assert_eq!(counters.requested_size.load(Ordering::Relaxed), 0);
    }
}
