//! The `QuotaKeeper` (§4.2): admission control for byte reservations,
//! eviction scheduling, and the LRU purge loop, built around a single
//! reservation-processing consumer task the way `disk_usage_eviction_task`
//! is built around a single background task per tenant.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex as SyncMutex;
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use utils::completion::{self, Barrier, Completion};
use utils::lifecycle::{LifecycleError, SingleUse};

use crate::collaborators::{ContentStore, FileSystem, PinSizeHistory};
use crate::error::QuotaError;
use crate::metrics::{QuotaMetrics, Stopwatch, StopwatchKind};
use crate::quota::config::QuotaKeeperConfiguration;
use crate::quota::purge::{PurgeHost, PurgeResult, Purger};
use crate::quota::request::{Counters, QuotaRequest, ReserveOutcome, ReservationTx};
use crate::quota::rules::{QuotaRule, RuleDescription, RuleEvalContext};

struct EvictionWaiter {
    size: u64,
    completion: oneshot::Sender<Result<ReserveOutcome, QuotaError>>,
}

struct KeeperInner {
    counters: Arc<Counters>,
    rules: Vec<QuotaRule>,
    eviction_queue: SyncMutex<VecDeque<EvictionWaiter>>,
    /// Serializes the peek/conditional-increment/conditional-dequeue
    /// sequence in `record_eviction` (§4.2.3) across concurrent evictions.
    /// A `tokio::sync::Mutex` rather than `parking_lot`, since the sequence
    /// spans an `.await` (rule evaluation may query the filesystem).
    eviction_lock: tokio::sync::Mutex<()>,
    purge_handle: SyncMutex<Option<JoinHandle<PurgeResult>>>,
    content_store: Arc<dyn ContentStore>,
    filesystem: Arc<dyn FileSystem>,
    pin_history: Arc<dyn PinSizeHistory>,
    metrics: Arc<dyn QuotaMetrics>,
    shutdown_token: CancellationToken,
    elastic_floor: u64,
    /// Held by every in-flight `record_eviction` call; shutdown drops its
    /// own clone and waits on `eviction_barrier` before draining
    /// `eviction_queue`, so a concurrent `on_content_evicted` racing
    /// shutdown always finishes its accounting first (§4.2.5).
    eviction_completion: SyncMutex<Option<Completion>>,
    eviction_barrier: Barrier,
}

impl KeeperInner {
    fn ctx(&self) -> RuleEvalContext<'_> {
        RuleEvalContext {
            filesystem: self.filesystem.as_ref(),
        }
    }

    async fn first_exceeding_hard_limit(
        &self,
        candidate: u64,
    ) -> anyhow::Result<Option<&QuotaRule>> {
        let ctx = self.ctx();
        for rule in &self.rules {
            if !rule.is_inside_hard_limit(candidate, &ctx).await? {
                return Ok(Some(rule));
            }
        }
        Ok(None)
    }

    async fn any_exceeding_soft_limit(&self, candidate: u64) -> anyhow::Result<bool> {
        let ctx = self.ctx();
        for rule in &self.rules {
            if !rule.is_inside_soft_limit(candidate, &ctx).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Completes a Reserve with success, re-checking the hard limit right
    /// before handing the result back (§4.2.1 post-completion invariant
    /// check): a race that leaves the reservation still above the hard
    /// limit fails it instead of letting accounting drift unbounded.
    ///
    /// The recheck is against `current_size() + size`, not
    /// `candidate_total()`: other requests still sitting in the eviction
    /// queue have already bumped `requested_size` but have not landed in
    /// `all_content_size` and may never commit, so they must not count
    /// against this one's own admission.
    async fn finish_success(
        &self,
        size: u64,
        reserved_from_eviction: bool,
        completion: oneshot::Sender<Result<ReserveOutcome, QuotaError>>,
    ) {
        let candidate = self.counters.current_size() + size;
        let outcome = match self.first_exceeding_hard_limit(candidate).await {
            Ok(None) => Ok(ReserveOutcome {
                reserved_from_eviction,
            }),
            Ok(Some(_)) => Err(QuotaError::AboveHardLimitAfterSuccess { size }),
            Err(e) => Err(QuotaError::Internal(e.to_string())),
        };
        let _ = completion.send(outcome);
    }

    #[tracing::instrument(skip_all, fields(size = size))]
    async fn process_reserve(
        self: &Arc<Self>,
        size: u64,
        completion: oneshot::Sender<Result<ReserveOutcome, QuotaError>>,
    ) {
        let candidate = self.counters.candidate_total();
        match self.first_exceeding_hard_limit(candidate).await {
            Ok(Some(rule)) => {
                tracing::debug!(rule = %rule.describe(), "reserve above hard limit, queued for eviction");
                self.eviction_queue
                    .lock()
                    .push_back(EvictionWaiter { size, completion });
                self.start_purge_if_needed();
            }
            Ok(None) => {
                match self.any_exceeding_soft_limit(candidate).await {
                    Ok(true) => {
                        tracing::debug!("reserve above soft limit, starting background purge");
                        self.start_purge_if_needed();
                    }
                    Ok(false) => {}
                    Err(e) => tracing::error!(error = %e, "failed to evaluate soft-limit rules"),
                }
                self.finish_success(size, false, completion).await;
            }
            Err(e) => {
                let _ = completion.send(Err(QuotaError::Internal(e.to_string())));
            }
        }
    }

    /// §4.2.3: called after every successful `ContentStore::evict`.
    #[tracing::instrument(skip_all, fields(bytes = bytes))]
    async fn record_eviction(&self, bytes: u64) {
        // Registers this call as in-flight for as long as its local scope
        // lives; `None` once shutdown has taken the master clone, in which
        // case there is no barrier left to hold.
        let _inflight = self.eviction_completion.lock().clone();

        self.counters
            .all_content_size
            .fetch_sub(bytes, Ordering::AcqRel);

        let _eviction_guard = self.eviction_lock.lock().await;
        loop {
            let Some(waiter_size) = self.eviction_queue.lock().front().map(|w| w.size) else {
                break;
            };

            let speculative = self
                .counters
                .reserved_size
                .fetch_add(waiter_size, Ordering::AcqRel)
                + waiter_size;
            let candidate = self.counters.current_size() + speculative;
            let blocked = match self.first_exceeding_hard_limit(candidate).await {
                Ok(maybe_rule) => maybe_rule.is_some(),
                Err(e) => {
                    tracing::error!(error = %e, "failed to evaluate rules during eviction accounting");
                    true
                }
            };

            if blocked {
                self.counters
                    .reserved_size
                    .fetch_sub(waiter_size, Ordering::AcqRel);
                break;
            }

            // Re-peek under the lock: another on_content_evicted call could
            // only run after this one on the same waiter (the eviction
            // queue is only drained here, single-threaded per call), so the
            // front is still the same waiter we just reasoned about.
            let waiter = self
                .eviction_queue
                .lock()
                .pop_front()
                .expect("front just peeked and not mutated by any other caller");
            self.finish_success(waiter.size, true, waiter.completion)
                .await;
        }
    }

    fn start_purge_if_needed(self: &Arc<Self>) {
        let mut slot = self.purge_handle.lock();
        if slot.is_some() {
            return;
        }
        let inner = Arc::clone(self);
        let token = self.shutdown_token.clone();
        let handle = tokio::spawn(async move {
            let jitter_ms = rand::thread_rng().gen_range(0..50);
            tokio::time::sleep(std::time::Duration::from_millis(jitter_ms)).await;
            let purger = Purger::new(inner.content_store.as_ref(), inner.metrics.as_ref());
            let result = purger.run(&token, inner.as_ref()).await;
            inner.purge_handle.lock().take();
            result
        });
        *slot = Some(handle);
    }

    async fn calibrate_rules(&self) -> Result<(), QuotaError> {
        crate::quota::rules::calibrate_all(&self.rules, self.pin_history.as_ref(), self.elastic_floor)
            .await
            .map_err(|e| QuotaError::CalibrationFailed {
                rule: RuleDescription("elastic".to_string()),
                reason: e.to_string(),
            })
    }

    async fn resolve_via_calibration_fallback(&self, waiter: EvictionWaiter, reason: &str) {
        let candidate = self.counters.candidate_total();
        let ctx = self.ctx();
        let mut noncalibratable = Vec::new();
        let mut calibratable = Vec::new();
        for rule in &self.rules {
            match rule.is_inside_hard_limit(candidate, &ctx).await {
                Ok(true) => {}
                Ok(false) if rule.can_be_calibrated() => calibratable.push(rule),
                Ok(false) => noncalibratable.push(rule),
                Err(e) => {
                    let _ = waiter.completion.send(Err(QuotaError::Internal(e.to_string())));
                    return;
                }
            }
        }

        if !noncalibratable.is_empty() {
            let desc = noncalibratable
                .iter()
                .map(|r| r.describe().to_string())
                .collect::<Vec<_>>()
                .join(", ");
            let _ = waiter
                .completion
                .send(Err(QuotaError::QuotaUnsatisfiable(format!(
                    "{reason}: {desc}"
                ))));
            return;
        }

        for rule in &calibratable {
            tracing::warn!(rule = %rule.describe(), "disabling calibratable rule pending recalibration");
            rule.disable();
        }
        // This waiter never went through `record_eviction`'s speculative
        // `reserved_size` bump, so it must not be flagged as such -- doing
        // so would make its eventual `commit()`/`rollback()` decrement
        // `reserved_size` for bytes that were never added to it.
        self.finish_success(waiter.size, false, waiter.completion).await;
    }

    fn drain_eviction_queue_on_shutdown(&self) {
        let mut queue = self.eviction_queue.lock();
        for waiter in queue.drain(..) {
            let _ = waiter.completion.send(Err(QuotaError::ShutdownInProgress));
        }
    }
}

#[async_trait]
impl PurgeHost for KeeperInner {
    async fn on_content_evicted(&self, physical_size: u64) {
        self.record_eviction(physical_size).await;
    }

    async fn should_stop_purging(&self) -> (bool, Option<RuleDescription>) {
        if self.shutdown_token.is_cancelled() {
            return (true, None);
        }
        let candidate = self.counters.candidate_total();
        let ctx = self.ctx();
        for rule in &self.rules {
            match rule.is_inside_target_limit(candidate, &ctx).await {
                Ok(true) => continue,
                Ok(false) => return (false, Some(rule.describe())),
                Err(e) => {
                    tracing::error!(error = %e, "rule evaluation failed during purge, stopping");
                    return (true, None);
                }
            }
        }
        (true, None)
    }

    async fn eviction_queue_is_empty(&self) -> bool {
        self.eviction_queue.lock().is_empty()
    }

    async fn fail_eviction_queue(&self, reason: String) {
        let waiters: Vec<EvictionWaiter> = {
            let mut queue = self.eviction_queue.lock();
            queue.drain(..).collect()
        };
        for waiter in waiters {
            self.resolve_via_calibration_fallback(waiter, &reason).await;
        }
    }

    fn current_content_size(&self) -> u64 {
        self.counters.current_size()
    }
}

#[tracing::instrument(skip_all)]
async fn run_processor(
    inner: Arc<KeeperInner>,
    mut rx: mpsc::UnboundedReceiver<QuotaRequest>,
    shutdown_token: CancellationToken,
) {
    scopeguard::defer! { tracing::info!("reservation processor exiting"); }
    loop {
        let request = tokio::select! {
            biased;
            _ = shutdown_token.cancelled() => break,
            request = rx.recv() => match request {
                Some(r) => r,
                None => break,
            },
        };
        let _stopwatch = Stopwatch::start(inner.metrics.as_ref(), StopwatchKind::ProcessQuotaRequest);
        // A panicking collaborator (the content store, filesystem, or pin
        // history trait objects) must fail only the request being handled,
        // not take the single consumer down with it -- a dead processor
        // hangs every reserve() issued afterwards. `AssertUnwindSafe` is
        // paired with no further use of `inner`'s borrowed state across the
        // unwind boundary, matching the teacher's own `catch_unwind` usage.
        let dispatch = AssertUnwindSafe(async {
            match request {
                QuotaRequest::Reserve { size, completion } => {
                    inner.process_reserve(size, completion).await;
                }
                QuotaRequest::Purge { completion } => {
                    inner.start_purge_if_needed();
                    let _ = completion.send(Ok(()));
                }
                QuotaRequest::Calibrate { completion } => {
                    let result = inner.calibrate_rules().await;
                    let _ = completion.send(result);
                }
                QuotaRequest::Synchronize { completion } => {
                    let _ = completion.send(Ok(()));
                }
            }
        });
        if let Err(panic) = dispatch.catch_unwind().await {
            tracing::error!(
                panic = %panic_message(&panic),
                "reservation dispatch panicked, request dropped"
            );
        }
    }
    rx.close();
    while let Ok(request) = rx.try_recv() {
        fail_request_on_shutdown(request);
    }
}

/// Best-effort text for a caught panic payload, for the log line in
/// [`run_processor`].
fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn fail_request_on_shutdown(request: QuotaRequest) {
    match request {
        QuotaRequest::Reserve { completion, .. } => {
            let _ = completion.send(Err(QuotaError::ShutdownInProgress));
        }
        QuotaRequest::Purge { completion }
        | QuotaRequest::Calibrate { completion }
        | QuotaRequest::Synchronize { completion } => {
            let _ = completion.send(Err(QuotaError::ShutdownInProgress));
        }
    }
}

/// The keeper's public handle. Owns the single reservation-processing task
/// and, transiently, the purge task.
pub struct QuotaKeeper {
    inner: Arc<KeeperInner>,
    lifecycle: SingleUse,
    tx: mpsc::UnboundedSender<QuotaRequest>,
    processor_handle: SyncMutex<Option<JoinHandle<()>>>,
}

impl QuotaKeeper {
    pub fn new(
        config: &QuotaKeeperConfiguration,
        content_store: Arc<dyn ContentStore>,
        filesystem: Arc<dyn FileSystem>,
        pin_history: Arc<dyn PinSizeHistory>,
        metrics: Arc<dyn QuotaMetrics>,
    ) -> Result<Self, QuotaError> {
        let rules = config.build_rules()?;
        let lifecycle = SingleUse::new();
        lifecycle
            .begin_startup()
            .expect("freshly constructed SingleUse cannot already be started");
        let shutdown_token = lifecycle.state().shutdown_started_token();
        let (eviction_completion, eviction_barrier) = completion::channel();

        let inner = Arc::new(KeeperInner {
            counters: Arc::new(Counters::new(config.content_directory_size)),
            rules,
            eviction_queue: SyncMutex::new(VecDeque::new()),
            eviction_lock: tokio::sync::Mutex::new(()),
            purge_handle: SyncMutex::new(None),
            content_store,
            filesystem,
            pin_history,
            metrics,
            shutdown_token: shutdown_token.clone(),
            elastic_floor: config.initial_elastic_size,
            eviction_completion: SyncMutex::new(Some(eviction_completion)),
            eviction_barrier,
        });

        let (tx, rx) = mpsc::unbounded_channel();
        let processor_handle = tokio::spawn(run_processor(
            Arc::clone(&inner),
            rx,
            shutdown_token,
        ));
        lifecycle.complete_startup();

        Ok(Self {
            inner,
            lifecycle,
            tx,
            processor_handle: SyncMutex::new(Some(processor_handle)),
        })
    }

    /// Enqueues a Reserve request. See §4.2's public contract: the returned
    /// handle resolves once the keeper admits or rejects the reservation;
    /// the caller must then call exactly one of `commit()`/`rollback()`.
    ///
    /// `requested_size` is bumped exactly once here, unconditionally, no
    /// matter which path below is taken -- `ReservationTx::wait()` releases
    /// that same bump on any failure, so every return path must leave
    /// exactly one bump outstanding for it to undo.
    pub fn reserve(&self, size: u64) -> ReservationTx {
        self.inner
            .counters
            .requested_size
            .fetch_add(size, Ordering::AcqRel);

        if self.lifecycle.state().shutdown_started() {
            return Self::already_shut_down(size, &self.inner.counters);
        }
        let (tx, rx) = oneshot::channel();
        if self
            .tx
            .send(QuotaRequest::Reserve { size, completion: tx })
            .is_err()
        {
            return Self::already_shut_down(size, &self.inner.counters);
        }
        ReservationTx::new(size, Arc::clone(&self.inner.counters), rx)
    }

    fn already_shut_down(size: u64, counters: &Arc<Counters>) -> ReservationTx {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(QuotaError::ShutdownInProgress));
        ReservationTx::new(size, Arc::clone(counters), rx)
    }

    /// Asks every calibratable rule to recompute its cap; returns once done.
    pub async fn calibrate(&self) -> Result<(), QuotaError> {
        self.ensure_running()?;
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(QuotaRequest::Calibrate { completion: tx })
            .map_err(|_| QuotaError::ShutdownInProgress)?;
        rx.await.map_err(|_| {
            QuotaError::Internal("the reservation processor panicked while calibrating".to_string())
        })?
    }

    /// `sync(false)` is a barrier: completes after all earlier-enqueued
    /// requests have been processed. `sync(true)` additionally forces a
    /// purge pass.
    pub async fn sync(&self, purge: bool) -> Result<(), QuotaError> {
        self.ensure_running()?;
        let (tx, rx) = oneshot::channel();
        let request = if purge {
            QuotaRequest::Purge { completion: tx }
        } else {
            QuotaRequest::Synchronize { completion: tx }
        };
        self.tx
            .send(request)
            .map_err(|_| QuotaError::ShutdownInProgress)?;
        rx.await.map_err(|_| {
            QuotaError::Internal("the reservation processor panicked while handling this request".to_string())
        })?
    }

    /// Must be called by the `ContentStore` caller after every successful
    /// eviction (§6).
    pub async fn on_content_evicted(&self, physical_size: u64) {
        self.inner.record_eviction(physical_size).await;
    }

    pub fn current_size(&self) -> u64 {
        self.inner.counters.current_size()
    }

    fn ensure_running(&self) -> Result<(), QuotaError> {
        self.lifecycle
            .state()
            .ensure_running("QuotaKeeper")
            .map_err(|_: LifecycleError| QuotaError::ShutdownInProgress)
    }

    /// §4.2.5 shutdown sequence.
    pub async fn shutdown(&self) -> Result<(), LifecycleError> {
        self.lifecycle.begin_shutdown()?;

        let processor = self.processor_handle.lock().take();
        if let Some(handle) = processor {
            let _ = handle.await;
        }

        let purge = self.inner.purge_handle.lock().take();
        if let Some(handle) = purge {
            let _ = handle.await;
        }

        // Drop the master completion clone and wait for every in-flight
        // `record_eviction` call to finish before draining the queue, so a
        // concurrent `on_content_evicted` racing shutdown always finishes
        // its accounting first (§4.2.5).
        self.inner.eviction_completion.lock().take();
        self.inner.eviction_barrier.wait().await;

        self.inner.drain_eviction_queue_on_shutdown();
        self.lifecycle.complete_shutdown();
        Ok(())
    }
}
