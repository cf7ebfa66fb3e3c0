//! The `Tracing/metrics` collaborator from the external-interfaces contract:
//! two stopwatch-type counters (`PurgeCall`, `ProcessQuotaRequest`) plus a
//! `purge_stop` observation hook. Exposing *where* these end up (a scrape
//! endpoint, a log sink) is the host's job; this crate only needs the
//! counters to be satisfiable by a `prometheus::Registry` the host already
//! owns, the way the rest of this codebase's components report into a
//! shared registry rather than owning their own HTTP exposition.

use std::time::{Duration, Instant};

use prometheus::{Histogram, HistogramOpts};

use crate::quota::purge::PurgeResult;

pub trait QuotaMetrics: Send + Sync {
    fn observe_purge_call(&self, elapsed: Duration);
    fn observe_process_quota_request(&self, elapsed: Duration);
    fn purge_stop(&self, result: &PurgeResult);
}

/// RAII stopwatch: records elapsed time into the named counter on drop, the
/// same shape as the stopwatch-type counters used elsewhere in this
/// codebase for per-call latency (`PurgeCall`, `ProcessQuotaRequest`).
pub struct Stopwatch<'a> {
    start: Instant,
    metrics: &'a dyn QuotaMetrics,
    kind: StopwatchKind,
}

#[derive(Clone, Copy)]
pub enum StopwatchKind {
    PurgeCall,
    ProcessQuotaRequest,
}

impl<'a> Stopwatch<'a> {
    pub fn start(metrics: &'a dyn QuotaMetrics, kind: StopwatchKind) -> Self {
        Self {
            start: Instant::now(),
            metrics,
            kind,
        }
    }
}

impl Drop for Stopwatch<'_> {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        match self.kind {
            StopwatchKind::PurgeCall => self.metrics.observe_purge_call(elapsed),
            StopwatchKind::ProcessQuotaRequest => {
                self.metrics.observe_process_quota_request(elapsed)
            }
        }
    }
}

/// Default implementation backed by `prometheus` histograms, registered into
/// a registry the host provides.
pub struct PrometheusQuotaMetrics {
    purge_call: Histogram,
    process_quota_request: Histogram,
}

impl PrometheusQuotaMetrics {
    pub fn new(registry: &prometheus::Registry) -> Result<Self, prometheus::Error> {
        let purge_call = Histogram::with_opts(HistogramOpts::new(
            "quota_purge_call_seconds",
            "Duration of a single QuotaKeeper purge pass",
        ))?;
        let process_quota_request = Histogram::with_opts(HistogramOpts::new(
            "quota_process_quota_request_seconds",
            "Duration of processing one reservation request",
        ))?;
        registry.register(Box::new(purge_call.clone()))?;
        registry.register(Box::new(process_quota_request.clone()))?;
        Ok(Self {
            purge_call,
            process_quota_request,
        })
    }
}

impl QuotaMetrics for PrometheusQuotaMetrics {
    fn observe_purge_call(&self, elapsed: Duration) {
        self.purge_call.observe(elapsed.as_secs_f64());
    }

    fn observe_process_quota_request(&self, elapsed: Duration) {
        self.process_quota_request.observe(elapsed.as_secs_f64());
    }

    fn purge_stop(&self, result: &PurgeResult) {
        tracing::debug!(
            evicted_files = result.evicted_files,
            current_content_size = result.current_content_size,
            "{}",
            result.description,
        );
    }
}

/// No-op implementation for tests and hosts that don't want metrics.
#[derive(Default)]
pub struct NoopQuotaMetrics;

impl QuotaMetrics for NoopQuotaMetrics {
    fn observe_purge_call(&self, _elapsed: Duration) {}
    fn observe_process_quota_request(&self, _elapsed: Duration) {}
    fn purge_stop(&self, _result: &PurgeResult) {}
}
