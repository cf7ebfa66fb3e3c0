//! `check_bandwidth_at_interval` (§4.3): races a copy task against an
//! interval timer, canceling the copy if its throughput drops below an
//! adaptive floor.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::bandwidth::historical::LimitSource;
use crate::bandwidth::config::BandwidthCheckerConfiguration;
use crate::error::BandwidthError;

const MB: f64 = 1_000_000.0;

/// What a caller-supplied copy task must expose back to the checker.
pub trait CopyResult: Send + 'static {
    fn size(&self) -> Option<u64>;
    fn set_minimum_speed_mb_per_s(&mut self, value: f64);
}

/// Shared `(bytes, network_copy_duration)` cell a copy task updates as
/// bytes arrive (§3 "Per-call transient").
#[derive(Debug, Default)]
pub struct CopyStatistics {
    bytes: AtomicU64,
    network_copy_duration_millis: AtomicU64,
}

impl CopyStatistics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_bytes(&self, n: u64) {
        self.bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_network_duration(&self, d: Duration) {
        self.network_copy_duration_millis
            .fetch_add(d.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> (u64, Duration) {
        (
            self.bytes.load(Ordering::Relaxed),
            Duration::from_millis(self.network_copy_duration_millis.load(Ordering::Relaxed)),
        )
    }
}

pub struct BandwidthOptions {
    pub copy_statistics: Arc<CopyStatistics>,
    /// Overrides the computed floor when set.
    pub required_mb_per_s: Option<f64>,
    pub use_network_duration: bool,
}

/// What the checker hands the caller's `to_timeout_result` when throughput
/// drops below the floor.
pub struct TimeoutDiagnostic {
    pub required_mb_per_s: f64,
    pub observed_bytes: u64,
    pub elapsed: Duration,
    pub interval: Duration,
}

/// §4.3: races `copy_factory`'s task against `config.interval`, canceling it
/// if the achieved speed ever drops below the floor derived from
/// `limit_source` (or `options.required_mb_per_s`, if set).
pub async fn check_bandwidth_at_interval<T, E, F, Fut, ToTimeout>(
    cancel: CancellationToken,
    config: &BandwidthCheckerConfiguration,
    limit_source: &LimitSource,
    options: &BandwidthOptions,
    copy_factory: F,
    to_timeout_result: ToTimeout,
) -> Result<T, BandwidthError<E>>
where
    T: CopyResult,
    E: std::error::Error,
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    ToTimeout: Fn(TimeoutDiagnostic) -> BandwidthError<E>,
{
    let max_cap = config.max_cap_mb_per_s.unwrap_or(f64::MAX);
    let computed_floor = (limit_source.current() * config.multiplier())
        .clamp(0.0, max_cap)
        .max(config.minimum_mb_per_s.unwrap_or(0.0));
    let min_mb_s = options.required_mb_per_s.unwrap_or(computed_floor);

    let start_bytes = options.copy_statistics.snapshot().0;
    let mut prev = options.copy_statistics.snapshot();

    let copy_cancel = cancel.child_token();
    let copy_future = copy_factory(copy_cancel.clone());
    tokio::pin!(copy_future);

    let start_instant = Instant::now();

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                copy_cancel.cancel();
                return Err(BandwidthError::Canceled);
            }

            result = &mut copy_future => {
                return match result {
                    Ok(mut result) => {
                        result.set_minimum_speed_mb_per_s(min_mb_s);
                        let elapsed = start_instant.elapsed();
                        let bytes_copied = result
                            .size()
                            .unwrap_or_else(|| options.copy_statistics.snapshot().0)
                            .saturating_sub(start_bytes);
                        if elapsed.as_secs_f64() > 0.0 {
                            let achieved = (bytes_copied as f64 / MB) / elapsed.as_secs_f64();
                            limit_source.record_observed_speed(achieved);
                        }
                        Ok(result)
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "copy task failed");
                        Err(BandwidthError::Copy(e))
                    }
                };
            }

            _ = tokio::time::sleep(config.interval) => {
                let cur = options.copy_statistics.snapshot();
                let transferred = cur.0.saturating_sub(prev.0);
                let elapsed = if options.use_network_duration {
                    let d = cur.1.saturating_sub(prev.1);
                    if d.is_zero() { config.interval } else { d }
                } else {
                    config.interval
                };
                let speed_mb_s = (transferred as f64 / MB) / elapsed.as_secs_f64();

                if speed_mb_s == 0.0 || speed_mb_s < min_mb_s {
                    copy_cancel.cancel();
                    tracing::warn!(
                        speed_mb_s,
                        min_mb_s,
                        transferred,
                        "copy bandwidth below floor, canceling"
                    );
                    return Err(to_timeout_result(TimeoutDiagnostic {
                        required_mb_per_s: min_mb_s,
                        observed_bytes: transferred,
                        elapsed,
                        interval: config.interval,
                    }));
                }
                prev = cur;
            }
        }
    }
}

/// Default `to_timeout_result` for callers who don't need to customize the
/// diagnostic: builds `BandwidthError::Timeout` directly.
pub fn default_timeout_result<E: std::error::Error>(diagnostic: TimeoutDiagnostic) -> BandwidthError<E> {
    BandwidthError::Timeout {
        required_mb_per_s: diagnostic.required_mb_per_s,
        observed_bytes: diagnostic.observed_bytes,
        elapsed: diagnostic.elapsed,
        interval: diagnostic.interval,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeCopy {
        size: u64,
        min_speed: f64,
    }

    impl CopyResult for FakeCopy {
        fn size(&self) -> Option<u64> {
            Some(self.size)
        }

        fn set_minimum_speed_mb_per_s(&mut self, value: f64) {
            self.min_speed = value;
        }
    }

    #[derive(Debug, thiserror::Error)]
    #[error("copy failed")]
    struct FakeCopyError;

    fn options() -> BandwidthOptions {
        BandwidthOptions {
            copy_statistics: CopyStatistics::new(),
            required_mb_per_s: None,
            use_network_duration: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn copy_finishing_before_the_interval_elapses_succeeds() {
        let config = BandwidthCheckerConfiguration {
            interval: Duration::from_secs(10),
            ..BandwidthCheckerConfiguration::default_()
        };
        let limit_source = LimitSource::Constant(0.0);
        let opts = options();

        let result = check_bandwidth_at_interval::<_, FakeCopyError, _, _, _>(
            CancellationToken::new(),
            &config,
            &limit_source,
            &opts,
            |_cancel| async {
                Ok(FakeCopy {
                    size: 1_000_000,
                    min_speed: 0.0,
                })
            },
            default_timeout_result,
        )
        .await;

        assert!(result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_copy_is_canceled_once_speed_drops_below_the_floor() {
        let config = BandwidthCheckerConfiguration {
            interval: Duration::from_secs(1),
            ..BandwidthCheckerConfiguration::default_()
        };
        let limit_source = LimitSource::Constant(0.0);
        let mut opts = options();
        opts.required_mb_per_s = Some(100.0);

        let result = check_bandwidth_at_interval::<FakeCopy, FakeCopyError, _, _, _>(
            CancellationToken::new(),
            &config,
            &limit_source,
            &opts,
            |_cancel| std::future::pending(),
            default_timeout_result,
        )
        .await;

        assert!(matches!(result, Err(BandwidthError::Timeout { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn outer_cancellation_stops_the_check_immediately() {
        let config = BandwidthCheckerConfiguration::default_();
        let limit_source = LimitSource::Constant(0.0);
        let opts = options();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = check_bandwidth_at_interval::<FakeCopy, FakeCopyError, _, _, _>(
            cancel,
            &config,
            &limit_source,
            &opts,
            |_cancel| std::future::pending(),
            default_timeout_result,
        )
        .await;

        assert!(matches!(result, Err(BandwidthError::Canceled)));
    }
}
