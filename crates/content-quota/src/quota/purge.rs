//! The background purge loop (§4.2.4): evicts LRU content until either the
//! eviction queue drains, a pass frees nothing (in which case queued
//! reserves are failed outright), or every rule reports
//! `is_inside_target_limit`.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::collaborators::ContentStore;
use crate::metrics::{QuotaMetrics, Stopwatch, StopwatchKind};
use crate::quota::rules::RuleDescription;

/// Result of one purge pass, reported through [`QuotaMetrics::purge_stop`].
#[derive(Debug, Clone)]
pub struct PurgeResult {
    pub evicted_files: u64,
    pub evicted_bytes: u64,
    pub current_content_size: u64,
    pub description: String,
}

/// The keeper-side hooks the purge loop needs without depending on
/// [`crate::quota::keeper::QuotaKeeper`] directly -- kept as a trait so the
/// eviction-queue bookkeeping in §4.2.3 stays owned by the keeper.
#[async_trait]
pub trait PurgeHost: Send + Sync {
    async fn on_content_evicted(&self, physical_size: u64);
    /// Checked before every candidate eviction. `(stop, active_rule)`: the
    /// first rule not inside its target limit, if any, is reported as the
    /// active rule driving the purge.
    async fn should_stop_purging(&self) -> (bool, Option<RuleDescription>);
    async fn eviction_queue_is_empty(&self) -> bool;
    async fn fail_eviction_queue(&self, reason: String);
    fn current_content_size(&self) -> u64;
}

/// Runs purge passes against a `ContentStore`, driven by a `PurgeHost`.
pub struct Purger<'a> {
    store: &'a dyn ContentStore,
    metrics: &'a dyn QuotaMetrics,
}

impl<'a> Purger<'a> {
    pub fn new(store: &'a dyn ContentStore, metrics: &'a dyn QuotaMetrics) -> Self {
        Self { store, metrics }
    }

    /// Runs passes until `continue_purging` (§4.2.4 step 4) decides to stop.
    #[tracing::instrument(skip_all)]
    pub async fn run(&self, cancel: &CancellationToken, host: &dyn PurgeHost) -> PurgeResult {
        let _stopwatch = Stopwatch::start(self.metrics, StopwatchKind::PurgeCall);
        loop {
            let pass = self.run_one_pass(cancel, host).await;
            tracing::debug!(
                evicted_files = pass.evicted_files,
                evicted_bytes = pass.evicted_bytes,
                "purge pass complete"
            );

            if pass.evicted_files == 0 {
                host.fail_eviction_queue("failed to free space".to_string())
                    .await;
                self.metrics.purge_stop(&pass);
                return pass;
            }
            if host.eviction_queue_is_empty().await {
                self.metrics.purge_stop(&pass);
                return pass;
            }
            if cancel.is_cancelled() {
                self.metrics.purge_stop(&pass);
                return pass;
            }
        }
    }

    async fn run_one_pass(&self, cancel: &CancellationToken, host: &dyn PurgeHost) -> PurgeResult {
        let candidates = match self.store.lru_ordered_content().await {
            Ok(list) => list,
            Err(e) => {
                tracing::error!(error = %e, "failed to list LRU-ordered content");
                return PurgeResult {
                    evicted_files: 0,
                    evicted_bytes: 0,
                    current_content_size: host.current_content_size(),
                    description: format!("failed to list content store: {e}"),
                };
            }
        };

        let mut evicted_files = 0u64;
        let mut evicted_bytes = 0u64;
        let mut active_rule: Option<RuleDescription> = None;

        for (hash, _last_access, _replicas) in candidates {
            if cancel.is_cancelled() {
                break;
            }
            let (stop, rule) = host.should_stop_purging().await;
            if stop {
                active_rule = rule;
                break;
            }

            match self.store.evict(&hash, true).await {
                Ok(result) if result.succeeded => {
                    evicted_files += 1;
                    evicted_bytes += result.evicted_physical_size;
                    host.on_content_evicted(result.evicted_physical_size).await;
                }
                Ok(_) => continue,
                Err(e) => {
                    tracing::warn!(hash = %hash, error = %e, "eviction attempt failed");
                    continue;
                }
            }
        }

        let description = match &active_rule {
            Some(rule) => format!("purge pass stopped by rule {rule}"),
            None => "purge pass exhausted candidate list".to_string(),
        };

        PurgeResult {
            evicted_files,
            evicted_bytes,
            current_content_size: host.current_content_size(),
            description,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::SystemTime;

    use parking_lot::Mutex;

    use super::*;
    use crate::collaborators::{ContentHash, EvictResult};
    use crate::metrics::NoopQuotaMetrics;

    struct FakeStore {
        remaining: Mutex<Vec<(ContentHash, u64)>>,
    }

    #[async_trait]
    impl ContentStore for FakeStore {
        async fn lru_ordered_content(
            &self,
        ) -> anyhow::Result<Vec<(ContentHash, SystemTime, u32)>> {
            Ok(self
                .remaining
                .lock()
                .iter()
                .map(|(hash, _size)| (hash.clone(), SystemTime::UNIX_EPOCH, 0))
                .collect())
        }

        async fn evict(&self, hash: &ContentHash, _only_unlinked: bool) -> anyhow::Result<EvictResult> {
            let mut remaining = self.remaining.lock();
            if let Some(pos) = remaining.iter().position(|(h, _)| h == hash) {
                let (_, size) = remaining.remove(pos);
                Ok(EvictResult {
                    succeeded: true,
                    evicted_physical_size: size,
                })
            } else {
                Ok(EvictResult {
                    succeeded: false,
                    evicted_physical_size: 0,
                })
            }
        }
    }

    struct FakeHost {
        current_size: AtomicU64,
        stop_after_evictions: u64,
        evicted_so_far: AtomicU64,
        queue_empty: bool,
        failed: Mutex<Option<String>>,
    }

    #[async_trait]
    impl PurgeHost for FakeHost {
        async fn on_content_evicted(&self, physical_size: u64) {
            self.current_size.fetch_sub(physical_size, Ordering::Relaxed);
            self.evicted_so_far.fetch_add(1, Ordering::Relaxed);
        }

        async fn should_stop_purging(&self) -> (bool, Option<RuleDescription>) {
            let stop = self.evicted_so_far.load(Ordering::Relaxed) >= self.stop_after_evictions;
            (stop, stop.then(|| RuleDescription("fake".to_string())))
        }

        async fn eviction_queue_is_empty(&self) -> bool {
            self.queue_empty
        }

        async fn fail_eviction_queue(&self, reason: String) {
            *self.failed.lock() = Some(reason);
        }

        fn current_content_size(&self) -> u64 {
            self.current_size.load(Ordering::Relaxed)
        }
    }

    #[tokio::test]
    async fn run_one_pass_stops_once_the_host_says_so() {
        let store = FakeStore {
            remaining: Mutex::new(vec![
                (ContentHash("a".into()), 10),
                (ContentHash("b".into()), 20),
                (ContentHash("c".into()), 30),
            ]),
        };
        let host = FakeHost {
            current_size: AtomicU64::new(60),
            stop_after_evictions: 2,
            evicted_so_far: AtomicU64::new(0),
            queue_empty: false,
            failed: Mutex::new(None),
        };
        let metrics = NoopQuotaMetrics;
        let purger = Purger::new(&store, &metrics);
        let cancel = CancellationToken::new();

        let pass = purger.run_one_pass(&cancel, &host).await;

        assert_eq!(pass.evicted_files, 2);
        assert_eq!(pass.evicted_bytes, 30);
        assert!(host.failed.lock().is_none());
    }

    #[tokio::test]
    async fn run_fails_the_queue_when_a_pass_evicts_nothing() {
        let store = FakeStore {
            remaining: Mutex::new(vec![]),
        };
        let host = FakeHost {
            current_size: AtomicU64::new(0),
            stop_after_evictions: 100,
            evicted_so_far: AtomicU64::new(0),
            queue_empty: false,
            failed: Mutex::new(None),
        };
        let metrics = NoopQuotaMetrics;
        let purger = Purger::new(&store, &metrics);
        let cancel = CancellationToken::new();

        let pass = purger.run(&cancel, &host).await;

        assert_eq!(pass.evicted_files, 0);
        assert!(host.failed.lock().is_some());
    }
}
