//! Contracts for the systems this crate treats as out-of-scope collaborators:
//! the on-disk content store, the filesystem, and the pin-size history used
//! to calibrate the elastic rule. Each is a small `async_trait` the way
//! `remote_storage`'s own storage backends are defined, so tests can supply
//! in-memory fakes without touching real disk.

use std::time::SystemTime;

use async_trait::async_trait;

/// Opaque content-address. The hashing scheme itself is out of scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash(pub String);

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub type LastAccess = SystemTime;
pub type ReplicaCount = u32;

/// Outcome of a single `ContentStore::evict` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictResult {
    pub succeeded: bool,
    pub evicted_physical_size: u64,
}

/// The directory of content-addressed artifacts. Evicting an artifact frees
/// its bytes; the caller of `evict` is responsible for reporting that back
/// to [`crate::quota::keeper::QuotaKeeper::on_content_evicted`].
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// A point-in-time snapshot ordered by ascending last-access time.
    async fn lru_ordered_content(
        &self,
    ) -> anyhow::Result<Vec<(ContentHash, LastAccess, ReplicaCount)>>;

    async fn evict(&self, hash: &ContentHash, only_unlinked: bool) -> anyhow::Result<EvictResult>;
}

/// Total and available bytes for the volume backing the content store.
/// `total_bytes - available_bytes` is the `DiskFreePercent` rule's nominal
/// cap (§3): it tiers against the volume's actual used space, not its raw
/// capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskUsage {
    pub total_bytes: u64,
    pub available_bytes: u64,
}

/// Bytes-free query backing the `DiskFreePercent` rule.
#[async_trait]
pub trait FileSystem: Send + Sync {
    async fn disk_usage(&self) -> anyhow::Result<DiskUsage>;
}

/// Historical pin sizes backing the `Elastic` rule's calibration.
#[async_trait]
pub trait PinSizeHistory: Send + Sync {
    async fn read_history(&self) -> anyhow::Result<Vec<u64>>;
}
