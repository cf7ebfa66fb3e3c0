//! Reservation/eviction quota engine and bandwidth watchdog for a local
//! content-addressed cache.
//!
//! [`quota::QuotaKeeper`] is the admission-control core: byte reservations,
//! LRU eviction, and rule-based limit enforcement. [`bandwidth`] is an
//! independent watchdog for slow remote copies. Both build on the small
//! [`utils::lifecycle`] substrate for startup/shutdown ordering.

pub mod bandwidth;
pub mod collaborators;
pub mod error;
pub mod metrics;
pub mod quota;

pub use collaborators::{ContentStore, DiskUsage, EvictResult, FileSystem, PinSizeHistory};
pub use error::{BandwidthConfigError, BandwidthError, QuotaError, RuleError};
pub use metrics::{NoopQuotaMetrics, PrometheusQuotaMetrics, QuotaMetrics};
