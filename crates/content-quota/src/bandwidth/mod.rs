//! The bandwidth watchdog (§4.3): interval-sampled progress monitoring with
//! cancellation of slow transfers and historical-speed feedback.

pub mod checker;
pub mod config;
pub mod historical;

pub use checker::{
    check_bandwidth_at_interval, default_timeout_result, BandwidthOptions, CopyResult,
    CopyStatistics, TimeoutDiagnostic,
};
pub use config::BandwidthCheckerConfiguration;
pub use historical::{HistoricalSpeedSource, LimitSource};
