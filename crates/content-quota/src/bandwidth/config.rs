//! `BandwidthCheckerConfiguration` (§6), validated the same way
//! `DiskUsageEvictionTaskConfig` is: a plain `serde` struct with
//! `humantime_serde` for the `Duration` field, plus two named presets.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::BandwidthConfigError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BandwidthCheckerConfiguration {
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    #[serde(default)]
    pub minimum_mb_per_s: Option<f64>,
    #[serde(default)]
    pub max_cap_mb_per_s: Option<f64>,
    #[serde(default)]
    pub multiplier: Option<f64>,
    #[serde(default)]
    pub history_records: Option<usize>,
}

impl BandwidthCheckerConfiguration {
    /// `{ 30s, none, none, none, none }`.
    pub fn default_() -> Self {
        Self {
            interval: Duration::from_secs(30),
            minimum_mb_per_s: None,
            max_cap_mb_per_s: None,
            multiplier: None,
            history_records: None,
        }
    }

    /// `{ i32::MAX ms, 0, none, none, none }`: interval effectively never
    /// elapses and the floor is zero, so the checker never cancels a copy.
    pub fn disabled() -> Self {
        Self {
            interval: Duration::from_millis(i32::MAX as u64),
            minimum_mb_per_s: Some(0.0),
            max_cap_mb_per_s: None,
            multiplier: None,
            history_records: None,
        }
    }

    pub fn validate(&self) -> Result<(), BandwidthConfigError> {
        if let Some(multiplier) = self.multiplier {
            if !(multiplier > 0.0) {
                return Err(BandwidthConfigError::InvalidMultiplier(multiplier));
            }
        }
        if let Some(history_records) = self.history_records {
            if history_records == 0 {
                return Err(BandwidthConfigError::InvalidHistoryRecords(history_records));
            }
        }
        Ok(())
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier.unwrap_or(1.0)
    }

    pub fn history_records(&self) -> usize {
        self.history_records.unwrap_or(32)
    }
}
