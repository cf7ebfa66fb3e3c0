//! `QuotaKeeperConfiguration` (§6): a plain, validated `serde` struct. Reading
//! it from a file or CLI is out of scope (§1) -- this crate only validates
//! values once they have arrived as Rust structs.

use serde::{Deserialize, Serialize};

use crate::error::RuleError;
use crate::quota::rules::{DiskFreePercentRule, ElasticRule, MaxSizeRule, Quota, QuotaRule, RuleThresholds};

fn default_history_window_size() -> usize {
    16
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaKeeperConfiguration {
    /// Bytes already on disk when the keeper starts, seeding `all_content_size`.
    pub content_directory_size: u64,
    #[serde(default)]
    pub enable_elasticity: bool,
    #[serde(default)]
    pub max_size_quota: Option<Quota>,
    #[serde(default)]
    pub disk_free_percent_quota: Option<Quota>,
    #[serde(default = "default_history_window_size")]
    pub history_window_size: usize,
    #[serde(default)]
    pub initial_elastic_size: u64,
}

impl QuotaKeeperConfiguration {
    /// Builds the ordered rule list this configuration describes. Rejects a
    /// configuration with no rules at all (§3).
    pub fn build_rules(&self) -> Result<Vec<QuotaRule>, RuleError> {
        let mut rules = Vec::new();

        if let Some(quota) = &self.max_size_quota {
            rules.push(QuotaRule::MaxSize(MaxSizeRule {
                quota: quota.clone(),
            }));
        }
        if let Some(quota) = &self.disk_free_percent_quota {
            // `quota.cap_bytes` is intentionally unused here: this rule's
            // nominal cap is derived each evaluation from the filesystem's
            // actual used-bytes count, not a configured byte count.
            rules.push(QuotaRule::DiskFreePercent(DiskFreePercentRule {
                thresholds: quota.thresholds,
            }));
        }
        if self.enable_elasticity {
            rules.push(QuotaRule::Elastic(ElasticRule::new(
                self.initial_elastic_size,
                RuleThresholds::default_margin(),
                self.history_window_size,
            )));
        }

        crate::quota::rules::validate_non_empty(&rules)?;
        Ok(rules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_configuration() {
        let config = QuotaKeeperConfiguration {
            content_directory_size: 0,
            enable_elasticity: false,
            max_size_quota: None,
            disk_free_percent_quota: None,
            history_window_size: default_history_window_size(),
            initial_elastic_size: 0,
        };
        assert_eq!(config.build_rules().unwrap_err(), RuleError::NoRulesConfigured);
    }

    #[test]
    fn builds_one_rule_per_configured_quota() {
        let config = QuotaKeeperConfiguration {
            content_directory_size: 0,
            enable_elasticity: true,
            max_size_quota: Some(Quota {
                cap_bytes: 1000,
                thresholds: RuleThresholds::default_margin(),
            }),
            disk_free_percent_quota: None,
            history_window_size: 4,
            initial_elastic_size: 500,
        };
        let rules = config.build_rules().unwrap();
        assert_eq!(rules.len(), 2);
    }
}
