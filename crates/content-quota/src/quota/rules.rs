//! Quota rules: predicates over the *candidate total size* (current size +
//! pending reserve) that the keeper consults at three tiers -- target, soft,
//! hard. All three rule kinds share the same tiering math
//! ([`RuleThresholds`]) over a per-kind "nominal cap": the configured byte
//! count for `MaxSize`, the volume's currently-used bytes (`total - free`)
//! for `DiskFreePercent` (refreshed on every evaluation), and the calibrated
//! cap for `Elastic`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use utils::percent::Percent;

use crate::collaborators::{FileSystem, PinSizeHistory};
use crate::error::RuleError;

/// `target_pct <= soft_pct <= hard_pct` of a rule's nominal cap. "Hard"
/// conventionally equals the configured/calibrated cap itself (100%); soft
/// and target sit below it, leaving headroom for the background purge to
/// act before new reservations are blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleThresholds {
    pub target_pct: Percent,
    pub soft_pct: Percent,
    pub hard_pct: Percent,
}

impl RuleThresholds {
    pub fn new(target_pct: Percent, soft_pct: Percent, hard_pct: Percent) -> Self {
        Self {
            target_pct,
            soft_pct,
            hard_pct,
        }
    }

    /// `(90, 95, 100)`: hard equals the nominal cap, soft/target are a
    /// margin below it.
    pub fn default_margin() -> Self {
        Self {
            target_pct: Percent::new(90).expect("90 is a valid percent"),
            soft_pct: Percent::new(95).expect("95 is a valid percent"),
            hard_pct: Percent::new(100).expect("100 is a valid percent"),
        }
    }

    fn scale(nominal_cap: u64, pct: Percent) -> u64 {
        ((nominal_cap as u128) * (pct.get() as u128) / 100) as u64
    }

    pub fn target_cap(&self, nominal_cap: u64) -> u64 {
        Self::scale(nominal_cap, self.target_pct)
    }

    pub fn soft_cap(&self, nominal_cap: u64) -> u64 {
        Self::scale(nominal_cap, self.soft_pct)
    }

    pub fn hard_cap(&self, nominal_cap: u64) -> u64 {
        Self::scale(nominal_cap, self.hard_pct)
    }
}

impl Default for RuleThresholds {
    fn default() -> Self {
        Self::default_margin()
    }
}

/// A static byte cap plus its tiering, used by the `MaxSize` rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quota {
    pub cap_bytes: u64,
    #[serde(default)]
    pub thresholds: RuleThresholds,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum RuleKind {
    MaxSize,
    DiskFreePercent,
    Elastic,
}

/// A short, loggable description of a rule, used in keeper-level failure
/// messages that concatenate multiple offending rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleDescription(pub String);

impl std::fmt::Display for RuleDescription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug)]
pub struct MaxSizeRule {
    pub quota: Quota,
}

#[derive(Debug)]
pub struct DiskFreePercentRule {
    pub thresholds: RuleThresholds,
}

#[derive(Debug)]
pub struct ElasticRule {
    cap_bytes: AtomicU64,
    enabled: AtomicBool,
    pub thresholds: RuleThresholds,
    pub history_window: usize,
}

impl ElasticRule {
    pub fn new(initial_cap_bytes: u64, thresholds: RuleThresholds, history_window: usize) -> Self {
        Self {
            cap_bytes: AtomicU64::new(initial_cap_bytes),
            enabled: AtomicBool::new(true),
            thresholds,
            history_window,
        }
    }

    pub fn cap_bytes(&self) -> u64 {
        self.cap_bytes.load(Ordering::Relaxed)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::Relaxed);
    }

    /// Recomputes the cap from recent pin-size history: the sum of the most
    /// recent `history_window` samples, never shrinking below the cap the
    /// rule started with. Re-enables the rule so the calibration fallback
    /// (§4.2.2) can recover from a prior overshoot.
    pub fn calibrate(&self, history: &[u64], floor: u64) {
        let new_cap: u64 = history
            .iter()
            .rev()
            .take(self.history_window.max(1))
            .copied()
            .fold(0u64, |acc, sample| acc.saturating_add(sample));
        self.cap_bytes
            .store(new_cap.max(floor), Ordering::Relaxed);
        self.enabled.store(true, Ordering::Relaxed);
    }
}

/// Context needed to evaluate rules whose nominal cap depends on an external
/// collaborator (`DiskFreePercent` reads the filesystem).
pub struct RuleEvalContext<'a> {
    pub filesystem: &'a dyn FileSystem,
}

#[derive(Debug)]
pub enum QuotaRule {
    MaxSize(MaxSizeRule),
    DiskFreePercent(DiskFreePercentRule),
    Elastic(ElasticRule),
}

impl QuotaRule {
    pub fn kind(&self) -> RuleKind {
        match self {
            QuotaRule::MaxSize(_) => RuleKind::MaxSize,
            QuotaRule::DiskFreePercent(_) => RuleKind::DiskFreePercent,
            QuotaRule::Elastic(_) => RuleKind::Elastic,
        }
    }

    pub fn can_be_calibrated(&self) -> bool {
        matches!(self, QuotaRule::Elastic(_))
    }

    pub fn is_enabled(&self) -> bool {
        match self {
            QuotaRule::Elastic(r) => r.is_enabled(),
            _ => true,
        }
    }

    pub fn disable(&self) {
        if let QuotaRule::Elastic(r) = self {
            r.disable();
        }
    }

    pub fn describe(&self) -> RuleDescription {
        match self {
            QuotaRule::MaxSize(r) => RuleDescription(format!(
                "MaxSize(hard={} bytes)",
                r.thresholds_hard_cap()
            )),
            QuotaRule::DiskFreePercent(r) => RuleDescription(format!(
                "DiskFreePercent(hard={}%)",
                r.thresholds.hard_pct.get()
            )),
            QuotaRule::Elastic(r) => RuleDescription(format!(
                "Elastic(cap={} bytes, enabled={})",
                r.cap_bytes(),
                r.is_enabled()
            )),
        }
    }

    /// The rule's current nominal cap. Async only because `DiskFreePercent`
    /// must re-read the volume's total size; callers that need to check a
    /// rule repeatedly without re-entering async code (the eviction
    /// accounting loop, §4.2.3) should snapshot this once per call.
    pub(crate) async fn nominal_cap(&self, ctx: &RuleEvalContext<'_>) -> anyhow::Result<u64> {
        Ok(match self {
            QuotaRule::MaxSize(r) => r.quota.cap_bytes,
            QuotaRule::DiskFreePercent(_) => {
                let usage = ctx.filesystem.disk_usage().await?;
                usage.total_bytes.saturating_sub(usage.available_bytes)
            }
            QuotaRule::Elastic(r) => r.cap_bytes(),
        })
    }

    pub(crate) fn thresholds(&self) -> RuleThresholds {
        match self {
            QuotaRule::MaxSize(r) => r.quota.thresholds,
            QuotaRule::DiskFreePercent(r) => r.thresholds,
            QuotaRule::Elastic(r) => r.thresholds,
        }
    }

    /// Synchronous hard-limit check against an already-known nominal cap
    /// (see [`Self::nominal_cap`]).
    pub(crate) fn exceeds_hard_cap(&self, candidate_total: u64, cap: u64) -> bool {
        self.is_enabled() && candidate_total > self.thresholds().hard_cap(cap)
    }

    pub async fn is_inside_target_limit(
        &self,
        candidate_total: u64,
        ctx: &RuleEvalContext<'_>,
    ) -> anyhow::Result<bool> {
        if !self.is_enabled() {
            return Ok(true);
        }
        let cap = self.nominal_cap(ctx).await?;
        Ok(candidate_total <= self.thresholds().target_cap(cap))
    }

    pub async fn is_inside_soft_limit(
        &self,
        candidate_total: u64,
        ctx: &RuleEvalContext<'_>,
    ) -> anyhow::Result<bool> {
        if !self.is_enabled() {
            return Ok(true);
        }
        let cap = self.nominal_cap(ctx).await?;
        Ok(candidate_total <= self.thresholds().soft_cap(cap))
    }

    pub async fn is_inside_hard_limit(
        &self,
        candidate_total: u64,
        ctx: &RuleEvalContext<'_>,
    ) -> anyhow::Result<bool> {
        if !self.is_enabled() {
            return Ok(true);
        }
        let cap = self.nominal_cap(ctx).await?;
        Ok(candidate_total <= self.thresholds().hard_cap(cap))
    }
}

impl MaxSizeRule {
    fn thresholds_hard_cap(&self) -> u64 {
        self.quota.thresholds.hard_cap(self.quota.cap_bytes)
    }
}

/// Builds the ordered rule list from configuration, applying history to any
/// configured `Elastic` rule via the supplied [`PinSizeHistory`].
pub fn validate_non_empty(rules: &[QuotaRule]) -> Result<(), RuleError> {
    if rules.is_empty() {
        Err(RuleError::NoRulesConfigured)
    } else {
        Ok(())
    }
}

pub async fn calibrate_all(
    rules: &[QuotaRule],
    history_source: &dyn PinSizeHistory,
    floor: u64,
) -> anyhow::Result<()> {
    let history = history_source.read_history().await?;
    for rule in rules {
        if let QuotaRule::Elastic(r) = rule {
            r.calibrate(&history, floor);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pct(v: u8) -> Percent {
        Percent::new(v).unwrap()
    }

    #[test]
    fn default_margin_tiers_hard_at_the_full_cap() {
        let thresholds = RuleThresholds::default_margin();
        assert_eq!(thresholds.hard_cap(1000), 1000);
        assert_eq!(thresholds.soft_cap(1000), 950);
        assert_eq!(thresholds.target_cap(1000), 900);
    }

    #[test]
    fn max_size_rule_hard_cap_equals_configured_bytes_by_default() {
        let rule = QuotaRule::MaxSize(MaxSizeRule {
            quota: Quota {
                cap_bytes: 100,
                thresholds: RuleThresholds::default_margin(),
            },
        });
        assert_eq!(rule.thresholds().hard_cap(100), 100);
        assert_eq!(rule.thresholds().target_cap(100), 90);
    }

    #[test]
    fn elastic_rule_calibrate_sums_the_recent_window_and_reenables() {
        let rule = ElasticRule::new(10, RuleThresholds::default_margin(), 2);
        rule.disable();
        assert!(!rule.is_enabled());
        rule.calibrate(&[1, 2, 3, 4], 0);
        // window=2 -> most recent two samples: 3, 4 -> 7
        assert_eq!(rule.cap_bytes(), 7);
        assert!(rule.is_enabled());
    }

    #[test]
    fn elastic_rule_calibrate_never_drops_below_floor() {
        let rule = ElasticRule::new(10, RuleThresholds::default_margin(), 5);
        rule.calibrate(&[1, 1], 50);
        assert_eq!(rule.cap_bytes(), 50);
    }

    #[test]
    fn disabled_elastic_rule_is_treated_as_inert() {
        let rule = QuotaRule::Elastic(ElasticRule::new(100, RuleThresholds::default_margin(), 4));
        rule.disable();
        assert!(!rule.exceeds_hard_cap(1_000_000, 100));
    }

    #[test]
    fn validate_non_empty_rejects_zero_rules() {
        assert_eq!(
            validate_non_empty(&[]).unwrap_err(),
            RuleError::NoRulesConfigured
        );
    }

    #[test]
    fn thresholds_new_preserves_given_percents() {
        let thresholds = RuleThresholds::new(pct(50), pct(75), pct(100));
        assert_eq!(thresholds.target_cap(200), 100);
        assert_eq!(thresholds.soft_cap(200), 150);
        assert_eq!(thresholds.hard_cap(200), 200);
    }
}
