//! Byte-quota retention policy.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Quota applied to everything stored in a sandbox.
///
/// Once usage exceeds `max_bytes`, eviction reduces it to
/// `max_bytes * target_ratio` so the next write does not immediately
/// re-trigger a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuotaPolicy {
    /// Hard ceiling on total bytes
    pub max_bytes: u64,
    /// Fraction of `max_bytes` that a sweep reduces usage to
    pub target_ratio: f64,
    /// Entries accessed more recently than this are never evicted
    pub min_idle: Duration,
    /// Whether eviction is enabled
    pub enabled: bool,
}

impl QuotaPolicy {
    /// Create a policy with the given ceiling and default hysteresis (80%).
    pub fn new(max_bytes: u64) -> Self {
        Self {
            max_bytes,
            target_ratio: 0.8,
            min_idle: Duration::from_secs(120),
            enabled: true,
        }
    }

    /// Set the fraction of the quota a sweep reduces usage to.
    ///
    /// Values outside `(0, 1]` are clamped into range.
    pub fn target_ratio(mut self, ratio: f64) -> Self {
        self.target_ratio = if ratio.is_finite() {
            ratio.clamp(f64::EPSILON, 1.0)
        } else {
            1.0
        };
        self
    }

    /// Set the minimum idle time before an entry may be evicted.
    pub fn min_idle(mut self, min_idle: Duration) -> Self {
        self.min_idle = min_idle;
        self
    }

    /// Enable or disable eviction.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// An unlimited policy that never evicts.
    pub fn unlimited() -> Self {
        Self {
            max_bytes: u64::MAX,
            target_ratio: 1.0,
            min_idle: Duration::ZERO,
            enabled: false,
        }
    }

    /// Byte level a sweep aims for.
    pub fn target_bytes(&self) -> u64 {
        (self.max_bytes as f64 * self.target_ratio).floor() as u64
    }

    /// Whether the given usage breaches the hard quota.
    pub fn is_over_quota(&self, total_bytes: u64) -> bool {
        self.enabled && total_bytes > self.max_bytes
    }

    /// Bytes that must be freed to reach the target, or zero when within quota.
    pub fn bytes_to_free(&self, total_bytes: u64) -> u64 {
        if !self.is_over_quota(total_bytes) {
            return 0;
        }
        total_bytes.saturating_sub(self.target_bytes())
    }
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        Self::new(20 * 1024 * 1024 * 1024)
    }
}
