//! C5 — per-provider ranking policy (spec §4.5), consumed only by the selector (C6).

use crate::usage::{UsageLimit, UsageReport};
use std::collections::HashMap;
use std::sync::Arc;

pub struct WindowLimits<'a> {
    pub primary: Option<&'a UsageLimit>,
    pub secondary: Option<&'a UsageLimit>,
}

pub struct WindowDefaults {
    pub primary_ms: i64,
    pub secondary_ms: i64,
}

pub trait RankingStrategy: Send + Sync {
    fn provider(&self) -> &str;

    /// Identify the limits representing the short-term and longer-term ceiling.
    fn find_window_limits<'a>(&self, report: &'a UsageReport) -> WindowLimits<'a>;

    /// Whether this account is in a preferred state that outranks drain comparisons.
    fn has_priority_boost(&self, primary: Option<&UsageLimit>, report: &UsageReport) -> bool;

    /// Fallback window durations when a report omits `window.durationMs`.
    fn window_defaults(&self) -> WindowDefaults;
}

#[derive(Default, Clone)]
pub struct RankingRegistry {
    strategies: HashMap<String, Arc<dyn RankingStrategy>>,
}

impl RankingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, strategy: Arc<dyn RankingStrategy>) {
        self.strategies.insert(strategy.provider().to_string(), strategy);
    }

    pub fn get(&self, provider: &str) -> Option<Arc<dyn RankingStrategy>> {
        self.strategies.get(provider).cloned()
    }
}

/// `drainRate(limit) = usedFraction / elapsedHours`, spec §4.6.6, where
/// `elapsedMs = clamp(durationMs - resolvedResetInMs, 0, durationMs)`. Falls back to
/// the plain used fraction when elapsed hours are nonpositive or nonfinite.
pub fn drain_rate(limit: &UsageLimit, now_ms: i64, window_default_ms: i64) -> f64 {
    let used_fraction = limit.used_fraction().unwrap_or(0.0);
    let duration_ms = limit
        .window
        .as_ref()
        .and_then(|w| w.duration_ms)
        .unwrap_or(window_default_ms)
        .max(0);
    let reset_in_ms = limit.resolved_reset_in_ms(now_ms).unwrap_or(duration_ms);

    let elapsed_ms = (duration_ms - reset_in_ms).clamp(0, duration_ms);
    let elapsed_hours = elapsed_ms as f64 / 3_600_000.0;

    if elapsed_hours <= 0.0 || !elapsed_hours.is_finite() {
        return used_fraction;
    }
    used_fraction / elapsed_hours
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usage::{LimitAmount, LimitStatus, LimitWindow};

    fn limit(used_fraction: f64, duration_ms: i64, reset_in_ms: i64) -> UsageLimit {
        UsageLimit {
            id: "primary".into(),
            status: LimitStatus::Active,
            amount: LimitAmount { used_fraction: Some(used_fraction), ..Default::default() },
            window: Some(LimitWindow { duration_ms: Some(duration_ms), reset_in_ms: Some(reset_in_ms), resets_at: None }),
            scope: None,
        }
    }

    #[test]
    fn drain_rate_is_used_fraction_per_elapsed_hour() {
        // 18M ms window, 9M ms left => 9M ms (2.5h) elapsed, 0.3 used => 0.12/h
        let l = limit(0.3, 18_000_000, 9_000_000);
        let rate = drain_rate(&l, 0, 18_000_000);
        assert!((rate - 0.12).abs() < 1e-9);
    }

    #[test]
    fn zero_elapsed_falls_back_to_used_fraction() {
        let l = limit(0.5, 18_000_000, 18_000_000); // nothing elapsed yet
        assert_eq!(drain_rate(&l, 0, 18_000_000), 0.5);
    }

    #[test]
    fn no_window_uses_default_duration() {
        let l = UsageLimit {
            id: "x".into(),
            status: LimitStatus::Active,
            amount: LimitAmount { used_fraction: Some(0.4), ..Default::default() },
            window: None,
            scope: None,
        };
        // No window at all => reset_in falls back to duration => elapsed 0 => used_fraction.
        assert_eq!(drain_rate(&l, 0, 18_000_000), 0.4);
    }
}
