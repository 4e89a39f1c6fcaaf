//! Treats whichever two limits match caller-supplied primary/secondary ids as the
//! short-term/long-term window pair, falling back to the shortest and second-shortest
//! `window.durationMs` when a report doesn't carry those ids. A `metadata["tier"] ==
//! "priority"` report outranks drain-rate comparisons entirely.

use crate::ranking::{RankingStrategy, WindowDefaults, WindowLimits};
use crate::usage::{UsageLimit, UsageReport};

pub struct PrimarySecondaryWindowRanking {
    provider: String,
    primary_id: Option<String>,
    secondary_id: Option<String>,
    primary_default_ms: i64,
    secondary_default_ms: i64,
}

impl PrimarySecondaryWindowRanking {
    /// Defaults mirror the "5-hour session window / weekly window" pair spec.md
    /// uses as its running example.
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            primary_id: None,
            secondary_id: None,
            primary_default_ms: 18_000_000,
            secondary_default_ms: 604_800_000,
        }
    }

    pub fn with_window_ids(mut self, primary_id: impl Into<String>, secondary_id: impl Into<String>) -> Self {
        self.primary_id = Some(primary_id.into());
        self.secondary_id = Some(secondary_id.into());
        self
    }

    pub fn with_default_durations_ms(mut self, primary_ms: i64, secondary_ms: i64) -> Self {
        self.primary_default_ms = primary_ms;
        self.secondary_default_ms = secondary_ms;
        self
    }
}

fn duration_ms(limit: &UsageLimit) -> Option<i64> {
    limit.window.as_ref().and_then(|w| w.duration_ms)
}

fn shortest_window<'a>(limits: &'a [UsageLimit], exclude_id: Option<&str>) -> Option<&'a UsageLimit> {
    limits
        .iter()
        .filter(|l| Some(l.id.as_str()) != exclude_id)
        .filter(|l| duration_ms(l).is_some())
        .min_by_key(|l| duration_ms(l).unwrap())
}

impl RankingStrategy for PrimarySecondaryWindowRanking {
    fn provider(&self) -> &str {
        &self.provider
    }

    fn find_window_limits<'a>(&self, report: &'a UsageReport) -> WindowLimits<'a> {
        let primary = self
            .primary_id
            .as_deref()
            .and_then(|id| report.limits.iter().find(|l| l.id == id))
            .or_else(|| shortest_window(&report.limits, None));

        let secondary = self
            .secondary_id
            .as_deref()
            .and_then(|id| report.limits.iter().find(|l| l.id == id))
            .or_else(|| shortest_window(&report.limits, primary.map(|l| l.id.as_str())));

        WindowLimits { primary, secondary }
    }

    fn has_priority_boost(&self, _primary: Option<&UsageLimit>, report: &UsageReport) -> bool {
        report.metadata.get("tier").map(|t| t == "priority").unwrap_or(false)
    }

    fn window_defaults(&self) -> WindowDefaults {
        WindowDefaults { primary_ms: self.primary_default_ms, secondary_ms: self.secondary_default_ms }
    }
}
