//! C4 — usage probing contract: the normalized `UsageReport` shape per-provider probes
//! must return, the probe trait itself, and a registry for dispatch by provider id.
//!
//! The HTTP parsing that turns a real vendor's usage endpoint into a `UsageReport` is
//! explicitly out of scope for this core (see spec §1); only the contract lives here.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitStatus {
    Active,
    Exhausted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitUnit {
    Count,
    Tokens,
    Percent,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimitAmount {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used_fraction: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining_fraction: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<LimitUnit>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimitWindow {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_in_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resets_at: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimitScope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageLimit {
    pub id: String,
    pub status: LimitStatus,
    #[serde(default)]
    pub amount: LimitAmount,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<LimitWindow>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<LimitScope>,
}

impl UsageLimit {
    /// Per spec §3: a limit is exhausted iff its status says so, or any of the
    /// fractional/absolute thresholds have been crossed.
    pub fn is_exhausted(&self) -> bool {
        if self.status == LimitStatus::Exhausted {
            return true;
        }
        let a = &self.amount;
        if let Some(f) = a.used_fraction {
            if f >= 1.0 {
                return true;
            }
        }
        if let Some(f) = a.remaining_fraction {
            if f <= 0.0 {
                return true;
            }
        }
        if let (Some(used), Some(limit)) = (a.used, a.limit) {
            if used >= limit {
                return true;
            }
        }
        if let Some(remaining) = a.remaining {
            if remaining <= 0.0 {
                return true;
            }
        }
        if a.unit == Some(LimitUnit::Percent) {
            if let Some(used) = a.used {
                if used >= 100.0 {
                    return true;
                }
            }
        }
        false
    }

    /// `usedFraction`, falling back to derivations from the other amount fields.
    pub fn used_fraction(&self) -> Option<f64> {
        let a = &self.amount;
        if let Some(f) = a.used_fraction {
            return Some(f);
        }
        if let Some(f) = a.remaining_fraction {
            return Some((1.0 - f).max(0.0));
        }
        if let (Some(used), Some(limit)) = (a.used, a.limit) {
            if limit > 0.0 {
                return Some(used / limit);
            }
        }
        if a.unit == Some(LimitUnit::Percent) {
            return a.used.map(|u| u / 100.0);
        }
        None
    }

    /// Milliseconds remaining until this limit's window resets, resolved against `now_ms`
    /// by preferring an absolute `resetsAt` over a relative `resetInMs`.
    pub fn resolved_reset_in_ms(&self, now_ms: i64) -> Option<i64> {
        let w = self.window.as_ref()?;
        if let Some(at) = w.resets_at {
            return Some((at - now_ms).max(0));
        }
        w.reset_in_ms
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageReport {
    pub provider: String,
    /// Milliseconds since epoch.
    pub fetched_at: i64,
    pub limits: Vec<UsageLimit>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl UsageReport {
    pub fn has_exhausted_limit(&self) -> bool {
        self.limits.iter().any(|l| l.is_exhausted())
    }

    pub fn exhausted_limits(&self) -> impl Iterator<Item = &UsageLimit> {
        self.limits.iter().filter(|l| l.is_exhausted())
    }
}

/// Parameters handed to a prober: the credential is a read-only, already-normalized
/// view (never the raw stored row), so probers cannot mutate state directly.
#[derive(Debug, Clone)]
pub struct ProbeParams {
    pub provider: String,
    pub credential_id: i64,
    pub account_id: Option<String>,
    pub email: Option<String>,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
}

/// Dependencies a prober may use; never exposes the broker's internal state.
pub struct ProbeDeps {
    pub cache: Arc<dyn crate::cache::UsageCache>,
    pub http: reqwest::Client,
    pub now_ms: i64,
}

/// A per-provider usage probe. Implementations **must not** throw: on any error, return
/// `Ok(None)` and log at debug through `tracing` (per spec §4.4 / §7).
#[async_trait]
pub trait UsageProber: Send + Sync {
    fn provider(&self) -> &str;

    /// Whether this probe can usefully run for the given params (e.g. account tier gating).
    fn supports(&self, _params: &ProbeParams) -> bool {
        true
    }

    async fn fetch_usage(&self, params: &ProbeParams, deps: &ProbeDeps) -> Option<UsageReport>;
}

#[derive(Default, Clone)]
pub struct ProberRegistry {
    probers: HashMap<String, Arc<dyn UsageProber>>,
}

impl ProberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, prober: Arc<dyn UsageProber>) {
        self.probers.insert(prober.provider().to_string(), prober);
    }

    pub fn get(&self, provider: &str) -> Option<Arc<dyn UsageProber>> {
        self.probers.get(provider).cloned()
    }
}
