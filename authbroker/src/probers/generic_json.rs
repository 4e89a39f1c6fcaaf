//! A usage prober for endpoints that already speak the `UsageReport` JSON shape
//! directly, memoized through the injected [`crate::cache::UsageCache`].

use crate::cache::UsageCache;
use crate::usage::{ProbeDeps, ProbeParams, UsageProber, UsageReport};
use async_trait::async_trait;

pub struct GenericJsonProber {
    provider: String,
    /// Used when `ProbeParams.base_url` is absent.
    default_endpoint: String,
    cache_ttl_secs: i64,
}

impl GenericJsonProber {
    pub fn new(provider: impl Into<String>, default_endpoint: impl Into<String>) -> Self {
        Self { provider: provider.into(), default_endpoint: default_endpoint.into(), cache_ttl_secs: 60 }
    }

    pub fn with_cache_ttl_secs(mut self, ttl: i64) -> Self {
        self.cache_ttl_secs = ttl;
        self
    }

    fn cache_key(&self, params: &ProbeParams) -> String {
        format!("generic_json:{}:{}", self.provider, params.credential_id)
    }
}

#[async_trait]
impl UsageProber for GenericJsonProber {
    fn provider(&self) -> &str {
        &self.provider
    }

    async fn fetch_usage(&self, params: &ProbeParams, deps: &ProbeDeps) -> Option<UsageReport> {
        let key = self.cache_key(params);
        if let Some(cached) = deps.cache.get(&key).await {
            if let Ok(report) = serde_json::from_str::<UsageReport>(&cached) {
                return Some(report);
            }
        }

        let url = params.base_url.clone().unwrap_or_else(|| self.default_endpoint.clone());
        let mut request = deps.http.get(&url);
        if let Some(api_key) = params.api_key.as_deref() {
            request = request.bearer_auth(api_key);
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!(error = %e, provider = %self.provider, "generic_json probe request failed");
                return None;
            }
        };
        if !response.status().is_success() {
            tracing::debug!(status = %response.status(), provider = %self.provider, "generic_json probe returned non-2xx");
            return None;
        }

        let report: UsageReport = match response.json().await {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!(error = %e, provider = %self.provider, "generic_json probe body did not parse");
                return None;
            }
        };

        if let Ok(serialized) = serde_json::to_string(&report) {
            deps.cache.set(&key, &serialized, deps.now_ms / 1000 + self.cache_ttl_secs).await;
        }

        Some(report)
    }
}
