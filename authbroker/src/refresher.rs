//! C3 — the OAuth refresher plugin contract (spec §4.3) plus the message-pattern
//! error classifier §7 requires ("definitive" revocation vs "transient" network/5xx).

use crate::credential::OAuthCredential;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

#[async_trait]
pub trait OAuthRefresher: Send + Sync {
    fn provider(&self) -> &str;

    /// Default: the credential needs refresh once its access token has expired.
    fn needs_refresh(&self, credential: &OAuthCredential, now_ms: i64) -> bool {
        credential.is_expired_at(now_ms)
    }

    /// Exchange `credential.refresh` for a fresh token set. Errors must be
    /// classifiable by `classify_refresh_error` (definitive vs transient).
    async fn refresh(&self, credential: &OAuthCredential) -> anyhow::Result<OAuthCredential>;

    /// Extract the value to pass downstream as the API key (usually `credential.access`,
    /// but some providers need a transformed value, e.g. access token + project id).
    fn api_key_from(&self, credential: &OAuthCredential) -> String {
        credential.access.clone()
    }
}

#[derive(Default, Clone)]
pub struct RefresherRegistry {
    refreshers: HashMap<String, Arc<dyn OAuthRefresher>>,
}

impl RefresherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, refresher: Arc<dyn OAuthRefresher>) {
        self.refreshers.insert(refresher.provider().to_string(), refresher);
    }

    pub fn get(&self, provider: &str) -> Option<Arc<dyn OAuthRefresher>> {
        self.refreshers.get(provider).cloned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshFailureKind {
    /// The credential will never succeed again (revoked/invalid token); soft-delete it.
    Definitive,
    /// Retry later (network error, timeout, 5xx); back off for a while.
    Transient,
}

/// Classify a refresh error's message per spec §7. This is deliberately fragile
/// string matching — the spec itself flags it as a candidate for replacement by an
/// explicit `{kind: ok|definitive|transient}` result type from the plugin (§9).
pub fn classify_refresh_error(err: &anyhow::Error) -> RefreshFailureKind {
    let msg = err.to_string().to_lowercase();

    let definitive_markers = [
        "invalid_grant",
        "invalid_token",
        "revoked",
        "unauthorized",
        "expired refresh",
    ];
    let network_markers = ["econnrefused", "fetch failed", "timed out", "timeout", "network error"];

    let looks_definitive = definitive_markers.iter().any(|m| msg.contains(m));
    let looks_network = network_markers.iter().any(|m| msg.contains(m));
    let is_5xx = (500..600).any(|code| msg.contains(&code.to_string()));
    let ambiguous_401_403 = (msg.contains("401") || msg.contains("403")) && looks_network;

    if looks_network || is_5xx || ambiguous_401_403 {
        RefreshFailureKind::Transient
    } else if looks_definitive {
        RefreshFailureKind::Definitive
    } else {
        // Conservative default: an unrecognized failure mode is treated as transient
        // so a flaky classifier never prematurely destroys a credential.
        RefreshFailureKind::Transient
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_grant_is_definitive() {
        let err = anyhow::anyhow!("refresh failed: invalid_grant");
        assert_eq!(classify_refresh_error(&err), RefreshFailureKind::Definitive);
    }

    #[test]
    fn connection_refused_is_transient() {
        let err = anyhow::anyhow!("ECONNREFUSED while contacting token endpoint");
        assert_eq!(classify_refresh_error(&err), RefreshFailureKind::Transient);
    }

    #[test]
    fn five_xx_is_transient() {
        let err = anyhow::anyhow!("token endpoint returned 503");
        assert_eq!(classify_refresh_error(&err), RefreshFailureKind::Transient);
    }

    #[test]
    fn ambiguous_401_with_network_indicator_is_transient() {
        let err = anyhow::anyhow!("401 Unauthorized: fetch failed");
        assert_eq!(classify_refresh_error(&err), RefreshFailureKind::Transient);
    }

    #[test]
    fn unrecognized_message_defaults_transient() {
        let err = anyhow::anyhow!("something weird happened");
        assert_eq!(classify_refresh_error(&err), RefreshFailureKind::Transient);
    }
}
