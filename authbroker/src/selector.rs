//! C6 — the credential selector: the in-memory orchestrator that ties the store (C1),
//! identity extraction (C2), refreshers (C3), probers (C4), and ranking (C5) together
//! behind the caller-facing API in spec §6.

use crate::cache::UsageCache;
use crate::credential::{ApiKeyCredential, Credential, CredentialType, OAuthCredential, StoredCredential};
use crate::env::{self, EnvLookup, ProcessEnv};
use crate::error::AuthBrokerError;
use crate::fnv::fnv1a_32;
use crate::identity;
use crate::ranking::{drain_rate, RankingRegistry, RankingStrategy, WindowDefaults};
use crate::refresher::{classify_refresh_error, OAuthRefresher, RefresherRegistry, RefreshFailureKind};
use crate::resolver::{ConfigValueResolver, DefaultConfigValueResolver};
use crate::store::CredentialStore;
use crate::usage::{ProbeDeps, ProbeParams, ProberRegistry, UsageReport};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

/// A 5-minute backoff applied to a credential after a transient refresh failure (spec §7).
const TRANSIENT_REFRESH_BACKOFF_MS: i64 = 5 * 60 * 1000;
/// Default backoff window when `markUsageLimitReached` has no probe data and no caller hint.
const DEFAULT_USAGE_BACKOFF_MS: i64 = 60_000;
/// Providers whose re-login replaces the whole set instead of appending (spec §6).
const REPLACE_ON_RELOGIN: &[&str] = &["minimax-code", "minimax-code-cn"];
/// Bound on definitive-failure retry loops inside a single `getApiKey` call; each retry
/// strictly shrinks the provider's set, so this is a safety net rather than a real limit.
const MAX_SELECTION_ATTEMPTS: usize = 16;

#[async_trait]
pub trait FallbackResolver: Send + Sync {
    async fn resolve(&self, provider: &str) -> Option<String>;
}

#[derive(Default, Clone)]
pub struct GetApiKeyOpts {
    pub base_url: Option<String>,
}

#[derive(Default, Clone)]
pub struct MarkUsageLimitOpts {
    pub retry_after_ms: Option<i64>,
    pub base_url: Option<String>,
}

#[derive(Default, Clone)]
pub struct FetchUsageReportsOpts {
    pub base_url_resolver: Option<Arc<dyn Fn(&str) -> Option<String> + Send + Sync>>,
}

pub enum LoginResult {
    OAuth(Vec<OAuthCredential>),
    ApiKey(String),
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BrokerSnapshot {
    pub store_path: PathBuf,
    pub runtime_overrides: HashMap<String, String>,
    pub credentials: HashMap<String, Vec<StoredCredential>>,
}

#[derive(Default)]
struct SelectorState {
    sets: HashMap<String, Vec<StoredCredential>>,
    backoff: HashMap<(String, CredentialType), HashMap<i64, i64>>,
    sessions: HashMap<String, HashMap<String, (CredentialType, i64)>>,
    round_robin: HashMap<(String, CredentialType), i64>,
}

struct Inner {
    store: CredentialStore,
    refreshers: RefresherRegistry,
    probers: ProberRegistry,
    rankings: RankingRegistry,
    config_resolver: Arc<dyn ConfigValueResolver>,
    env: Arc<dyn EnvLookup>,
    cache: Arc<dyn UsageCache>,
    http: reqwest::Client,
    clock: Arc<dyn Fn() -> i64 + Send + Sync>,
    fallback: Mutex<Option<Arc<dyn FallbackResolver>>>,
    runtime_overrides: Mutex<HashMap<String, String>>,
    state: Mutex<SelectorState>,
}

/// The credential selector. Cheap to clone — clones share the same in-memory state and
/// store handle, mirroring how the teacher's `AiClient` shares its provider map.
#[derive(Clone)]
pub struct CredentialBroker {
    inner: Arc<Inner>,
}

pub struct CredentialBrokerBuilder {
    store: Option<CredentialStore>,
    refreshers: RefresherRegistry,
    probers: ProberRegistry,
    rankings: RankingRegistry,
    config_resolver: Option<Arc<dyn ConfigValueResolver>>,
    env: Option<Arc<dyn EnvLookup>>,
    cache: Option<Arc<dyn UsageCache>>,
    http: Option<reqwest::Client>,
    clock: Option<Arc<dyn Fn() -> i64 + Send + Sync>>,
}

impl CredentialBroker {
    pub fn builder() -> CredentialBrokerBuilder {
        CredentialBrokerBuilder::new()
    }

    fn now(&self) -> i64 {
        (self.inner.clock)()
    }

    // ---- reload / dedup (spec §4.6.1, §4.6.2) -------------------------------------

    pub async fn reload(&self) {
        let rows = self.inner.store.list_auth_credentials(None).await;
        let mut by_provider: HashMap<String, Vec<StoredCredential>> = HashMap::new();
        for row in rows {
            by_provider.entry(row.provider.clone()).or_default().push(row);
        }

        let mut new_sets = HashMap::new();
        let mut dropped_ids = Vec::new();
        for (provider, rows) in by_provider {
            let (kept, dropped) = dedupe_provider_rows(&provider, rows);
            dropped_ids.extend(dropped);
            new_sets.insert(provider, kept);
        }
        for id in &dropped_ids {
            self.inner.store.delete_auth_credential(*id).await;
        }

        let mut state = self.inner.state.lock().await;
        let mut changed: Vec<String> = new_sets
            .iter()
            .filter(|(p, rows)| state.sets.get(*p).map(|old| !same_ids(old, rows)).unwrap_or(true))
            .map(|(p, _)| p.clone())
            .collect();
        changed.extend(state.sets.keys().filter(|p| !new_sets.contains_key(*p)).cloned());

        for provider in &changed {
            state.sessions.remove(provider);
            for kind in [CredentialType::ApiKey, CredentialType::OAuth] {
                state.round_robin.remove(&(provider.clone(), kind));
                state.backoff.remove(&(provider.clone(), kind));
            }
        }
        state.sets = new_sets;
    }

    // ---- store-backed mutation passthroughs ---------------------------------------

    pub async fn set(&self, provider: &str, credentials: Vec<Credential>) {
        self.inner.store.replace_for_provider(provider, &credentials).await;
        self.reload().await;
    }

    pub async fn remove(&self, provider: &str) {
        self.inner.store.delete_auth_credentials_for_provider(provider).await;
        self.reload().await;
    }

    pub async fn list(&self) -> Vec<String> {
        let state = self.inner.state.lock().await;
        let mut providers: Vec<String> =
            state.sets.iter().filter(|(_, rows)| !rows.is_empty()).map(|(p, _)| p.clone()).collect();
        providers.sort();
        providers
    }

    pub async fn has(&self, provider: &str) -> bool {
        if self.inner.runtime_overrides.lock().await.contains_key(provider) {
            return true;
        }
        self.has_auth(provider).await
    }

    pub async fn has_auth(&self, provider: &str) -> bool {
        self.inner.state.lock().await.sets.get(provider).map(|s| !s.is_empty()).unwrap_or(false)
    }

    pub async fn has_oauth(&self, provider: &str) -> bool {
        self.inner
            .state
            .lock()
            .await
            .sets
            .get(provider)
            .map(|s| s.iter().any(|c| c.kind() == CredentialType::OAuth))
            .unwrap_or(false)
    }

    // ---- runtime overrides & fallback (spec §4.6.3) -------------------------------

    pub async fn set_runtime_api_key(&self, provider: &str, key: &str) {
        self.inner.runtime_overrides.lock().await.insert(provider.to_string(), key.to_string());
    }

    pub async fn remove_runtime_api_key(&self, provider: &str) {
        self.inner.runtime_overrides.lock().await.remove(provider);
    }

    pub async fn set_fallback_resolver(&self, resolver: Arc<dyn FallbackResolver>) {
        *self.inner.fallback.lock().await = Some(resolver);
    }

    // ---- login/logout (spec §6; the actual login UX is out of scope) -------------

    pub async fn apply_login_result(&self, provider: &str, result: LoginResult) {
        let incoming: Vec<Credential> = match result {
            LoginResult::OAuth(creds) => creds.into_iter().map(Credential::OAuth).collect(),
            LoginResult::ApiKey(key) => vec![Credential::ApiKey(ApiKeyCredential { key })],
        };

        if REPLACE_ON_RELOGIN.contains(&provider) {
            self.inner.store.replace_for_provider(provider, &incoming).await;
        } else {
            let mut existing: Vec<Credential> = self
                .inner
                .store
                .list_auth_credentials(Some(provider))
                .await
                .into_iter()
                .map(|r| r.credential)
                .collect();
            existing.extend(incoming);
            self.inner.store.replace_for_provider(provider, &existing).await;
        }
        self.reload().await;
    }

    pub async fn logout(&self, provider: &str) {
        self.remove(provider).await;
    }

    // ---- snapshot for sub-workers (spec §6 last bullet) ---------------------------

    pub async fn snapshot(&self) -> BrokerSnapshot {
        BrokerSnapshot {
            store_path: self.inner.store.path().to_path_buf(),
            runtime_overrides: self.inner.runtime_overrides.lock().await.clone(),
            credentials: self.inner.state.lock().await.sets.clone(),
        }
    }

    /// Sub-workers reopen the store fresh and call `reload()`; only runtime overrides
    /// need explicit replay since they are process-local and never persisted.
    pub async fn restore_runtime_overrides(&self, snapshot: &BrokerSnapshot) {
        *self.inner.runtime_overrides.lock().await = snapshot.runtime_overrides.clone();
    }

    // ---- getApiKey / peekApiKey (spec §4.6.4) -------------------------------------

    pub async fn get_api_key(&self, provider: &str, session_id: Option<&str>, opts: GetApiKeyOpts) -> Option<String> {
        if let Some(key) = self.inner.runtime_overrides.lock().await.get(provider).cloned() {
            return Some(key);
        }

        for _ in 0..MAX_SELECTION_ATTEMPTS {
            let set = { self.inner.state.lock().await.sets.get(provider).cloned().unwrap_or_default() };
            if set.is_empty() {
                break;
            }

            if let Some(key) = self.select_api_key(provider, &set, session_id).await {
                return Some(key);
            }

            match self.select_oauth(provider, &set, session_id, &opts).await {
                OauthOutcome::Key(key) => return Some(key),
                OauthOutcome::RetryFromScratch => continue,
                OauthOutcome::NoneAvailable => break,
            }
        }

        if let Some(value) = env::lookup(self.inner.env.as_ref(), provider) {
            return Some(value);
        }

        let fallback = self.inner.fallback.lock().await.clone();
        if let Some(resolver) = fallback {
            if let Some(value) = resolver.resolve(provider).await {
                return Some(value);
            }
        }

        None
    }

    /// Like `getApiKey` but never refreshes an expired OAuth token and performs no
    /// selection bookkeeping (no round-robin advance, no session recording).
    pub async fn peek_api_key(&self, provider: &str) -> Option<String> {
        if let Some(key) = self.inner.runtime_overrides.lock().await.get(provider).cloned() {
            return Some(key);
        }

        let now = self.now();
        let set = { self.inner.state.lock().await.sets.get(provider).cloned().unwrap_or_default() };

        for cred in &set {
            if let Credential::ApiKey(a) = &cred.credential {
                if let Some(value) = self.inner.config_resolver.resolve(&a.key).await {
                    return Some(value);
                }
            }
        }
        for cred in &set {
            if let Credential::OAuth(o) = &cred.credential {
                if o.expires > now {
                    return Some(o.access.clone());
                }
            }
        }

        env::lookup(self.inner.env.as_ref(), provider)
    }

    async fn select_api_key(&self, provider: &str, set: &[StoredCredential], session_id: Option<&str>) -> Option<String> {
        let candidates: Vec<&StoredCredential> = set.iter().filter(|c| c.kind() == CredentialType::ApiKey).collect();
        if candidates.is_empty() {
            return None;
        }
        let chosen = self.pick_plain(provider, CredentialType::ApiKey, &candidates, session_id).await?;
        let raw = chosen.credential.as_api_key()?.key.clone();
        let resolved = self.inner.config_resolver.resolve(&raw).await?;
        self.record_session(provider, session_id, CredentialType::ApiKey, chosen.id).await;
        Some(resolved)
    }

    // ---- §4.6.5 plain selection, shared by api_key and the no-ranking OAuth path --

    async fn pick_plain(
        &self,
        provider: &str,
        kind: CredentialType,
        candidates: &[&StoredCredential],
        session_id: Option<&str>,
    ) -> Option<StoredCredential> {
        let n = candidates.len();
        if n == 0 {
            return None;
        }
        if n == 1 {
            return Some(candidates[0].clone());
        }

        let now = self.now();
        let mut state = self.inner.state.lock().await;

        if let Some(sid) = session_id {
            let stuck = state.sessions.get(provider).and_then(|m| m.get(sid)).copied();
            if let Some((stuck_kind, stuck_id)) = stuck {
                if stuck_kind == kind {
                    if let Some(cand) = candidates.iter().find(|c| c.id == stuck_id) {
                        if !is_blocked(&mut state, provider, kind, stuck_id, now) {
                            return Some((*cand).clone());
                        }
                    }
                }
            }
        }

        let start = match session_id {
            Some(sid) => (fnv1a_32(sid) as usize) % n,
            None => {
                let counter = state.round_robin.entry((provider.to_string(), kind)).or_insert(-1);
                *counter = counter.wrapping_add(1);
                counter.rem_euclid(n as i64) as usize
            }
        };

        for offset in 0..n {
            let idx = (start + offset) % n;
            if !is_blocked(&mut state, provider, kind, candidates[idx].id, now) {
                return Some(candidates[idx].clone());
            }
        }
        Some(candidates[start].clone())
    }

    async fn record_session(&self, provider: &str, session_id: Option<&str>, kind: CredentialType, id: i64) {
        if let Some(sid) = session_id {
            let mut state = self.inner.state.lock().await;
            state.sessions.entry(provider.to_string()).or_default().insert(sid.to_string(), (kind, id));
        }
    }

    async fn mark_blocked(&self, provider: &str, kind: CredentialType, id: i64, until: i64) {
        let mut state = self.inner.state.lock().await;
        let slot = state.backoff.entry((provider.to_string(), kind)).or_default().entry(id).or_insert(until);
        *slot = (*slot).max(until);
    }

    // ---- §4.6.6 OAuth selection with usage-aware ranking --------------------------

    async fn select_oauth(
        &self,
        provider: &str,
        set: &[StoredCredential],
        session_id: Option<&str>,
        opts: &GetApiKeyOpts,
    ) -> OauthOutcome {
        let candidates: Vec<StoredCredential> =
            set.iter().filter(|c| c.kind() == CredentialType::OAuth).cloned().collect();
        if candidates.is_empty() {
            return OauthOutcome::NoneAvailable;
        }

        let ranking = self.inner.rankings.get(provider);
        let use_ranking = ranking.as_ref().is_some() && candidates.len() > 1;

        if !use_ranking {
            let refs: Vec<&StoredCredential> = candidates.iter().collect();
            let Some(chosen) = self.pick_plain(provider, CredentialType::OAuth, &refs, session_id).await else {
                return OauthOutcome::NoneAvailable;
            };
            return self.refresh_and_finish(provider, chosen, session_id, false, true).await;
        }
        let ranking = ranking.unwrap();
        let now = self.now();

        // Session stickiness takes priority over a fresh ranking pass, same as §4.6.5.
        if let Some(sid) = session_id {
            let stuck = {
                let mut state = self.inner.state.lock().await;
                state
                    .sessions
                    .get(provider)
                    .and_then(|m| m.get(sid))
                    .copied()
                    .filter(|(k, _)| *k == CredentialType::OAuth)
                    .filter(|(_, id)| !is_blocked(&mut state, provider, CredentialType::OAuth, *id, now))
            };
            if let Some((_, id)) = stuck {
                if let Some(cred) = candidates.iter().find(|c| c.id == id).cloned() {
                    let outcome = self.refresh_and_finish(provider, cred, session_id, true, false).await;
                    if !matches!(outcome, OauthOutcome::NoneAvailable) {
                        return outcome;
                    }
                }
            }
        }

        let n = candidates.len();
        let start = {
            match session_id {
                Some(sid) => (fnv1a_32(sid) as usize) % n,
                None => {
                    let mut state = self.inner.state.lock().await;
                    let counter = state.round_robin.entry((provider.to_string(), CredentialType::OAuth)).or_insert(-1);
                    *counter = counter.wrapping_add(1);
                    counter.rem_euclid(n as i64) as usize
                }
            }
        };
        let order: Vec<usize> = (0..n).map(|o| (start + o) % n).collect();

        let prober = self.inner.probers.get(provider);
        let mut probe_futs = Vec::with_capacity(n);
        for &idx in &order {
            let cand = candidates[idx].clone();
            let provider_s = provider.to_string();
            let already_blocked = {
                let mut state = self.inner.state.lock().await;
                is_blocked(&mut state, provider, CredentialType::OAuth, cand.id, now)
            };
            let prober = prober.clone();
            let cache = self.inner.cache.clone();
            let http = self.inner.http.clone();
            let base_url = opts.base_url.clone();
            probe_futs.push(async move {
                if already_blocked {
                    return (cand, None, true);
                }
                let Some(prober) = prober else { return (cand, None, false) };
                let oauth = cand.credential.as_oauth();
                let params = ProbeParams {
                    provider: provider_s,
                    credential_id: cand.id,
                    account_id: oauth.and_then(|o| o.account_id.clone()),
                    email: oauth.and_then(|o| o.email.clone()),
                    api_key: None,
                    base_url,
                };
                if !prober.supports(&params) {
                    return (cand, None, false);
                }
                let deps = ProbeDeps { cache, http, now_ms: now };
                let report = prober.fetch_usage(&params, &deps).await;
                (cand, report, false)
            });
        }
        let probed = futures::future::join_all(probe_futs).await;

        let mut entries = Vec::with_capacity(n);
        for (cand, report, was_already_blocked) in probed {
            let mut blocked = was_already_blocked;
            let mut blocked_until = None;
            if !blocked {
                if let Some(ref r) = report {
                    if r.has_exhausted_limit() {
                        let until = compute_blocked_until(r, now);
                        self.mark_blocked(provider, CredentialType::OAuth, cand.id, until).await;
                        blocked = true;
                        blocked_until = Some(until);
                    }
                }
            } else {
                let state = self.inner.state.lock().await;
                blocked_until = state
                    .backoff
                    .get(&(provider.to_string(), CredentialType::OAuth))
                    .and_then(|m| m.get(&cand.id))
                    .copied();
            }
            entries.push(RankedCandidate { cred: cand, report, blocked, blocked_until });
        }

        let defaults = ranking.window_defaults();
        let orig_index: HashMap<i64, usize> = candidates.iter().enumerate().map(|(i, c)| (c.id, i)).collect();
        entries.sort_by(|a, b| compare_candidates(a, b, ranking.as_ref(), &defaults, now, &orig_index));

        for entry in &entries {
            if entry.blocked {
                continue;
            }
            match self.refresh_and_finish(provider, entry.cred.clone(), session_id, true, true).await {
                OauthOutcome::NoneAvailable => continue,
                other => return other,
            }
        }

        // All candidates blocked: try the first of the sorted order anyway (soonest to
        // unblock), skipping the pre-check, so the caller at least gets a key to retry with.
        if let Some(first) = entries.first() {
            let fallback = first.cred.clone();
            return self.refresh_and_finish(provider, fallback, session_id, true, true).await;
        }
        OauthOutcome::NoneAvailable
    }

    /// §4.6.7: refresh (if needed), persist, optionally re-probe on account change, and
    /// record session stickiness. `pre_checked` means a usage check already ran for this
    /// candidate this call (during the §4.6.6 fan-out or via session stickiness reuse).
    async fn refresh_and_finish(
        &self,
        provider: &str,
        cred: StoredCredential,
        session_id: Option<&str>,
        ranking_active: bool,
        pre_checked: bool,
    ) -> OauthOutcome {
        let now = self.now();

        if ranking_active && !pre_checked {
            if let Some(blocked) = self.precheck_usage(provider, &cred, now, None).await {
                if blocked {
                    return OauthOutcome::NoneAvailable;
                }
            }
        }

        let Some(oauth) = cred.credential.as_oauth().cloned() else {
            return OauthOutcome::NoneAvailable;
        };
        let refresher = self.inner.refreshers.get(provider);

        let refreshed = if refresher.as_ref().map(|r| r.needs_refresh(&oauth, now)).unwrap_or(false) {
            let Some(refresher) = refresher.clone() else {
                return OauthOutcome::NoneAvailable;
            };
            match refresher.refresh(&oauth).await {
                Ok(fresh) => fresh,
                Err(err) => return self.handle_refresh_error(provider, &cred, err).await,
            }
        } else {
            oauth.clone()
        };

        let api_key = refresher.as_ref().map(|r| r.api_key_from(&refreshed)).unwrap_or_else(|| refreshed.access.clone());

        let merged = merge_oauth(&oauth, &refreshed);
        self.inner.store.update_auth_credential(cred.id, &Credential::OAuth(merged.clone())).await;
        {
            let mut state = self.inner.state.lock().await;
            if let Some(set) = state.sets.get_mut(provider) {
                if let Some(row) = set.iter_mut().find(|r| r.id == cred.id) {
                    row.credential = Credential::OAuth(merged.clone());
                }
            }
        }

        if ranking_active && merged.account_id != oauth.account_id {
            if let Some(blocked) = self.precheck_usage(provider, &cred, now, Some(&merged)).await {
                if blocked {
                    return OauthOutcome::NoneAvailable;
                }
            }
        }

        self.record_session(provider, session_id, CredentialType::OAuth, cred.id).await;
        OauthOutcome::Key(api_key)
    }

    /// Runs a usage probe for `cred` (using `override_oauth` in place of its stored
    /// credential fields if given) and marks it blocked if exhausted. `None` means no
    /// prober is registered or it doesn't support these params — caller treats as clear.
    async fn precheck_usage(
        &self,
        provider: &str,
        cred: &StoredCredential,
        now: i64,
        override_oauth: Option<&OAuthCredential>,
    ) -> Option<bool> {
        let prober = self.inner.probers.get(provider)?;
        let oauth = override_oauth.or_else(|| cred.credential.as_oauth());
        let params = ProbeParams {
            provider: provider.to_string(),
            credential_id: cred.id,
            account_id: oauth.and_then(|o| o.account_id.clone()),
            email: oauth.and_then(|o| o.email.clone()),
            api_key: None,
            base_url: None,
        };
        if !prober.supports(&params) {
            return None;
        }
        let deps = ProbeDeps { cache: self.inner.cache.clone(), http: self.inner.http.clone(), now_ms: now };
        let report = prober.fetch_usage(&params, &deps).await?;
        if report.has_exhausted_limit() {
            let until = compute_blocked_until(&report, now);
            self.mark_blocked(provider, CredentialType::OAuth, cred.id, until).await;
            return Some(true);
        }
        Some(false)
    }

    async fn handle_refresh_error(&self, provider: &str, cred: &StoredCredential, err: anyhow::Error) -> OauthOutcome {
        match classify_refresh_error(&err) {
            RefreshFailureKind::Definitive => {
                tracing::warn!(provider, credential_id = cred.id, error = %err, "definitive oauth refresh failure");
                self.inner.store.delete_auth_credential(cred.id).await;
                let mut state = self.inner.state.lock().await;
                if let Some(set) = state.sets.get_mut(provider) {
                    set.retain(|r| r.id != cred.id);
                }
                if let Some(sessions) = state.sessions.get_mut(provider) {
                    sessions.retain(|_, v| v.1 != cred.id);
                }
                OauthOutcome::RetryFromScratch
            }
            RefreshFailureKind::Transient => {
                tracing::debug!(provider, credential_id = cred.id, error = %err, "transient oauth refresh failure");
                self.mark_blocked(provider, CredentialType::OAuth, cred.id, self.now() + TRANSIENT_REFRESH_BACKOFF_MS).await;
                OauthOutcome::NoneAvailable
            }
        }
    }

    // ---- markUsageLimitReached (spec §4.6.8) --------------------------------------

    pub async fn mark_usage_limit_reached(&self, provider: &str, session_id: Option<&str>, opts: MarkUsageLimitOpts) -> bool {
        let now = self.now();
        let target = {
            let state = self.inner.state.lock().await;
            session_id.and_then(|sid| state.sessions.get(provider).and_then(|m| m.get(sid)).copied())
        };

        let Some((kind, id)) = target else {
            // Nothing was ever selected for this session; there is no credential to mark.
            return false;
        };

        let mut blocked_until = now + opts.retry_after_ms.unwrap_or(DEFAULT_USAGE_BACKOFF_MS);

        if kind == CredentialType::OAuth {
            if let Some(prober) = self.inner.probers.get(provider) {
                let set = self.inner.state.lock().await.sets.get(provider).cloned().unwrap_or_default();
                if let Some(cred) = set.iter().find(|c| c.id == id) {
                    if let Some(oauth) = cred.credential.as_oauth() {
                        let params = ProbeParams {
                            provider: provider.to_string(),
                            credential_id: id,
                            account_id: oauth.account_id.clone(),
                            email: oauth.email.clone(),
                            api_key: None,
                            base_url: opts.base_url.clone(),
                        };
                        if prober.supports(&params) {
                            let deps = ProbeDeps { cache: self.inner.cache.clone(), http: self.inner.http.clone(), now_ms: now };
                            if let Some(report) = prober.fetch_usage(&params, &deps).await {
                                if let Some(at) = report.exhausted_limits().filter_map(|l| l.window.as_ref()?.resets_at).min() {
                                    // The source takes the max of the caller's hint and the
                                    // probe's resetsAt (spec §9 open question).
                                    blocked_until = blocked_until.max(at);
                                }
                            }
                        }
                    }
                }
            }
        }

        self.mark_blocked(provider, kind, id, blocked_until).await;
        self.any_unblocked_of_kind(provider, kind, id).await
    }

    async fn any_unblocked_of_kind(&self, provider: &str, kind: CredentialType, exclude_id: i64) -> bool {
        let now = self.now();
        let set = { self.inner.state.lock().await.sets.get(provider).cloned().unwrap_or_default() };
        let mut state = self.inner.state.lock().await;
        set.iter()
            .filter(|c| c.kind() == kind && c.id != exclude_id)
            .any(|c| !is_blocked(&mut state, provider, kind, c.id, now))
    }

    // ---- fetchUsageReports (spec §4.6.9) ------------------------------------------

    pub async fn fetch_usage_reports(&self, opts: FetchUsageReportsOpts) -> Option<Vec<UsageReport>> {
        let now = self.now();
        let sets = self.inner.state.lock().await.sets.clone();
        let mut raw = Vec::new();

        for (provider, creds) in &sets {
            let Some(prober) = self.inner.probers.get(provider) else { continue };
            for cred in creds {
                let oauth = cred.credential.as_oauth();
                let api_key = match &cred.credential {
                    Credential::ApiKey(a) => self.inner.config_resolver.resolve(&a.key).await,
                    Credential::OAuth(o) => Some(o.access.clone()),
                };
                let base_url = opts.base_url_resolver.as_ref().and_then(|f| f(provider));
                let params = ProbeParams {
                    provider: provider.clone(),
                    credential_id: cred.id,
                    account_id: oauth.and_then(|o| o.account_id.clone()),
                    email: oauth.and_then(|o| o.email.clone()),
                    api_key,
                    base_url,
                };
                if !prober.supports(&params) {
                    continue;
                }
                let deps = ProbeDeps { cache: self.inner.cache.clone(), http: self.inner.http.clone(), now_ms: now };
                if let Some(report) = prober.fetch_usage(&params, &deps).await {
                    raw.push(report);
                }
            }
        }

        if raw.is_empty() {
            return None;
        }
        Some(merge_usage_reports(raw))
    }
}

impl CredentialBrokerBuilder {
    fn new() -> Self {
        Self {
            store: None,
            refreshers: RefresherRegistry::new(),
            probers: ProberRegistry::new(),
            rankings: RankingRegistry::new(),
            config_resolver: None,
            env: None,
            cache: None,
            http: None,
            clock: None,
        }
    }

    pub fn store(mut self, store: CredentialStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn refresher(mut self, refresher: Arc<dyn OAuthRefresher>) -> Self {
        self.refreshers.register(refresher);
        self
    }

    pub fn prober(mut self, prober: Arc<dyn crate::usage::UsageProber>) -> Self {
        self.probers.register(prober);
        self
    }

    pub fn ranking(mut self, ranking: Arc<dyn RankingStrategy>) -> Self {
        self.rankings.register(ranking);
        self
    }

    pub fn config_resolver(mut self, resolver: Arc<dyn ConfigValueResolver>) -> Self {
        self.config_resolver = Some(resolver);
        self
    }

    pub fn env(mut self, env: Arc<dyn EnvLookup>) -> Self {
        self.env = Some(env);
        self
    }

    pub fn cache(mut self, cache: Arc<dyn UsageCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn http_client(mut self, client: reqwest::Client) -> Self {
        self.http = Some(client);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Fn() -> i64 + Send + Sync>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> Result<CredentialBroker, AuthBrokerError> {
        let store = self.store.ok_or_else(|| AuthBrokerError::InvalidConfig("store is required".into()))?;
        let cache = self.cache.unwrap_or_else(|| Arc::new(store.clone()) as Arc<dyn UsageCache>);

        let inner = Inner {
            store,
            refreshers: self.refreshers,
            probers: self.probers,
            rankings: self.rankings,
            config_resolver: self.config_resolver.unwrap_or_else(|| Arc::new(DefaultConfigValueResolver)),
            env: self.env.unwrap_or_else(|| Arc::new(ProcessEnv)),
            cache,
            http: self.http.unwrap_or_default(),
            clock: self.clock.unwrap_or_else(|| Arc::new(|| chrono::Utc::now().timestamp_millis())),
            fallback: Mutex::new(None),
            runtime_overrides: Mutex::new(HashMap::new()),
            state: Mutex::new(SelectorState::default()),
        };
        Ok(CredentialBroker { inner: Arc::new(inner) })
    }
}

/// Caller-facing config for the common case: open (or create) the SQLite store at
/// `store_path` and build a broker with default collaborators. Providers that need
/// refreshers/probers/rankings/a fallback resolver still register them via
/// [`CredentialBroker::builder`] after construction — this is the zero-config path,
/// mirroring `ConfigManager::new`/`default_path` in the reference toolkit.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub store_path: PathBuf,
}

impl BrokerConfig {
    pub fn new(store_path: impl Into<PathBuf>) -> Self {
        Self { store_path: store_path.into() }
    }

    /// `~/.authbroker/credentials.db`.
    pub fn default_path() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self::new(home.join(".authbroker").join("credentials.db"))
    }
}

impl CredentialBroker {
    /// Open the store at `config.store_path` and build a broker with every default
    /// collaborator (no refreshers/probers/rankings registered yet). Call `reload()`
    /// once plugins are registered to load the initial credential sets.
    pub fn open(config: BrokerConfig) -> Result<Self, AuthBrokerError> {
        let store = CredentialStore::open(&config.store_path)?;
        Self::builder().store(store).build()
    }
}

enum OauthOutcome {
    Key(String),
    RetryFromScratch,
    NoneAvailable,
}

struct RankedCandidate {
    cred: StoredCredential,
    report: Option<UsageReport>,
    blocked: bool,
    blocked_until: Option<i64>,
}

fn is_blocked(state: &mut SelectorState, provider: &str, kind: CredentialType, id: i64, now: i64) -> bool {
    let key = (provider.to_string(), kind);
    if let Some(map) = state.backoff.get_mut(&key) {
        if let Some(&until) = map.get(&id) {
            if until > now {
                return true;
            }
            map.remove(&id);
        }
    }
    false
}

fn same_ids(old: &[StoredCredential], new: &[StoredCredential]) -> bool {
    old.len() == new.len() && old.iter().zip(new.iter()).all(|(a, b)| a.id == b.id)
}

fn dedupe_provider_rows(provider: &str, rows: Vec<StoredCredential>) -> (Vec<StoredCredential>, Vec<i64>) {
    let restrict = identity::email_only_dedup(provider);
    let mut claimed: HashSet<String> = HashSet::new();
    let mut kept_rev = Vec::new();
    let mut dropped = Vec::new();

    for row in rows.into_iter().rev() {
        match &row.credential {
            Credential::OAuth(oauth) => {
                let ids = identity::identifiers_for(oauth, restrict);
                if !ids.is_empty() && ids.iter().any(|id| claimed.contains(id)) {
                    dropped.push(row.id);
                    continue;
                }
                claimed.extend(ids);
                kept_rev.push(row);
            }
            Credential::ApiKey(_) => kept_rev.push(row),
        }
    }
    kept_rev.reverse();
    (kept_rev, dropped)
}

fn merge_oauth(old: &OAuthCredential, fresh: &OAuthCredential) -> OAuthCredential {
    let mut merged = fresh.clone();
    if merged.account_id.is_none() {
        merged.account_id = old.account_id.clone();
    }
    if merged.email.is_none() {
        merged.email = old.email.clone();
    }
    if merged.project_id.is_none() {
        merged.project_id = old.project_id.clone();
    }
    if merged.enterprise_url.is_none() {
        merged.enterprise_url = old.enterprise_url.clone();
    }
    for (k, v) in &old.extra {
        merged.extra.entry(k.clone()).or_insert_with(|| v.clone());
    }
    merged
}

fn compute_blocked_until(report: &UsageReport, now: i64) -> i64 {
    let earliest = report
        .exhausted_limits()
        .filter_map(|l| {
            let w = l.window.as_ref()?;
            w.resets_at.or_else(|| w.reset_in_ms.map(|r| now + r))
        })
        .filter(|&t| t > now)
        .min();
    earliest.unwrap_or(now + DEFAULT_USAGE_BACKOFF_MS)
}

fn cmp_optional_f64(a: Option<f64>, b: Option<f64>) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Some(x), Some(y)) => Some(x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal)),
        _ => None,
    }
}

fn compare_candidates(
    a: &RankedCandidate,
    b: &RankedCandidate,
    ranking: &dyn RankingStrategy,
    defaults: &WindowDefaults,
    now: i64,
    orig_index: &HashMap<i64, usize>,
) -> std::cmp::Ordering {
    use std::cmp::Ordering;

    match a.blocked.cmp(&b.blocked) {
        Ordering::Equal => {}
        other => return other,
    }
    if a.blocked && b.blocked {
        let ord = a.blocked_until.unwrap_or(i64::MAX).cmp(&b.blocked_until.unwrap_or(i64::MAX));
        return if ord != Ordering::Equal { ord } else { orig_index[&a.cred.id].cmp(&orig_index[&b.cred.id]) };
    }

    let a_windows = a.report.as_ref().map(|r| ranking.find_window_limits(r));
    let b_windows = b.report.as_ref().map(|r| ranking.find_window_limits(r));
    let a_primary = a_windows.as_ref().and_then(|w| w.primary);
    let b_primary = b_windows.as_ref().and_then(|w| w.primary);
    let a_secondary = a_windows.as_ref().and_then(|w| w.secondary);
    let b_secondary = b_windows.as_ref().and_then(|w| w.secondary);

    let a_boost = a.report.as_ref().map(|r| ranking.has_priority_boost(a_primary, r)).unwrap_or(false);
    let b_boost = b.report.as_ref().map(|r| ranking.has_priority_boost(b_primary, r)).unwrap_or(false);
    match b_boost.cmp(&a_boost) {
        Ordering::Equal => {}
        other => return other,
    }

    if let Some(ord) = cmp_optional_f64(
        a_secondary.map(|l| drain_rate(l, now, defaults.secondary_ms)),
        b_secondary.map(|l| drain_rate(l, now, defaults.secondary_ms)),
    ) {
        if ord != Ordering::Equal {
            return ord;
        }
    }
    if let Some(ord) = cmp_optional_f64(a_secondary.and_then(|l| l.used_fraction()), b_secondary.and_then(|l| l.used_fraction())) {
        if ord != Ordering::Equal {
            return ord;
        }
    }
    if let Some(ord) = cmp_optional_f64(
        a_primary.map(|l| drain_rate(l, now, defaults.primary_ms)),
        b_primary.map(|l| drain_rate(l, now, defaults.primary_ms)),
    ) {
        if ord != Ordering::Equal {
            return ord;
        }
    }
    if let Some(ord) = cmp_optional_f64(a_primary.and_then(|l| l.used_fraction()), b_primary.and_then(|l| l.used_fraction())) {
        if ord != Ordering::Equal {
            return ord;
        }
    }

    orig_index[&a.cred.id].cmp(&orig_index[&b.cred.id])
}

fn identifiers_from_metadata(metadata: &HashMap<String, String>) -> Vec<String> {
    let mut ids = Vec::new();
    if let Some(email) = metadata.get("email").filter(|e| !e.is_empty()) {
        ids.push(format!("email:{}", email.to_lowercase()));
    }
    for key in ["accountId", "account", "user", "username"] {
        if let Some(v) = metadata.get(key).filter(|v| !v.is_empty()) {
            ids.push(format!("account:{v}"));
            break;
        }
    }
    ids
}

/// §4.6.9: group same-provider reports whose identifier sets intersect and merge each
/// group into one (union limits by id, prefer the richer report as base, max `fetchedAt`).
fn merge_usage_reports(reports: Vec<UsageReport>) -> Vec<UsageReport> {
    let ids: Vec<Vec<String>> = reports.iter().map(|r| identifiers_from_metadata(&r.metadata)).collect();
    let mut groups: Vec<Vec<usize>> = Vec::new();

    'outer: for i in 0..reports.len() {
        if ids[i].is_empty() {
            groups.push(vec![i]);
            continue;
        }
        for g in groups.iter_mut() {
            let same_provider = reports[g[0]].provider == reports[i].provider;
            let intersects = same_provider && g.iter().any(|&j| ids[j].iter().any(|id| ids[i].contains(id)));
            if intersects {
                g.push(i);
                continue 'outer;
            }
        }
        groups.push(vec![i]);
    }

    groups
        .into_iter()
        .map(|idxs| {
            if idxs.len() == 1 {
                return reports[idxs[0]].clone();
            }
            let base_idx = *idxs.iter().max_by_key(|&&i| reports[i].limits.len()).unwrap();
            let mut merged = reports[base_idx].clone();
            let mut seen: HashSet<String> = merged.limits.iter().map(|l| l.id.clone()).collect();
            for &i in &idxs {
                if i == base_idx {
                    continue;
                }
                for limit in &reports[i].limits {
                    if seen.insert(limit.id.clone()) {
                        merged.limits.push(limit.clone());
                    }
                }
                for (k, v) in &reports[i].metadata {
                    merged.metadata.entry(k.clone()).or_insert_with(|| v.clone());
                }
                merged.fetched_at = merged.fetched_at.max(reports[i].fetched_at);
            }
            merged
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::FixedEnv;
    use crate::ranking::WindowLimits;
    use crate::usage::{LimitAmount, LimitStatus, LimitWindow};
    use std::collections::HashMap as Map;
    use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};

    fn fixed_clock(now: i64) -> Arc<dyn Fn() -> i64 + Send + Sync> {
        Arc::new(move || now)
    }

    async fn tmp_broker(now: i64) -> (tempfile::TempDir, CredentialBroker) {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::open(dir.path().join("auth.db")).unwrap();
        let broker = CredentialBroker::builder().store(store).clock(fixed_clock(now)).build().unwrap();
        (dir, broker)
    }

    fn api_key(k: &str) -> Credential {
        Credential::ApiKey(ApiKeyCredential { key: k.into() })
    }

    fn oauth(access: &str, expires: i64) -> Credential {
        Credential::OAuth(OAuthCredential {
            access: access.into(),
            refresh: format!("refresh-{access}"),
            expires,
            account_id: None,
            email: None,
            project_id: None,
            enterprise_url: None,
            extra: Map::new(),
        })
    }

    struct AlwaysRefresh;
    #[async_trait]
    impl OAuthRefresher for AlwaysRefresh {
        fn provider(&self) -> &str {
            "openai-codex"
        }
        fn needs_refresh(&self, _c: &OAuthCredential, _now_ms: i64) -> bool {
            false
        }
        async fn refresh(&self, c: &OAuthCredential) -> anyhow::Result<OAuthCredential> {
            Ok(c.clone())
        }
    }

    struct ScriptedProber {
        reports: Map<String, UsageReport>,
    }
    #[async_trait]
    impl crate::usage::UsageProber for ScriptedProber {
        fn provider(&self) -> &str {
            "openai-codex"
        }
        async fn fetch_usage(&self, params: &ProbeParams, _deps: &ProbeDeps) -> Option<UsageReport> {
            self.reports.get(&params.credential_id.to_string()).cloned()
        }
    }

    struct SimpleRanking;
    impl RankingStrategy for SimpleRanking {
        fn provider(&self) -> &str {
            "openai-codex"
        }
        fn find_window_limits<'a>(&self, report: &'a UsageReport) -> WindowLimits<'a> {
            WindowLimits { primary: report.limits.first(), secondary: None }
        }
        fn has_priority_boost(&self, _primary: Option<&crate::usage::UsageLimit>, _report: &UsageReport) -> bool {
            false
        }
        fn window_defaults(&self) -> WindowDefaults {
            WindowDefaults { primary_ms: 18_000_000, secondary_ms: 18_000_000 * 7 }
        }
    }

    fn limit(id: &str, used_fraction: f64, resets_at: Option<i64>) -> crate::usage::UsageLimit {
        crate::usage::UsageLimit {
            id: id.into(),
            status: if used_fraction >= 1.0 { LimitStatus::Exhausted } else { LimitStatus::Active },
            amount: LimitAmount { used_fraction: Some(used_fraction), ..Default::default() },
            window: Some(LimitWindow { duration_ms: Some(18_000_000), reset_in_ms: None, resets_at }),
            scope: None,
        }
    }

    // S1
    #[tokio::test]
    async fn runtime_override_beats_stored_key() {
        let (_dir, broker) = tmp_broker(1_000_000).await;
        broker.set("anthropic", vec![api_key("stored")]).await;
        broker.set_runtime_api_key("anthropic", "runtime").await;

        let key = broker.get_api_key("anthropic", Some("session-1"), GetApiKeyOpts::default()).await;
        assert_eq!(key, Some("runtime".to_string()));
    }

    // S2
    #[tokio::test]
    async fn round_robin_without_session() {
        let (_dir, broker) = tmp_broker(1_000_000).await;
        broker.set("openai", vec![api_key("A"), api_key("B"), api_key("C")]).await;

        let mut seen = Vec::new();
        for _ in 0..6 {
            seen.push(broker.get_api_key("openai", None, GetApiKeyOpts::default()).await.unwrap());
        }
        assert_eq!(seen, vec!["A", "B", "C", "A", "B", "C"]);
    }

    // S3
    #[tokio::test]
    async fn session_stickiness() {
        let (_dir, broker) = tmp_broker(1_000_000).await;
        broker.set("openai", vec![api_key("A"), api_key("B"), api_key("C")]).await;

        let session = "abc";
        assert_eq!(fnv1a_32(session) as usize % 3, 1);

        let first = broker.get_api_key("openai", Some(session), GetApiKeyOpts::default()).await;
        assert_eq!(first, Some("B".to_string()));
        for _ in 0..3 {
            let again = broker.get_api_key("openai", Some(session), GetApiKeyOpts::default()).await;
            assert_eq!(again, Some("B".to_string()));
        }
    }

    // S4
    #[tokio::test]
    async fn usage_exhausted_skip() {
        let now = 1_000_000;
        let (_dir, broker) = tmp_broker(now).await;
        broker.set("openai-codex", vec![oauth("o1-access", now + 999_999), oauth("o2-access", now + 999_999)]).await;

        let ids: Vec<i64> =
            broker.inner.state.lock().await.sets["openai-codex"].iter().map(|c| c.id).collect();

        let mut reports = Map::new();
        reports.insert(ids[0].to_string(), UsageReport {
            provider: "openai-codex".into(),
            fetched_at: now,
            limits: vec![limit("5h", 1.0, Some(now + 120_000))],
            metadata: Map::new(),
        });
        reports.insert(ids[1].to_string(), UsageReport {
            provider: "openai-codex".into(),
            fetched_at: now,
            limits: vec![limit("5h", 0.3, None)],
            metadata: Map::new(),
        });

        let broker = CredentialBroker {
            inner: Arc::new(Inner {
                probers: {
                    let mut r = ProberRegistry::new();
                    r.register(Arc::new(ScriptedProber { reports }));
                    r
                },
                rankings: {
                    let mut r = RankingRegistry::new();
                    r.register(Arc::new(SimpleRanking));
                    r
                },
                refreshers: {
                    let mut r = RefresherRegistry::new();
                    r.register(Arc::new(AlwaysRefresh));
                    r
                },
                ..Arc::try_unwrap(broker.inner).ok().unwrap()
            }),
        };

        let key = broker.get_api_key("openai-codex", None, GetApiKeyOpts::default()).await;
        assert_eq!(key, Some("o2-access".to_string()));

        let blocked_until = {
            let state = broker.inner.state.lock().await;
            state.backoff[&("openai-codex".to_string(), CredentialType::OAuth)][&ids[0]]
        };
        assert_eq!(blocked_until, now + 120_000);
    }

    // S5
    #[tokio::test]
    async fn all_blocked_falls_back() {
        let now = 1_000_000;
        let (_dir, broker) = tmp_broker(now).await;
        broker.set("openai-codex", vec![oauth("o1-access", now + 999_999), oauth("o2-access", now + 999_999)]).await;
        let ids: Vec<i64> =
            broker.inner.state.lock().await.sets["openai-codex"].iter().map(|c| c.id).collect();

        broker.mark_blocked("openai-codex", CredentialType::OAuth, ids[0], now + 300_000).await;
        broker.mark_blocked("openai-codex", CredentialType::OAuth, ids[1], now + 60_000).await;

        let broker = CredentialBroker {
            inner: Arc::new(Inner {
                rankings: {
                    let mut r = RankingRegistry::new();
                    r.register(Arc::new(SimpleRanking));
                    r
                },
                refreshers: {
                    let mut r = RefresherRegistry::new();
                    r.register(Arc::new(AlwaysRefresh));
                    r
                },
                ..Arc::try_unwrap(broker.inner).ok().unwrap()
            }),
        };

        let key = broker.get_api_key("openai-codex", Some("sess"), GetApiKeyOpts::default()).await;
        assert_eq!(key, Some("o2-access".to_string()));

        let recorded = broker.inner.state.lock().await.sessions["openai-codex"]["sess"];
        assert_eq!(recorded, (CredentialType::OAuth, ids[1]));
    }

    // S6
    #[tokio::test]
    async fn definitive_refresh_failure_removes_credential() {
        let now = 1_000_000;
        let (_dir, broker) = tmp_broker(now).await;
        broker.set("openai-codex", vec![oauth("o1-access", now - 1), oauth("o2-access", now - 1)]).await;

        struct Dispatch {
            now: i64,
        }
        #[async_trait]
        impl OAuthRefresher for Dispatch {
            fn provider(&self) -> &str {
                "openai-codex"
            }
            async fn refresh(&self, c: &OAuthCredential) -> anyhow::Result<OAuthCredential> {
                if c.access == "o1-access" {
                    Err(anyhow::anyhow!("invalid_grant"))
                } else {
                    Ok(OAuthCredential { access: "o2-fresh".into(), expires: self.now + 999_999, ..c.clone() })
                }
            }
        }

        let broker = CredentialBroker {
            inner: Arc::new(Inner {
                refreshers: {
                    let mut r = RefresherRegistry::new();
                    r.register(Arc::new(Dispatch { now }));
                    r
                },
                ..Arc::try_unwrap(broker.inner).ok().unwrap()
            }),
        };

        let key = broker.get_api_key("openai-codex", None, GetApiKeyOpts::default()).await;
        assert_eq!(key, Some("o2-fresh".to_string()));

        broker.reload().await;
        let remaining = broker.inner.state.lock().await.sets["openai-codex"].len();
        assert_eq!(remaining, 1);
    }

    // S7 — dedup on load
    #[tokio::test]
    async fn dedup_on_load() {
        use base64::engine::general_purpose::URL_SAFE_NO_PAD;
        use base64::Engine;

        let now = 1_000_000;
        let (_dir, broker) = tmp_broker(now).await;

        let jwt = |payload: &str| {
            let p = URL_SAFE_NO_PAD.encode(payload.as_bytes());
            format!("h.{p}.s")
        };

        let r1 = OAuthCredential {
            access: jwt(r#"{"email":"a@x"}"#),
            refresh: "r1".into(),
            expires: now + 999_999,
            account_id: None,
            email: None,
            project_id: None,
            enterprise_url: None,
            extra: Map::new(),
        };
        let r2 = OAuthCredential { access: "r2-access".into(), refresh: "r2".into(), expires: now + 999_999, account_id: Some("acc-1".into()), email: None, project_id: None, enterprise_url: None, extra: Map::new() };
        let r3 = OAuthCredential {
            access: jwt(r#"{"email":"a@x","account_id":"acc-1"}"#),
            refresh: "r3".into(),
            expires: now + 999_999,
            account_id: None,
            email: None,
            project_id: None,
            enterprise_url: None,
            extra: Map::new(),
        };

        broker.set("customprovider", vec![Credential::OAuth(r1), Credential::OAuth(r2), Credential::OAuth(r3.clone())]).await;

        let remaining = broker.inner.state.lock().await.sets["customprovider"].clone();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].credential.as_oauth().unwrap().refresh, "r3");
    }

    #[tokio::test]
    async fn backoff_is_monotonic_under_repeated_marks() {
        let (_dir, broker) = tmp_broker(1_000_000).await;
        broker.mark_blocked("openai", CredentialType::ApiKey, 1, 5_000).await;
        broker.mark_blocked("openai", CredentialType::ApiKey, 1, 3_000).await;
        let until = broker.inner.state.lock().await.backoff[&("openai".to_string(), CredentialType::ApiKey)][&1];
        assert_eq!(until, 5_000);
    }

    #[tokio::test]
    async fn peek_does_not_refresh_expired_oauth() {
        let (_dir, broker) = tmp_broker(1_000_000).await;
        broker.set("anthropic", vec![oauth("expired-access", 999_999)]).await;
        assert_eq!(broker.peek_api_key("anthropic").await, None);
    }

    #[tokio::test]
    async fn peek_returns_unexpired_access_token() {
        let (_dir, broker) = tmp_broker(1_000_000).await;
        broker.set("anthropic", vec![oauth("fresh-access", 2_000_000)]).await;
        assert_eq!(broker.peek_api_key("anthropic").await, Some("fresh-access".to_string()));
    }

    #[tokio::test]
    async fn env_lookup_is_last_resort() {
        let (_dir, broker) = tmp_broker(1_000_000).await;
        let mut env_map = Map::new();
        env_map.insert("ANTHROPIC_API_KEY".to_string(), "from-env".to_string());
        let broker = CredentialBroker { inner: Arc::new(Inner { env: Arc::new(FixedEnv(env_map)), ..Arc::try_unwrap(broker.inner).ok().unwrap() }) };

        let key = broker.get_api_key("anthropic", None, GetApiKeyOpts::default()).await;
        assert_eq!(key, Some("from-env".to_string()));
    }

    struct CountingFallback(AtomicI64);
    #[async_trait]
    impl FallbackResolver for CountingFallback {
        async fn resolve(&self, _provider: &str) -> Option<String> {
            self.0.fetch_add(1, AtomicOrdering::SeqCst);
            Some("fallback-value".to_string())
        }
    }

    #[tokio::test]
    async fn fallback_resolver_used_when_nothing_else_matches() {
        let (_dir, broker) = tmp_broker(1_000_000).await;
        broker.set_fallback_resolver(Arc::new(CountingFallback(AtomicI64::new(0)))).await;
        let key = broker.get_api_key("unknown-provider", None, GetApiKeyOpts::default()).await;
        assert_eq!(key, Some("fallback-value".to_string()));
    }

    #[tokio::test]
    async fn list_reflects_removal() {
        let (_dir, broker) = tmp_broker(1_000_000).await;
        broker.set("openai", vec![api_key("a")]).await;
        assert_eq!(broker.list().await, vec!["openai".to_string()]);
        broker.remove("openai").await;
        assert!(broker.list().await.is_empty());
    }

    #[tokio::test]
    async fn open_creates_store_and_reload_sees_prior_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("auth.db");

        let broker = CredentialBroker::open(BrokerConfig::new(&path)).unwrap();
        broker.set("openai", vec![api_key("k1")]).await;

        // A second handle over the same path sees what the first one wrote.
        let reopened = CredentialBroker::open(BrokerConfig::new(&path)).unwrap();
        reopened.reload().await;
        assert!(reopened.has_auth("openai").await);
    }

    #[test]
    fn default_path_is_under_home_dir() {
        let config = BrokerConfig::default_path();
        assert!(config.store_path.ends_with("credentials.db"));
    }
}
