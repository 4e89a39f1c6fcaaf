//! C2 — identity extraction for cross-credential deduplication (spec §4.2).
//!
//! Identifiers are formatted `email:<lowercased>` or `account:<as-is>`. Only the
//! middle segment of a JWT is read (no signature verification): the core already
//! trusts a token it issued or stored, it only needs the claims inside.

use crate::credential::OAuthCredential;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

/// Providers restricted to email-only identifiers for dedup (spec §4.2, §9: Codex
/// issues per-email ChatGPT sessions whose `sub` can drift across refreshes).
pub fn email_only_dedup(provider: &str) -> bool {
    matches!(provider, "openai-codex" | "anthropic")
}

#[derive(Debug, serde::Deserialize)]
struct JwtClaims {
    email: Option<String>,
    account_id: Option<String>,
    #[serde(rename = "accountId")]
    account_id_camel: Option<String>,
    user_id: Option<String>,
    sub: Option<String>,
}

impl JwtClaims {
    fn account_identifier(&self) -> Option<&str> {
        self.account_id
            .as_deref()
            .or(self.account_id_camel.as_deref())
            .or(self.user_id.as_deref())
            .or(self.sub.as_deref())
    }
}

fn decode_jwt_claims(token: &str) -> Option<JwtClaims> {
    let mut parts = token.split('.');
    let _header = parts.next()?;
    let payload = parts.next()?;
    parts.next()?; // signature, present but unused
    if parts.next().is_some() {
        return None; // not a 3-segment JWT
    }
    let bytes = URL_SAFE_NO_PAD.decode(payload).ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Both an email and an account identifier may come out of one JWT — "first present"
/// in spec §4.2 only disambiguates among the four account-ish claim names, not between
/// email and account themselves.
fn identifiers_from_jwt(token: &str) -> Vec<String> {
    let Some(claims) = decode_jwt_claims(token) else {
        return Vec::new();
    };
    let mut ids = Vec::new();
    if let Some(email) = claims.email.as_deref().filter(|e| !e.is_empty()) {
        ids.push(format!("email:{}", email.to_lowercase()));
    }
    if let Some(account) = claims.account_identifier().filter(|a| !a.is_empty()) {
        ids.push(format!("account:{account}"));
    }
    ids
}

/// Pull `(email, account_id)` straight out of a JWT's claims, for plugins (e.g. a
/// Codex-style refresher) that need the raw pair rather than the `email:`/`account:`
/// identifier strings `identifiers_for` produces.
pub fn decode_account_email(token: &str) -> (Option<String>, Option<String>) {
    let Some(claims) = decode_jwt_claims(token) else {
        return (None, None);
    };
    let email = claims.email.clone().filter(|e| !e.is_empty());
    let account = claims.account_identifier().filter(|a| !a.is_empty()).map(String::from);
    (email, account)
}

/// Identifiers for a credential, in source precedence order per spec §4.2: explicit
/// fields first, then the access token's JWT claims, then the refresh token's.
/// `restrict_to_email` drops every non-`email:` identifier (openai-codex/anthropic).
pub fn identifiers_for(credential: &OAuthCredential, restrict_to_email: bool) -> Vec<String> {
    let mut ids = Vec::new();

    // Explicit fields: unlike the JWT-claims source below, both may contribute —
    // spec §4.2 only applies "first present" precedence within a JWT's claim set.
    if let Some(account) = credential.account_id.as_deref().filter(|a| !a.is_empty()) {
        ids.push(format!("account:{account}"));
    }
    if let Some(email) = credential.email.as_deref().filter(|e| !e.is_empty()) {
        ids.push(format!("email:{}", email.to_lowercase()));
    }

    if ids.is_empty() {
        ids = identifiers_from_jwt(&credential.access);
    }
    if ids.is_empty() {
        ids = identifiers_from_jwt(&credential.refresh);
    }

    if restrict_to_email {
        ids.retain(|id| id.starts_with("email:"));
    }
    ids
}
