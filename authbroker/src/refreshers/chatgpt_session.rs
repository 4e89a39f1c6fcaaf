//! Codex-style session refresher: like [`super::oauth2_standard::Oauth2StandardRefresher`]
//! but also derives `accountId`/`email` from the returned ID token's JWT claims,
//! since this family of providers encodes account identity there rather than in a
//! separate profile endpoint.

use crate::credential::OAuthCredential;
use crate::identity::decode_account_email;
use crate::refresher::OAuthRefresher;
use async_trait::async_trait;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

pub struct ChatGptSessionRefresher {
    provider: String,
    token_url: String,
    client_id: String,
    http: reqwest::Client,
}

impl ChatGptSessionRefresher {
    pub fn new(provider: impl Into<String>, token_url: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self { provider: provider.into(), token_url: token_url.into(), client_id: client_id.into(), http: reqwest::Client::new() }
    }

    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }
}

#[async_trait]
impl OAuthRefresher for ChatGptSessionRefresher {
    fn provider(&self) -> &str {
        &self.provider
    }

    async fn refresh(&self, credential: &OAuthCredential) -> anyhow::Result<OAuthCredential> {
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", credential.refresh.as_str()),
            ("client_id", self.client_id.as_str()),
        ];

        let response = self.http.post(&self.token_url).form(&form).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("token endpoint returned {status}: {body}");
        }
        let body: TokenResponse = response.json().await?;

        let (email, account_id) = body
            .id_token
            .as_deref()
            .map(decode_account_email)
            .unwrap_or((None, None));

        let expires = body
            .expires_in
            .map(|secs| chrono::Utc::now().timestamp_millis() + secs.max(0) * 1000)
            .unwrap_or(credential.expires);

        Ok(OAuthCredential {
            access: body.access_token,
            refresh: body.refresh_token.unwrap_or_else(|| credential.refresh.clone()),
            expires,
            account_id: account_id.or_else(|| credential.account_id.clone()),
            email: email.or_else(|| credential.email.clone()),
            ..credential.clone()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_id_is_exposed() {
        let r = ChatGptSessionRefresher::new("openai-codex", "https://auth.example.test/token", "cid");
        assert_eq!(r.provider(), "openai-codex");
    }
}
