//! A plain RFC 6749 refresh-token-grant refresher, usable by any provider whose
//! token endpoint accepts `grant_type=refresh_token` form-encoded and returns a
//! JSON `{access_token, refresh_token?, expires_in?}` body.

use crate::credential::OAuthCredential;
use crate::refresher::OAuthRefresher;
use async_trait::async_trait;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

pub struct Oauth2StandardRefresher {
    provider: String,
    token_url: String,
    client_id: String,
    client_secret: Option<String>,
    http: reqwest::Client,
}

impl Oauth2StandardRefresher {
    pub fn new(
        provider: impl Into<String>,
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: Option<String>,
    ) -> Self {
        Self {
            provider: provider.into(),
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret,
            http: reqwest::Client::new(),
        }
    }

    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }
}

#[async_trait]
impl OAuthRefresher for Oauth2StandardRefresher {
    fn provider(&self) -> &str {
        &self.provider
    }

    async fn refresh(&self, credential: &OAuthCredential) -> anyhow::Result<OAuthCredential> {
        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", credential.refresh.as_str()),
            ("client_id", self.client_id.as_str()),
        ];
        if let Some(secret) = self.client_secret.as_deref() {
            form.push(("client_secret", secret));
        }

        let response = self.http.post(&self.token_url).form(&form).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("token endpoint returned {status}: {body}");
        }
        let body: TokenResponse = response.json().await?;

        let expires = body
            .expires_in
            .map(|secs| chrono::Utc::now().timestamp_millis() + secs.max(0) * 1000)
            .unwrap_or(credential.expires);

        Ok(OAuthCredential {
            access: body.access_token,
            refresh: body.refresh_token.unwrap_or_else(|| credential.refresh.clone()),
            expires,
            ..credential.clone()
        })
    }
}
