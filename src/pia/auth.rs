use reqwest::{header::AUTHORIZATION, RequestBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use super::{Client, PiaError, Result};

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TokenResponse {
    pub token: String,
}

impl Client {
    /// Exchanges the configured username and password for a fresh token.
    /// Always hits the network; use [`Client::token`] to go through the cache.
    #[instrument(skip(self))]
    pub async fn get_token(&self) -> Result<TokenResponse> {
        let (username, password) = self
            .config
            .credentials()
            .ok_or(PiaError::MissingCredentials)?;

        let res = self
            .http()
            .post(&self.config.endpoints.token)
            .form(&[("username", username), ("password", password)])
            .send()
            .await?;

        if !res.status().is_success() {
            return Err(PiaError::Status {
                request: "token",
                status: res.status(),
            });
        }

        Ok(res.json().await?)
    }

    /// Returns a token for authenticated requests: the static token if configured,
    /// otherwise a cached one, otherwise a newly exchanged one.
    pub async fn token(&self) -> Result<String> {
        if let Some(token) = self.config.static_token() {
            return Ok(token.to_string());
        }

        self.config
            .cache
            .get_or_try_insert_with(move || async move {
                debug!("No cached PIA token, requesting a new one");
                self.get_token().await.map(|res| res.token)
            })
            .await
    }

    pub(crate) async fn authorize(&self, req: RequestBuilder) -> Result<RequestBuilder> {
        let token = self.token().await?;
        Ok(req.header(AUTHORIZATION, format!("Token {token}")))
    }
}
