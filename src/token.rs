use crate::config::Config;
use crate::errors::AppError;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::Mutex;

/// Bearer credential for the provider API. Never persisted.
#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: DateTime<Utc>,
}

impl CachedToken {
    fn is_valid(&self) -> bool {
        Utc::now() < self.expires_at
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

/// Caches the provider bearer token and renews it on demand.
///
/// Renewal is single-flight: the cache slot's lock is held across the
/// refresh, so concurrent callers queue on the lock and observe the freshly
/// stored token instead of issuing duplicate authentication requests. A
/// failed renewal caches nothing; the next caller retries.
pub struct TokenCache {
    client: Client,
    auth_url: String,
    username: String,
    password: String,
    client_id: String,
    audience: String,
    slot: Mutex<Option<CachedToken>>,
}

impl TokenCache {
    pub fn new(config: &Config) -> Self {
        Self {
            client: Client::new(),
            auth_url: config.provider_auth_url.clone(),
            username: config.provider_username.clone(),
            password: config.provider_password.clone(),
            client_id: config.provider_client_id.clone(),
            audience: config.provider_audience.clone(),
            slot: Mutex::new(None),
        }
    }

    /// Returns a valid bearer token, renewing it if the cached one expired.
    pub async fn get_valid_token(&self) -> Result<String, AppError> {
        let mut slot = self.slot.lock().await;

        if let Some(token) = slot.as_ref() {
            if token.is_valid() {
                return Ok(token.value.clone());
            }
        }

        let renewed = self.renew().await?;
        let value = renewed.value.clone();
        *slot = Some(renewed);
        Ok(value)
    }

    async fn renew(&self) -> Result<CachedToken, AppError> {
        tracing::info!("Renewing provider access token");

        let params = [
            ("grant_type", "password"),
            ("username", self.username.as_str()),
            ("password", self.password.as_str()),
            ("audience", self.audience.as_str()),
            ("scope", "offline_access"),
            ("client_id", self.client_id.as_str()),
        ];

        let response = self
            .client
            .post(&self.auth_url)
            .form(&params)
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| {
                AppError::AuthenticationFailed(format!("Token request failed: {}", e))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            tracing::error!("Token renewal returned {}: {}", status, error_text);
            return Err(AppError::AuthenticationFailed(format!(
                "Provider auth returned status {}: {}",
                status, error_text
            )));
        }

        let token: TokenResponse = response.json().await.map_err(|e| {
            AppError::AuthenticationFailed(format!("Failed to parse token response: {}", e))
        })?;

        tracing::info!("Provider access token renewed");

        Ok(CachedToken {
            value: token.access_token,
            expires_at: Utc::now() + chrono::Duration::seconds(token.expires_in),
        })
    }
}
