// Token refresh against the backend authentication service

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;

use super::store::CredentialStore;
use super::types::{Credential, RefreshRequest, RefreshResponse, TokenData};

/// Exchanges the long-lived refresh token for a new access credential
#[async_trait]
pub trait AuthService: Send + Sync {
    async fn refresh_token(&self) -> Result<Credential>;
}

/// Authentication service reached over HTTP
///
/// Reads the refresh token from the store and writes the rotated pair back
/// before returning, the same way the browser's refresh endpoint rewrites
/// its cookies.
pub struct HttpAuthService {
    client: Client,
    refresh_url: String,
    store: Arc<dyn CredentialStore>,
}

impl HttpAuthService {
    pub fn new(
        api_url: &str,
        refresh_path: &str,
        store: Arc<dyn CredentialStore>,
        connect_timeout: u64,
        request_timeout: u64,
    ) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout))
            .timeout(Duration::from_secs(request_timeout))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            refresh_url: refresh_url(api_url, refresh_path),
            store,
        })
    }

    pub fn refresh_url(&self) -> &str {
        &self.refresh_url
    }
}

/// Join base URL and path without doubling the slash
fn refresh_url(api_url: &str, refresh_path: &str) -> String {
    format!(
        "{}/{}",
        api_url.trim_end_matches('/'),
        refresh_path.trim_start_matches('/')
    )
}

#[async_trait]
impl AuthService for HttpAuthService {
    async fn refresh_token(&self) -> Result<Credential> {
        tracing::info!("Refreshing access token via {}", self.refresh_url);

        let refresh_token = self
            .store
            .refresh_token()?
            .context("No refresh token stored for this session")?;

        let request = RefreshRequest { refresh_token };

        let response = self
            .client
            .post(&self.refresh_url)
            .json(&request)
            .send()
            .await
            .context("Failed to send refresh request")?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            tracing::error!(
                "Refresh request rejected: status={}, body={}",
                status,
                error_text
            );

            // Surface the backend's message when it sends one
            if let Ok(error_json) = serde_json::from_str::<serde_json::Value>(&error_text) {
                if let Some(message) = error_json.get("message").and_then(|v| v.as_str()) {
                    anyhow::bail!("Refresh failed: {} - {}", status, message);
                }
            }

            anyhow::bail!("Refresh failed: {} - {}", status, error_text);
        }

        let data: RefreshResponse = response
            .json()
            .await
            .context("Failed to parse refresh response")?;

        if data.access_token.is_empty() {
            anyhow::bail!("Refresh response does not contain accessToken");
        }

        let credential = Credential::parse(&data.access_token)
            .context("Refresh response carried an undecodable access token")?;

        self.store.save(&TokenData {
            access_token: data.access_token,
            refresh_token: data.refresh_token,
        })?;

        tracing::info!(
            token = %credential.redacted(),
            expires_at = ?credential.expires_at(),
            "Access token refreshed"
        );

        Ok(credential)
    }
}
