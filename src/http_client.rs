use anyhow::Context;
use rand::Rng;
use reqwest::{header, Client, Method, Request, RequestBuilder, Response, StatusCode};
use std::time::Duration;

use crate::auth::TokenGuard;
use crate::error::{ApiError, Result};

/// Upper bound for a single backoff sleep (milliseconds)
const MAX_BACKOFF_DELAY_MS: u64 = 60_000;

/// HTTP client for the recipe backend API
///
/// Every request goes through the freshness guard before it is dispatched
/// and carries the current access token as a bearer credential.
pub struct ApiClient {
    /// Shared HTTP client with connection pooling
    client: Client,

    /// Credential freshness guard
    guard: TokenGuard,

    /// Backend base URL, without trailing slash
    base_url: String,

    /// Maximum number of retries
    max_retries: u32,

    /// Base delay for exponential backoff (milliseconds)
    base_delay_ms: u64,
}

impl ApiClient {
    pub fn new(
        guard: TokenGuard,
        base_url: &str,
        connect_timeout: u64,
        request_timeout: u64,
        max_retries: u32,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout))
            .timeout(Duration::from_secs(request_timeout))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            guard,
            base_url: base_url.trim_end_matches('/').to_string(),
            max_retries,
            base_delay_ms: 1000, // 1 second base delay
        })
    }

    /// Override the backoff base delay
    pub fn with_base_delay_ms(mut self, base_delay_ms: u64) -> Self {
        self.base_delay_ms = base_delay_ms;
        self
    }

    pub fn guard(&self) -> &TokenGuard {
        &self.guard
    }

    /// Start a request for a path relative to the backend base URL
    pub fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        self.client.request(method, url)
    }

    /// Authenticated GET of a backend path
    pub async fn get(&self, path: &str) -> Result<Response> {
        let request = self
            .request(Method::GET, path)
            .build()
            .map_err(|e| ApiError::ValidationError(format!("Invalid request path: {}", e)))?;
        self.execute(request).await
    }

    /// Execute an authenticated request with retry logic
    /// Automatically handles:
    /// - due credential: refreshes before sending
    /// - 401: one shared refresh, then retries once
    /// - 429 / 5xx / network errors: exponential backoff
    pub async fn execute(&self, request: Request) -> Result<Response> {
        self.guard.ensure_fresh().await?;

        let method = request.method().clone();
        let url = request.url().clone();
        tracing::debug!(
            method = %method,
            url = %url,
            "Sending authenticated request"
        );

        let mut attempt = 0;
        let mut refreshed_after_401 = false;

        loop {
            let req = self.authorize(&request)?;

            match self.client.execute(req).await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        tracing::debug!(status = %status, "Request successful");
                        return Ok(response);
                    }

                    tracing::warn!(
                        status = %status,
                        url = %url,
                        "Received error response"
                    );

                    if status == StatusCode::UNAUTHORIZED && !refreshed_after_401 {
                        tracing::warn!("Received 401, refreshing credential and retrying...");
                        self.guard.refresh().await?;
                        refreshed_after_401 = true;
                        continue;
                    }

                    let retryable =
                        status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error();
                    if retryable && attempt < self.max_retries {
                        let delay = self.calculate_backoff_delay(attempt);
                        tracing::warn!(
                            "Received {}, retrying after {}ms (attempt {}/{})",
                            status,
                            delay,
                            attempt + 1,
                            self.max_retries
                        );
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        attempt += 1;
                        continue;
                    }

                    let error_text = response.text().await.unwrap_or_default();
                    tracing::error!(
                        status = status.as_u16(),
                        url = %url,
                        response_body = %error_text,
                        attempt = attempt + 1,
                        "HTTP request failed with error response"
                    );
                    return Err(ApiError::Backend {
                        status: status.as_u16(),
                        message: error_text,
                    });
                }

                Err(e) => {
                    let error_kind = if e.is_timeout() {
                        "timeout"
                    } else if e.is_connect() {
                        "connection_failed"
                    } else if e.is_request() {
                        "request_error"
                    } else if e.is_body() {
                        "body_error"
                    } else {
                        "unknown"
                    };

                    if attempt < self.max_retries {
                        let delay = self.calculate_backoff_delay(attempt);
                        tracing::warn!(
                            error_kind = error_kind,
                            error = %e,
                            "Request failed, retrying after {}ms (attempt {}/{})",
                            delay,
                            attempt + 1,
                            self.max_retries
                        );
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        attempt += 1;
                        continue;
                    }

                    tracing::error!(
                        error_kind = error_kind,
                        error = %e,
                        url = %url,
                        total_attempts = attempt + 1,
                        "HTTP request failed after all retries"
                    );
                    return Err(ApiError::Internal(anyhow::anyhow!(
                        "HTTP request failed: {} (kind: {})",
                        e,
                        error_kind
                    )));
                }
            }
        }
    }

    /// Clone the request and attach the current bearer token
    fn authorize(&self, request: &Request) -> Result<Request> {
        let token = self
            .guard
            .store()
            .access_token()?
            .ok_or(ApiError::NotAuthenticated)?;

        let mut req = request.try_clone().ok_or_else(|| {
            ApiError::Internal(anyhow::anyhow!("Request body is not cloneable"))
        })?;

        let value = header::HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|_| {
            ApiError::Internal(anyhow::anyhow!("Stored token is not a valid header value"))
        })?;
        req.headers_mut().insert(header::AUTHORIZATION, value);
        Ok(req)
    }

    /// Calculate exponential backoff delay
    fn calculate_backoff_delay(&self, attempt: u32) -> u64 {
        // base_delay * 2^attempt, capped, plus up to 10% jitter
        let factor = 2_u64.checked_pow(attempt).unwrap_or(u64::MAX);
        let delay = self
            .base_delay_ms
            .saturating_mul(factor)
            .min(MAX_BACKOFF_DELAY_MS);
        let jitter = (delay as f64 * 0.1 * rand::thread_rng().gen::<f64>()) as u64;
        delay + jitter
    }
}
