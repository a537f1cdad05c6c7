// Authentication types

use anyhow::{Context, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Claims embedded in the access token payload
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Claims {
    /// Expiration time (epoch seconds)
    pub exp: i64,

    /// Subject (user ID)
    #[serde(default)]
    pub sub: Option<String>,

    /// Elevated-privilege flag
    #[serde(default, alias = "isAdmin")]
    pub is_admin: bool,
}

/// A decoded bearer credential
///
/// The signature is never checked here; the backend owns verification.
/// Only the payload segment is decoded to read the expiry.
#[derive(Debug, Clone, PartialEq)]
pub struct Credential {
    token: String,
    claims: Claims,
}

impl Credential {
    /// Decode a compact `header.payload.signature` token
    pub fn parse(token: &str) -> Result<Self> {
        let mut segments = token.split('.');
        let payload = match (segments.next(), segments.next(), segments.next(), segments.next()) {
            (Some(_), Some(payload), Some(_), None) if !payload.is_empty() => payload,
            _ => anyhow::bail!("Token is not in header.payload.signature form"),
        };

        let bytes = URL_SAFE_NO_PAD
            .decode(payload.trim_end_matches('='))
            .context("Token payload is not valid base64url")?;
        let claims: Claims =
            serde_json::from_slice(&bytes).context("Token payload is not a valid claim set")?;

        Ok(Self {
            token: token.to_string(),
            claims,
        })
    }

    /// Raw token string, as sent in the Authorization header
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn claims(&self) -> &Claims {
        &self.claims
    }

    pub fn is_admin(&self) -> bool {
        self.claims.is_admin
    }

    /// Expiry as a timestamp; `None` if the claim is outside chrono's range
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_opt(self.claims.exp, 0).single()
    }

    /// True once `now` is within `margin` of the expiry
    pub fn expires_within(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        now.timestamp() >= self.claims.exp.saturating_sub(margin.num_seconds())
    }

    /// Shortened token for log output
    pub fn redacted(&self) -> String {
        redact(&self.token)
    }
}

/// First 8 characters of a token followed by an ellipsis
pub fn redact(token: &str) -> String {
    let prefix: String = token.chars().take(8).collect();
    format!("{}...", prefix)
}

/// Token pair held by the credential store
#[derive(Debug, Clone, PartialEq)]
pub struct TokenData {
    pub access_token: String,
    pub refresh_token: Option<String>,
}

/// Refresh request body
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    pub refresh_token: String,
}

/// Refresh response body
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponse {
    pub access_token: String,
    pub refresh_token: Option<String>,
}
