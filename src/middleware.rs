// Session middleware for routes that need a live credential

use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::{IntoResponse, Redirect, Response},
};

use crate::auth::TokenGuard;

/// State for [`require_fresh_session`]
#[derive(Clone)]
pub struct SessionState {
    pub guard: TokenGuard,

    /// Where to send the user when the session is gone
    pub login_path: String,
}

impl SessionState {
    pub fn new(guard: TokenGuard, login_path: impl Into<String>) -> Self {
        Self {
            guard,
            login_path: login_path.into(),
        }
    }
}

/// Session middleware
///
/// Refreshes the credential when it is due, then lets the request through.
/// A missing credential or a failed refresh logs the user out by
/// redirecting to the login page.
pub async fn require_fresh_session(
    State(state): State<SessionState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();

    if state.guard.credential().is_none() {
        tracing::debug!("No usable session for {}, redirecting to login", path);
        return Redirect::to(&state.login_path).into_response();
    }

    if let Err(e) = state.guard.ensure_fresh().await {
        tracing::warn!("Forcing logout on {}: {}", path, e);
        if let Err(e) = state.guard.store().clear() {
            tracing::error!("Failed to clear session after refresh failure: {:#}", e);
        }
        return Redirect::to(&state.login_path).into_response();
    }

    next.run(request).await
}
