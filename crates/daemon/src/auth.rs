// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Cloudflared Tunnel Manager Contributors

// Cloudflared Tunnel Manager - API Authentication Module
// Bearer-token sessions for the daemon API. Tokens live in memory only and
// die with the daemon; users log in again after a restart.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

use cfd_tunnel_common::ErrorResponse;

/// Username of the authenticated caller, inserted into request extensions
/// by the middleware
#[derive(Debug, Clone)]
pub struct CurrentUser(pub String);

/// In-memory session token store
#[derive(Clone, Default)]
pub struct SessionStore {
    tokens: Arc<RwLock<HashMap<String, String>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue a fresh session token for a user
    pub async fn issue(&self, username: &str) -> String {
        let token = Uuid::new_v4().to_string();
        let mut tokens = self.tokens.write().await;
        tokens.insert(token.clone(), username.to_string());
        token
    }

    pub async fn revoke(&self, token: &str) -> bool {
        let mut tokens = self.tokens.write().await;
        tokens.remove(token).is_some()
    }

    pub async fn username_for(&self, token: &str) -> Option<String> {
        let tokens = self.tokens.read().await;
        tokens.get(token).cloned()
    }
}

/// State for the authentication middleware
#[derive(Clone)]
pub struct AuthLayerState {
    pub sessions: SessionStore,
    pub require_auth: bool,
}

/// Obfuscate a token for logging (show only the last 4 characters)
pub fn obfuscate_token(token: &str) -> String {
    if token.len() < 4 {
        "*".repeat(token.len())
    } else {
        let mask_len = token.len() - 4;
        format!("{}{}", "*".repeat(mask_len), &token[mask_len..])
    }
}

/// Pull the bearer token out of an Authorization header
pub fn bearer_token(headers: &header::HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// Authentication middleware for the protected part of the router.
/// Validates the bearer token against the session store and records the
/// caller in request extensions. 401 on anything else.
pub async fn auth_middleware(
    State(auth_state): State<AuthLayerState>,
    mut request: Request,
    next: Next,
) -> Response {
    if !auth_state.require_auth {
        return next.run(request).await;
    }

    let token = match bearer_token(request.headers()) {
        Some(token) => token.to_string(),
        None => {
            warn!("Authentication failed: missing bearer token");
            return unauthorized("missing bearer token");
        }
    };

    match auth_state.sessions.username_for(&token).await {
        Some(username) => {
            tracing::trace!("Authenticated request for '{}'", username);
            request.extensions_mut().insert(CurrentUser(username));
            next.run(request).await
        }
        None => {
            warn!(
                "Authentication failed: invalid or expired token {}",
                obfuscate_token(&token)
            );
            unauthorized("invalid or expired token")
        }
    }
}

fn unauthorized(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
        .into_response()
}
