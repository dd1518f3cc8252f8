#![forbid(unsafe_code)]

use axum::{http::StatusCode, response::{IntoResponse, Response}, Json};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,
    #[error("invalid token")]
    InvalidToken,
    #[error("token expired")]
    TokenExpired,
    #[error("token signing failed: {0}")]
    Signing(String),
    #[error("authentication not configured")]
    NotConfigured,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AuthError::MissingToken => (StatusCode::UNAUTHORIZED, "Missing authorization"),
            AuthError::InvalidToken => (StatusCode::UNAUTHORIZED, "Invalid token"),
            AuthError::TokenExpired => (StatusCode::UNAUTHORIZED, "Token expired"),
            AuthError::Signing(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Token error"),
            AuthError::NotConfigured => (StatusCode::SERVICE_UNAVAILABLE, "Authentication not configured"),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

/// Bearer token claims. `sub` is the user's email.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub name: String,
    pub exp: usize,
}

/// Authenticated identity attached to a connection for its whole lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Principal {
    pub email: String,
    pub display_name: String,
}

impl Principal {
    pub fn new(email: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            display_name: display_name.into(),
        }
    }

    /// Builds a principal from verified claims. The subject is trimmed and
    /// lowercased; a blank display name falls back to the email's local part.
    pub fn from_claims(claims: Claims) -> Result<Self, AuthError> {
        let email = claims.sub.trim().to_lowercase();
        if email.is_empty() {
            return Err(AuthError::InvalidToken);
        }
        let display_name = match claims.name.trim() {
            "" => email.split('@').next().unwrap_or(&email).to_string(),
            name => name.to_string(),
        };
        Ok(Self { email, display_name })
    }
}
