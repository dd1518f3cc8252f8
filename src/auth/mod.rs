#![forbid(unsafe_code)]

// Upgrade-time authentication. The token is read from the Authorization header,
// falling back to a `token` query parameter for browser WebSocket clients.

pub mod jwt;
pub mod types;

pub use jwt::TokenKeys;
pub use types::{AuthError, Claims, Principal};

use axum::http::{header, HeaderMap};

pub fn bearer_token<'a>(headers: &'a HeaderMap, query_token: Option<&'a str>) -> Option<&'a str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .or_else(|| query_token.map(str::trim).filter(|t| !t.is_empty()))
}

pub fn authenticate(
    headers: &HeaderMap,
    query_token: Option<&str>,
    keys: Option<&TokenKeys>,
) -> Result<Principal, AuthError> {
    let keys = keys.ok_or(AuthError::NotConfigured)?;
    let token = bearer_token(headers, query_token).ok_or(AuthError::MissingToken)?;
    keys.verify(token)
}
