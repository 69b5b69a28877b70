//! Shared-secret check for trigger and admin endpoints.

use axum::http::HeaderMap;
use secrecy::{ExposeSecret, SecretString};

pub const SECRET_HEADER: &str = "x-campaign-secret";

/// Outcome of checking a request's credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthCheck {
    Authorized,
    /// Wrong or missing secret on the request.
    Rejected,
    /// No secret configured on the server, so nothing can be authorized.
    NotConfigured,
}

/// The secret presented by a request, from `x-campaign-secret` or a bearer token.
pub fn presented_secret(headers: &HeaderMap) -> Option<&str> {
    if let Some(value) = headers.get(SECRET_HEADER).and_then(|v| v.to_str().ok()) {
        return Some(value.trim()).filter(|v| !v.is_empty());
    }
    let raw = headers.get("Authorization")?.to_str().ok()?;
    let token = raw.strip_prefix("Bearer ")?.trim();
    if token.is_empty() {
        return None;
    }
    Some(token)
}

pub fn check(expected: Option<&SecretString>, headers: &HeaderMap) -> AuthCheck {
    let Some(expected) = expected else {
        return AuthCheck::NotConfigured;
    };
    match presented_secret(headers) {
        Some(given) if constant_time_eq(given.as_bytes(), expected.expose_secret().as_bytes()) => {
            AuthCheck::Authorized
        }
        _ => AuthCheck::Rejected,
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
