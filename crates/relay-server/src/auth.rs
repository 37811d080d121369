//! HTTP basic authentication for the admin surface.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use secrecy::{ExposeSecret, SecretString};

const REALM: &str = "Basic realm=\"relay admin\"";

/// The single shared admin credential.
#[derive(Clone, Debug)]
pub struct AdminCredentials {
    user: String,
    pass: SecretString,
}

impl AdminCredentials {
    pub fn new(user: impl Into<String>, pass: SecretString) -> Self {
        Self { user: user.into(), pass }
    }

    /// Check an `Authorization` header value of the form `Basic <base64(user:pass)>`.
    pub fn verify(&self, header_value: &str) -> bool {
        let Some(encoded) = header_value
            .strip_prefix("Basic ")
            .or_else(|| header_value.strip_prefix("basic "))
        else {
            return false;
        };
        let Ok(decoded) = STANDARD.decode(encoded.trim()) else {
            return false;
        };
        let Ok(decoded) = String::from_utf8(decoded) else {
            return false;
        };
        let Some((user, pass)) = decoded.split_once(':') else {
            return false;
        };
        // Evaluate both halves so a wrong user costs the same as a wrong password.
        let user_ok = constant_time_eq(user.as_bytes(), self.user.as_bytes());
        let pass_ok = constant_time_eq(pass.as_bytes(), self.pass.expose_secret().as_bytes());
        user_ok & pass_ok
    }

    pub fn authorized(&self, headers: &HeaderMap) -> bool {
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| self.verify(v))
    }
}

/// Constant-time comparison for credential checks.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

/// Middleware guarding admin routes.
pub async fn require_admin(
    State(credentials): State<Arc<AdminCredentials>>,
    request: Request,
    next: Next,
) -> Response {
    if credentials.authorized(request.headers()) {
        return next.run(request).await;
    }
    tracing::warn!(path = %request.uri().path(), "rejected admin request: bad credentials");
    (StatusCode::UNAUTHORIZED, [(header::WWW_AUTHENTICATE, REALM)]).into_response()
}
