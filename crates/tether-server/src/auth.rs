//! Auth Gate (§4.7): single shared bearer token, constant-time compare,
//! 24h cookie so sub-resource requests (e.g. the preview proxy) don't
//! need to repeat the token in every URL.

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use rand::RngCore;
use tether_core::security::constant_time_eq;

use crate::state::AppState;

pub const TOKEN_COOKIE: &str = "tether_token";
const COOKIE_MAX_AGE_SECS: i64 = 24 * 60 * 60;

/// Read `<NAME>_REMOTE_TOKEN` if set, otherwise mint a fresh 8-hex-char
/// token the way §4.7 specifies (4 random bytes).
pub fn resolve_token(binary_name: &str) -> String {
    let var = format!("{}_REMOTE_TOKEN", binary_name.to_uppercase());
    if let Ok(token) = std::env::var(&var) {
        return token;
    }
    let mut buf = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

pub fn token_matches(state: &AppState, candidate: &str) -> bool {
    constant_time_eq(candidate.as_bytes(), state.auth_token.as_bytes())
}

/// Builds a `Set-Cookie` header value for a successful token check.
pub fn auth_cookie(state: &AppState) -> String {
    format!(
        "{TOKEN_COOKIE}={}; Path=/; HttpOnly; SameSite=Lax; Max-Age={COOKIE_MAX_AGE_SECS}",
        state.auth_token
    )
}

fn extract_bearer(headers: &axum::http::HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

fn extract_cookie(headers: &axum::http::HeaderMap) -> Option<String> {
    let raw = headers.get(header::COOKIE)?.to_str().ok()?;
    raw.split(';').find_map(|kv| {
        let kv = kv.trim();
        let (name, value) = kv.split_once('=')?;
        (name == TOKEN_COOKIE).then(|| value.to_string())
    })
}

/// Middleware guarding every HTTP API route other than static assets.
pub async fn require_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let headers = request.headers();
    let candidate = extract_bearer(headers).or_else(|| extract_cookie(headers));

    match candidate {
        Some(token) if token_matches(&state, &token) => next.run(request).await,
        _ => (StatusCode::UNAUTHORIZED, "invalid or missing token").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_token_prefers_env_override() {
        std::env::set_var("TESTBIN_REMOTE_TOKEN", "deadbeef");
        let token = resolve_token("testbin");
        std::env::remove_var("TESTBIN_REMOTE_TOKEN");
        assert_eq!(token, "deadbeef");
    }

    #[test]
    fn resolve_token_generates_eight_hex_chars_without_override() {
        std::env::remove_var("NOOVERRIDE_REMOTE_TOKEN");
        let token = resolve_token("nooverride");
        assert_eq!(token.len(), 8);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
