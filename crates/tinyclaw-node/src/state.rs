// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use tinyclaw_core::Orchestrator;
use tinyclaw_heartware::Heartware;
use tinyclaw_model::FilterChain;

use crate::auth::AuthService;
use crate::ratelimit::AuthRateLimiter;

/// Shared state threaded through every handler.
#[derive(Clone)]
pub struct AppState {
    pub auth: Arc<AuthService>,
    pub orchestrator: Arc<Orchestrator>,
    pub limiter: Arc<AuthRateLimiter>,
    pub heartware: Arc<Heartware>,
    pub filters: Arc<FilterChain>,
}

/// Session cookie name. The server only ever stores the SHA-256 hash of the
/// value.
pub const SESSION_COOKIE: &str = "tinyclaw_session";

/// One year, as demanded of the session cookie.
pub const SESSION_MAX_AGE_SECS: u64 = 365 * 24 * 60 * 60;

pub fn session_cookie_header(token: &str) -> String {
    format!(
        "{SESSION_COOKIE}={token}; HttpOnly; SameSite=Strict; Max-Age={SESSION_MAX_AGE_SECS}; Path=/"
    )
}

/// Extract the session token from a Cookie header value.
pub fn session_token_from_cookies(cookie_header: &str) -> Option<&str> {
    cookie_header.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == SESSION_COOKIE).then_some(value)
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_header_carries_required_attributes() {
        let header = session_cookie_header("TOKEN");
        assert!(header.starts_with("tinyclaw_session=TOKEN"));
        assert!(header.contains("HttpOnly"));
        assert!(header.contains("SameSite=Strict"));
        assert!(header.contains("Max-Age=31536000"));
        assert!(header.contains("Path=/"));
    }

    #[test]
    fn token_parses_out_of_cookie_list() {
        let header = "other=1; tinyclaw_session=ABC123; theme=dark";
        assert_eq!(session_token_from_cookies(header), Some("ABC123"));
        assert_eq!(session_token_from_cookies("other=1"), None);
    }
}
