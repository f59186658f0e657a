// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! HTTP handlers.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use axum::{
    extract::{ConnectInfo, Query, State},
    http::{HeaderMap, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::Stream;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use tinyclaw_core::{EventSink, StreamEvent, PROVIDER_ERROR_MESSAGE};
use tinyclaw_heartware::SOUL_FILE;

use crate::auth::AuthError;
use crate::ratelimit::Gate;
use crate::state::{session_cookie_header, session_token_from_cookies, AppState};

const MAX_GUEST_MESSAGE_CHARS: usize = 4_000;

// ── Helpers ───────────────────────────────────────────────────────────────────

fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({"error": "unauthorized"}))).into_response()
}

fn too_many_requests() -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({"error": "too many attempts, slow down"})),
    )
        .into_response()
}

fn forbidden() -> Response {
    (StatusCode::FORBIDDEN, Json(json!({"error": "forbidden"}))).into_response()
}

fn has_session(state: &AppState, headers: &HeaderMap) -> bool {
    headers
        .get(axum::http::header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .and_then(session_token_from_cookies)
        .map(|token| state.auth.verify_session(token))
        .unwrap_or(false)
}

fn require_session(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    if has_session(state, headers) {
        Ok(())
    } else {
        Err(unauthorized())
    }
}

fn with_session_cookie(token: &str, body: serde_json::Value) -> Response {
    let mut resp = Json(body).into_response();
    if let Ok(value) = session_cookie_header(token).parse() {
        resp.headers_mut().insert(axum::http::header::SET_COOKIE, value);
    }
    resp
}

fn auth_error_response(err: AuthError) -> Response {
    match err {
        AuthError::Store(e) => {
            warn!("auth storage failure: {e:#}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "internal error"})),
            )
                .into_response()
        }
        // Generic message on every credential path; no oracle.
        _ => unauthorized(),
    }
}

/// Strip control characters and cap length before a guest message reaches
/// the orchestrator.
fn sanitize_guest_message(message: &str) -> String {
    message
        .chars()
        .filter(|c| !c.is_control() || *c == '\n')
        .take(MAX_GUEST_MESSAGE_CHARS)
        .collect::<String>()
        .trim()
        .to_string()
}

// ── Liveness & status ─────────────────────────────────────────────────────────

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({"ok": true}))
}

pub async fn auth_status(State(state): State<AppState>, headers: HeaderMap) -> Json<serde_json::Value> {
    let claimed = state.auth.is_claimed();
    Json(json!({
        "claimed": claimed,
        "isOwner": has_session(&state, &headers),
        "setupRequired": !claimed,
        "mfaConfigured": state.auth.mfa_configured(),
    }))
}

// ── Setup ─────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct BootstrapBody {
    pub secret: String,
}

pub async fn setup_bootstrap(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<BootstrapBody>,
) -> Response {
    if state.limiter.check_auth(addr.ip()) != Gate::Allowed {
        return too_many_requests();
    }
    match state.auth.begin_setup(&body.secret) {
        Ok((setup_token, totp_secret, totp_uri)) => Json(json!({
            "setupToken": setup_token,
            "totpSecret": totp_secret,
            "totpUri": totp_uri,
        }))
        .into_response(),
        Err(e) => auth_error_response(e),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupCompleteBody {
    pub setup_token: String,
    pub owner_id: String,
    pub api_key: Option<String>,
    pub soul_seed: Option<String>,
    pub totp_code: String,
}

pub async fn setup_complete(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<SetupCompleteBody>,
) -> Response {
    if state.limiter.check_auth(addr.ip()) != Gate::Allowed {
        return too_many_requests();
    }
    let artifacts = match state.auth.complete_setup(
        &body.setup_token,
        &body.owner_id,
        body.api_key.as_deref(),
        &body.totp_code,
    ) {
        Ok(a) => a,
        Err(e) => return auth_error_response(e),
    };

    if let Some(seed) = &body.soul_seed {
        if let Err(e) = state.heartware.save(SOUL_FILE, seed) {
            warn!("writing soul seed failed: {e:#}");
        }
    }

    with_session_cookie(
        &artifacts.session_token,
        json!({
            "backupCodes": artifacts.backup_codes,
            "recoveryToken": artifacts.recovery_token,
        }),
    )
}

// ── Login & recovery ──────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct LoginBody {
    pub code: String,
}

pub async fn login(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<LoginBody>,
) -> Response {
    if state.limiter.check_auth(addr.ip()) != Gate::Allowed {
        return too_many_requests();
    }
    match state.auth.login_with_totp(&body.code) {
        Ok(token) => with_session_cookie(&token, json!({"ok": true})),
        Err(e) => auth_error_response(e),
    }
}

#[derive(Deserialize)]
pub struct RecoveryTokenBody {
    pub token: String,
}

pub async fn recovery_validate_token(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<RecoveryTokenBody>,
) -> Response {
    match state.limiter.check_recovery(addr.ip()) {
        Gate::Allowed => {}
        Gate::Limited => return too_many_requests(),
        Gate::Blocked => return forbidden(),
    }
    match state.auth.validate_recovery_token(&body.token) {
        Ok(session_id) => {
            state.limiter.clear_recovery_failures(addr.ip());
            Json(json!({"recoverySessionId": session_id})).into_response()
        }
        Err(e) => {
            state.limiter.record_recovery_failure(addr.ip());
            auth_error_response(e)
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UseBackupBody {
    pub recovery_session_id: String,
    pub code: String,
}

pub async fn recovery_use_backup(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<UseBackupBody>,
) -> Response {
    match state.limiter.check_recovery(addr.ip()) {
        Gate::Allowed => {}
        Gate::Limited => return too_many_requests(),
        Gate::Blocked => return forbidden(),
    }
    match state
        .auth
        .use_backup_code(&body.recovery_session_id, &body.code)
    {
        Ok(token) => {
            state.limiter.clear_recovery_failures(addr.ip());
            with_session_cookie(&token, json!({"ok": true}))
        }
        Err(e) => {
            state.limiter.record_recovery_failure(addr.ip());
            auth_error_response(e)
        }
    }
}

// ── TOTP re-enrollment ────────────────────────────────────────────────────────

pub async fn totp_setup(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Err(resp) = require_session(&state, &headers) {
        return resp;
    }
    let (secret, uri) = state.auth.begin_totp_reenroll();
    Json(json!({"totpSecret": secret, "totpUri": uri})).into_response()
}

#[derive(Deserialize)]
pub struct TotpConfirmBody {
    pub code: String,
}

pub async fn totp_confirm(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<TotpConfirmBody>,
) -> Response {
    if let Err(resp) = require_session(&state, &headers) {
        return resp;
    }
    match state.auth.confirm_totp_reenroll(&body.code) {
        Ok(artifacts) => with_session_cookie(
            &artifacts.session_token,
            json!({
                "backupCodes": artifacts.backup_codes,
                "recoveryToken": artifacts.recovery_token,
            }),
        ),
        Err(e) => auth_error_response(e),
    }
}

// ── Chat ──────────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct ChatBody {
    pub message: String,
    #[serde(default)]
    pub stream: bool,
    /// Guest display name (friend endpoint only).
    pub name: Option<String>,
}

pub async fn chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ChatBody>,
) -> Response {
    if let Err(resp) = require_session(&state, &headers) {
        return resp;
    }
    let Some(owner) = state.auth.owner_id() else {
        return unauthorized();
    };
    run_turn(state, owner, body.message, body.stream).await
}

pub async fn chat_friend(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(body): Json<ChatBody>,
) -> Response {
    if state.limiter.check_friend(addr.ip()) != Gate::Allowed {
        return too_many_requests();
    }
    let message = sanitize_guest_message(&body.message);
    if message.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "empty message"})),
        )
            .into_response();
    }
    let name = body
        .name
        .as_deref()
        .map(sanitize_guest_message)
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| addr.ip().to_string());
    let principal = format!("friend:{name}");
    run_turn(state, principal, message, body.stream).await
}

async fn run_turn(state: AppState, principal: String, message: String, stream: bool) -> Response {
    if stream {
        return sse_turn(state, principal, message).into_response();
    }
    match state
        .orchestrator
        .clone()
        .handle_message(&principal, &message, None)
        .await
    {
        Ok(content) => Json(json!({"content": content})).into_response(),
        Err(e) => {
            warn!(user = %principal, "turn failed: {e:#}");
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({"error": PROVIDER_ERROR_MESSAGE})),
            )
                .into_response()
        }
    }
}

/// One SSE frame per stream event; `: heartbeat` comments every 8 seconds
/// keep slow turns alive; the stream closes after `{type:"done"}`.
fn sse_turn(
    state: AppState,
    principal: String,
    message: String,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (sink, rx) = EventSink::channel(state.filters.clone());
    let orchestrator = state.orchestrator.clone();
    let done_sink = sink.clone();

    tokio::spawn(async move {
        if let Err(e) = orchestrator
            .handle_message(&principal, &message, Some(sink))
            .await
        {
            // The orchestrator already emitted the error frame for provider
            // failures; close the stream either way.
            warn!(user = %principal, "streaming turn failed: {e:#}");
            done_sink.emit(StreamEvent::Done);
        }
    });

    let stream = futures::stream::unfold((rx, false), |(mut rx, finished)| async move {
        if finished {
            return None;
        }
        let event = rx.recv().await?;
        let is_done = matches!(event, StreamEvent::Done);
        let frame = Event::default().data(event.to_envelope().to_string());
        Some((Ok(frame), (rx, is_done)))
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(8))
            .text("heartbeat"),
    )
}

// ── Listings ──────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserQuery {
    pub user_id: Option<String>,
}

pub async fn background_tasks(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<UserQuery>,
) -> Response {
    if let Err(resp) = require_session(&state, &headers) {
        return resp;
    }
    let user = query
        .user_id
        .or_else(|| state.auth.owner_id())
        .unwrap_or_default();
    match state.orchestrator.store().list_background_tasks(&user) {
        Ok(tasks) => {
            let items: Vec<serde_json::Value> = tasks
                .iter()
                .map(|t| {
                    json!({
                        "id": t.id,
                        "agentId": t.agent_id,
                        "description": t.description,
                        "status": t.status.as_str(),
                        "result": t.result,
                        "startedAt": t.started_at,
                        "completedAt": t.completed_at,
                        "deliveredAt": t.delivered_at,
                    })
                })
                .collect();
            Json(json!({"tasks": items})).into_response()
        }
        Err(e) => {
            warn!("listing background tasks: {e:#}");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": "internal error"})))
                .into_response()
        }
    }
}

pub async fn sub_agents(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<UserQuery>,
) -> Response {
    if let Err(resp) = require_session(&state, &headers) {
        return resp;
    }
    let user = query
        .user_id
        .or_else(|| state.auth.owner_id())
        .unwrap_or_default();
    match state.orchestrator.store().list_sub_agents(&user) {
        Ok(agents) => {
            let items: Vec<serde_json::Value> = agents
                .iter()
                .map(|a| {
                    json!({
                        "id": a.id,
                        "role": a.role,
                        "status": a.status.as_str(),
                        "performanceScore": a.performance_score,
                        "totalTasks": a.total_tasks,
                        "successfulTasks": a.successful_tasks,
                        "tierPreference": a.tier_preference,
                        "createdAt": a.created_at,
                        "lastActiveAt": a.last_active_at,
                        "deletedAt": a.deleted_at,
                    })
                })
                .collect();
            Json(json!({"agents": items})).into_response()
        }
        Err(e) => {
            warn!("listing sub-agents: {e:#}");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": "internal error"})))
                .into_response()
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guest_sanitizer_strips_control_and_caps_length() {
        let dirty = format!("hi\u{0007} there{}", "x".repeat(10_000));
        let clean = sanitize_guest_message(&dirty);
        assert!(!clean.contains('\u{0007}'));
        assert!(clean.len() <= MAX_GUEST_MESSAGE_CHARS);
        assert!(clean.starts_with("hi there"));
    }

    #[test]
    fn guest_sanitizer_keeps_newlines() {
        assert_eq!(sanitize_guest_message("a\nb"), "a\nb");
    }
}
