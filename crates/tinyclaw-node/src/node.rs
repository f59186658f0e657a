// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Router assembly and server startup.

use std::net::SocketAddr;

use anyhow::Context;
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::limit::RequestBodyLimitLayer;
use tracing::info;

use crate::routes;
use crate::security::security_headers;
use crate::state::AppState;

/// Request bodies above this are rejected before any handler runs.
const MAX_BODY_BYTES: usize = 256 * 1024;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(routes::health))
        .route("/api/auth/status", get(routes::auth_status))
        .route("/api/setup/bootstrap", post(routes::setup_bootstrap))
        .route("/api/setup/complete", post(routes::setup_complete))
        .route("/api/auth/login", post(routes::login))
        .route("/api/recovery/validate-token", post(routes::recovery_validate_token))
        .route("/api/recovery/use-backup", post(routes::recovery_use_backup))
        .route("/api/owner/totp-setup", post(routes::totp_setup))
        .route("/api/owner/totp-confirm", post(routes::totp_confirm))
        .route("/api/chat", post(routes::chat))
        .route("/api/chat/friend", post(routes::chat_friend))
        .route("/api/background-tasks", get(routes::background_tasks))
        .route("/api/sub-agents", get(routes::sub_agents))
        .layer(middleware::from_fn(security_headers))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .with_state(state)
}

/// Bind and serve until the process is stopped.
pub async fn run(state: AppState, bind: &str, port: u16) -> anyhow::Result<()> {
    let addr: SocketAddr = format!("{bind}:{port}")
        .parse()
        .with_context(|| format!("invalid bind address {bind}:{port}"))?;
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("gateway listening on http://{addr}");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("http server")
}
