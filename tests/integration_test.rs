// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! End-to-end gateway tests: a real HTTP server over a mock model backend.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use tinyclaw_agents::{BackgroundRunner, SubAgentManager, TemplateStore, TimeoutEstimator};
use tinyclaw_core::{Compactor, Orchestrator, OrchestratorDeps, SessionQueue, SubAgentRunner};
use tinyclaw_memory::MemoryEngine;
use tinyclaw_model::FilterChain;
use tinyclaw_node::{build_router, AppState, AuthRateLimiter, AuthService};
use tinyclaw_shield::{ApprovalQueue, Shield};
use tinyclaw_store::{SecurityStore, Store};
use tinyclaw_tools::{MemoryAddTool, MemorySearchTool, ToolRegistry};

struct TestNode {
    base: String,
    state: AppState,
    _data_dir: tempfile::TempDir,
}

async fn spawn_node() -> TestNode {
    let data_dir = tempfile::tempdir().unwrap();

    let store = Arc::new(Store::open_in_memory().unwrap());
    let security = Arc::new(SecurityStore::open_in_memory().unwrap());

    let mut providers = std::collections::HashMap::new();
    providers.insert(
        "default".to_string(),
        tinyclaw_model::from_config(
            "default",
            &tinyclaw_config::ProviderConfig {
                provider: "mock".into(),
                name: "mock-model".into(),
                api_key_env: None,
                api_key: None,
                base_url: None,
                max_tokens: None,
                temperature: None,
            },
        )
        .unwrap(),
    );
    let registry = Arc::new(tinyclaw_model::ProviderRegistry::new(providers, "default").unwrap());

    let memory = Arc::new(MemoryEngine::new(
        store.clone(),
        tinyclaw_config::MemoryConfig::default(),
    ));
    let agents_cfg = tinyclaw_config::AgentsConfig::default();
    let _manager = Arc::new(SubAgentManager::new(store.clone(), agents_cfg.clone()));
    let _templates = Arc::new(TemplateStore::new(store.clone(), agents_cfg));
    let publisher: tinyclaw_agents::Publisher = Arc::new(|_, _| {});
    let runner = Arc::new(BackgroundRunner::new(store.clone(), publisher));
    let _estimator = Arc::new(TimeoutEstimator::new(store.clone()));
    let shield = Arc::new(Shield::disabled());
    let _executor = Arc::new(SubAgentRunner::new(
        registry.clone(),
        Arc::new(ToolRegistry::new()),
        shield.clone(),
        store.clone(),
    ));

    let mut tools = ToolRegistry::new();
    tools.register(MemoryAddTool::new(memory.clone()));
    tools.register(MemorySearchTool::new(memory.clone()));

    let auth = Arc::new(AuthService::new(security.clone()));
    let mut cfg = tinyclaw_config::OrchestratorConfig::default();
    cfg.owner_id = "owner-1".to_string();

    let filters = Arc::new(FilterChain::default());
    let orchestrator = Orchestrator::new(OrchestratorDeps {
        registry,
        tools: Arc::new(tools),
        shield,
        approvals: Arc::new(ApprovalQueue::new(Duration::from_secs(300))),
        memory,
        compactor: Arc::new(Compactor::new(
            store.clone(),
            tinyclaw_config::CompactorConfig::default(),
        )),
        store,
        runner,
        queue: SessionQueue::new(),
        filters: filters.clone(),
        audit: None,
        identity_text: String::new(),
        soul_text: String::new(),
        cfg,
    });

    let state = AppState {
        auth,
        orchestrator,
        limiter: Arc::new(AuthRateLimiter::new(
            5,
            Duration::from_secs(300),
            20,
            security,
        )),
        heartware: Arc::new(tinyclaw_heartware::Heartware::new(
            data_dir.path().to_path_buf(),
        )),
        filters,
    };

    let router = build_router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });

    TestNode { base: format!("http://{addr}"), state, _data_dir: data_dir }
}

#[tokio::test]
async fn health_and_security_headers() {
    let node = spawn_node().await;
    let resp = reqwest::get(format!("{}/api/health", node.base)).await.unwrap();

    assert_eq!(resp.status(), 200);
    assert_eq!(resp.headers()["x-content-type-options"], "nosniff");
    assert_eq!(resp.headers()["x-frame-options"], "DENY");
    assert_eq!(resp.headers()["x-xss-protection"], "1; mode=block");
    assert_eq!(
        resp.headers()["referrer-policy"],
        "strict-origin-when-cross-origin"
    );

    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["ok"], true);
}

#[tokio::test]
async fn status_reports_unclaimed_instance() {
    let node = spawn_node().await;
    let body: serde_json::Value = reqwest::get(format!("{}/api/auth/status", node.base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["claimed"], false);
    assert_eq!(body["setupRequired"], true);
    assert_eq!(body["isOwner"], false);
    assert_eq!(body["mfaConfigured"], false);
}

#[tokio::test]
async fn owner_chat_requires_session() {
    let node = spawn_node().await;
    let resp = reqwest::Client::new()
        .post(format!("{}/api/chat", node.base))
        .json(&json!({"message": "hi"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
}

#[tokio::test]
async fn friend_chat_round_trips_through_the_mock_model() {
    let node = spawn_node().await;
    let resp = reqwest::Client::new()
        .post(format!("{}/api/chat/friend", node.base))
        .json(&json!({"message": "hello there", "name": "alice"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["content"], "MOCK: hello there");
}

#[tokio::test]
async fn friend_chat_streams_sse_frames_ending_with_done() {
    let node = spawn_node().await;
    let resp = reqwest::Client::new()
        .post(format!("{}/api/chat/friend", node.base))
        .json(&json!({"message": "stream me", "stream": true}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let content_type = resp.headers()["content-type"].to_str().unwrap().to_string();
    assert!(content_type.starts_with("text/event-stream"));

    let body = resp.text().await.unwrap();
    assert!(body.contains("data:"));
    assert!(body.contains("MOCK: stream me"));
    assert!(body.contains(r#""type":"done"#));
}

#[tokio::test]
async fn empty_friend_message_is_rejected() {
    let node = spawn_node().await;
    let resp = reqwest::Client::new()
        .post(format!("{}/api/chat/friend", node.base))
        .json(&json!({"message": "   "}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn session_cookie_unlocks_owner_surface() {
    let node = spawn_node().await;

    // Claim the instance through the service-level setup flow, then use the
    // session cookie over HTTP like a real client would.
    let session_token = claim(&node.state.auth);
    let cookie = format!("tinyclaw_session={session_token}");

    let resp = reqwest::Client::new()
        .post(format!("{}/api/chat", node.base))
        .header("cookie", &cookie)
        .json(&json!({"message": "hello from the owner"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(body["content"], "MOCK: hello from the owner");

    // Listing endpoints open up with the same cookie.
    let tasks = reqwest::Client::new()
        .get(format!("{}/api/background-tasks", node.base))
        .header("cookie", &cookie)
        .send()
        .await
        .unwrap();
    assert_eq!(tasks.status(), 200);

    let agents = reqwest::Client::new()
        .get(format!("{}/api/sub-agents", node.base))
        .header("cookie", &cookie)
        .send()
        .await
        .unwrap();
    assert_eq!(agents.status(), 200);
}

/// Complete the setup flow at the service level and return a session token.
fn claim(auth: &AuthService) -> String {
    let bootstrap = auth.bootstrap_secret_for_display();
    let (setup_token, _totp_secret, _uri) = auth.begin_setup(&bootstrap).unwrap();
    let code = auth
        .totp_code_for_pending_setup(&setup_token)
        .expect("pending setup session");
    let artifacts = auth
        .complete_setup(&setup_token, "owner-1", None, &code)
        .unwrap();
    artifacts.session_token
}
