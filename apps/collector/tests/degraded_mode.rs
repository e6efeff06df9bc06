#![allow(clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use collector_service::build_collector_state_with_backend;
use collector_service::config::Config;
use collector_service::directory::memory::MemoryDirectoryBackend;
use collector_service::directory::types::{AgentState, AgentStatus, StatusKey};
use collector_service::protocol::checkin::auth_proof;
use collector_service::server::build_router;
use collector_service::server::listener::spawn_server;
use serde_json::{Value, json};

const CLASS_KEY: &[u8] = b"BUILD001 class key";

async fn post(client: &reqwest::Client, base: &str, body: Value) -> Result<(reqwest::header::HeaderMap, Value)> {
    let response = client.post(format!("{base}/checkin")).json(&body).send().await?;
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let headers = response.headers().clone();
    Ok((headers, response.json().await?))
}

#[tokio::test]
async fn agent_rides_out_a_directory_outage() -> Result<()> {
    let key = StatusKey::new("BUILD001", "instance-1", "WIN32");
    let backend = Arc::new(MemoryDirectoryBackend::new());
    backend.set_signature(b"collector signature").await;
    backend.set_class_key("BUILD001", CLASS_KEY).await;
    backend
        .set_status(
            key.clone(),
            AgentStatus {
                state: AgentState::Active,
                agent_id: 7,
            },
        )
        .await;
    backend.set_config(7, b"first config").await;

    let state = build_collector_state_with_backend(Config::default(), backend.clone());
    assert!(state.directory.cache_init().await);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let server = spawn_server(listener, build_router(state.clone()), Duration::from_secs(5))?;
    let base = format!("http://{}", server.local_addr);
    let client = reqwest::Client::builder().cookie_store(true).build()?;

    // Authenticate while the directory is live.
    let (headers, body) = post(
        &client,
        &base,
        json!({
            "command": "auth",
            "build_id": "BUILD001",
            "instance_id": "instance-1",
            "subtype": "WIN32",
            "proof": auth_proof(CLASS_KEY, "instance-1"),
        }),
    )
    .await?;
    let cookie = headers
        .get(reqwest::header::SET_COOKIE)
        .and_then(|value| value.to_str().ok())
        .expect("auth sets the session cookie")
        .to_string();
    assert!(cookie.starts_with("ID="));
    assert_eq!(body["state"], "active");
    assert_eq!(state.sessions.how_many().await, 1);

    let (_, body) = post(&client, &base, json!({ "command": "config" })).await?;
    let live_config = body["config"].clone();
    assert!(live_config.is_object());

    // Directory goes down; the session and cached facts keep serving.
    backend.set_failing(true);

    let (headers, body) = post(&client, &base, json!({ "command": "id" })).await?;
    assert!(headers.get(reqwest::header::SET_COOKIE).is_none());
    assert_eq!(body["status"], "ok");
    assert_eq!(body["agent_id"], 7);
    assert_eq!(body["state"], "active");
    assert!(!state.directory.is_connected());

    let (_, body) = post(&client, &base, json!({ "command": "config" })).await?;
    assert_eq!(body["config"], live_config);

    let (_, body) = post(&client, &base, json!({ "command": "upload" })).await?;
    assert_eq!(body["upload"], Value::Null);
    assert_eq!(state.sessions.how_many().await, 1);

    // Directory recovers with a changed status; the next query answers live
    // and refreshes the cache.
    backend
        .set_status(
            key.clone(),
            AgentStatus {
                state: AgentState::Queued,
                agent_id: 7,
            },
        )
        .await;
    backend.set_failing(false);

    let (_, body) = post(&client, &base, json!({ "command": "id" })).await?;
    assert_eq!(body["state"], "queued");
    assert!(state.directory.is_connected());
    assert_eq!(
        state.directory.cache().status(&key).await.map(|status| status.state),
        Some(AgentState::Queued)
    );

    server.close().await?;
    Ok(())
}

#[tokio::test]
async fn unknown_agents_are_answered_not_dropped_during_an_outage() -> Result<()> {
    let backend = Arc::new(MemoryDirectoryBackend::new());
    backend.set_failing(true);
    let state = build_collector_state_with_backend(Config::default(), backend.clone());
    assert!(!state.directory.cache_init().await);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let server = spawn_server(listener, build_router(state.clone()), Duration::from_secs(5))?;
    let base = format!("http://{}", server.local_addr);
    let client = reqwest::Client::new();

    let (headers, body) = post(
        &client,
        &base,
        json!({
            "command": "auth",
            "build_id": "BUILD404",
            "instance_id": "instance-9",
            "subtype": "WIN32",
            "proof": "00",
        }),
    )
    .await?;
    assert!(headers.get(reqwest::header::SET_COOKIE).is_none());
    assert_eq!(body["status"], "error");
    assert_eq!(body["code"], "unknown_build");
    assert_eq!(state.sessions.how_many().await, 0);

    server.close().await?;
    Ok(())
}
