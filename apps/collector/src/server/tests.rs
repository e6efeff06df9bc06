use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{Notify, mpsc};
use tower::ServiceExt;

use super::listener::{CollectorServer, spawn_server};
use super::{CollectorState, build_router, wants_keep_alive};
use crate::cache::DirectoryCache;
use crate::config::Config;
use crate::directory::DirectoryClient;
use crate::directory::memory::MemoryDirectoryBackend;
use crate::directory::resilient::ResilientDirectory;
use crate::directory::types::Credentials;
use crate::protocol::{AgentProtocol, AgentReply, AgentRequest, ProtocolError};
use crate::sessions::SessionManager;

/// Echoes what the server handed over; `login` bodies issue a token.
struct EchoProtocol;

#[async_trait]
impl AgentProtocol for EchoProtocol {
    async fn handle(&self, request: AgentRequest) -> Result<AgentReply, ProtocolError> {
        match request.body.as_ref() {
            b"refuse" => return Err(ProtocolError::SessionNotFound),
            b"explode" => panic!("protocol bug"),
            _ => {}
        }
        let reply = AgentReply {
            body: json!({
                "method": request.method.as_str(),
                "path": request.uri.path(),
                "token": request.session_token,
                "body_len": request.body.len(),
            })
            .to_string()
            .into_bytes(),
            content_type: "application/x-agent".to_string(),
            session_token: None,
        };
        if request.body.as_ref() == b"login" {
            return Ok(reply.with_session_token("fresh-token".to_string()));
        }
        Ok(reply)
    }
}

/// Holds every request until released, reporting when it has started.
struct GatedProtocol {
    started: mpsc::UnboundedSender<()>,
    release: Arc<Notify>,
}

#[async_trait]
impl AgentProtocol for GatedProtocol {
    async fn handle(&self, _request: AgentRequest) -> Result<AgentReply, ProtocolError> {
        let _ = self.started.send(());
        self.release.notified().await;
        Ok(AgentReply::json(&json!({ "status": "ok" })))
    }
}

fn test_config() -> Config {
    Config {
        max_body_bytes: 64,
        connection_inactivity_timeout_seconds: 1,
        ..Config::default()
    }
}

fn test_state(config: Config, protocol: Arc<dyn AgentProtocol>) -> CollectorState {
    let backend = Arc::new(MemoryDirectoryBackend::new());
    let client = Arc::new(DirectoryClient::new(backend, Credentials::default()));
    let directory = Arc::new(ResilientDirectory::new(
        client,
        Arc::new(DirectoryCache::new()),
    ));
    CollectorState::new(config, directory, Arc::new(SessionManager::new()), protocol)
}

fn echo_router() -> axum::Router {
    build_router(test_state(test_config(), Arc::new(EchoProtocol)))
}

async fn body_json(response: axum::response::Response) -> Result<Value> {
    let bytes = response.into_body().collect().await?.to_bytes();
    Ok(serde_json::from_slice(&bytes)?)
}

async fn spawn_echo_server() -> Result<CollectorServer> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    Ok(spawn_server(
        listener,
        echo_router(),
        Duration::from_secs(1),
    )?)
}

/// Reads one HTTP/1.1 response with a `content-length` body.
async fn read_response(stream: &mut TcpStream) -> Result<String> {
    let mut buffer = Vec::new();
    let mut chunk = [0_u8; 1024];
    loop {
        let head_end = buffer.windows(4).position(|window| window == b"\r\n\r\n");
        if let Some(head_end) = head_end {
            let head = String::from_utf8_lossy(&buffer[..head_end]).to_ascii_lowercase();
            let length = head
                .lines()
                .find_map(|line| line.strip_prefix("content-length:"))
                .and_then(|value| value.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buffer.len() >= head_end + 4 + length {
                return Ok(String::from_utf8_lossy(&buffer[..head_end + 4 + length]).to_string());
            }
        }
        let read = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut chunk)).await??;
        if read == 0 {
            return Err(anyhow!("connection closed before a full response"));
        }
        buffer.extend_from_slice(&chunk[..read]);
    }
}

#[tokio::test]
async fn any_method_and_path_reach_the_protocol() -> Result<()> {
    let app = echo_router();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri("/some/agent/path?x=1")
                .body(Body::from("payload"))?,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE),
        Some(&header::HeaderValue::from_static("application/x-agent"))
    );
    let body = body_json(response).await?;
    assert_eq!(body["method"], "PUT");
    assert_eq!(body["path"], "/some/agent/path");
    assert_eq!(body["body_len"], 7);

    let response = app
        .oneshot(Request::builder().uri("/").body(Body::empty())?)
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn cookie_name_is_stripped_before_the_protocol_sees_it() -> Result<()> {
    let response = echo_router()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/")
                .header(header::COOKIE, "ID=abc123")
                .body(Body::from("hello"))?,
        )
        .await?;
    assert!(response.headers().get(header::SET_COOKIE).is_none());
    assert_eq!(body_json(response).await?["token"], "abc123");
    Ok(())
}

#[tokio::test]
async fn new_sessions_set_the_id_cookie() -> Result<()> {
    let response = echo_router()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/")
                .body(Body::from("login"))?,
        )
        .await?;
    assert_eq!(
        response.headers().get(header::SET_COOKIE),
        Some(&header::HeaderValue::from_static("ID=fresh-token"))
    );
    Ok(())
}

#[tokio::test]
async fn protocol_failures_still_answer_200() -> Result<()> {
    let app = echo_router();

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/")
                .body(Body::from("refuse"))?,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await?["code"], "session_not_found");

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/")
                .body(Body::from("explode"))?,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await?["code"], "internal_error");
    Ok(())
}

#[tokio::test]
async fn oversized_bodies_are_rejected_and_close_the_connection() -> Result<()> {
    let response = echo_router()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/")
                .body(Body::from(vec![b'x'; 65]))?,
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONNECTION),
        Some(&header::HeaderValue::from_static("close"))
    );
    assert_eq!(body_json(response).await?["code"], "malformed_request");
    Ok(())
}

#[test]
fn keep_alive_is_detected_case_insensitively() {
    let mut headers = axum::http::HeaderMap::new();
    assert!(!wants_keep_alive(&headers));
    headers.insert(header::CONNECTION, "Upgrade, Keep-Alive".parse().expect("header"));
    assert!(wants_keep_alive(&headers));
    headers.insert(header::CONNECTION, "close".parse().expect("header"));
    assert!(!wants_keep_alive(&headers));
}

#[tokio::test]
async fn keep_alive_connections_serve_several_requests() -> Result<()> {
    let server = spawn_echo_server().await?;
    let mut stream = TcpStream::connect(server.local_addr).await?;

    for _ in 0..2 {
        stream
            .write_all(
                b"POST /checkin HTTP/1.1\r\nHost: collector\r\nConnection: keep-alive\r\nCookie: ID=tok\r\nContent-Length: 2\r\n\r\nhi",
            )
            .await?;
        let response = read_response(&mut stream).await?.to_ascii_lowercase();
        assert!(response.starts_with("http/1.1 200"));
        assert!(response.contains("connection: keep-alive"));
        assert!(response.contains("\"token\":\"tok\""));
    }

    server.close().await?;
    Ok(())
}

#[tokio::test]
async fn requests_without_keep_alive_close_after_the_response() -> Result<()> {
    let server = spawn_echo_server().await?;
    let mut stream = TcpStream::connect(server.local_addr).await?;

    stream
        .write_all(b"POST / HTTP/1.1\r\nHost: collector\r\nContent-Length: 2\r\n\r\nhi")
        .await?;
    let response = read_response(&mut stream).await?.to_ascii_lowercase();
    assert!(response.starts_with("http/1.1 200"));
    assert!(response.contains("connection: close"));

    let mut rest = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut rest)).await?;
    assert_eq!(read?, 0);

    server.close().await?;
    Ok(())
}

#[tokio::test]
async fn stalled_connections_are_closed_after_the_inactivity_timeout() -> Result<()> {
    let server = spawn_echo_server().await?;
    let mut stream = TcpStream::connect(server.local_addr).await?;
    stream.write_all(b"POST / HTTP/1.1\r\nHost: coll").await?;

    let mut rest = Vec::new();
    let ended = tokio::time::timeout(Duration::from_secs(5), stream.read_to_end(&mut rest)).await;
    assert!(ended.is_ok(), "connection should be closed by the server");

    server.close().await?;
    Ok(())
}

#[tokio::test]
async fn worker_pool_bounds_concurrent_processing() -> Result<()> {
    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    let release = Arc::new(Notify::new());
    let config = Config {
        worker_pool_size: 1,
        ..test_config()
    };
    let state = test_state(
        config,
        Arc::new(GatedProtocol {
            started: started_tx,
            release: release.clone(),
        }),
    );
    let app = build_router(state.clone());
    assert_eq!(state.idle_workers(), 1);

    let mut requests = Vec::new();
    for _ in 0..2 {
        let app = app.clone();
        requests.push(tokio::spawn(async move {
            app.oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/")
                    .body(Body::from("{}"))
                    .expect("request"),
            )
            .await
        }));
    }

    started_rx.recv().await.ok_or_else(|| anyhow!("first request never started"))?;
    assert_eq!(state.idle_workers(), 0);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(started_rx.try_recv().is_err(), "second request must wait for a worker");

    release.notify_one();
    started_rx.recv().await.ok_or_else(|| anyhow!("second request never started"))?;
    release.notify_one();

    for request in requests {
        let response = request.await??;
        assert_eq!(response.status(), StatusCode::OK);
    }
    assert_eq!(state.idle_workers(), 1);
    Ok(())
}

#[tokio::test]
async fn requests_slower_than_the_inactivity_timeout_still_answer_200() -> Result<()> {
    let (started_tx, mut started_rx) = mpsc::unbounded_channel();
    let release = Arc::new(Notify::new());
    let app = build_router(test_state(
        test_config(),
        Arc::new(GatedProtocol {
            started: started_tx,
            release: release.clone(),
        }),
    ));

    let request = tokio::spawn(app.oneshot(
        Request::builder()
            .method("POST")
            .uri("/")
            .header(header::CONNECTION, "keep-alive")
            .body(Body::from("{}"))?,
    ));
    started_rx.recv().await.ok_or_else(|| anyhow!("request never started"))?;
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    release.notify_one();

    let response = request.await??;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE),
        Some(&header::HeaderValue::from_static("application/json"))
    );
    assert_eq!(
        response.headers().get(header::CONNECTION),
        Some(&header::HeaderValue::from_static("keep-alive"))
    );
    assert_eq!(body_json(response).await?["status"], "ok");
    Ok(())
}

#[tokio::test]
async fn stalled_bodies_get_a_malformed_reply_and_close() -> Result<()> {
    let server = spawn_echo_server().await?;
    let mut stream = TcpStream::connect(server.local_addr).await?;
    stream
        .write_all(
            b"POST / HTTP/1.1\r\nHost: collector\r\nConnection: keep-alive\r\nContent-Length: 10\r\n\r\nhi",
        )
        .await?;

    let response = read_response(&mut stream).await?.to_ascii_lowercase();
    assert!(response.starts_with("http/1.1 200"));
    assert!(response.contains("connection: close"));
    assert!(response.contains("content-type: application/json"));
    assert!(response.contains("malformed_request"));

    server.close().await?;
    Ok(())
}
