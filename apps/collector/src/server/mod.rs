use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, header};
use axum::response::Response;
use tokio::sync::Semaphore;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::directory::BackendError;
use crate::directory::resilient::ResilientDirectory;
use crate::protocol::{AgentProtocol, AgentReply, AgentRequest, ProtocolError, session_cookie};
use crate::sessions::SessionManager;

pub mod listener;

#[cfg(test)]
mod tests;

#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("listener i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("directory backend setup failed: {0}")]
    Directory(#[from] BackendError),
}

/// Components shared by every request, constructed once per process.
#[derive(Clone)]
pub struct CollectorState {
    pub config: Arc<Config>,
    pub directory: Arc<ResilientDirectory>,
    pub sessions: Arc<SessionManager>,
    pub protocol: Arc<dyn AgentProtocol>,
    workers: Arc<Semaphore>,
}

impl CollectorState {
    pub fn new(
        config: Config,
        directory: Arc<ResilientDirectory>,
        sessions: Arc<SessionManager>,
        protocol: Arc<dyn AgentProtocol>,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(config.worker_pool_size));
        Self {
            config: Arc::new(config),
            directory,
            sessions,
            protocol,
            workers,
        }
    }

    /// Worker slots not currently running a request.
    pub fn idle_workers(&self) -> usize {
        self.workers.available_permits()
    }
}

/// Every method and path goes to the agent protocol.
///
/// Only the body read is bounded in time. Waiting for a worker and protocol
/// processing are not, so a slow request is still answered with a 200.
pub fn build_router(state: CollectorState) -> Router {
    Router::new()
        .fallback(handle_agent_request)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_agent_request(
    State(state): State<CollectorState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let started = Instant::now();
    let peer = connect_info.map_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)), |info| info.0);
    let keep_alive = wants_keep_alive(&headers);

    let body = match read_body(&state.config, body).await {
        Ok(body) => body,
        Err(reason) => {
            tracing::warn!(peer = %peer, reason = %reason, "agent request body rejected");
            // The unread remainder of the body makes the connection unusable.
            return agent_response(ProtocolError::MalformedRequest(reason).to_reply(), false);
        }
    };

    let request = AgentRequest {
        peer,
        method: method.clone(),
        uri: uri.clone(),
        session_token: crate::protocol::session_token(&headers),
        headers,
        body,
    };
    let reply = run_on_worker(&state, request).await;

    tracing::info!(
        peer = %peer,
        method = %method,
        uri = %uri,
        keep_alive,
        new_session = reply.session_token.is_some(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "agent request served"
    );
    agent_response(reply, keep_alive)
}

async fn read_body(config: &Config, body: Body) -> Result<Bytes, String> {
    let limit = config.max_body_bytes;
    match tokio::time::timeout(
        config.connection_inactivity_timeout(),
        axum::body::to_bytes(body, limit),
    )
    .await
    {
        Ok(Ok(bytes)) => Ok(bytes),
        Ok(Err(error)) => Err(format!("request body unreadable or over {limit} bytes: {error}")),
        Err(_) => Err("request body stalled past the inactivity timeout".to_string()),
    }
}

// Processing runs on its own task so a panic or a slow directory call never
// reaches the connection task. The permit bounds concurrent processing.
async fn run_on_worker(state: &CollectorState, request: AgentRequest) -> AgentReply {
    let permit = match state.workers.clone().acquire_owned().await {
        Ok(permit) => permit,
        Err(error) => {
            tracing::error!(reason = %error, "worker pool closed");
            return ProtocolError::Internal("worker pool unavailable".to_string()).to_reply();
        }
    };
    let protocol = state.protocol.clone();
    let peer = request.peer;
    let task = tokio::spawn(async move {
        let _permit = permit;
        protocol.handle(request).await
    });

    match task.await {
        Ok(Ok(reply)) => reply,
        Ok(Err(error)) => {
            tracing::warn!(peer = %peer, code = error.code(), reason = %error, "agent request refused");
            error.to_reply()
        }
        Err(error) => {
            tracing::error!(peer = %peer, reason = %error, "agent request processing failed");
            ProtocolError::Internal("request processing failed".to_string()).to_reply()
        }
    }
}

pub(crate) fn wants_keep_alive(headers: &HeaderMap) -> bool {
    headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("keep-alive"))
}

fn agent_response(reply: AgentReply, keep_alive: bool) -> Response {
    let mut response = Response::new(Body::from(reply.body));
    *response.status_mut() = StatusCode::OK;
    let headers = response.headers_mut();

    let content_type = HeaderValue::from_str(&reply.content_type)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
    headers.insert(header::CONTENT_TYPE, content_type);

    if let Some(token) = reply.session_token {
        match HeaderValue::from_str(&session_cookie(&token)) {
            Ok(cookie) => {
                headers.insert(header::SET_COOKIE, cookie);
            }
            Err(error) => {
                tracing::error!(reason = %error, "session token is not a valid cookie value");
            }
        }
    }

    headers.insert(
        header::CONNECTION,
        HeaderValue::from_static(if keep_alive { "keep-alive" } else { "close" }),
    );
    response
}
