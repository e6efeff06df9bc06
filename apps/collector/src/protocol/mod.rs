//! Seam between the connection server and the agent wire protocol.
//!
//! The server only threads bytes, headers and the session cookie through an
//! [`AgentProtocol`]; everything agent-specific lives behind it.

use std::net::SocketAddr;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::{HeaderMap, Method, Uri, header};
use serde_json::json;

pub mod checkin;

pub const SESSION_COOKIE_NAME: &str = "ID";

#[derive(Clone, Debug)]
pub struct AgentRequest {
    pub peer: SocketAddr,
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    /// Raw session token with the cookie name already stripped.
    pub session_token: Option<String>,
    pub body: Bytes,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentReply {
    pub body: Vec<u8>,
    pub content_type: String,
    /// Set only when this request authenticated a new session.
    pub session_token: Option<String>,
}

impl AgentReply {
    pub fn json(value: &serde_json::Value) -> Self {
        Self {
            body: value.to_string().into_bytes(),
            content_type: "application/json".to_string(),
            session_token: None,
        }
    }

    pub fn with_session_token(mut self, token: String) -> Self {
        self.session_token = Some(token);
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed request: {0}")]
    MalformedRequest(String),
    #[error("session not found")]
    SessionNotFound,
    #[error("unknown build: {0}")]
    UnknownBuild(String),
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("internal protocol error: {0}")]
    Internal(String),
}

impl ProtocolError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::MalformedRequest(_) => "malformed_request",
            Self::SessionNotFound => "session_not_found",
            Self::UnknownBuild(_) => "unknown_build",
            Self::AuthenticationFailed(_) => "authentication_failed",
            Self::Internal(_) => "internal_error",
        }
    }

    /// Best-effort reply the agent can parse and retry on.
    pub fn to_reply(&self) -> AgentReply {
        AgentReply::json(&json!({
            "status": "error",
            "code": self.code(),
            "message": self.to_string(),
        }))
    }
}

#[async_trait]
pub trait AgentProtocol: Send + Sync {
    async fn handle(&self, request: AgentRequest) -> Result<AgentReply, ProtocolError>;
}

/// Extracts the session token from the `Cookie` headers without touching them.
///
/// Empty values count as no token.
pub fn session_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            (name.trim() == SESSION_COOKIE_NAME).then(|| value.trim().to_string())
        })
        .find(|token| !token.is_empty())
}

/// `Set-Cookie` value carrying a freshly issued token.
pub fn session_cookie(token: &str) -> String {
    format!("{SESSION_COOKIE_NAME}={token}")
}
