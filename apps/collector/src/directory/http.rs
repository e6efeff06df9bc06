use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::directory::types::{
    AgentConfig, AgentStatus, Credentials, DownloadItem, FilesystemRule, StatusKey, StatusReport,
    UploadItem,
};
use crate::directory::{BackendError, DirectoryBackend};

/// JSON-over-HTTP client for the authoritative directory.
///
/// `login` obtains a session token that is sent as a bearer token on every
/// later call; `logout` drops it.
pub struct HttpDirectoryBackend {
    base_url: String,
    http: reqwest::Client,
    session_token: Mutex<Option<String>>,
}

impl HttpDirectoryBackend {
    pub fn new(base_url: impl Into<String>, timeout_ms: u64) -> Result<Self, BackendError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(|error| BackendError::Transport(error.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
            session_token: Mutex::new(None),
        })
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<reqwest::Response, BackendError> {
        let mut request = self
            .http
            .request(method, format!("{}{}", self.base_url, path));
        if let Some(token) = self.session_token.lock().await.as_deref() {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request
            .send()
            .await
            .map_err(|error| BackendError::Transport(error.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(BackendError::Remote {
            status: status.as_u16(),
            message,
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, BackendError> {
        let response = self.send(Method::GET, path, None).await?;
        decode(response).await
    }

    async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, BackendError> {
        let body = serde_json::to_value(body)
            .map_err(|error| BackendError::Decode(error.to_string()))?;
        let response = self.send(Method::POST, path, Some(body)).await?;
        decode(response).await
    }

    async fn delete(&self, path: &str) -> Result<(), BackendError> {
        self.send(Method::DELETE, path, None).await.map(|_| ())
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, BackendError> {
    response
        .json::<T>()
        .await
        .map_err(|error| BackendError::Decode(error.to_string()))
}

fn decode_bytes(field: &str, value: &str) -> Result<Vec<u8>, BackendError> {
    BASE64
        .decode(value)
        .map_err(|error| BackendError::Decode(format!("{field}: {error}")))
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    user: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct LoginResponse {
    token: String,
}

#[derive(Deserialize)]
struct SignatureResponse {
    value: String,
}

#[derive(Deserialize)]
struct ClassKeysResponse {
    keys: HashMap<String, String>,
}

#[derive(Deserialize)]
struct ConfigResponse {
    config: Option<WireConfig>,
}

#[derive(Deserialize)]
struct WireConfig {
    config_id: u64,
    content: String,
}

#[derive(Deserialize)]
struct ItemsResponse<T> {
    items: Vec<T>,
}

#[derive(Deserialize)]
struct WireUpload {
    id: u64,
    filename: String,
    content: String,
}

#[derive(Deserialize)]
struct Ack {}

#[async_trait]
impl DirectoryBackend for HttpDirectoryBackend {
    async fn login(&self, credentials: &Credentials) -> Result<(), BackendError> {
        let body = LoginRequest {
            user: credentials.user.as_str(),
            password: credentials.password.as_str(),
        };
        let response: LoginResponse = match self.post_json("/auth/login", &body).await {
            Ok(response) => response,
            Err(BackendError::Remote { status, .. })
                if status == StatusCode::UNAUTHORIZED.as_u16()
                    || status == StatusCode::FORBIDDEN.as_u16() =>
            {
                return Err(BackendError::LoginRejected);
            }
            Err(error) => return Err(error),
        };
        *self.session_token.lock().await = Some(response.token);
        Ok(())
    }

    async fn logout(&self) -> Result<(), BackendError> {
        let result = self.send(Method::POST, "/auth/logout", None).await;
        *self.session_token.lock().await = None;
        result.map(|_| ())
    }

    async fn signature(&self) -> Result<Vec<u8>, BackendError> {
        let response: SignatureResponse = self.get_json("/signature").await?;
        decode_bytes("signature", &response.value)
    }

    async fn class_keys(&self) -> Result<HashMap<String, Vec<u8>>, BackendError> {
        let response: ClassKeysResponse = self.get_json("/builds/keys").await?;
        response
            .keys
            .into_iter()
            .map(|(build_id, key)| {
                let key = decode_bytes("class key", &key)?;
                Ok((build_id, key))
            })
            .collect()
    }

    async fn status_of(&self, key: &StatusKey) -> Result<AgentStatus, BackendError> {
        self.post_json("/agents/status", key).await
    }

    async fn new_config(&self, agent_id: u64) -> Result<Option<AgentConfig>, BackendError> {
        let response: ConfigResponse = self
            .get_json(&format!("/agents/{agent_id}/config"))
            .await?;
        response
            .config
            .map(|config| {
                Ok(AgentConfig {
                    config_id: config.config_id,
                    content: decode_bytes("config", &config.content)?,
                })
            })
            .transpose()
    }

    async fn uploads(&self, agent_id: u64) -> Result<Vec<UploadItem>, BackendError> {
        let response: ItemsResponse<WireUpload> = self
            .get_json(&format!("/agents/{agent_id}/uploads"))
            .await?;
        response
            .items
            .into_iter()
            .map(|upload| {
                Ok(UploadItem {
                    id: upload.id,
                    filename: upload.filename,
                    content: decode_bytes("upload", &upload.content)?,
                })
            })
            .collect()
    }

    async fn delete_upload(&self, agent_id: u64, upload_id: u64) -> Result<(), BackendError> {
        self.delete(&format!("/agents/{agent_id}/uploads/{upload_id}"))
            .await
    }

    async fn downloads(&self, agent_id: u64) -> Result<Vec<DownloadItem>, BackendError> {
        let response: ItemsResponse<DownloadItem> = self
            .get_json(&format!("/agents/{agent_id}/downloads"))
            .await?;
        Ok(response.items)
    }

    async fn delete_download(&self, agent_id: u64, download_id: u64) -> Result<(), BackendError> {
        self.delete(&format!("/agents/{agent_id}/downloads/{download_id}"))
            .await
    }

    async fn filesystem_rules(&self, agent_id: u64) -> Result<Vec<FilesystemRule>, BackendError> {
        let response: ItemsResponse<FilesystemRule> = self
            .get_json(&format!("/agents/{agent_id}/filesystems"))
            .await?;
        Ok(response.items)
    }

    async fn delete_filesystem_rule(
        &self,
        agent_id: u64,
        rule_id: u64,
    ) -> Result<(), BackendError> {
        self.delete(&format!("/agents/{agent_id}/filesystems/{rule_id}"))
            .await
    }

    async fn report_status(&self, report: &StatusReport) -> Result<(), BackendError> {
        let _: Ack = self.post_json("/status", report).await?;
        Ok(())
    }
}
