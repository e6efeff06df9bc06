//! Access to the authoritative agent directory.
//!
//! [`DirectoryClient`] owns the single logical connection to the backend and
//! maps every remote call 1:1. It has a partial contract: calls fail with
//! [`DirectoryError`] and a failure drops the connection flag.
//! [`resilient::ResilientDirectory`] sits on top and never fails outward.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use crate::directory::types::{
    AgentConfig, AgentStatus, Credentials, DownloadItem, FilesystemRule, StatusKey, StatusReport,
    UploadItem,
};

pub mod http;
pub mod memory;
pub mod resilient;
pub mod types;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("remote error ({status}): {message}")]
    Remote { status: u16, message: String },
    #[error("decode error: {0}")]
    Decode(String),
    #[error("login rejected")]
    LoginRejected,
}

/// Raw remote operations exposed by the authoritative directory.
///
/// Implementations are free to fail on any call; the caller decides how to
/// degrade.
#[async_trait]
pub trait DirectoryBackend: Send + Sync {
    async fn login(&self, credentials: &Credentials) -> Result<(), BackendError>;

    async fn logout(&self) -> Result<(), BackendError>;

    async fn signature(&self) -> Result<Vec<u8>, BackendError>;

    /// Every known build id mapped to its class key.
    async fn class_keys(&self) -> Result<HashMap<String, Vec<u8>>, BackendError>;

    async fn status_of(&self, key: &StatusKey) -> Result<AgentStatus, BackendError>;

    async fn new_config(&self, agent_id: u64) -> Result<Option<AgentConfig>, BackendError>;

    /// Pending uploads ordered by ascending id.
    async fn uploads(&self, agent_id: u64) -> Result<Vec<UploadItem>, BackendError>;

    async fn delete_upload(&self, agent_id: u64, upload_id: u64) -> Result<(), BackendError>;

    async fn downloads(&self, agent_id: u64) -> Result<Vec<DownloadItem>, BackendError>;

    async fn delete_download(&self, agent_id: u64, download_id: u64) -> Result<(), BackendError>;

    async fn filesystem_rules(&self, agent_id: u64) -> Result<Vec<FilesystemRule>, BackendError>;

    async fn delete_filesystem_rule(
        &self,
        agent_id: u64,
        rule_id: u64,
    ) -> Result<(), BackendError>;

    async fn report_status(&self, report: &StatusReport) -> Result<(), BackendError>;
}

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("directory unavailable: not connected (operation {operation})")]
    Disconnected { operation: &'static str },
    #[error("directory unavailable: {operation} failed: {source}")]
    Backend {
        operation: &'static str,
        #[source]
        source: BackendError,
    },
}

pub struct DirectoryClient {
    backend: Arc<dyn DirectoryBackend>,
    credentials: Credentials,
    connected: AtomicBool,
}

impl DirectoryClient {
    /// Starts disconnected; the first [`connect`](Self::connect) performs the login.
    pub fn new(backend: Arc<dyn DirectoryBackend>, credentials: Credentials) -> Self {
        Self {
            backend,
            credentials,
            connected: AtomicBool::new(false),
        }
    }

    /// Attempts a backend login. Failure is a state transition, never an error.
    pub async fn connect(&self) -> bool {
        match self.backend.login(&self.credentials).await {
            Ok(()) => {
                if !self.connected.swap(true, Ordering::SeqCst) {
                    tracing::info!("directory connection established");
                }
                true
            }
            Err(error) => {
                self.connected.store(false, Ordering::SeqCst);
                tracing::warn!(reason = %error, "directory connection failed");
                false
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub async fn disconnect(&self) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Err(error) = self.backend.logout().await {
            tracing::debug!(reason = %error, "directory logout failed");
        }
        tracing::info!("directory connection closed");
    }

    pub async fn signature(&self) -> Result<Vec<u8>, DirectoryError> {
        self.guarded("signature", self.backend.signature()).await
    }

    pub async fn class_keys(&self) -> Result<HashMap<String, Vec<u8>>, DirectoryError> {
        self.guarded("class_keys", self.backend.class_keys()).await
    }

    pub async fn status_of(&self, key: &StatusKey) -> Result<AgentStatus, DirectoryError> {
        self.guarded("status_of", self.backend.status_of(key)).await
    }

    pub async fn new_config(&self, agent_id: u64) -> Result<Option<AgentConfig>, DirectoryError> {
        self.guarded("new_config", self.backend.new_config(agent_id))
            .await
    }

    pub async fn uploads(&self, agent_id: u64) -> Result<Vec<UploadItem>, DirectoryError> {
        self.guarded("uploads", self.backend.uploads(agent_id)).await
    }

    pub async fn delete_upload(&self, agent_id: u64, upload_id: u64) -> Result<(), DirectoryError> {
        self.guarded(
            "delete_upload",
            self.backend.delete_upload(agent_id, upload_id),
        )
        .await
    }

    pub async fn downloads(&self, agent_id: u64) -> Result<Vec<DownloadItem>, DirectoryError> {
        self.guarded("downloads", self.backend.downloads(agent_id))
            .await
    }

    pub async fn delete_download(
        &self,
        agent_id: u64,
        download_id: u64,
    ) -> Result<(), DirectoryError> {
        self.guarded(
            "delete_download",
            self.backend.delete_download(agent_id, download_id),
        )
        .await
    }

    pub async fn filesystem_rules(
        &self,
        agent_id: u64,
    ) -> Result<Vec<FilesystemRule>, DirectoryError> {
        self.guarded("filesystem_rules", self.backend.filesystem_rules(agent_id))
            .await
    }

    pub async fn delete_filesystem_rule(
        &self,
        agent_id: u64,
        rule_id: u64,
    ) -> Result<(), DirectoryError> {
        self.guarded(
            "delete_filesystem_rule",
            self.backend.delete_filesystem_rule(agent_id, rule_id),
        )
        .await
    }

    pub async fn report_status(&self, report: &StatusReport) -> Result<(), DirectoryError> {
        self.guarded("report_status", self.backend.report_status(report))
            .await
    }

    // The call future is lazy, so nothing reaches the backend while disconnected.
    async fn guarded<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = Result<T, BackendError>>,
    ) -> Result<T, DirectoryError> {
        if !self.is_connected() {
            return Err(DirectoryError::Disconnected { operation });
        }
        match call.await {
            Ok(value) => Ok(value),
            Err(source) => {
                if self.connected.swap(false, Ordering::SeqCst) {
                    tracing::warn!(
                        operation,
                        reason = %source,
                        "directory call failed, switching to degraded mode"
                    );
                }
                Err(DirectoryError::Backend { operation, source })
            }
        }
    }
}
