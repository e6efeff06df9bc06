use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::directory::types::{
    AgentConfig, AgentStatus, Credentials, DownloadItem, FilesystemRule, StatusKey, StatusReport,
    UploadItem,
};
use crate::directory::{BackendError, DirectoryBackend};

/// Status reports kept for inspection; older ones are discarded.
pub const RETAINED_REPORTS: usize = 256;

/// In-process directory used when no backend URL is configured and as the
/// controllable fake in tests. [`set_failing`](Self::set_failing) makes every
/// call fail as if the backend were unreachable.
#[derive(Default)]
pub struct MemoryDirectoryBackend {
    inner: Mutex<MemoryDirectoryInner>,
    failing: AtomicBool,
    remote_calls: AtomicU64,
    next_item_id: AtomicU64,
}

#[derive(Default)]
struct MemoryDirectoryInner {
    signature: Vec<u8>,
    class_keys: HashMap<String, Vec<u8>>,
    statuses: HashMap<StatusKey, AgentStatus>,
    configs: HashMap<u64, AgentConfig>,
    uploads: HashMap<u64, BTreeMap<u64, UploadItem>>,
    downloads: HashMap<u64, BTreeMap<u64, DownloadItem>>,
    filesystem_rules: HashMap<u64, BTreeMap<u64, FilesystemRule>>,
    reports: VecDeque<StatusReport>,
}

impl MemoryDirectoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of calls that reached this backend, failed ones included.
    pub fn remote_calls(&self) -> u64 {
        self.remote_calls.load(Ordering::SeqCst)
    }

    pub async fn set_signature(&self, signature: &[u8]) {
        self.inner.lock().await.signature = signature.to_vec();
    }

    pub async fn set_class_key(&self, build_id: &str, class_key: &[u8]) {
        self.inner
            .lock()
            .await
            .class_keys
            .insert(build_id.to_string(), class_key.to_vec());
    }

    pub async fn set_status(&self, key: StatusKey, status: AgentStatus) {
        self.inner.lock().await.statuses.insert(key, status);
    }

    pub async fn set_config(&self, agent_id: u64, content: &[u8]) -> u64 {
        let config_id = self.allocate_id();
        self.inner.lock().await.configs.insert(
            agent_id,
            AgentConfig {
                config_id,
                content: content.to_vec(),
            },
        );
        config_id
    }

    pub async fn push_upload(&self, agent_id: u64, filename: &str, content: &[u8]) -> u64 {
        let id = self.allocate_id();
        self.inner
            .lock()
            .await
            .uploads
            .entry(agent_id)
            .or_default()
            .insert(
                id,
                UploadItem {
                    id,
                    filename: filename.to_string(),
                    content: content.to_vec(),
                },
            );
        id
    }

    pub async fn push_download(&self, agent_id: u64, pattern: &str) -> u64 {
        let id = self.allocate_id();
        self.inner
            .lock()
            .await
            .downloads
            .entry(agent_id)
            .or_default()
            .insert(
                id,
                DownloadItem {
                    id,
                    pattern: pattern.to_string(),
                },
            );
        id
    }

    pub async fn push_filesystem_rule(&self, agent_id: u64, path: &str, depth: u32) -> u64 {
        let id = self.allocate_id();
        self.inner
            .lock()
            .await
            .filesystem_rules
            .entry(agent_id)
            .or_default()
            .insert(
                id,
                FilesystemRule {
                    id,
                    path: path.to_string(),
                    depth,
                },
            );
        id
    }

    pub async fn pending_uploads(&self, agent_id: u64) -> usize {
        self.inner
            .lock()
            .await
            .uploads
            .get(&agent_id)
            .map_or(0, BTreeMap::len)
    }

    /// The most recent delivered reports, oldest first.
    pub async fn reports(&self) -> Vec<StatusReport> {
        self.inner.lock().await.reports.iter().cloned().collect()
    }

    fn allocate_id(&self) -> u64 {
        self.next_item_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn reach(&self) -> Result<(), BackendError> {
        self.remote_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(BackendError::Transport("directory unreachable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl DirectoryBackend for MemoryDirectoryBackend {
    async fn login(&self, _credentials: &Credentials) -> Result<(), BackendError> {
        self.reach()
    }

    async fn logout(&self) -> Result<(), BackendError> {
        self.reach()
    }

    async fn signature(&self) -> Result<Vec<u8>, BackendError> {
        self.reach()?;
        Ok(self.inner.lock().await.signature.clone())
    }

    async fn class_keys(&self) -> Result<HashMap<String, Vec<u8>>, BackendError> {
        self.reach()?;
        Ok(self.inner.lock().await.class_keys.clone())
    }

    async fn status_of(&self, key: &StatusKey) -> Result<AgentStatus, BackendError> {
        self.reach()?;
        Ok(self
            .inner
            .lock()
            .await
            .statuses
            .get(key)
            .copied()
            .unwrap_or(AgentStatus::UNKNOWN))
    }

    async fn new_config(&self, agent_id: u64) -> Result<Option<AgentConfig>, BackendError> {
        self.reach()?;
        Ok(self.inner.lock().await.configs.get(&agent_id).cloned())
    }

    async fn uploads(&self, agent_id: u64) -> Result<Vec<UploadItem>, BackendError> {
        self.reach()?;
        Ok(self
            .inner
            .lock()
            .await
            .uploads
            .get(&agent_id)
            .map(|items| items.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete_upload(&self, agent_id: u64, upload_id: u64) -> Result<(), BackendError> {
        self.reach()?;
        if let Some(items) = self.inner.lock().await.uploads.get_mut(&agent_id) {
            items.remove(&upload_id);
        }
        Ok(())
    }

    async fn downloads(&self, agent_id: u64) -> Result<Vec<DownloadItem>, BackendError> {
        self.reach()?;
        Ok(self
            .inner
            .lock()
            .await
            .downloads
            .get(&agent_id)
            .map(|items| items.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete_download(&self, agent_id: u64, download_id: u64) -> Result<(), BackendError> {
        self.reach()?;
        if let Some(items) = self.inner.lock().await.downloads.get_mut(&agent_id) {
            items.remove(&download_id);
        }
        Ok(())
    }

    async fn filesystem_rules(&self, agent_id: u64) -> Result<Vec<FilesystemRule>, BackendError> {
        self.reach()?;
        Ok(self
            .inner
            .lock()
            .await
            .filesystem_rules
            .get(&agent_id)
            .map(|items| items.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete_filesystem_rule(
        &self,
        agent_id: u64,
        rule_id: u64,
    ) -> Result<(), BackendError> {
        self.reach()?;
        if let Some(items) = self.inner.lock().await.filesystem_rules.get_mut(&agent_id) {
            items.remove(&rule_id);
        }
        Ok(())
    }

    async fn report_status(&self, report: &StatusReport) -> Result<(), BackendError> {
        self.reach()?;
        let mut inner = self.inner.lock().await;
        if inner.reports.len() == RETAINED_REPORTS {
            inner.reports.pop_front();
        }
        inner.reports.push_back(report.clone());
        Ok(())
    }
}
