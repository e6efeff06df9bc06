use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::cache::{CacheKey, CachedFact, DirectoryCache};
use crate::directory::DirectoryClient;
use crate::directory::types::{
    AgentConfig, AgentStatus, DownloadItem, FilesystemRule, StatusKey, StatusReport, UploadItem,
};

/// Directory facade whose accessors always produce an answer.
///
/// Every accessor tries the live backend first (reconnecting if needed),
/// refreshes the cache on success and falls back to the cache on failure.
/// Single-valued facts (signature, class keys, status, pending config) are
/// served stale from the cache. Work queues are never cached: a failed read
/// degrades to "nothing pending" so an item already consumed upstream cannot
/// be handed out twice.
///
/// The only externally visible failure signal is [`is_connected`](Self::is_connected).
pub struct ResilientDirectory {
    client: Arc<DirectoryClient>,
    cache: Arc<DirectoryCache>,
    queue_locks: Mutex<HashMap<u64, Arc<Mutex<()>>>>,
}

impl ResilientDirectory {
    pub fn new(client: Arc<DirectoryClient>, cache: Arc<DirectoryCache>) -> Self {
        Self {
            client,
            cache,
            queue_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn client(&self) -> &Arc<DirectoryClient> {
        &self.client
    }

    pub fn cache(&self) -> &Arc<DirectoryCache> {
        &self.cache
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    pub async fn reset_cache(&self) {
        self.cache.reset_all().await;
    }

    /// Eagerly caches the facts agents need at check-in time.
    ///
    /// Returns whether the live backend answered this pass. Cached answers
    /// remain available either way.
    pub async fn cache_init(&self) -> bool {
        if !self.ensure_connected().await {
            tracing::warn!("directory unreachable during cache init, serving from cache");
            return false;
        }

        let signature = match self.client.signature().await {
            Ok(signature) => signature,
            Err(_) => return false,
        };
        self.cache
            .set(CacheKey::Signature, CachedFact::Signature(signature))
            .await;

        let class_keys = match self.client.class_keys().await {
            Ok(class_keys) => class_keys,
            Err(_) => return false,
        };
        let count = class_keys.len();
        for (build_id, class_key) in class_keys {
            self.cache
                .set(CacheKey::ClassKey(build_id), CachedFact::ClassKey(class_key))
                .await;
        }
        tracing::info!(class_keys = count, "directory cache initialized");
        true
    }

    pub async fn signature(&self) -> Option<Vec<u8>> {
        if self.ensure_connected().await {
            if let Ok(signature) = self.client.signature().await {
                self.cache
                    .set(CacheKey::Signature, CachedFact::Signature(signature.clone()))
                    .await;
                return Some(signature);
            }
        }
        self.cache.signature().await
    }

    pub async fn class_key_of(&self, build_id: &str) -> Option<Vec<u8>> {
        if self.ensure_connected().await {
            if let Ok(class_keys) = self.client.class_keys().await {
                let mut found = None;
                for (id, class_key) in class_keys {
                    if id == build_id {
                        found = Some(class_key.clone());
                    }
                    self.cache
                        .set(CacheKey::ClassKey(id), CachedFact::ClassKey(class_key))
                        .await;
                }
                return found;
            }
        }
        self.cache.class_key(build_id).await
    }

    pub async fn status_of(&self, key: &StatusKey) -> AgentStatus {
        if self.ensure_connected().await {
            if let Ok(status) = self.client.status_of(key).await {
                self.cache
                    .set(CacheKey::Status(key.clone()), CachedFact::Status(status))
                    .await;
                return status;
            }
        }
        self.cache
            .status(key)
            .await
            .unwrap_or(AgentStatus::UNKNOWN)
    }

    pub async fn new_config_available(&self, agent_id: u64) -> bool {
        self.new_config(agent_id).await.is_some()
    }

    pub async fn new_config(&self, agent_id: u64) -> Option<AgentConfig> {
        if self.ensure_connected().await {
            if let Ok(config) = self.client.new_config(agent_id).await {
                self.cache
                    .set(
                        CacheKey::PendingConfig(agent_id),
                        CachedFact::PendingConfig(config.clone()),
                    )
                    .await;
                return config;
            }
        }
        self.cache.pending_config(agent_id).await.flatten()
    }

    pub async fn new_uploads_available(&self, agent_id: u64) -> bool {
        if !self.ensure_connected().await {
            return false;
        }
        self.client
            .uploads(agent_id)
            .await
            .is_ok_and(|uploads| !uploads.is_empty())
    }

    /// Removes the oldest pending upload and reports how many are left after it.
    pub async fn new_upload(&self, agent_id: u64) -> Option<(UploadItem, usize)> {
        self.exclusive(agent_id, || self.pop_upload(agent_id)).await
    }

    async fn pop_upload(&self, agent_id: u64) -> Option<(UploadItem, usize)> {
        if !self.ensure_connected().await {
            return None;
        }
        let mut uploads = self.client.uploads(agent_id).await.ok()?;
        if uploads.is_empty() {
            return None;
        }
        uploads.sort_by_key(|upload| upload.id);
        let upload = uploads.remove(0);
        // Unacknowledged items stay upstream and are not handed out.
        self.client.delete_upload(agent_id, upload.id).await.ok()?;
        Some((upload, uploads.len()))
    }

    pub async fn new_downloads_available(&self, agent_id: u64) -> bool {
        if !self.ensure_connected().await {
            return false;
        }
        self.client
            .downloads(agent_id)
            .await
            .is_ok_and(|downloads| !downloads.is_empty())
    }

    /// Consumes every pending download request.
    pub async fn new_downloads(&self, agent_id: u64) -> Vec<DownloadItem> {
        self.exclusive(agent_id, || self.drain_downloads(agent_id)).await
    }

    async fn drain_downloads(&self, agent_id: u64) -> Vec<DownloadItem> {
        if !self.ensure_connected().await {
            return Vec::new();
        }
        let Ok(downloads) = self.client.downloads(agent_id).await else {
            return Vec::new();
        };
        let mut consumed = Vec::with_capacity(downloads.len());
        for download in downloads {
            if self
                .client
                .delete_download(agent_id, download.id)
                .await
                .is_err()
            {
                break;
            }
            consumed.push(download);
        }
        consumed
    }

    pub async fn new_filesystems_available(&self, agent_id: u64) -> bool {
        if !self.ensure_connected().await {
            return false;
        }
        self.client
            .filesystem_rules(agent_id)
            .await
            .is_ok_and(|rules| !rules.is_empty())
    }

    /// Consumes every pending filesystem rule.
    pub async fn new_filesystem_rules(&self, agent_id: u64) -> Vec<FilesystemRule> {
        self.exclusive(agent_id, || self.drain_filesystem_rules(agent_id)).await
    }

    async fn drain_filesystem_rules(&self, agent_id: u64) -> Vec<FilesystemRule> {
        if !self.ensure_connected().await {
            return Vec::new();
        }
        let Ok(rules) = self.client.filesystem_rules(agent_id).await else {
            return Vec::new();
        };
        let mut consumed = Vec::with_capacity(rules.len());
        for rule in rules {
            if self
                .client
                .delete_filesystem_rule(agent_id, rule.id)
                .await
                .is_err()
            {
                break;
            }
            consumed.push(rule);
        }
        consumed
    }

    /// Sends a heartbeat, reconnecting first if needed. Returns whether it was delivered.
    pub async fn report_status(&self, report: &StatusReport) -> bool {
        if !self.ensure_connected().await {
            return false;
        }
        self.client.report_status(report).await.is_ok()
    }

    async fn ensure_connected(&self) -> bool {
        self.client.is_connected() || self.client.connect().await
    }

    /// Runs `work` while holding the agent's queue lock. The lock entry is
    /// dropped again once no other caller holds or waits on it.
    async fn exclusive<T, F, Fut>(&self, agent_id: u64, work: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let lock = self
            .queue_locks
            .lock()
            .await
            .entry(agent_id)
            .or_default()
            .clone();
        let result = {
            let _guard = lock.lock().await;
            work().await
        };

        let mut locks = self.queue_locks.lock().await;
        // One reference lives in the map, the other is ours.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(&agent_id);
        }
        result
    }
}
