use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::directory::types::{AgentConfig, AgentStatus, StatusKey};

/// Address of one fact in the cache, keyed the same way the directory keys it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Signature,
    ClassKey(String),
    Status(StatusKey),
    PendingConfig(u64),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CachedFact {
    Signature(Vec<u8>),
    ClassKey(Vec<u8>),
    Status(AgentStatus),
    /// `None` records that the directory had no pending configuration.
    PendingConfig(Option<AgentConfig>),
}

/// Last-known-good answers for every directory fact.
///
/// Entries never expire and are never evicted for space; the only way to drop
/// them is [`DirectoryCache::reset_all`]. Each write replaces a single key
/// under the write lock, so concurrent writers on distinct keys cannot
/// interfere.
#[derive(Default)]
pub struct DirectoryCache {
    facts: RwLock<HashMap<CacheKey, CachedFact>>,
}

impl DirectoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, key: &CacheKey) -> Option<CachedFact> {
        self.facts.read().await.get(key).cloned()
    }

    pub async fn set(&self, key: CacheKey, fact: CachedFact) {
        self.facts.write().await.insert(key, fact);
    }

    pub async fn reset_all(&self) {
        self.facts.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.facts.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.facts.read().await.is_empty()
    }

    pub async fn signature(&self) -> Option<Vec<u8>> {
        match self.get(&CacheKey::Signature).await {
            Some(CachedFact::Signature(value)) => Some(value),
            _ => None,
        }
    }

    pub async fn class_key(&self, build_id: &str) -> Option<Vec<u8>> {
        match self.get(&CacheKey::ClassKey(build_id.to_string())).await {
            Some(CachedFact::ClassKey(value)) => Some(value),
            _ => None,
        }
    }

    pub async fn status(&self, key: &StatusKey) -> Option<AgentStatus> {
        match self.get(&CacheKey::Status(key.clone())).await {
            Some(CachedFact::Status(status)) => Some(status),
            _ => None,
        }
    }

    /// Outer `None` is a cache miss; inner `None` is a cached "nothing pending".
    pub async fn pending_config(&self, agent_id: u64) -> Option<Option<AgentConfig>> {
        match self.get(&CacheKey::PendingConfig(agent_id)).await {
            Some(CachedFact::PendingConfig(config)) => Some(config),
            _ => None,
        }
    }
}
