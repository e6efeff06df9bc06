use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

// Largest whole-second span chrono can represent.
const MAX_TTL_SECONDS: i64 = i64::MAX / 1_000;

/// One authenticated agent connection window.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Session {
    pub token: String,
    pub agent_record_id: u64,
    pub build_id: String,
    pub instance_id: String,
    pub subtype: String,
    pub class_key: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// Fields an agent proves at authentication time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewSession {
    pub agent_record_id: u64,
    pub build_id: String,
    pub instance_id: String,
    pub subtype: String,
    pub class_key: Vec<u8>,
}

/// Registry of live sessions keyed by an unguessable token.
///
/// Every operation holds the registry lock for its whole read-modify-write,
/// so [`get`](Self::get) refreshing `last_seen_at` cannot race a sweep.
/// Callers only ever receive clones.
#[derive(Default)]
pub struct SessionManager {
    sessions: Mutex<HashMap<String, Session>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(&self, new_session: NewSession) -> String {
        self.create_at(new_session, Utc::now()).await
    }

    pub async fn check(&self, token: &str) -> bool {
        self.sessions.lock().await.contains_key(token)
    }

    /// Returns a copy of the session and slides its expiry window.
    pub async fn get(&self, token: &str) -> Option<Session> {
        self.get_at(token, Utc::now()).await
    }

    pub async fn delete(&self, token: &str) {
        if self.sessions.lock().await.remove(token).is_some() {
            tracing::debug!("session deleted");
        }
    }

    pub async fn how_many(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Drops every session idle for strictly longer than `ttl_seconds`.
    /// Returns the number removed.
    pub async fn timeout(&self, ttl_seconds: u64) -> usize {
        self.timeout_at(ttl_seconds, Utc::now()).await
    }

    async fn create_at(&self, new_session: NewSession, now: DateTime<Utc>) -> String {
        let mut sessions = self.sessions.lock().await;
        let mut token = Uuid::new_v4().simple().to_string();
        while sessions.contains_key(&token) {
            token = Uuid::new_v4().simple().to_string();
        }
        tracing::info!(
            agent_record_id = new_session.agent_record_id,
            build_id = %new_session.build_id,
            instance_id = %new_session.instance_id,
            "session created"
        );
        sessions.insert(
            token.clone(),
            Session {
                token: token.clone(),
                agent_record_id: new_session.agent_record_id,
                build_id: new_session.build_id,
                instance_id: new_session.instance_id,
                subtype: new_session.subtype,
                class_key: new_session.class_key,
                created_at: now,
                last_seen_at: now,
            },
        );
        token
    }

    async fn get_at(&self, token: &str, now: DateTime<Utc>) -> Option<Session> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions.get_mut(token)?;
        session.last_seen_at = now;
        Some(session.clone())
    }

    async fn timeout_at(&self, ttl_seconds: u64, now: DateTime<Utc>) -> usize {
        let ttl = Duration::seconds(
            i64::try_from(ttl_seconds)
                .unwrap_or(MAX_TTL_SECONDS)
                .min(MAX_TTL_SECONDS),
        );
        let mut sessions = self.sessions.lock().await;
        let before = sessions.len();
        sessions.retain(|_, session| now.signed_duration_since(session.last_seen_at) <= ttl);
        let removed = before - sessions.len();
        if removed > 0 {
            tracing::info!(removed, remaining = sessions.len(), "expired sessions swept");
        }
        removed
    }
}
