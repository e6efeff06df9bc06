use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::directory::resilient::ResilientDirectory;
use crate::directory::types::{ComponentHealth, StatusReport};
use crate::sessions::SessionManager;

pub struct Heartbeat {
    service_name: String,
    directory: Arc<ResilientDirectory>,
    sessions: Arc<SessionManager>,
    last_delivered: AtomicBool,
}

impl Heartbeat {
    pub fn new(
        service_name: String,
        directory: Arc<ResilientDirectory>,
        sessions: Arc<SessionManager>,
    ) -> Self {
        Self {
            service_name,
            directory,
            sessions,
            last_delivered: AtomicBool::new(true),
        }
    }

    /// Sends one status report. The first report after an outage is marked
    /// `warn` so the directory can see the collector ran degraded.
    pub async fn beat(&self) -> bool {
        let active_sessions = self.sessions.how_many().await;
        let recovering = !self.last_delivered.load(Ordering::SeqCst);
        let report = StatusReport {
            component: self.service_name.clone(),
            health: if recovering {
                ComponentHealth::Warn
            } else {
                ComponentHealth::Ok
            },
            message: status_message(active_sessions, recovering),
            active_sessions,
        };

        let delivered = self.directory.report_status(&report).await;
        self.last_delivered.store(delivered, Ordering::SeqCst);
        if delivered {
            tracing::debug!(active_sessions, "heartbeat delivered");
        } else {
            tracing::warn!(active_sessions, "heartbeat not delivered, directory unreachable");
        }
        delivered
    }
}

fn status_message(active_sessions: usize, recovering: bool) -> String {
    let load = match active_sessions {
        0 => "Idle".to_string(),
        1 => "Handling 1 agent".to_string(),
        count => format!("Handling {count} agents"),
    };
    if recovering {
        format!("{load} (recovered from directory outage)")
    } else {
        load
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::Heartbeat;
    use crate::cache::DirectoryCache;
    use crate::directory::DirectoryClient;
    use crate::directory::memory::MemoryDirectoryBackend;
    use crate::directory::resilient::ResilientDirectory;
    use crate::directory::types::{ComponentHealth, Credentials};
    use crate::sessions::{NewSession, SessionManager};

    fn heartbeat(backend: &Arc<MemoryDirectoryBackend>, sessions: &Arc<SessionManager>) -> Heartbeat {
        let client = Arc::new(DirectoryClient::new(backend.clone(), Credentials::default()));
        let directory = Arc::new(ResilientDirectory::new(
            client,
            Arc::new(DirectoryCache::new()),
        ));
        Heartbeat::new("collector".to_string(), directory, sessions.clone())
    }

    #[tokio::test]
    async fn reports_carry_the_live_session_count() {
        let backend = Arc::new(MemoryDirectoryBackend::new());
        let sessions = Arc::new(SessionManager::new());
        let heartbeat = heartbeat(&backend, &sessions);

        assert!(heartbeat.beat().await);
        sessions
            .create(NewSession {
                agent_record_id: 1,
                build_id: "BUILD001".to_string(),
                instance_id: "inst".to_string(),
                subtype: "WIN32".to_string(),
                class_key: Vec::new(),
            })
            .await;
        assert!(heartbeat.beat().await);

        let reports = backend.reports().await;
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].component, "collector");
        assert_eq!(reports[0].message, "Idle");
        assert_eq!(reports[1].active_sessions, 1);
        assert_eq!(reports[1].message, "Handling 1 agent");
        assert_eq!(reports[1].health, ComponentHealth::Ok);
    }

    #[tokio::test]
    async fn first_report_after_an_outage_is_a_warning() {
        let backend = Arc::new(MemoryDirectoryBackend::new());
        let sessions = Arc::new(SessionManager::new());
        let heartbeat = heartbeat(&backend, &sessions);

        backend.set_failing(true);
        assert!(!heartbeat.beat().await);
        backend.set_failing(false);
        assert!(heartbeat.beat().await);
        assert!(heartbeat.beat().await);

        let reports = backend.reports().await;
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].health, ComponentHealth::Warn);
        assert!(reports[0].message.contains("recovered"));
        assert_eq!(reports[1].health, ComponentHealth::Ok);
    }
}
