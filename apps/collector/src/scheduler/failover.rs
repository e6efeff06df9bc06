use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::directory::resilient::ResilientDirectory;

/// Probes directory endpoints with a bounded TCP connect and reconnects the
/// directory once an endpoint comes back while it is disconnected.
pub struct ReachabilityChecker {
    endpoints: Vec<String>,
    probe_timeout: Duration,
    directory: Arc<ResilientDirectory>,
    last_seen: Mutex<HashMap<String, bool>>,
}

impl ReachabilityChecker {
    pub fn new(
        endpoints: Vec<String>,
        probe_timeout: Duration,
        directory: Arc<ResilientDirectory>,
    ) -> Self {
        Self {
            endpoints,
            probe_timeout,
            directory,
            last_seen: Mutex::new(HashMap::new()),
        }
    }

    /// Returns each endpoint with its reachability in configuration order.
    pub async fn check(&self) -> Vec<(String, bool)> {
        let probes = join_all(self.endpoints.iter().map(|endpoint| self.probe(endpoint))).await;
        let mut results = Vec::with_capacity(self.endpoints.len());
        let mut restored = false;

        for (endpoint, reachable) in self.endpoints.iter().zip(probes) {
            let previous = self
                .last_seen
                .lock()
                .await
                .insert(endpoint.clone(), reachable);
            match (previous, reachable) {
                (Some(true) | None, false) => {
                    tracing::warn!(endpoint = %endpoint, "directory endpoint unreachable");
                }
                (Some(false), true) => {
                    tracing::info!(endpoint = %endpoint, "directory endpoint restored");
                    restored = true;
                }
                (None, true) => {
                    tracing::debug!(endpoint = %endpoint, "directory endpoint reachable");
                    restored = true;
                }
                _ => {}
            }
            results.push((endpoint.clone(), reachable));
        }

        if restored && !self.directory.is_connected() {
            let live = self.directory.cache_init().await;
            tracing::info!(live, "directory reconnect attempted after endpoint recovery");
        }
        results
    }

    async fn probe(&self, endpoint: &str) -> bool {
        matches!(
            tokio::time::timeout(self.probe_timeout, TcpStream::connect(endpoint)).await,
            Ok(Ok(_))
        )
    }
}
