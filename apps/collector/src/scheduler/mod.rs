//! Time-driven background work.
//!
//! Every job runs on its own task and stops when [`Scheduler::shutdown`]
//! flips the shared shutdown signal. A job that is mid-execution finishes
//! its current pass first.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::Config;
use crate::directory::resilient::ResilientDirectory;
use crate::sessions::SessionManager;

pub mod failover;
pub mod heartbeat;

use failover::ReachabilityChecker;
use heartbeat::Heartbeat;

pub struct Scheduler {
    shutdown: watch::Sender<bool>,
    jobs: Vec<(&'static str, JoinHandle<()>)>,
}

impl Scheduler {
    /// Heartbeat and session sweep follow the listener switch; the
    /// reachability check follows its own switch.
    pub fn start(
        config: &Config,
        directory: Arc<ResilientDirectory>,
        sessions: Arc<SessionManager>,
    ) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut jobs = Vec::new();

        if config.listener_enabled {
            let heartbeat = Arc::new(Heartbeat::new(
                config.service_name.clone(),
                directory.clone(),
                sessions.clone(),
            ));
            jobs.push((
                "heartbeat",
                spawn_periodic(
                    "heartbeat",
                    config.heartbeat_interval(),
                    true,
                    shutdown_rx.clone(),
                    move || {
                        let heartbeat = heartbeat.clone();
                        async move {
                            heartbeat.beat().await;
                        }
                    },
                ),
            ));

            let ttl_seconds = config.session_ttl_seconds;
            jobs.push((
                "session_sweep",
                spawn_periodic(
                    "session_sweep",
                    config.session_sweep_interval(),
                    false,
                    shutdown_rx.clone(),
                    move || {
                        let sessions = sessions.clone();
                        async move {
                            sessions.timeout(ttl_seconds).await;
                        }
                    },
                ),
            ));
        }

        if config.failover_check_enabled {
            let checker = Arc::new(ReachabilityChecker::new(
                config.failover_endpoints.clone(),
                Duration::from_millis(config.directory.timeout_ms),
                directory,
            ));
            jobs.push((
                "failover_check",
                spawn_periodic(
                    "failover_check",
                    config.failover_check_interval(),
                    true,
                    shutdown_rx,
                    move || {
                        let checker = checker.clone();
                        async move {
                            checker.check().await;
                        }
                    },
                ),
            ));
        }

        tracing::info!(
            jobs = ?jobs.iter().map(|(name, _)| *name).collect::<Vec<_>>(),
            "scheduler started"
        );
        Self { shutdown, jobs }
    }

    pub fn job_names(&self) -> Vec<&'static str> {
        self.jobs.iter().map(|(name, _)| *name).collect()
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for (name, job) in self.jobs {
            if let Err(error) = job.await {
                tracing::warn!(job = name, reason = %error, "scheduled job ended abnormally");
            }
        }
        tracing::info!("scheduler stopped");
    }
}

fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    immediate: bool,
    mut shutdown: watch::Receiver<bool>,
    job: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let period = period.max(Duration::from_secs(1));
    tokio::spawn(async move {
        let start = if immediate {
            Instant::now()
        } else {
            Instant::now() + period
        };
        let mut ticker = tokio::time::interval_at(start, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    tracing::debug!(job = name, "scheduled job running");
                    job().await;
                }
                _ = shutdown.changed() => break,
            }
        }
    })
}
