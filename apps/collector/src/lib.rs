#![forbid(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::panic))]

use std::future::Future;
use std::sync::Arc;

use tracing::info;

use crate::{
    cache::DirectoryCache,
    config::Config,
    directory::{
        DirectoryBackend, DirectoryClient, http::HttpDirectoryBackend,
        memory::MemoryDirectoryBackend, resilient::ResilientDirectory, types::Credentials,
    },
    protocol::checkin::CheckinProtocol,
    scheduler::Scheduler,
    server::{
        CollectorState, ServeError, build_router,
        listener::{bind, spawn_server},
    },
    sessions::SessionManager,
};

pub mod cache;
pub mod config;
pub mod directory;
pub mod protocol;
pub mod scheduler;
pub mod server;
pub mod sessions;

/// Picks the HTTP backend when a directory URL is configured, the in-memory
/// one otherwise.
pub fn build_directory_backend(config: &Config) -> Result<Arc<dyn DirectoryBackend>, ServeError> {
    match config.directory.base_url.as_deref() {
        Some(base_url) => Ok(Arc::new(HttpDirectoryBackend::new(
            base_url,
            config.directory.timeout_ms,
        )?)),
        None => {
            info!("no directory URL configured, using the in-memory directory");
            Ok(Arc::new(MemoryDirectoryBackend::new()))
        }
    }
}

/// Wires one instance of every shared component around `backend`.
pub fn build_collector_state_with_backend(
    config: Config,
    backend: Arc<dyn DirectoryBackend>,
) -> CollectorState {
    let credentials = Credentials {
        user: config.directory.user.clone(),
        password: config.directory.password.clone(),
    };
    let client = Arc::new(DirectoryClient::new(backend, credentials));
    let directory = Arc::new(ResilientDirectory::new(
        client,
        Arc::new(DirectoryCache::new()),
    ));
    let sessions = Arc::new(SessionManager::new());
    let protocol = Arc::new(CheckinProtocol::new(directory.clone(), sessions.clone()));
    CollectorState::new(config, directory, sessions, protocol)
}

pub fn build_collector_state(config: Config) -> Result<CollectorState, ServeError> {
    let backend = build_directory_backend(&config)?;
    Ok(build_collector_state_with_backend(config, backend))
}

pub async fn serve(config: Config) -> Result<(), ServeError> {
    serve_until(config, shutdown_signal()).await
}

/// Runs the collector until `shutdown` resolves. Only a bind failure or a
/// broken backend setup ends it early.
pub async fn serve_until(
    config: Config,
    shutdown: impl Future<Output = ()>,
) -> Result<(), ServeError> {
    let state = build_collector_state(config)?;
    let listener = if state.config.listener_enabled {
        Some(bind(state.config.bind_addr).await?)
    } else {
        info!("http listener disabled");
        None
    };

    let live = state.directory.cache_init().await;
    info!(
        service = %state.config.service_name,
        live,
        "directory bootstrap finished"
    );

    let scheduler = Scheduler::start(
        &state.config,
        state.directory.clone(),
        state.sessions.clone(),
    );
    let server = match listener {
        Some(listener) => Some(spawn_server(
            listener,
            build_router(state.clone()),
            state.config.connection_inactivity_timeout(),
        )?),
        None => None,
    };

    shutdown.await;
    info!("shutdown requested");

    if let Some(server) = server {
        server.close().await?;
    }
    scheduler.shutdown().await;
    state.directory.client().disconnect().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::warn!(reason = %error, "ctrl-c handler unavailable, running until killed");
        std::future::pending::<()>().await;
    }
}
