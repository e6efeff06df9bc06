use std::{
    env,
    net::{AddrParseError, SocketAddr},
    time::Duration,
};

use thiserror::Error;

pub const DEFAULT_MAX_BODY_BYTES: usize = 30 * 1024 * 1024;

#[derive(Clone, Debug)]
pub struct Config {
    pub service_name: String,
    pub bind_addr: SocketAddr,
    pub listener_enabled: bool,
    pub heartbeat_interval_seconds: u64,
    pub session_ttl_seconds: u64,
    pub session_sweep_interval_seconds: u64,
    pub connection_inactivity_timeout_seconds: u64,
    pub max_body_bytes: usize,
    pub worker_pool_size: usize,
    pub directory: DirectoryConfig,
    pub failover_check_enabled: bool,
    pub failover_check_interval_seconds: u64,
    pub failover_endpoints: Vec<String>,
}

#[derive(Clone, Debug, Default)]
pub struct DirectoryConfig {
    /// Base URL of the authoritative directory. `None` selects the in-memory backend.
    pub base_url: Option<String>,
    pub user: String,
    pub password: String,
    pub timeout_ms: u64,
}

impl Config {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    pub fn session_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.session_sweep_interval_seconds)
    }

    pub fn connection_inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_inactivity_timeout_seconds)
    }

    pub fn failover_check_interval(&self) -> Duration {
        Duration::from_secs(self.failover_check_interval_seconds)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: "collector".to_string(),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 80)),
            listener_enabled: true,
            heartbeat_interval_seconds: 30,
            session_ttl_seconds: 600,
            session_sweep_interval_seconds: 60,
            connection_inactivity_timeout_seconds: 30,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            worker_pool_size: 50,
            directory: DirectoryConfig {
                base_url: None,
                user: String::new(),
                password: String::new(),
                timeout_ms: 5_000,
            },
            failover_check_enabled: false,
            failover_check_interval_seconds: 30,
            failover_endpoints: Vec::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid COLLECTOR_BIND_ADDR: {0}")]
    BindAddrParse(#[from] AddrParseError),
    #[error("invalid COLLECTOR_LISTENER_ENABLED: {0}")]
    InvalidListenerEnabled(String),
    #[error("invalid COLLECTOR_HEARTBEAT_INTERVAL_SECONDS: {0}")]
    InvalidHeartbeatInterval(String),
    #[error("invalid COLLECTOR_SESSION_TTL_SECONDS: {0}")]
    InvalidSessionTtl(String),
    #[error("invalid COLLECTOR_SESSION_SWEEP_INTERVAL_SECONDS: {0}")]
    InvalidSessionSweepInterval(String),
    #[error("invalid COLLECTOR_CONNECTION_INACTIVITY_TIMEOUT_SECONDS: {0}")]
    InvalidInactivityTimeout(String),
    #[error("invalid COLLECTOR_MAX_BODY_BYTES: {0}")]
    InvalidMaxBodyBytes(String),
    #[error("invalid COLLECTOR_WORKER_POOL_SIZE: {0}")]
    InvalidWorkerPoolSize(String),
    #[error("invalid COLLECTOR_DIRECTORY_URL: {0}")]
    InvalidDirectoryUrl(String),
    #[error("invalid COLLECTOR_DIRECTORY_TIMEOUT_MS: {0}")]
    InvalidDirectoryTimeout(String),
    #[error("invalid COLLECTOR_FAILOVER_CHECK_ENABLED: {0}")]
    InvalidFailoverCheckEnabled(String),
    #[error("invalid COLLECTOR_FAILOVER_CHECK_INTERVAL_SECONDS: {0}")]
    InvalidFailoverCheckInterval(String),
    #[error("invalid COLLECTOR_FAILOVER_ENDPOINTS: {0}")]
    InvalidFailoverEndpoints(String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let service_name = lookup("COLLECTOR_SERVICE_NAME")
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or(defaults.service_name);
        let bind_addr = match lookup("COLLECTOR_BIND_ADDR") {
            Some(raw) => raw.trim().parse()?,
            None => defaults.bind_addr,
        };
        let listener_enabled = parse_bool_lookup(
            &lookup,
            "COLLECTOR_LISTENER_ENABLED",
            defaults.listener_enabled,
        )
        .map_err(ConfigError::InvalidListenerEnabled)?;
        let heartbeat_interval_seconds = parse_u64_lookup(
            &lookup,
            "COLLECTOR_HEARTBEAT_INTERVAL_SECONDS",
            defaults.heartbeat_interval_seconds,
        )
        .map_err(ConfigError::InvalidHeartbeatInterval)?
        .max(1);
        let session_ttl_seconds = parse_u64_lookup(
            &lookup,
            "COLLECTOR_SESSION_TTL_SECONDS",
            defaults.session_ttl_seconds,
        )
        .map_err(ConfigError::InvalidSessionTtl)?
        .max(1);
        let session_sweep_interval_seconds = parse_u64_lookup(
            &lookup,
            "COLLECTOR_SESSION_SWEEP_INTERVAL_SECONDS",
            defaults.session_sweep_interval_seconds,
        )
        .map_err(ConfigError::InvalidSessionSweepInterval)?
        .max(1);
        let connection_inactivity_timeout_seconds = parse_u64_lookup(
            &lookup,
            "COLLECTOR_CONNECTION_INACTIVITY_TIMEOUT_SECONDS",
            defaults.connection_inactivity_timeout_seconds,
        )
        .map_err(ConfigError::InvalidInactivityTimeout)?
        .max(1);
        let max_body_bytes = parse_u64_lookup(
            &lookup,
            "COLLECTOR_MAX_BODY_BYTES",
            defaults.max_body_bytes as u64,
        )
        .map_err(ConfigError::InvalidMaxBodyBytes)?
        .max(1) as usize;
        let worker_pool_size = parse_u64_lookup(
            &lookup,
            "COLLECTOR_WORKER_POOL_SIZE",
            defaults.worker_pool_size as u64,
        )
        .map_err(ConfigError::InvalidWorkerPoolSize)?
        .clamp(1, 4_096) as usize;

        let base_url = lookup("COLLECTOR_DIRECTORY_URL")
            .map(|value| value.trim().trim_end_matches('/').to_string())
            .filter(|value| !value.is_empty());
        if let Some(url) = base_url.as_deref() {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ConfigError::InvalidDirectoryUrl(format!(
                    "expected http:// or https:// scheme, got: {url}"
                )));
            }
        }
        let directory_timeout_ms = parse_u64_lookup(
            &lookup,
            "COLLECTOR_DIRECTORY_TIMEOUT_MS",
            defaults.directory.timeout_ms,
        )
        .map_err(ConfigError::InvalidDirectoryTimeout)?
        .clamp(250, 120_000);
        let directory = DirectoryConfig {
            base_url,
            user: lookup("COLLECTOR_DIRECTORY_USER").unwrap_or_default(),
            password: lookup("COLLECTOR_DIRECTORY_PASSWORD").unwrap_or_default(),
            timeout_ms: directory_timeout_ms,
        };

        let failover_check_enabled = parse_bool_lookup(
            &lookup,
            "COLLECTOR_FAILOVER_CHECK_ENABLED",
            defaults.failover_check_enabled,
        )
        .map_err(ConfigError::InvalidFailoverCheckEnabled)?;
        let failover_check_interval_seconds = parse_u64_lookup(
            &lookup,
            "COLLECTOR_FAILOVER_CHECK_INTERVAL_SECONDS",
            defaults.failover_check_interval_seconds,
        )
        .map_err(ConfigError::InvalidFailoverCheckInterval)?
        .max(1);
        let mut failover_endpoints = Vec::new();
        for raw in lookup("COLLECTOR_FAILOVER_ENDPOINTS")
            .unwrap_or_default()
            .split(',')
        {
            let trimmed = raw.trim();
            if trimmed.is_empty() {
                continue;
            }
            if !is_host_port(trimmed) {
                return Err(ConfigError::InvalidFailoverEndpoints(format!(
                    "expected host:port, got: {trimmed}"
                )));
            }
            failover_endpoints.push(trimmed.to_string());
        }

        Ok(Self {
            service_name,
            bind_addr,
            listener_enabled,
            heartbeat_interval_seconds,
            session_ttl_seconds,
            session_sweep_interval_seconds,
            connection_inactivity_timeout_seconds,
            max_body_bytes,
            worker_pool_size,
            directory,
            failover_check_enabled,
            failover_check_interval_seconds,
            failover_endpoints,
        })
    }
}

fn parse_u64_lookup(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: u64,
) -> Result<u64, String> {
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map_err(|error| format!("{key}: {error}")),
        None => Ok(default),
    }
}

fn parse_bool_lookup(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: bool,
) -> Result<bool, String> {
    let Some(raw) = lookup(key) else {
        return Ok(default);
    };
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(format!("{key}: {other}")),
    }
}

fn is_host_port(value: &str) -> bool {
    match value.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    }
}
