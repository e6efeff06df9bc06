use serde::{Deserialize, Serialize};

/// Lifecycle state of an agent as recorded by the directory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    /// No authoritative answer is available.
    Unknown,
    Active,
    /// Known but waiting for operator approval.
    Queued,
    Closed,
    Deleted,
}

impl AgentState {
    /// Closed and deleted agents must not be granted a session.
    pub fn admits_sessions(self) -> bool {
        !matches!(self, Self::Closed | Self::Deleted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Active => "active",
            Self::Queued => "queued",
            Self::Closed => "closed",
            Self::Deleted => "deleted",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStatus {
    pub state: AgentState,
    pub agent_id: u64,
}

impl AgentStatus {
    /// Neutral answer served when neither the backend nor the cache knows the agent.
    pub const UNKNOWN: Self = Self {
        state: AgentState::Unknown,
        agent_id: 0,
    };
}

/// Identity triple an agent presents when checking in.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StatusKey {
    pub build_id: String,
    pub instance_id: String,
    pub subtype: String,
}

impl StatusKey {
    pub fn new(
        build_id: impl Into<String>,
        instance_id: impl Into<String>,
        subtype: impl Into<String>,
    ) -> Self {
        Self {
            build_id: build_id.into(),
            instance_id: instance_id.into(),
            subtype: subtype.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub config_id: u64,
    pub content: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadItem {
    pub id: u64,
    pub filename: String,
    pub content: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadItem {
    pub id: u64,
    pub pattern: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemRule {
    pub id: u64,
    pub path: String,
    pub depth: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentHealth {
    Ok,
    Warn,
    Error,
}

/// Payload of a heartbeat sent to the directory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub component: String,
    pub health: ComponentHealth,
    pub message: String,
    pub active_sessions: usize,
}

#[derive(Clone, Default)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}
