use std::fmt;

use chrono::{DateTime, Utc};

/// Which collection a managed instance belongs to.
///
/// The kind doubles as the first token of the `tnet` command line, so it is
/// never stored inside an instance's argument list.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    Agent,
    Proxy,
}

impl ServiceKind {
    pub const ALL: [ServiceKind; 2] = [ServiceKind::Agent, ServiceKind::Proxy];

    pub fn as_str(self) -> &'static str {
        match self {
            ServiceKind::Agent => "agent",
            ServiceKind::Proxy => "proxy",
        }
    }

    /// Plural path segment used by the dashboard API (`/api/agents`, `/api/proxies`).
    pub fn collection(self) -> &'static str {
        match self {
            ServiceKind::Agent => "agents",
            ServiceKind::Proxy => "proxies",
        }
    }

    pub fn from_command_token(token: &str) -> Option<Self> {
        match token {
            "agent" => Some(ServiceKind::Agent),
            "proxy" => Some(ServiceKind::Proxy),
            _ => None,
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub String);

impl InstanceId {
    /// Short ids: the first 8 hex characters of a random v4 UUID.
    pub fn new() -> Self {
        let full = uuid::Uuid::new_v4().simple().to_string();
        Self(full[..8].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for InstanceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    Stopped,
    Running,
    /// A supervisor call timed out; the real process state is indeterminate.
    Unknown,
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            InstanceStatus::Stopped => "stopped",
            InstanceStatus::Running => "running",
            InstanceStatus::Unknown => "unknown",
        })
    }
}

/// Dashboard-facing view of an instance. `args` is always masked.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct InstanceView {
    pub id: InstanceId,
    pub status: InstanceStatus,
    pub args: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceAction {
    Created,
    StatusChanged,
    Deleted,
}

/// Published whenever an instance is created, changes status or is deleted.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct InstanceEvent {
    pub kind: ServiceKind,
    pub id: InstanceId,
    pub action: InstanceAction,
    pub status: InstanceStatus,
}
