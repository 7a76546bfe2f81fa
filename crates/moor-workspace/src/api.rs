use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use moor_relay::Connection;

/// Lifecycle state the host API reports for a workspace.
///
/// States the client does not know about deserialize as `Unknown` and
/// are treated as not ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkspaceState {
    Available,
    Provisioning,
    Starting,
    ShuttingDown,
    Shutdown,
    Unknown,
}

impl WorkspaceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkspaceState::Available => "Available",
            WorkspaceState::Provisioning => "Provisioning",
            WorkspaceState::Starting => "Starting",
            WorkspaceState::ShuttingDown => "ShuttingDown",
            WorkspaceState::Shutdown => "Shutdown",
            WorkspaceState::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for WorkspaceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for WorkspaceState {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for WorkspaceState {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        Ok(match s.as_str() {
            "Available" => WorkspaceState::Available,
            "Provisioning" => WorkspaceState::Provisioning,
            "Starting" => WorkspaceState::Starting,
            "ShuttingDown" => WorkspaceState::ShuttingDown,
            "Shutdown" => WorkspaceState::Shutdown,
            _ => WorkspaceState::Unknown,
        })
    }
}

/// A remote workspace record as reported by the host API.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    pub name: String,
    pub state: WorkspaceState,
    #[serde(default)]
    pub connection: Connection,
}

/// Host API collaborator: typed record fetch plus the start operation.
/// The session core never talks to the hosted API directly.
#[async_trait]
pub trait WorkspaceApi: Send + Sync {
    /// Fetch the current record for the named workspace.
    async fn get(&self, name: &str) -> anyhow::Result<Workspace>;

    /// Ask the host to start the named workspace.
    async fn start(&self, name: &str) -> anyhow::Result<()>;
}

/// Remote command runner collaborator: executes a single command
/// against the forwarded destination behind a tunnel's local port and
/// returns its standard output.
#[async_trait]
pub trait RemoteExec: Send + Sync {
    async fn output(&self, local_port: u16, command: &str) -> anyhow::Result<Vec<u8>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workspace_state_round_trip() {
        let state: WorkspaceState = serde_json::from_str("\"Available\"").unwrap();
        assert_eq!(state, WorkspaceState::Available);
        assert_eq!(serde_json::to_string(&state).unwrap(), "\"Available\"");
    }

    #[test]
    fn unknown_state_is_tolerated() {
        let state: WorkspaceState = serde_json::from_str("\"Archived\"").unwrap();
        assert_eq!(state, WorkspaceState::Unknown);
    }

    #[test]
    fn workspace_record_parses_without_connection() {
        let workspace: Workspace =
            serde_json::from_str(r#"{"name":"octocat-web","state":"Starting"}"#).unwrap();
        assert_eq!(workspace.name, "octocat-web");
        assert_eq!(workspace.state, WorkspaceState::Starting);
        assert!(!workspace.connection.is_complete());
    }
}
