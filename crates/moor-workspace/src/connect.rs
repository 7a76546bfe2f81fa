use std::time::Duration;

use serde::Deserialize;
use tokio::time::sleep;
use tracing::info;

use moor_relay::{RelayClient, Session};

use crate::api::{Workspace, WorkspaceApi, WorkspaceState};
use crate::error::WorkspaceError;

/// Poll budget for workspace startup.
///
/// This is a bounded human-perceived wait, not a resilience mechanism:
/// a fixed number of polls at a fixed cadence, then give up.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectPolicy {
    #[serde(default = "default_max_polls")]
    pub max_polls: u32,
    #[serde(default = "default_poll_interval")]
    pub poll_interval: Duration,
}

impl Default for ConnectPolicy {
    fn default() -> Self {
        Self {
            max_polls: default_max_polls(),
            poll_interval: default_poll_interval(),
        }
    }
}

fn default_max_polls() -> u32 {
    30
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

/// Start the workspace if needed, wait for its connection details to be
/// ready, then join the relay session. Join errors propagate unchanged.
pub async fn connect(
    api: &dyn WorkspaceApi,
    workspace: Workspace,
    policy: &ConnectPolicy,
) -> Result<Session, WorkspaceError> {
    let ready = wait_until_ready(api, workspace, policy).await?;
    info!(workspace = %ready.name, "connecting to workspace session");
    Ok(RelayClient::new(ready.connection).join().await?)
}

/// Issue a start request if the workspace is not available, then
/// re-fetch its record until the readiness predicate holds, within the
/// policy's budget. No sleep before the first two polls, so an
/// already-started workspace connects without delay.
pub async fn wait_until_ready(
    api: &dyn WorkspaceApi,
    mut workspace: Workspace,
    policy: &ConnectPolicy,
) -> Result<Workspace, WorkspaceError> {
    if workspace.state != WorkspaceState::Available {
        info!(workspace = %workspace.name, state = %workspace.state, "starting workspace");
        api.start(&workspace.name).await.map_err(WorkspaceError::Api)?;
    }

    let mut retries = 0u32;
    while !connection_ready(&workspace) {
        if retries > 1 {
            sleep(policy.poll_interval).await;
        }
        if retries == policy.max_polls {
            return Err(WorkspaceError::Timeout);
        }
        workspace = api.get(&workspace.name).await.map_err(WorkspaceError::Api)?;
        retries += 1;
    }

    Ok(workspace)
}

/// Ready means every connection-descriptor field is populated and the
/// workspace reports itself available.
fn connection_ready(workspace: &Workspace) -> bool {
    workspace.connection.is_complete() && workspace.state == WorkspaceState::Available
}
