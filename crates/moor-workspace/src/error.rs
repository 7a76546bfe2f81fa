use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkspaceError {
    #[error("timed out while waiting for the workspace to become available")]
    Timeout,

    #[error("host api error: {0}")]
    Api(#[source] anyhow::Error),

    #[error("remote command failed: {0}")]
    Exec(#[source] anyhow::Error),

    #[error("parsing workspace state: {0}")]
    State(#[from] serde_json::Error),

    #[error(transparent)]
    Relay(#[from] moor_relay::RelayError),
}
