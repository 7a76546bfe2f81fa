use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{Instant, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use moor_relay::{Session, Tunnel};

use crate::api::RemoteExec;
use crate::error::WorkspaceError;

/// Status of one workspace setup step.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Running,
    Succeeded,
    Failed,
}

/// One entry of the workspace's setup-state document. A poll tick
/// yields the full current batch, not a diff.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceStep {
    pub name: String,
    pub status: StepStatus,
}

#[derive(Deserialize)]
struct StepsDocument {
    steps: Vec<WorkspaceStep>,
}

/// Cadence and read command for the state poller.
#[derive(Debug, Clone, Deserialize)]
pub struct WatchPolicy {
    #[serde(default = "default_interval")]
    pub interval: Duration,
    /// Session name and remote port the state tunnel is opened against.
    #[serde(default = "default_session_name")]
    pub session_name: String,
    #[serde(default = "default_remote_port")]
    pub remote_port: u16,
    /// Command run through the tunnel to read the state document.
    #[serde(default = "default_state_command")]
    pub state_command: String,
}

impl Default for WatchPolicy {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            session_name: default_session_name(),
            remote_port: default_remote_port(),
            state_command: default_state_command(),
        }
    }
}

fn default_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_session_name() -> String {
    "sshd".to_string()
}

fn default_remote_port() -> u16 {
    2222
}

fn default_state_command() -> String {
    "cat /workspaces/.moor/setup-steps.json".to_string()
}

/// Poll the workspace's setup state over a tunnel until cancelled.
///
/// Each tick runs the policy's read command through the tunnel and
/// hands the whole parsed batch to `sink`. Returns `Ok(())` when
/// `cancel` fires; returns an error if the tunnel's transport drops or
/// a read or parse fails. A failed parse aborts the watch rather than
/// skipping the tick.
pub async fn watch_steps(
    session: &Session,
    runner: &dyn RemoteExec,
    cancel: &CancellationToken,
    policy: &WatchPolicy,
    mut sink: impl FnMut(Vec<WorkspaceStep>),
) -> Result<(), WorkspaceError> {
    let tunnel = Tunnel::forward(session, &policy.session_name, policy.remote_port).await?;
    debug!(local_port = tunnel.local_port(), "watching workspace setup state");

    // first read lands one full interval from now; the ticker is a
    // local, so it is released on every exit path
    let mut ticker = interval_at(Instant::now() + policy.interval, policy.interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            err = tunnel.closed() => return Err(err.into()),
            _ = ticker.tick() => {
                let output = runner
                    .output(tunnel.local_port(), &policy.state_command)
                    .await
                    .map_err(WorkspaceError::Exec)?;
                let document: StepsDocument = serde_json::from_slice(&output)?;
                sink(document.steps);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use moor_protocol::methods;
    use moor_relay::{Connection, RelayError, RpcClient, Session};
    use moor_testkit::{FakeRelay, FakeRelayHandle};
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    struct StaticExec(Vec<u8>);

    #[async_trait]
    impl RemoteExec for StaticExec {
        async fn output(&self, _local_port: u16, _command: &str) -> anyhow::Result<Vec<u8>> {
            Ok(self.0.clone())
        }
    }

    async fn session_with_sharing() -> (Session, FakeRelayHandle) {
        let relay = FakeRelay::new()
            .with_password("session-token")
            .with_service(methods::JOIN_WORKSPACE, |_| {
                Ok(json!({ "sessionNumber": 1 }))
            });
        let notifier = relay.notifier();
        let relay = relay.with_service(methods::START_SHARING, move |params| {
            let port = params[0].clone();
            notifier.notify(
                methods::SHARING_SUCCEEDED,
                json!({ "port": port.clone(), "changeKind": "start" }),
            );
            Ok(json!({ "sourcePort": port, "streamName": "s", "streamCondition": "c" }))
        });
        let (transport, handle) = relay.spawn();
        let connection = Connection {
            session_id: "session-id".to_string(),
            session_token: "session-token".to_string(),
            relay_endpoint: "sb://relay.example.net/w".to_string(),
            relay_sas: "relay-sas".to_string(),
        };
        let session = Session::join(RpcClient::start(transport), &connection)
            .await
            .expect("join");
        (session, handle)
    }

    fn fast_policy() -> WatchPolicy {
        WatchPolicy {
            interval: Duration::from_millis(5),
            ..WatchPolicy::default()
        }
    }

    #[tokio::test]
    async fn delivers_whole_batches_until_cancelled() {
        let (session, _handle) = session_with_sharing().await;
        let runner = StaticExec(
            br#"{"steps":[{"name":"install","status":"succeeded"},{"name":"build","status":"running"}]}"#
                .to_vec(),
        );

        let cancel = CancellationToken::new();
        let batches = Arc::new(Mutex::new(Vec::new()));
        let sink_batches = Arc::clone(&batches);
        let sink_cancel = cancel.clone();
        let result = watch_steps(&session, &runner, &cancel, &fast_policy(), move |steps| {
            let mut batches = sink_batches.lock().unwrap();
            batches.push(steps);
            if batches.len() == 2 {
                sink_cancel.cancel();
            }
        })
        .await;

        assert!(result.is_ok());
        let batches = batches.lock().unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(
            batches[0],
            vec![
                WorkspaceStep {
                    name: "install".to_string(),
                    status: StepStatus::Succeeded,
                },
                WorkspaceStep {
                    name: "build".to_string(),
                    status: StepStatus::Running,
                },
            ]
        );
    }

    #[tokio::test]
    async fn malformed_state_document_aborts_the_watch() {
        let (session, _handle) = session_with_sharing().await;
        let runner = StaticExec(b"not a state document".to_vec());

        let cancel = CancellationToken::new();
        let err = watch_steps(&session, &runner, &cancel, &fast_policy(), |_| {})
            .await
            .expect_err("watch should abort");
        assert!(matches!(err, WorkspaceError::State(_)));
    }

    #[tokio::test]
    async fn relay_loss_aborts_the_watch() {
        let (session, handle) = session_with_sharing().await;
        let runner = StaticExec(br#"{"steps":[]}"#.to_vec());

        let cancel = CancellationToken::new();
        let handle = Arc::new(handle);
        let closer = Arc::clone(&handle);
        let err = watch_steps(&session, &runner, &cancel, &fast_policy(), move |_| {
            closer.close();
        })
        .await
        .expect_err("watch should abort");
        assert!(matches!(
            err,
            WorkspaceError::Relay(RelayError::ConnectionClosed)
        ));
    }
}
