use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::oneshot;
use tracing::info;

use moor_protocol::{
    ChannelId, ClientCapabilities, Frame, JoinWorkspaceResult, Port, methods,
};

use crate::error::RelayError;
use crate::rpc::{RelayStream, RpcClient};
use crate::transport::Transport;

/// Everything needed to reach and authenticate to the relay, supplied
/// once at join time by the host API.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    pub session_id: String,
    pub session_token: String,
    pub relay_endpoint: String,
    pub relay_sas: String,
}

impl Connection {
    /// True when every field required to dial and authenticate is
    /// present.
    pub fn is_complete(&self) -> bool {
        !self.session_id.is_empty()
            && !self.session_token.is_empty()
            && !self.relay_endpoint.is_empty()
            && !self.relay_sas.is_empty()
    }
}

/// Dials the relay and joins a workspace session.
///
/// One client joins at most once, even if the attempt fails; build a
/// new client to retry.
pub struct RelayClient {
    connection: Connection,
    joined: AtomicBool,
}

impl RelayClient {
    pub fn new(connection: Connection) -> Self {
        Self {
            connection,
            joined: AtomicBool::new(false),
        }
    }

    /// Dial the relay over TLS, authenticate with the session id and
    /// token, and join the workspace.
    pub async fn join(&self) -> Result<Session, RelayError> {
        if self.joined.swap(true, Ordering::SeqCst) {
            return Err(RelayError::AlreadyJoined);
        }
        let transport =
            Transport::dial(&self.connection.relay_endpoint, &self.connection.relay_sas).await?;
        Session::join(RpcClient::start(transport), &self.connection).await
    }
}

/// A live workspace session: one joined relay connection and the
/// operations it carries. Cloning is cheap and shares the connection.
#[derive(Clone)]
pub struct Session {
    pub(crate) rpc: RpcClient,
    session_number: u32,
}

impl Session {
    /// Authenticate and join over an already-running engine. Exposed so
    /// tests can drive a session over an in-memory transport.
    pub async fn join(rpc: RpcClient, connection: &Connection) -> Result<Self, RelayError> {
        match rpc
            .call(
                methods::AUTHENTICATE,
                json!([connection.session_id, connection.session_token]),
            )
            .await
        {
            Ok(_) => {}
            Err(RelayError::Rpc { message, .. }) => {
                return Err(RelayError::Authentication(message));
            }
            Err(e) => return Err(e),
        }

        let joined: JoinWorkspaceResult = rpc
            .call_typed(
                methods::JOIN_WORKSPACE,
                json!([ClientCapabilities {
                    is_non_interactive: true,
                }]),
            )
            .await?;
        info!(session_number = joined.session_number, "joined workspace session");

        Ok(Self {
            rpc,
            session_number: joined.session_number,
        })
    }

    /// Session number assigned by the relay at join.
    pub fn session_number(&self) -> u32 {
        self.session_number
    }

    /// Ports currently shared by any client, verbatim from the relay.
    pub async fn get_shared_servers(&self) -> Result<Vec<Port>, RelayError> {
        self.rpc
            .call_typed(methods::GET_SHARED_SERVERS, json!([]))
            .await
    }

    /// Control permissions and visibility scopes for a shared port's
    /// URLs.
    pub async fn update_shared_server_privacy(
        &self,
        port: u16,
        visibility: &str,
    ) -> Result<(), RelayError> {
        self.rpc
            .call(
                methods::UPDATE_SHARED_SERVER_PRIVACY,
                json!([port, visibility]),
            )
            .await?;
        Ok(())
    }

    /// One-shot registration for an inbound server-initiated request,
    /// e.g. a renegotiation ask.
    pub async fn register_request_handler(&self, method: &str) -> oneshot::Receiver<Frame> {
        self.rpc.register_listener(method).await
    }

    /// Open a logical byte stream addressed by `channel`.
    pub async fn open_stream(&self, channel: &ChannelId) -> Result<RelayStream, RelayError> {
        self.rpc.open_stream(channel).await
    }

    /// Resolves when the underlying transport terminates.
    pub async fn closed(&self) {
        self.rpc.closed().await
    }
}
