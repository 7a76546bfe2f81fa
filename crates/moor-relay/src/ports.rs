use serde_json::{Value, json};
use tokio::sync::oneshot;
use tracing::debug;

use moor_protocol::{ChannelId, Frame, Port, PortChangeKind, PortNotification, methods};

use crate::error::RelayError;
use crate::rpc::RpcClient;
use crate::session::Session;

impl Session {
    /// Ask the workspace host to start sharing `port`.
    ///
    /// Sharing is confirmed twice: the RPC response is the relay's
    /// acceptance and carries the stream identifiers, and a
    /// `sharingSucceeded` notification for the same port number is the
    /// readiness signal. Both must arrive. A `sharingFailed`
    /// notification turns its error detail into the returned error.
    pub async fn start_sharing(
        &self,
        session_name: &str,
        port: u16,
    ) -> Result<ChannelId, RelayError> {
        let browse_url = format!("http://localhost:{port}");
        // the listeners must exist before the call is dispatched, or the
        // notification can race past us
        let waiter = PortNotificationWaiter::register(&self.rpc, port, PortChangeKind::Start).await;

        let response: Port = self
            .rpc
            .call_typed(
                methods::START_SHARING,
                json!([port, session_name, browse_url]),
            )
            .await?;

        let notification = waiter.wait().await?;
        if !notification.success {
            return Err(RelayError::Rpc {
                method: methods::START_SHARING.to_string(),
                message: notification.error_detail,
            });
        }

        Ok(ChannelId::new(response.stream_name, response.stream_condition))
    }

    /// Wait for the next sharing notification matching `port` and
    /// `kind`. Notifications for unrelated ports are discarded and the
    /// wait continues.
    pub async fn wait_for_port_notification(
        &self,
        port: u16,
        kind: PortChangeKind,
    ) -> Result<PortNotification, RelayError> {
        PortNotificationWaiter::register(&self.rpc, port, kind)
            .await
            .wait()
            .await
    }
}

/// A registered wait for `sharingSucceeded`/`sharingFailed` filtered to
/// one port number.
struct PortNotificationWaiter<'a> {
    rpc: &'a RpcClient,
    port: u16,
    kind: PortChangeKind,
    succeeded: oneshot::Receiver<Frame>,
    failed: oneshot::Receiver<Frame>,
}

impl<'a> PortNotificationWaiter<'a> {
    async fn register(rpc: &'a RpcClient, port: u16, kind: PortChangeKind) -> Self {
        let succeeded = rpc.register_listener(methods::SHARING_SUCCEEDED).await;
        let failed = rpc.register_listener(methods::SHARING_FAILED).await;
        Self {
            rpc,
            port,
            kind,
            succeeded,
            failed,
        }
    }

    async fn wait(mut self) -> Result<PortNotification, RelayError> {
        loop {
            let (frame, success) = tokio::select! {
                frame = &mut self.succeeded => (frame.map_err(|_| RelayError::ConnectionClosed)?, true),
                frame = &mut self.failed => (frame.map_err(|_| RelayError::ConnectionClosed)?, false),
            };
            // delivery consumed the registration; renew it so an
            // unrelated port cannot strand this wait
            if success {
                self.succeeded = self.rpc.register_listener(methods::SHARING_SUCCEEDED).await;
            } else {
                self.failed = self.rpc.register_listener(methods::SHARING_FAILED).await;
            }

            let params = frame.params.unwrap_or(Value::Null);
            let mut notification: PortNotification = serde_json::from_value(params)
                .map_err(|e| RelayError::Protocol(format!("malformed sharing notification: {e}")))?;
            notification.success = success;

            if notification.port == self.port && notification.change_kind == self.kind {
                return Ok(notification);
            }
            debug!(
                port = notification.port,
                "discarding sharing notification for unrelated port"
            );
        }
    }
}
