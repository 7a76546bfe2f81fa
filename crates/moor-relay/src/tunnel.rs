use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use moor_protocol::ChannelId;

use crate::error::RelayError;
use crate::session::Session;

/// A local listener bridged to a shared remote port.
///
/// Every accepted local connection gets its own relay stream addressed
/// by the tunnel's channel id; bytes are copied both ways until either
/// side closes. Ordinary network clients (an SSH client, a browser)
/// connect to `127.0.0.1:local_port` and reach the remote service.
pub struct Tunnel {
    local_port: u16,
    session: Session,
    shutdown: CancellationToken,
}

impl Tunnel {
    /// Share `remote_port` under `session_name`, then open a tunnel to
    /// it on an ephemeral local port.
    pub async fn forward(
        session: &Session,
        session_name: &str,
        remote_port: u16,
    ) -> Result<Self, RelayError> {
        let channel = session.start_sharing(session_name, remote_port).await?;
        Self::open(session, channel, 0).await
    }

    /// Bind `local_port` (0 picks an ephemeral port) and bridge
    /// accepted connections to `channel`.
    pub async fn open(
        session: &Session,
        channel: ChannelId,
        local_port: u16,
    ) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(("127.0.0.1", local_port)).await?;
        let local_port = listener.local_addr()?.port();
        let shutdown = CancellationToken::new();

        let accept_session = session.clone();
        let accept_shutdown = shutdown.clone();
        tokio::spawn(async move {
            accept_loop(listener, accept_session, channel, accept_shutdown).await;
        });

        info!(local_port, "tunnel listening");
        Ok(Self {
            local_port,
            session: session.clone(),
            shutdown,
        })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Resolves with the failure once the session transport terminates,
    /// so long-lived consumers can detect loss of connectivity without
    /// polling.
    pub async fn closed(&self) -> RelayError {
        self.session.closed().await;
        RelayError::ConnectionClosed
    }

    /// Stop accepting local connections. Bridges already established
    /// run until their streams close.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    session: Session,
    channel: ChannelId,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = session.closed() => break,
            accepted = listener.accept() => match accepted {
                Ok((conn, peer)) => {
                    debug!(peer = %peer, "accepted tunnel connection");
                    let session = session.clone();
                    let channel = channel.clone();
                    tokio::spawn(async move {
                        if let Err(e) = bridge(conn, session, channel).await {
                            debug!(error = %e, "tunnel connection ended");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "tunnel accept failed");
                    break;
                }
            },
        }
    }
}

/// Copy bytes between one local connection and one relay stream until
/// either side closes.
async fn bridge(mut conn: TcpStream, session: Session, channel: ChannelId) -> Result<(), RelayError> {
    let mut stream = session.open_stream(&channel).await?;
    let mut buf = [0u8; 4096];
    // true means the local side finished and the relay should be told
    let outcome: Result<bool, RelayError> = loop {
        tokio::select! {
            read = conn.read(&mut buf) => match read {
                Ok(0) => break Ok(true),
                Ok(n) => {
                    if let Err(e) = stream.write(&buf[..n]) {
                        break Err(e);
                    }
                }
                Err(e) => break Err(e.into()),
            },
            chunk = stream.read() => match chunk {
                Some(data) => {
                    if let Err(e) = conn.write_all(&data).await {
                        break Err(e.into());
                    }
                }
                None => break Ok(false), // remote side closed
            },
        }
    };
    match outcome {
        Ok(true) => {
            stream.close().await;
            Ok(())
        }
        Ok(false) => Ok(()),
        Err(e) => {
            stream.close().await;
            Err(e)
        }
    }
}
