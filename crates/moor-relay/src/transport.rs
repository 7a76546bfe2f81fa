use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error};
use url::Url;

use moor_protocol::Frame;

use crate::error::RelayError;

/// One secured, ordered frame pipe to the relay.
///
/// [`Transport::dial`] speaks websocket-over-TLS; [`Transport::pair`]
/// builds an in-memory transport for driving the engine without
/// sockets. Either way the engine sees the same thing: an outbound
/// sender and an inbound receiver, both of which close when the peer
/// goes away.
pub struct Transport {
    pub(crate) outbound: mpsc::UnboundedSender<Frame>,
    pub(crate) inbound: mpsc::UnboundedReceiver<Frame>,
}

/// The relay-side half of [`Transport::pair`]. Frames the client sends
/// arrive on `inbound`; frames pushed into `outbound` reach the client.
pub struct TransportPeer {
    pub outbound: mpsc::UnboundedSender<Frame>,
    pub inbound: mpsc::UnboundedReceiver<Frame>,
}

impl Transport {
    /// Dial the relay endpoint, presenting the shared-access signature
    /// as part of the websocket handshake.
    pub async fn dial(endpoint: &str, sas: &str) -> Result<Self, RelayError> {
        let url = relay_url(endpoint, sas)?;
        let (ws, _) = connect_async(url.as_str()).await?;
        let (mut sink, mut stream) = ws.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<Frame>();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = out_rx.recv() => match frame {
                        Some(frame) => {
                            let text = match serde_json::to_string(&frame) {
                                Ok(text) => text,
                                Err(e) => {
                                    error!(error = %e, "unencodable outbound frame");
                                    break;
                                }
                            };
                            if let Err(e) = sink.send(Message::Text(text)).await {
                                debug!(error = %e, "relay send failed");
                                break;
                            }
                        }
                        None => {
                            let _ = sink.send(Message::Close(None)).await;
                            break;
                        }
                    },
                    msg = stream.next() => match msg {
                        Some(Ok(Message::Text(text))) => match serde_json::from_str::<Frame>(&text) {
                            Ok(frame) => {
                                if in_tx.send(frame).is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                // a frame we cannot parse poisons the whole
                                // stream; drop the connection
                                error!(error = %e, "malformed relay frame");
                                break;
                            }
                        },
                        Some(Ok(Message::Close(_))) | None => {
                            debug!("relay closed the connection");
                            break;
                        }
                        Some(Ok(_)) => {} // ping/pong
                        Some(Err(e)) => {
                            debug!(error = %e, "relay read failed");
                            break;
                        }
                    },
                }
            }
        });

        Ok(Self {
            outbound: out_tx,
            inbound: in_rx,
        })
    }

    /// In-memory transport plus the relay-side half, for tests.
    pub fn pair() -> (Self, TransportPeer) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        (
            Self {
                outbound: out_tx,
                inbound: in_rx,
            },
            TransportPeer {
                outbound: in_tx,
                inbound: out_rx,
            },
        )
    }
}

/// Normalize a relay endpoint into a websocket URL carrying the SAS
/// token. Relay endpoints are published as `sb://` or `https://`; both
/// map to `wss://`.
fn relay_url(endpoint: &str, sas: &str) -> Result<Url, RelayError> {
    let Some((scheme, rest)) = endpoint.split_once("://") else {
        return Err(RelayError::Protocol(format!(
            "invalid relay endpoint {endpoint:?}"
        )));
    };
    let ws_scheme = match scheme {
        "sb" | "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(RelayError::Protocol(format!(
                "unsupported relay scheme {other:?}"
            )));
        }
    };
    let mut url = Url::parse(&format!("{ws_scheme}://{rest}"))
        .map_err(|e| RelayError::Protocol(format!("invalid relay endpoint {endpoint:?}: {e}")))?;
    if !sas.is_empty() {
        url.query_pairs_mut().append_pair("sb-hs-token", sas);
    }
    Ok(url)
}
