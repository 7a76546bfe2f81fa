//! In-process fake relay for exercising moor session clients.
//!
//! A [`FakeRelay`] is configured with a session-token password and a
//! table of RPC services, then either handed to the client as an
//! in-memory transport ([`FakeRelay::spawn`]) or served over a real
//! local websocket ([`FakeRelay::listen`]) to exercise the dial path.
//! Service handlers can push notifications through a [`Notifier`], and
//! unhandled `streamManager.getStream` requests get echo streams, which
//! is enough to drive a tunnel end to end.

use std::collections::{HashMap, HashSet};

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use moor_protocol::{Frame, StreamClosed, StreamData, methods};
use moor_relay::Transport;

type Service = Box<dyn Fn(Value) -> Result<Value, String> + Send + Sync>;

/// A configurable fake relay.
pub struct FakeRelay {
    password: Option<String>,
    services: HashMap<String, Service>,
    push_tx: mpsc::UnboundedSender<Frame>,
    push_rx: mpsc::UnboundedReceiver<Frame>,
}

/// Pushes server-initiated frames into a running [`FakeRelay`]. Handed
/// out before the relay starts so service handlers can capture one.
#[derive(Clone)]
pub struct Notifier {
    push: mpsc::UnboundedSender<Frame>,
}

impl Notifier {
    pub fn notify(&self, method: &str, params: Value) {
        let _ = self.push.send(Frame::notification(method, params));
    }

    /// Push a raw frame, e.g. a server-initiated request carrying an id.
    pub fn push_frame(&self, frame: Frame) {
        let _ = self.push.send(frame);
    }
}

/// Controls a running fake relay.
pub struct FakeRelayHandle {
    notifier: Notifier,
    shutdown: CancellationToken,
}

impl FakeRelayHandle {
    pub fn notify(&self, method: &str, params: Value) {
        self.notifier.notify(method, params);
    }

    pub fn notifier(&self) -> Notifier {
        self.notifier.clone()
    }

    /// Drop the connection, as a relay outage would.
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

impl Default for FakeRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRelay {
    pub fn new() -> Self {
        let (push_tx, push_rx) = mpsc::unbounded_channel();
        Self {
            password: None,
            services: HashMap::new(),
            push_tx,
            push_rx,
        }
    }

    /// Require this session token on `connection.authenticate` and
    /// reject every other call until it has been presented.
    pub fn with_password(mut self, token: &str) -> Self {
        self.password = Some(token.to_string());
        self
    }

    /// Serve `method` with `handler`.
    pub fn with_service<F>(mut self, method: &str, handler: F) -> Self
    where
        F: Fn(Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.services.insert(method.to_string(), Box::new(handler));
        self
    }

    /// A push channel into the relay, usable before it starts.
    pub fn notifier(&self) -> Notifier {
        Notifier {
            push: self.push_tx.clone(),
        }
    }

    /// Start serving over an in-memory transport pair.
    pub fn spawn(self) -> (Transport, FakeRelayHandle) {
        let (transport, peer) = Transport::pair();
        let shutdown = CancellationToken::new();
        let handle = FakeRelayHandle {
            notifier: Notifier {
                push: self.push_tx.clone(),
            },
            shutdown: shutdown.clone(),
        };
        let state = ServerState {
            password: self.password,
            services: self.services,
        };
        tokio::spawn(serve(
            state,
            peer.inbound,
            peer.outbound,
            self.push_rx,
            shutdown,
        ));
        (transport, handle)
    }

    /// Serve one websocket connection on an ephemeral local port and
    /// return its `ws://` URL, exercising the client's dial path.
    pub async fn listen(self) -> anyhow::Result<(String, FakeRelayHandle)> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let url = format!("ws://{}", listener.local_addr()?);
        let shutdown = CancellationToken::new();
        let handle = FakeRelayHandle {
            notifier: Notifier {
                push: self.push_tx.clone(),
            },
            shutdown: shutdown.clone(),
        };
        let state = ServerState {
            password: self.password,
            services: self.services,
        };
        let push_rx = self.push_rx;

        let token = shutdown.clone();
        tokio::spawn(async move {
            let Ok((tcp, _)) = listener.accept().await else {
                return;
            };
            let Ok(ws) = tokio_tungstenite::accept_async(tcp).await else {
                return;
            };
            let (mut sink, mut stream) = ws.split();
            let (in_tx, in_rx) = mpsc::unbounded_channel();
            let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Frame>();

            let pump_token = token.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = pump_token.cancelled() => {
                            let _ = sink.send(Message::Close(None)).await;
                            break;
                        }
                        frame = out_rx.recv() => match frame {
                            Some(frame) => {
                                let Ok(text) = serde_json::to_string(&frame) else { break };
                                if sink.send(Message::Text(text)).await.is_err() {
                                    break;
                                }
                            }
                            None => {
                                let _ = sink.send(Message::Close(None)).await;
                                break;
                            }
                        },
                        msg = stream.next() => match msg {
                            Some(Ok(Message::Text(text))) => {
                                let Ok(frame) = serde_json::from_str::<Frame>(&text) else { break };
                                if in_tx.send(frame).is_err() {
                                    break;
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => {}
                            Some(Err(_)) => break,
                        },
                    }
                }
            });

            serve(state, in_rx, out_tx, push_rx, token).await;
        });

        Ok((url, handle))
    }
}

struct ServerState {
    password: Option<String>,
    services: HashMap<String, Service>,
}

async fn serve(
    state: ServerState,
    mut inbound: mpsc::UnboundedReceiver<Frame>,
    outbound: mpsc::UnboundedSender<Frame>,
    mut push: mpsc::UnboundedReceiver<Frame>,
    shutdown: CancellationToken,
) {
    let mut authed = false;
    let mut push_open = true;
    let mut echo_streams: HashSet<String> = HashSet::new();
    let mut next_stream = 1u32;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            frame = push.recv(), if push_open => match frame {
                Some(frame) => {
                    if outbound.send(frame).is_err() {
                        break;
                    }
                }
                None => push_open = false,
            },
            frame = inbound.recv() => {
                let Some(frame) = frame else { break };
                let Some(method) = frame.method.clone() else { continue };
                match frame.id {
                    Some(id) => {
                        let params = frame.params.unwrap_or(Value::Null);
                        let response = respond(
                            &state,
                            &mut authed,
                            &mut echo_streams,
                            &mut next_stream,
                            id,
                            &method,
                            params,
                        );
                        if outbound.send(response).is_err() {
                            break;
                        }
                    }
                    None => {
                        // client notification: echo-stream traffic
                        if method == methods::STREAM_DATA {
                            let Ok(data) = serde_json::from_value::<StreamData>(
                                frame.params.clone().unwrap_or(Value::Null),
                            ) else {
                                continue;
                            };
                            if echo_streams.contains(&data.stream_id)
                                && outbound.send(frame).is_err()
                            {
                                break;
                            }
                        } else if method == methods::STREAM_CLOSED {
                            if let Ok(closed) = serde_json::from_value::<StreamClosed>(
                                frame.params.unwrap_or(Value::Null),
                            ) {
                                echo_streams.remove(&closed.stream_id);
                            }
                        }
                    }
                }
            }
        }
    }
}

fn respond(
    state: &ServerState,
    authed: &mut bool,
    echo_streams: &mut HashSet<String>,
    next_stream: &mut u32,
    id: u64,
    method: &str,
    params: Value,
) -> Frame {
    if method == methods::AUTHENTICATE {
        return match &state.password {
            Some(expected) if params[1] != json!(expected.as_str()) => {
                Frame::error_response(id, "invalid session token")
            }
            _ => {
                *authed = true;
                Frame::response(id, json!(true))
            }
        };
    }
    if state.password.is_some() && !*authed {
        return Frame::error_response(id, "not authenticated");
    }
    if let Some(service) = state.services.get(method) {
        return match service(params) {
            Ok(result) => Frame::response(id, result),
            Err(message) => Frame::error_response(id, message),
        };
    }
    if method == methods::GET_STREAM {
        let stream_id = format!("stream-{next_stream}");
        *next_stream += 1;
        echo_streams.insert(stream_id.clone());
        return Frame::response(id, json!(stream_id));
    }
    Frame::error_response(id, format!("unknown method: {method}"))
}
