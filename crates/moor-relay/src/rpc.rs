use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tracing::{debug, warn};

use moor_protocol::{ChannelId, Frame, FrameKind, StreamClosed, StreamData, methods};

use crate::error::RelayError;
use crate::transport::Transport;

/// Multiplexes one relay transport into many concurrent outbound calls
/// and inbound notification listeners.
///
/// Calls are correlated by id; the caller's task parks until the
/// matching response arrives, the transport closes, or the caller drops
/// the future, whichever comes first. A response arriving after its
/// call was dropped is discarded. Notifications are delivered to every
/// listener registered for the method at the instant of arrival, and
/// each registration is consumed by that delivery.
#[derive(Clone)]
pub struct RpcClient {
    shared: Arc<Shared>,
}

struct PendingCall {
    method: String,
    reply: oneshot::Sender<Result<Value, RelayError>>,
}

struct Shared {
    outbound: mpsc::UnboundedSender<Frame>,
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingCall>>,
    listeners: Mutex<HashMap<String, Vec<oneshot::Sender<Frame>>>>,
    streams: Mutex<HashMap<String, mpsc::UnboundedSender<Vec<u8>>>>,
    closed: watch::Sender<bool>,
}

impl RpcClient {
    /// Take ownership of a transport and start routing its frames.
    pub fn start(transport: Transport) -> Self {
        let (closed, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            outbound: transport.outbound,
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            listeners: Mutex::new(HashMap::new()),
            streams: Mutex::new(HashMap::new()),
            closed,
        });

        let router = Arc::clone(&shared);
        let mut inbound = transport.inbound;
        tokio::spawn(async move {
            while let Some(frame) = inbound.recv().await {
                router.route(frame).await;
            }
            router.shut_down().await;
        });

        Self { shared }
    }

    /// Dispatch `method` and park until the correlated response arrives.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, RelayError> {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply, rx) = oneshot::channel();
        self.shared.pending.lock().await.insert(
            id,
            PendingCall {
                method: method.to_string(),
                reply,
            },
        );
        if self
            .shared
            .outbound
            .send(Frame::request(id, method, params))
            .is_err()
        {
            self.shared.pending.lock().await.remove(&id);
            return Err(RelayError::ConnectionClosed);
        }
        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(RelayError::ConnectionClosed),
        }
    }

    /// Like [`call`](Self::call), but a result that does not match `T`
    /// is a protocol error.
    pub async fn call_typed<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, RelayError> {
        let result = self.call(method, params).await?;
        serde_json::from_value(result)
            .map_err(|e| RelayError::Protocol(format!("{method} returned malformed result: {e}")))
    }

    /// Register a one-shot listener for server-pushed frames named
    /// `method`. The registration is consumed by the next delivery for
    /// that method; re-register to keep listening.
    pub async fn register_listener(&self, method: &str) -> oneshot::Receiver<Frame> {
        let (tx, rx) = oneshot::channel();
        self.shared
            .listeners
            .lock()
            .await
            .entry(method.to_string())
            .or_default()
            .push(tx);
        rx
    }

    /// Open a logical byte stream addressed by `channel`, multiplexed
    /// over this transport.
    pub async fn open_stream(&self, channel: &ChannelId) -> Result<RelayStream, RelayError> {
        let stream_id: String = self
            .call_typed(
                methods::GET_STREAM,
                json!([channel.stream_name, channel.stream_condition]),
            )
            .await?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared
            .streams
            .lock()
            .await
            .insert(stream_id.clone(), tx);
        Ok(RelayStream {
            id: stream_id,
            incoming: rx,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Resolves once the transport has terminated.
    pub async fn closed(&self) {
        let mut rx = self.shared.closed.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.shared.closed.subscribe().borrow()
    }
}

impl Shared {
    async fn route(&self, frame: Frame) {
        let Some(method) = frame.method.clone() else {
            return self.route_response(frame).await;
        };
        match method.as_str() {
            methods::STREAM_DATA => {
                let params = frame.params.unwrap_or(Value::Null);
                match serde_json::from_value::<StreamData>(params) {
                    Ok(data) => self.route_stream_data(data).await,
                    Err(e) => warn!(error = %e, "malformed stream.data frame"),
                }
            }
            methods::STREAM_CLOSED => {
                let params = frame.params.unwrap_or(Value::Null);
                match serde_json::from_value::<StreamClosed>(params) {
                    Ok(closed) => {
                        // dropping the sink ends the reader side
                        self.streams.lock().await.remove(&closed.stream_id);
                    }
                    Err(e) => warn!(error = %e, "malformed stream.closed frame"),
                }
            }
            _ => {
                // drain the registrations under the lock, deliver outside it
                let waiters = self
                    .listeners
                    .lock()
                    .await
                    .remove(&method)
                    .unwrap_or_default();
                if waiters.is_empty() {
                    debug!(method = %method, "notification with no listeners");
                    return;
                }
                for waiter in waiters {
                    let _ = waiter.send(frame.clone());
                }
            }
        }
    }

    async fn route_response(&self, frame: Frame) {
        let Some(FrameKind::Response { id, result, error }) = frame.classify() else {
            warn!("unroutable relay frame");
            return;
        };
        let Some(call) = self.pending.lock().await.remove(&id) else {
            debug!(id, "discarding response for cancelled call");
            return;
        };
        let outcome = match error {
            Some(e) => Err(RelayError::Rpc {
                method: call.method,
                message: e.message,
            }),
            None => Ok(result),
        };
        if call.reply.send(outcome).is_err() {
            debug!(id, "discarding response for cancelled call");
        }
    }

    async fn route_stream_data(&self, data: StreamData) {
        let sink = self.streams.lock().await.get(&data.stream_id).cloned();
        let Some(sink) = sink else {
            debug!(stream_id = %data.stream_id, "data for unknown stream");
            return;
        };
        if sink.send(data.data).is_err() {
            self.streams.lock().await.remove(&data.stream_id);
        }
    }

    /// Transport is gone: fail every pending call, wake every waiter.
    async fn shut_down(&self) {
        let pending: Vec<PendingCall> = {
            let mut map = self.pending.lock().await;
            map.drain().map(|(_, call)| call).collect()
        };
        for call in pending {
            let _ = call.reply.send(Err(RelayError::ConnectionClosed));
        }
        self.listeners.lock().await.clear();
        self.streams.lock().await.clear();
        let _ = self.closed.send(true);
        debug!("relay connection closed");
    }
}

/// One logical byte stream multiplexed over the session transport.
pub struct RelayStream {
    id: String,
    incoming: mpsc::UnboundedReceiver<Vec<u8>>,
    shared: Arc<Shared>,
}

impl RelayStream {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Next chunk from the remote side; `None` once the stream or the
    /// transport closes.
    pub async fn read(&mut self) -> Option<Vec<u8>> {
        self.incoming.recv().await
    }

    /// Send one chunk to the remote side.
    pub fn write(&self, data: &[u8]) -> Result<(), RelayError> {
        let params = serde_json::to_value(StreamData {
            stream_id: self.id.clone(),
            data: data.to_vec(),
        })?;
        self.shared
            .outbound
            .send(Frame::notification(methods::STREAM_DATA, params))
            .map_err(|_| RelayError::ConnectionClosed)
    }

    /// Tell the relay this stream is finished.
    pub async fn close(self) {
        self.shared.streams.lock().await.remove(&self.id);
        let _ = self.shared.outbound.send(Frame::notification(
            methods::STREAM_CLOSED,
            json!({ "streamId": self.id }),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportPeer;
    use std::time::Duration;

    fn started() -> (RpcClient, TransportPeer) {
        let (transport, peer) = Transport::pair();
        (RpcClient::start(transport), peer)
    }

    #[tokio::test]
    async fn responses_correlate_out_of_order() {
        let (rpc, mut peer) = started();

        let a = rpc.call("alpha", json!([]));
        let b = rpc.call("beta", json!([]));
        let answer = async {
            let first = peer.inbound.recv().await.unwrap();
            let second = peer.inbound.recv().await.unwrap();
            // answer in reverse submission order
            peer.outbound
                .send(Frame::response(second.id.unwrap(), json!("beta-result")))
                .unwrap();
            peer.outbound
                .send(Frame::response(first.id.unwrap(), json!("alpha-result")))
                .unwrap();
        };

        let (a, b, ()) = tokio::join!(a, b, answer);
        assert_eq!(a.unwrap(), json!("alpha-result"));
        assert_eq!(b.unwrap(), json!("beta-result"));
    }

    #[tokio::test]
    async fn error_response_carries_method_and_message() {
        let (rpc, mut peer) = started();
        let call = rpc.call("serverSharing.startSharing", json!([80]));
        let answer = async {
            let req = peer.inbound.recv().await.unwrap();
            peer.outbound
                .send(Frame::error_response(req.id.unwrap(), "port in use"))
                .unwrap();
        };
        let (outcome, ()) = tokio::join!(call, answer);
        let err = outcome.unwrap_err();
        assert!(matches!(err, RelayError::Rpc { .. }));
        assert_eq!(err.to_string(), "serverSharing.startSharing: port in use");
    }

    #[tokio::test]
    async fn cancelled_call_discards_late_response() {
        let (rpc, mut peer) = started();

        let cancelled =
            tokio::time::timeout(Duration::from_millis(20), rpc.call("slow", json!([]))).await;
        assert!(cancelled.is_err(), "call should have been abandoned");

        // the request was dispatched; answer it late
        let req = peer.inbound.recv().await.unwrap();
        peer.outbound
            .send(Frame::response(req.id.unwrap(), json!("too late")))
            .unwrap();

        // a second call on the same engine is unaffected
        let call = rpc.call("fast", json!([]));
        let answer = async {
            let req = peer.inbound.recv().await.unwrap();
            peer.outbound
                .send(Frame::response(req.id.unwrap(), json!(42)))
                .unwrap();
        };
        let (outcome, ()) = tokio::join!(call, answer);
        assert_eq!(outcome.unwrap(), json!(42));
    }

    #[tokio::test]
    async fn pending_calls_fail_when_transport_closes() {
        let (rpc, mut peer) = started();
        let call = rpc.call("never", json!([]));
        let _ = peer.inbound.recv().await; // wait for dispatch
        drop(peer);
        assert!(matches!(call.await, Err(RelayError::ConnectionClosed)));
        rpc.closed().await;
        assert!(rpc.is_closed());
    }

    #[tokio::test]
    async fn notification_consumes_current_registrations_only() {
        let (rpc, peer) = started();
        let first = rpc.register_listener("serverSharing.sharingSucceeded").await;
        let second = rpc.register_listener("serverSharing.sharingSucceeded").await;

        peer.outbound
            .send(Frame::notification(
                "serverSharing.sharingSucceeded",
                json!({ "port": 80 }),
            ))
            .unwrap();

        let a = first.await.unwrap();
        let b = second.await.unwrap();
        assert_eq!(a.params.as_ref().unwrap()["port"], 80);
        assert_eq!(b.params.as_ref().unwrap()["port"], 80);

        // a registration added after delivery sees the next event
        let third = rpc.register_listener("serverSharing.sharingSucceeded").await;
        peer.outbound
            .send(Frame::notification(
                "serverSharing.sharingSucceeded",
                json!({ "port": 81 }),
            ))
            .unwrap();
        let c = third.await.unwrap();
        assert_eq!(c.params.as_ref().unwrap()["port"], 81);
    }

    #[tokio::test]
    async fn listener_errors_when_transport_closes() {
        let (rpc, peer) = started();
        let listener = rpc.register_listener("serverSharing.sharingFailed").await;
        drop(peer);
        assert!(listener.await.is_err());
    }

    #[tokio::test]
    async fn stream_frames_route_to_their_sink() {
        let (rpc, mut peer) = started();

        let channel = ChannelId::new("s", "c");
        let open = rpc.open_stream(&channel);
        let answer = async {
            let req = peer.inbound.recv().await.unwrap();
            assert_eq!(req.method.as_deref(), Some(methods::GET_STREAM));
            assert_eq!(req.params.as_ref().unwrap()[0], "s");
            peer.outbound
                .send(Frame::response(req.id.unwrap(), json!("stream-1")))
                .unwrap();
        };
        let (stream, ()) = tokio::join!(open, answer);
        let mut stream = stream.unwrap();

        stream.write(b"outbound bytes").unwrap();
        let sent = peer.inbound.recv().await.unwrap();
        let sent: StreamData = serde_json::from_value(sent.params.unwrap()).unwrap();
        assert_eq!(sent.stream_id, "stream-1");
        assert_eq!(sent.data, b"outbound bytes");

        let inbound = serde_json::to_value(StreamData {
            stream_id: "stream-1".to_string(),
            data: b"inbound bytes".to_vec(),
        })
        .unwrap();
        peer.outbound
            .send(Frame::notification(methods::STREAM_DATA, inbound))
            .unwrap();
        assert_eq!(stream.read().await.unwrap(), b"inbound bytes");

        peer.outbound
            .send(Frame::notification(
                methods::STREAM_CLOSED,
                json!({ "streamId": "stream-1" }),
            ))
            .unwrap();
        assert!(stream.read().await.is_none());
    }
}
