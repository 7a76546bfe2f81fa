use serde::{Deserialize, Serialize};
use serde_json::Value;

/// RPC method names spoken over the relay.
pub mod methods {
    /// Handshake call issued immediately after dialing the relay.
    pub const AUTHENTICATE: &str = "connection.authenticate";
    pub const JOIN_WORKSPACE: &str = "workspace.joinWorkspace";
    pub const START_SHARING: &str = "serverSharing.startSharing";
    pub const GET_SHARED_SERVERS: &str = "serverSharing.getSharedServers";
    pub const UPDATE_SHARED_SERVER_PRIVACY: &str = "serverSharing.updateSharedServerPrivacy";
    pub const SHARING_SUCCEEDED: &str = "serverSharing.sharingSucceeded";
    pub const SHARING_FAILED: &str = "serverSharing.sharingFailed";
    pub const GET_STREAM: &str = "streamManager.getStream";
    pub const STREAM_DATA: &str = "stream.data";
    pub const STREAM_CLOSED: &str = "stream.closed";
}

/// A single relay frame, one JSON object per websocket text message.
///
/// Requests carry `id` + `method`, responses `id` + `result`/`error`,
/// notifications `method` only. Server-initiated requests (`method` and
/// `id` both set) are routed by method name like notifications; the
/// client never answers them.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Frame {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

/// Error payload of a failed response frame.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RpcError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
}

/// A [`Frame`] sorted into the two inbound shapes the engine routes.
#[derive(Debug, Clone)]
pub enum FrameKind {
    /// Correlated reply to an outbound call.
    Response {
        id: u64,
        result: Value,
        error: Option<RpcError>,
    },
    /// Server-pushed frame keyed by method name.
    Notification {
        method: String,
        params: Value,
    },
}

impl Frame {
    pub fn request(id: u64, method: &str, params: Value) -> Self {
        Self {
            id: Some(id),
            method: Some(method.to_string()),
            params: Some(params),
            result: None,
            error: None,
        }
    }

    pub fn response(id: u64, result: Value) -> Self {
        Self {
            id: Some(id),
            method: None,
            params: None,
            result: Some(result),
            error: None,
        }
    }

    pub fn error_response(id: u64, message: impl Into<String>) -> Self {
        Self {
            id: Some(id),
            method: None,
            params: None,
            result: None,
            error: Some(RpcError {
                message: message.into(),
                code: None,
            }),
        }
    }

    pub fn notification(method: &str, params: Value) -> Self {
        Self {
            id: None,
            method: Some(method.to_string()),
            params: Some(params),
            result: None,
            error: None,
        }
    }

    /// Sort an inbound frame. Returns `None` for frames that are neither
    /// a response nor carry a method name.
    pub fn classify(self) -> Option<FrameKind> {
        if let Some(method) = self.method {
            return Some(FrameKind::Notification {
                method,
                params: self.params.unwrap_or(Value::Null),
            });
        }
        let id = self.id?;
        Some(FrameKind::Response {
            id,
            result: self.result.unwrap_or(Value::Null),
            error: self.error,
        })
    }
}

/// Capabilities advertised in `workspace.joinWorkspace`.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClientCapabilities {
    pub is_non_interactive: bool,
}

/// Result payload of `workspace.joinWorkspace`.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct JoinWorkspaceResult {
    pub session_number: u32,
}

/// A port exposed by the remote workspace.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Port {
    pub source_port: u16,
    #[serde(default)]
    pub destination_port: u16,
    #[serde(default)]
    pub session_name: String,
    #[serde(default)]
    pub stream_name: String,
    #[serde(default)]
    pub stream_condition: String,
    #[serde(default)]
    pub browse_url: String,
    #[serde(default)]
    pub is_public: bool,
    #[serde(default, rename = "isTCPServerConnectionEstablished")]
    pub is_tcp_server_connection_established: bool,
    #[serde(default, rename = "hasTLSHandshakePassed")]
    pub has_tls_handshake_passed: bool,
    #[serde(default)]
    pub privacy: String,
}

/// Kind of change reported by a sharing notification.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PortChangeKind {
    Start,
    Update,
}

/// Params of `serverSharing.sharingSucceeded` / `sharingFailed`.
///
/// `success` is not on the wire; the client sets it from which of the
/// two methods delivered the notification.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PortNotification {
    pub port: u16,
    pub change_kind: PortChangeKind,
    #[serde(default)]
    pub error_detail: String,
    #[serde(default)]
    pub status_code: i32,
    #[serde(skip)]
    pub success: bool,
}

/// Addresses one shared port's byte stream inside the multiplexed
/// transport: the (streamName, streamCondition) pair returned by
/// `serverSharing.startSharing`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelId {
    pub stream_name: String,
    pub stream_condition: String,
}

impl ChannelId {
    pub fn new(stream_name: impl Into<String>, stream_condition: impl Into<String>) -> Self {
        Self {
            stream_name: stream_name.into(),
            stream_condition: stream_condition.into(),
        }
    }
}

/// Params of a `stream.data` frame.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct StreamData {
    pub stream_id: String,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

/// Params of a `stream.closed` frame.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct StreamClosed {
    pub stream_id: String,
}

/// Base64 encoding for byte payloads in JSON.
mod base64_bytes {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_frame_wire_shape() {
        let frame = Frame::request(7, methods::START_SHARING, json!([2222, "sshd"]));
        let wire = serde_json::to_string(&frame).unwrap();
        assert_eq!(
            wire,
            r#"{"id":7,"method":"serverSharing.startSharing","params":[2222,"sshd"]}"#
        );
    }

    #[test]
    fn classify_response() {
        let frame: Frame = serde_json::from_str(r#"{"id":3,"result":{"sessionNumber":1}}"#).unwrap();
        match frame.classify() {
            Some(FrameKind::Response { id, result, error }) => {
                assert_eq!(id, 3);
                assert_eq!(result["sessionNumber"], 1);
                assert!(error.is_none());
            }
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn classify_response_with_null_result() {
        let frame: Frame = serde_json::from_str(r#"{"id":9,"result":null}"#).unwrap();
        match frame.classify() {
            Some(FrameKind::Response { result, .. }) => assert!(result.is_null()),
            other => panic!("expected response, got {other:?}"),
        }
    }

    #[test]
    fn classify_notification() {
        let frame: Frame =
            serde_json::from_str(r#"{"method":"serverSharing.sharingSucceeded","params":{"port":2222,"changeKind":"start"}}"#)
                .unwrap();
        match frame.classify() {
            Some(FrameKind::Notification { method, params }) => {
                assert_eq!(method, methods::SHARING_SUCCEEDED);
                assert_eq!(params["port"], 2222);
            }
            other => panic!("expected notification, got {other:?}"),
        }
    }

    #[test]
    fn classify_server_request_as_notification() {
        // Server-initiated requests carry an id but route by method name.
        let frame: Frame =
            serde_json::from_str(r#"{"id":12,"method":"connection.renegotiate","params":{}}"#).unwrap();
        assert!(matches!(
            frame.classify(),
            Some(FrameKind::Notification { method, .. }) if method == "connection.renegotiate"
        ));
    }

    #[test]
    fn classify_rejects_bare_frame() {
        let frame: Frame = serde_json::from_str(r#"{"params":[1]}"#).unwrap();
        assert!(frame.classify().is_none());
    }

    #[test]
    fn port_wire_names() {
        let port = Port {
            source_port: 2222,
            stream_name: "stream-name".to_string(),
            stream_condition: "stream-condition".to_string(),
            is_tcp_server_connection_established: true,
            has_tls_handshake_passed: true,
            ..Port::default()
        };
        let wire = serde_json::to_value(&port).unwrap();
        assert_eq!(wire["sourcePort"], 2222);
        assert_eq!(wire["streamName"], "stream-name");
        assert_eq!(wire["isTCPServerConnectionEstablished"], true);
        assert_eq!(wire["hasTLSHandshakePassed"], true);
        let parsed: Port = serde_json::from_value(wire).unwrap();
        assert_eq!(parsed, port);
    }

    #[test]
    fn port_notification_defaults() {
        let n: PortNotification =
            serde_json::from_str(r#"{"port":2222,"changeKind":"start"}"#).unwrap();
        assert_eq!(n.port, 2222);
        assert_eq!(n.change_kind, PortChangeKind::Start);
        assert_eq!(n.error_detail, "");
        assert_eq!(n.status_code, 0);
        assert!(!n.success);
    }

    #[test]
    fn join_result_parses() {
        let r: JoinWorkspaceResult = serde_json::from_str(r#"{"sessionNumber":41}"#).unwrap();
        assert_eq!(r.session_number, 41);
    }

    #[test]
    fn stream_data_base64_payload() {
        let data = StreamData {
            stream_id: "s-1".to_string(),
            data: b"ssh-handshake".to_vec(),
        };
        let wire = serde_json::to_string(&data).unwrap();
        assert!(!wire.contains("ssh-handshake"));
        let parsed: StreamData = serde_json::from_str(&wire).unwrap();
        assert_eq!(parsed.data, b"ssh-handshake");
        assert_eq!(parsed.stream_id, "s-1");
    }
}
