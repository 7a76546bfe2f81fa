use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("authentication rejected: {0}")]
    Authentication(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("{method}: {message}")]
    Rpc { method: String, message: String },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("workspace already joined")]
    AlreadyJoined,

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Protocol(err.to_string())
    }
}
