use thiserror::Error;
use tokio_tungstenite::tungstenite;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The control channel answered with something other than 200.
    #[error("Non-200 response from Discord API ({status}): {body}")]
    ControlChannel { status: u16, body: String },

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// An application message was sent before the gateway identified.
    #[error("Not connected to the gateway")]
    NotConnected,

    #[error("Already connected to the gateway")]
    AlreadyConnected,

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("Invalid gateway url: {0}")]
    InvalidGatewayUrl(#[from] url::ParseError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Gateway connection closed")]
    ConnectionClosed,
}

/// Failure to turn an inbound websocket message into a [`Frame`](crate::discord::payload::Frame).
#[derive(Debug, Error)]
pub enum FrameDecodeError {
    #[error("zlib inflate failed: {0}")]
    Inflate(#[from] std::io::Error),

    #[error("inflated frame exceeds {0} bytes")]
    TooLarge(usize),

    #[error("frame is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("frame is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}
