use thiserror::Error;

/// Crate-wide error type for fallible setup and I/O paths.
///
/// This is distinct from the CDP wire error codes in [`crate::relay::frame::codes`]:
/// those are values placed into outgoing JSON frames regardless of which side
/// produced them, while `GatewayError` is the ordinary Rust `Result` error used
/// by `?` inside the gateway's own code.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("pool at capacity")]
    AtCapacity,

    #[error("failed to launch chrome: {0}")]
    LaunchFailed(String),

    #[error("timed out waiting for chrome to become ready on port {0}")]
    StartupTimeout(u16),

    #[error("{0}")]
    Other(String),
}

impl GatewayError {
    /// The HTTP status the upgrade dispatcher should write back on the raw
    /// socket before ever completing a WebSocket handshake (§4.4, §6).
    pub fn http_status(&self) -> u16 {
        match self {
            GatewayError::BadRequest(_) => 400,
            GatewayError::Forbidden(_) => 403,
            GatewayError::AtCapacity => 503,
            _ => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
