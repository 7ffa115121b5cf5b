use thiserror::Error;

/// Error types for the peershare agent
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    #[error("Not connected to relay")]
    NotConnected,

    #[error("Timeout waiting for response")]
    Timeout,

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Base64 decode error: {0}")]
    Base64Error(#[from] base64::DecodeError),

    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Type alias for Results using RelayError
pub type Result<T> = std::result::Result<T, RelayError>;
