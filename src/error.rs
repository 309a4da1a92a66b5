use thiserror::Error;

/// Errors that can occur while serving relay connections.
#[derive(Error, Debug)]
pub enum RelayError {
    /// WebSocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The connection was closed by the remote peer.
    #[error("connection closed")]
    ConnectionClosed,
}
