use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("WebSocket connection error: {0}")]
    WebSocketError(#[from] fastwebsockets::WebSocketError),

    #[error("JSON serialization/deserialization error: {0}")]
    SerdeError(#[from] serde_json::Error),

    #[error("URL parsing error: {0}")]
    UrlError(#[from] url::ParseError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    TlsError(#[from] rustls::Error),

    #[error("Connection timeout")]
    Timeout,

    #[error("Connection closed unexpectedly")]
    ConnectionClosed,

    #[error("Handshake failed: {reason}")]
    HandshakeFailed { reason: String },

    #[error("Server rejected namespace connect: {message}")]
    ConnectRejected { message: String },

    #[error("Maximum reconnection attempts exceeded")]
    MaxReconnectsExceeded,

    #[error("Invalid message format: {0}")]
    InvalidMessage(String),

    #[error("Unknown event: {name}")]
    UnknownEvent { name: String },

    #[error("Metrics server error: {0}")]
    MetricsError(String),
}

impl SyncError {
    /// Errors that describe a malformed frame or payload rather than a broken link.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            SyncError::SerdeError(_) | SyncError::InvalidMessage(_) | SyncError::UnknownEvent { .. }
        )
    }
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_errors_are_classified() {
        assert!(SyncError::InvalidMessage("x".into()).is_protocol());
        assert!(
            SyncError::UnknownEvent {
                name: "mystery".into()
            }
            .is_protocol()
        );
        assert!(!SyncError::Timeout.is_protocol());
        assert!(!SyncError::ConnectionClosed.is_protocol());
    }

    #[test]
    fn messages_render() {
        let err = SyncError::ConnectRejected {
            message: "not authorized".into(),
        };
        assert_eq!(
            err.to_string(),
            "Server rejected namespace connect: not authorized"
        );
    }
}
