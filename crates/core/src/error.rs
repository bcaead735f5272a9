use thiserror::Error;

pub type Result<T> = std::result::Result<T, TradeGateError>;

#[derive(Error, Debug)]
pub enum TradeGateError {
    /// Non-2xx REST response. The body is kept for diagnostics.
    #[error("Request failed with status {status}: {body}")]
    Request { status: u16, body: String },

    /// The local rate model no longer matches what the exchange reports.
    #[error("Rate limit integrity error: {0}")]
    RateLimitIntegrity(String),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Subscription state error: {0}")]
    SubscriptionState(String),

    #[error("Stream ended: connection closed")]
    StreamEnded,

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Invalid order: {0}")]
    InvalidOrder(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TradeGateError {
    /// Fatal errors mean the gateway's model of the exchange is wrong and
    /// continuing would be unsafe.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TradeGateError::RateLimitIntegrity(_))
    }

    pub fn is_connection_lost(&self) -> bool {
        matches!(self, TradeGateError::ConnectionLost(_) | TradeGateError::StreamEnded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_error_keeps_body() {
        let err = TradeGateError::Request {
            status: 400,
            body: r#"{"code":-1102,"msg":"Mandatory parameter 'symbol' was not sent"}"#.to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("400"));
        assert!(text.contains("-1102"));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_error_classification() {
        assert!(TradeGateError::RateLimitIntegrity("x-mbx-foo".into()).is_fatal());
        assert!(TradeGateError::ConnectionLost("reset".into()).is_connection_lost());
        assert!(TradeGateError::StreamEnded.is_connection_lost());
        assert!(!TradeGateError::SubscriptionState("closed".into()).is_connection_lost());
    }
}
