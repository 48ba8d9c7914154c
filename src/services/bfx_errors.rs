//! Bitfinex API Error Differentiation
//!
//! Parses Bitfinex v2 error responses (`["error", code, "message"]`) into
//! structured types so callers can decide whether to retry or give up.

use crate::types::OrderId;
use thiserror::Error;

/// Structured order gateway errors
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// Too many requests, back off
    #[error("rate limited by Bitfinex")]
    RateLimited,
    /// API key, nonce or signature rejected
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    /// Order does not exist or is already closed
    #[error("order {0} not found")]
    OrderNotFound(OrderId),
    /// Exchange refused the request (bad amount, insufficient balance, ...)
    #[error("request rejected: {0}")]
    Rejected(String),
    /// Network/connection error (timeout, DNS, etc.)
    #[error("network error: {0}")]
    Network(String),
    /// Response body did not have the expected shape
    #[error("unexpected response: {0}")]
    Decode(String),
    /// Anything else, with the API error code
    #[error("Bitfinex API error {code}: {message}")]
    Api { code: i64, message: String },
}

/// Bitfinex error codes
const ERR_RATE_LIMIT: i64 = 11010;
const ERR_AUTH_FAIL: i64 = 10100;
const ERR_NONCE_SMALL: i64 = 10114;

impl GatewayError {
    /// Parse an error response into a structured error
    pub fn from_response(status: u16, body: &str) -> Self {
        let (code, message) = match serde_json::from_str::<serde_json::Value>(body) {
            Ok(serde_json::Value::Array(fields))
                if fields.first().and_then(|v| v.as_str()) == Some("error") =>
            {
                let code = fields.get(1).and_then(|v| v.as_i64()).unwrap_or(0);
                let message = fields
                    .get(2)
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                (code, message)
            }
            Ok(serde_json::Value::Object(map)) => {
                let message = map
                    .get("message")
                    .or_else(|| map.get("error"))
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                (0, message)
            }
            _ => (0, body.to_string()),
        };

        let msg_lower = message.to_lowercase();

        if status == 429 || code == ERR_RATE_LIMIT || msg_lower.contains("ratelimit") || msg_lower.contains("rate limit") {
            return GatewayError::RateLimited;
        }

        if status == 401
            || code == ERR_AUTH_FAIL
            || code == ERR_NONCE_SMALL
            || msg_lower.contains("apikey")
            || msg_lower.contains("invalid signature")
            || msg_lower.contains("nonce")
        {
            return GatewayError::AuthenticationFailed(message);
        }

        if msg_lower.contains("not found")
            || msg_lower.contains("insufficient")
            || msg_lower.contains("invalid")
            || msg_lower.contains("minimum")
        {
            return GatewayError::Rejected(message);
        }

        GatewayError::Api { code, message }
    }

    /// Parse a network/reqwest error
    pub fn from_network_error(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            GatewayError::Network("request timed out".to_string())
        } else if err.is_connect() {
            GatewayError::Network("connection failed".to_string())
        } else if err.is_decode() {
            GatewayError::Decode(err.to_string())
        } else {
            GatewayError::Network(err.to_string())
        }
    }

    /// Whether an idempotent read may be retried after a short backoff.
    /// Rate limits are not: Bitfinex extends the block on every request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::Network(_))
    }
}
