//! Stable error taxonomy surfaced to downstream subscribers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error codes forming the wire contract with subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidSymbol,
    UnsupportedContractType,
    ConnectionPoolBusy,
    WsConnectFailed,
    WsSubscribeRejected,
    WsStreamTimeout,
    RestBackfillFailed,
    RateLimited,
    InternalQueueBackpressure,
    Unknown,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidSymbol => "INVALID_SYMBOL",
            ErrorCode::UnsupportedContractType => "UNSUPPORTED_CONTRACT_TYPE",
            ErrorCode::ConnectionPoolBusy => "CONNECTION_POOL_BUSY",
            ErrorCode::WsConnectFailed => "WS_CONNECT_FAILED",
            ErrorCode::WsSubscribeRejected => "WS_SUBSCRIBE_REJECTED",
            ErrorCode::WsStreamTimeout => "WS_STREAM_TIMEOUT",
            ErrorCode::RestBackfillFailed => "REST_BACKFILL_FAILED",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::InternalQueueBackpressure => "INTERNAL_QUEUE_BACKPRESSURE",
            ErrorCode::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
