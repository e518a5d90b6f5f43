//! Error types for the upstream streaming engine.

use common::ErrorCode;
use thiserror::Error;

/// Errors raised by the upstream session and its collaborators.
#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("subscription rejected by exchange: {0}")]
    SubscribeRejected(String),

    #[error("rate limited by exchange: {0}")]
    RateLimited(String),

    #[error("stream timeout: {0}")]
    StreamTimeout(String),

    #[error("REST backfill failed: {0}")]
    BackfillFailed(String),

    #[error("unsupported contract type: {0}")]
    UnsupportedContractType(String),

    #[error("invalid symbol: {0}")]
    InvalidSymbol(String),

    #[error("{0}")]
    Generic(String),
}

impl ConnectorError {
    /// Map onto the stable wire-level error code.
    pub fn code(&self) -> ErrorCode {
        match self {
            ConnectorError::SubscribeRejected(_) => ErrorCode::WsSubscribeRejected,
            ConnectorError::RateLimited(_) => ErrorCode::RateLimited,
            ConnectorError::StreamTimeout(_) => ErrorCode::WsStreamTimeout,
            ConnectorError::BackfillFailed(_) => ErrorCode::RestBackfillFailed,
            ConnectorError::UnsupportedContractType(_) => ErrorCode::UnsupportedContractType,
            ConnectorError::InvalidSymbol(_) => ErrorCode::InvalidSymbol,
            ConnectorError::ConnectFailed(_)
            | ConnectorError::WebSocket(_)
            | ConnectorError::ConnectionClosed => ErrorCode::WsConnectFailed,
            _ => ErrorCode::Unknown,
        }
    }
}

pub type Result<T> = std::result::Result<T, ConnectorError>;

/// A frame that could not be normalised. Parse errors are absorbed
/// locally: counted and dropped, never surfaced to subscribers.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid value for {field}: {value}")]
    InvalidValue { field: &'static str, value: String },

    #[error("candle violates OHLC invariants")]
    MalformedCandle,
}
