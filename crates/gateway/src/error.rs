//! Gateway error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("connector error: {0}")]
    Connector(#[from] connector::ConnectorError),

    #[error("invalid subscription payload: {0}")]
    InvalidPayload(String),
}

pub type Result<T> = std::result::Result<T, GatewayError>;
