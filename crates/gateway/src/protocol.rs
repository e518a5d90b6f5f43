//! Wire protocol for downstream subscribers.
//!
//! A connection carries exactly one subscribe request (a bare JSON
//! object) followed by server frames tagged with `type`.

use chrono::{DateTime, Utc};
use common::{Candle, ErrorCode};
use serde::{Deserialize, Serialize};

/// The single subscribe frame a client sends after connecting.
#[derive(Debug, Clone, Deserialize)]
pub struct SubscribeRequest {
    pub exchange: String,
    #[serde(default)]
    pub contract_type: Option<String>,
    pub symbols: Vec<String>,
    /// Total quote frames to deliver before the server closes the
    /// connection; 0 streams forever.
    #[serde(default)]
    pub limit: u64,
}

impl SubscribeRequest {
    /// Structural validation shared by the WS handler.
    pub fn validate(&self) -> Result<(), String> {
        if self.exchange.trim().is_empty() {
            return Err("field 'exchange' is required and must be a non-empty string".to_string());
        }
        if self.symbols.is_empty() {
            return Err("field 'symbols' is required and must be a non-empty list".to_string());
        }
        if self.symbols.iter().any(|s| s.trim().is_empty()) {
            return Err("each symbol must be a non-empty string".to_string());
        }
        if let Some(contract_type) = &self.contract_type {
            if contract_type.trim().is_empty() {
                return Err("field 'contract_type' must be a non-empty string when provided".to_string());
            }
        }
        Ok(())
    }
}

/// Frames sent from the gateway to a subscriber.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Subscribed {
        exchange: String,
        contract_type: String,
        symbols: Vec<String>,
        limit: u64,
    },
    Quote(QuoteData),
    Error(ErrorData),
}

/// One forwarded candle.
#[derive(Debug, Clone, Serialize)]
pub struct QuoteData {
    /// Send time at the gateway.
    pub current_time: DateTime<Utc>,
    /// Bar open time.
    pub timestamp: DateTime<Utc>,
    pub exchange: String,
    pub symbol: String,
    pub contract_type: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub trade_num: u64,
    pub is_closed_candle: bool,
}

impl QuoteData {
    pub fn from_candle(candle: &Candle) -> Self {
        Self {
            current_time: Utc::now(),
            timestamp: candle.open_time,
            exchange: candle.exchange.to_string(),
            symbol: candle.symbol.clone(),
            contract_type: candle.contract_type.clone(),
            open: candle.open,
            high: candle.high,
            low: candle.low,
            close: candle.close,
            volume: candle.volume,
            trade_num: candle.trade_num,
            is_closed_candle: candle.is_closed,
        }
    }
}

/// Error frame; optional fields are omitted when absent.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorData {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exchange: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contract_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbols: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exchange_message: Option<String>,
}

impl ErrorData {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            exchange: None,
            contract_type: None,
            symbols: None,
            exchange_message: None,
        }
    }

    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = Some(exchange.into());
        self
    }

    pub fn with_contract_type(mut self, contract_type: impl Into<String>) -> Self {
        self.contract_type = Some(contract_type.into());
        self
    }

    pub fn with_symbols(mut self, symbols: Vec<String>) -> Self {
        self.symbols = Some(symbols);
        self
    }

    pub fn with_exchange_message(mut self, message: Option<String>) -> Self {
        self.exchange_message = message;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use common::Exchange;
    use serde_json::Value;

    #[test]
    fn subscribe_request_decodes_bare_object() {
        let request: SubscribeRequest = serde_json::from_str(
            r#"{"exchange":"binance","contract_type":"spot","symbols":["BTCUSDT"],"limit":3}"#,
        )
        .unwrap();
        assert_eq!(request.exchange, "binance");
        assert_eq!(request.contract_type.as_deref(), Some("spot"));
        assert_eq!(request.symbols, vec!["BTCUSDT"]);
        assert_eq!(request.limit, 3);
        assert!(request.validate().is_ok());
    }

    #[test]
    fn limit_and_contract_type_default() {
        let request: SubscribeRequest =
            serde_json::from_str(r#"{"exchange":"okx","symbols":["BTC-USDT"]}"#).unwrap();
        assert_eq!(request.limit, 0);
        assert!(request.contract_type.is_none());
    }

    #[test]
    fn validation_rejects_empty_fields() {
        let request: SubscribeRequest =
            serde_json::from_str(r#"{"exchange":"","symbols":["BTCUSDT"]}"#).unwrap();
        assert!(request.validate().is_err());

        let request: SubscribeRequest =
            serde_json::from_str(r#"{"exchange":"binance","symbols":[]}"#).unwrap();
        assert!(request.validate().is_err());

        let request: SubscribeRequest =
            serde_json::from_str(r#"{"exchange":"binance","symbols":[""]}"#).unwrap();
        assert!(request.validate().is_err());
    }

    #[test]
    fn quote_frame_shape_matches_contract() {
        let candle = Candle {
            exchange: Exchange::Binance,
            contract_type: "spot".to_string(),
            symbol: "BTCUSDT".to_string(),
            open_time: Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap(),
            open: 44100.0,
            high: 44150.0,
            low: 44080.0,
            close: 44123.45,
            volume: 123.456,
            trade_num: 102,
            is_closed: true,
        };
        let json = serde_json::to_value(ServerMessage::Quote(QuoteData::from_candle(&candle))).unwrap();
        assert_eq!(json["type"], "quote");
        assert_eq!(json["exchange"], "binance");
        assert_eq!(json["is_closed_candle"], true);
        assert_eq!(json["trade_num"], 102);
        assert!(json["current_time"].is_string());
        assert!(json["timestamp"].as_str().unwrap().starts_with("2024-05-01T12:30:00"));
    }

    #[test]
    fn error_frame_omits_absent_fields() {
        let message = ServerMessage::Error(
            ErrorData::new(ErrorCode::InvalidSymbol, "unknown symbol")
                .with_exchange("binance")
                .with_symbols(vec!["FOOXYZ".to_string()]),
        );
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["code"], "INVALID_SYMBOL");
        assert_eq!(json["symbols"][0], "FOOXYZ");
        let Value::Object(map) = &json else { panic!() };
        assert!(!map.contains_key("contract_type"));
        assert!(!map.contains_key("exchange_message"));
    }

    #[test]
    fn subscribed_frame_lists_accepted_symbols() {
        let message = ServerMessage::Subscribed {
            exchange: "binance".to_string(),
            contract_type: "spot".to_string(),
            symbols: vec!["BTCUSDT".to_string()],
            limit: 3,
        };
        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "subscribed");
        assert_eq!(json["limit"], 3);
    }
}
