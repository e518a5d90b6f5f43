//! OKX candle adapter.
//!
//! All contract types share the single `business` WebSocket; the
//! `candle1m` channel delivers array payloads
//! `[ts, o, h, l, c, vol, …, confirm]` with the bar start in `ts`.

use crate::adapter::{ExchangeAdapter, FrameEvent};
use crate::error::{ConnectorError, ParseError, Result};
use crate::exchanges::{datetime_from_ms, value_epoch_ms, value_f64};
use async_trait::async_trait;
use common::candle::truncate_to_minute;
use common::{Candle, Exchange};
use futures::stream::{self, StreamExt};
use serde_json::{json, Value};
use tracing::{debug, warn};

const STREAM_URL: &str = "wss://ws.okx.com:8443/ws/v5/business";
const REST_URL: &str = "https://www.okx.com/api/v5/market/candles";

pub struct OkxAdapter {
    contract_type: String,
}

impl OkxAdapter {
    pub fn new(contract_type: &str) -> Result<Self> {
        match contract_type {
            "spot" | "swap" | "swap_coinm" => Ok(Self {
                contract_type: contract_type.to_string(),
            }),
            other => Err(ConnectorError::UnsupportedContractType(format!(
                "okx does not support '{other}'"
            ))),
        }
    }

    fn subscribe_op(&self, op: &str, symbols: &[String]) -> String {
        let args: Vec<Value> = symbols
            .iter()
            .map(|symbol| json!({"channel": "candle1m", "instId": symbol}))
            .collect();
        json!({"op": op, "args": args}).to_string()
    }

    fn entry_to_candle(&self, entry: &Value, symbol: &str) -> std::result::Result<Candle, ParseError> {
        let entry = entry.as_array().ok_or(ParseError::MissingField("data[]"))?;
        if entry.len() < 6 {
            return Err(ParseError::MissingField("data[]"));
        }
        let open_ms = value_epoch_ms(&entry[0]).ok_or(ParseError::MissingField("ts"))?;

        // `confirm` sits at index 8 on current payloads, 7 on older ones.
        let confirm = entry.get(8).or_else(|| entry.get(7));
        let is_closed = confirm
            .map(|v| matches!(flag_text(v).as_str(), "1" | "true" | "t"))
            .unwrap_or(false);

        Ok(Candle {
            exchange: Exchange::Okx,
            contract_type: self.contract_type.clone(),
            symbol: symbol.to_string(),
            open_time: truncate_to_minute(datetime_from_ms(open_ms, "ts")?),
            open: value_f64(&entry[1], "o")?,
            high: value_f64(&entry[2], "h")?,
            low: value_f64(&entry[3], "l")?,
            close: value_f64(&entry[4], "c")?,
            volume: value_f64(&entry[5], "vol")?,
            trade_num: 0,
            is_closed,
        })
    }
}

fn flag_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.to_ascii_lowercase(),
        other => other.to_string().to_ascii_lowercase(),
    }
}

#[async_trait]
impl ExchangeAdapter for OkxAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::Okx
    }

    fn contract_type(&self) -> &str {
        &self.contract_type
    }

    fn ws_url(&self, _symbols: &[String]) -> Result<String> {
        Ok(STREAM_URL.to_string())
    }

    fn subscribe_frames(&self, symbols: &[String]) -> Result<Vec<String>> {
        Ok(vec![self.subscribe_op("subscribe", symbols)])
    }

    fn unsubscribe_frames(&self, symbols: &[String]) -> Result<Vec<String>> {
        Ok(vec![self.subscribe_op("unsubscribe", symbols)])
    }

    fn handle_frame(&self, text: &str) -> std::result::Result<FrameEvent, ParseError> {
        let message: Value = serde_json::from_str(text)?;

        match message.get("event").and_then(Value::as_str) {
            Some("subscribe") | Some("unsubscribe") => return Ok(FrameEvent::Ignore),
            Some("error") => {
                let msg = message
                    .get("msg")
                    .and_then(Value::as_str)
                    .unwrap_or("subscription error")
                    .to_string();
                return Ok(FrameEvent::SubscribeRejected(msg));
            }
            _ => {}
        }

        let symbol = message
            .pointer("/arg/instId")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let Some(entries) = message.get("data").and_then(Value::as_array) else {
            return Ok(FrameEvent::Ignore);
        };

        let mut candles = Vec::with_capacity(entries.len());
        for entry in entries {
            candles.push(self.entry_to_candle(entry, &symbol)?);
        }
        Ok(FrameEvent::Candles(candles))
    }

    async fn backfill(
        &self,
        client: &reqwest::Client,
        symbols: &[String],
        concurrency: usize,
    ) -> Result<Vec<Candle>> {
        let responses = stream::iter(symbols.iter().cloned())
            .map(|symbol| {
                let client = client.clone();
                async move {
                    let result = client
                        .get(REST_URL)
                        .query(&[("instId", symbol.as_str()), ("bar", "1m"), ("limit", "1")])
                        .send()
                        .await;
                    (symbol, result)
                }
            })
            .buffer_unordered(concurrency.max(1))
            .collect::<Vec<_>>()
            .await;

        let mut candles = Vec::new();
        for (symbol, result) in responses {
            let response = match result {
                Ok(response) => response,
                Err(err) => {
                    warn!(symbol, error = %err, "okx REST backfill request failed");
                    continue;
                }
            };
            if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
                return Err(ConnectorError::RateLimited(format!(
                    "okx REST returned 429 for {symbol}"
                )));
            }
            let response = match response.error_for_status() {
                Ok(response) => response,
                Err(err) => {
                    warn!(symbol, error = %err, "okx REST backfill request failed");
                    continue;
                }
            };
            let payload: Value = match response.json().await {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(symbol, error = %err, "okx REST backfill returned bad JSON");
                    continue;
                }
            };
            match payload.get("data").and_then(Value::as_array).and_then(|d| d.first()) {
                Some(entry) => match self.entry_to_candle(entry, &symbol) {
                    Ok(candle) => candles.push(candle),
                    Err(err) => warn!(symbol, error = %err, "failed to parse okx REST candle"),
                },
                None => debug!(symbol, "okx REST backfill returned no candles"),
            }
        }
        Ok(candles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> OkxAdapter {
        OkxAdapter::new("swap").unwrap()
    }

    #[test]
    fn subscribe_frame_lists_every_symbol() {
        let frames = adapter()
            .subscribe_frames(&["BTC-USDT-SWAP".to_string(), "ETH-USDT-SWAP".to_string()])
            .unwrap();
        assert_eq!(frames.len(), 1);
        let frame: Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(frame["op"], "subscribe");
        assert_eq!(frame["args"][0]["channel"], "candle1m");
        assert_eq!(frame["args"][1]["instId"], "ETH-USDT-SWAP");
    }

    #[test]
    fn candle_array_maps_with_confirm_flag() {
        let frame = r#"{
            "arg": {"channel": "candle1m", "instId": "BTC-USDT-SWAP"},
            "data": [["1700000040000", "44100.0", "44150.0", "44080.0", "44123.45",
                      "123.456", "5443210", "5443210", "1"]]
        }"#;
        let FrameEvent::Candles(candles) = adapter().handle_frame(frame).unwrap() else {
            panic!("expected candles");
        };
        let candle = &candles[0];
        assert_eq!(candle.symbol, "BTC-USDT-SWAP");
        assert_eq!(candle.contract_type, "swap");
        assert!(candle.is_closed);
        assert_eq!(candle.open_time.timestamp_millis(), 1_700_000_040_000);
    }

    #[test]
    fn confirm_zero_is_open_candle() {
        let frame = r#"{
            "arg": {"channel": "candle1m", "instId": "BTC-USDT"},
            "data": [["1700000040000", "1", "2", "0.5", "1.5", "10", "10", "10", "0"]]
        }"#;
        let FrameEvent::Candles(candles) = adapter().handle_frame(frame).unwrap() else {
            panic!("expected candles");
        };
        assert!(!candles[0].is_closed);
    }

    #[test]
    fn subscribe_ack_is_ignored() {
        let frame = r#"{"event":"subscribe","arg":{"channel":"candle1m","instId":"BTC-USDT"}}"#;
        assert!(matches!(adapter().handle_frame(frame).unwrap(), FrameEvent::Ignore));
    }

    #[test]
    fn error_event_is_rejection() {
        let frame = r#"{"event":"error","code":"60012","msg":"Invalid request"}"#;
        let event = adapter().handle_frame(frame).unwrap();
        assert!(matches!(event, FrameEvent::SubscribeRejected(msg) if msg == "Invalid request"));
    }

    #[test]
    fn short_entry_is_parse_error() {
        let frame = r#"{"arg":{"instId":"BTC-USDT"},"data":[["1700000040000","1","2"]]}"#;
        assert!(adapter().handle_frame(frame).is_err());
    }
}
