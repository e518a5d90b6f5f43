//! Binance kline adapter (spot, USD-margined, coin-margined).
//!
//! Subscriptions ride on the combined-stream URL
//! (`…/stream?streams=<sym>@kline_1m/…`); frames carry the kline under
//! `data.k`. REST backfill hits the matching `klines` endpoint.

use crate::adapter::{ExchangeAdapter, FrameEvent};
use crate::error::{ConnectorError, ParseError, Result};
use crate::exchanges::{datetime_from_ms, field_f64, value_u64};
use async_trait::async_trait;
use common::candle::truncate_to_minute;
use common::{Candle, Exchange};
use futures::stream::{self, StreamExt};
use serde_json::Value;
use tracing::{debug, warn};

pub struct BinanceAdapter {
    contract_type: String,
    stream_base: &'static str,
    rest_url: &'static str,
}

impl BinanceAdapter {
    pub fn new(contract_type: &str) -> Result<Self> {
        let (stream_base, rest_url) = match contract_type {
            "spot" => (
                "wss://stream.binance.com:9443",
                "https://api.binance.com/api/v3/klines",
            ),
            "usdm" => (
                "wss://fstream.binance.com",
                "https://fapi.binance.com/fapi/v1/klines",
            ),
            "coinm" => (
                "wss://dstream.binance.com",
                "https://dapi.binance.com/dapi/v1/klines",
            ),
            other => {
                return Err(ConnectorError::UnsupportedContractType(format!(
                    "binance does not support '{other}'"
                )))
            }
        };
        Ok(Self {
            contract_type: contract_type.to_string(),
            stream_base,
            rest_url,
        })
    }

    fn kline_to_candle(&self, kline: &Value) -> std::result::Result<Candle, ParseError> {
        let symbol = kline
            .get("s")
            .and_then(Value::as_str)
            .ok_or(ParseError::MissingField("k.s"))?
            .to_string();
        let open_ms = kline
            .get("t")
            .and_then(Value::as_i64)
            .ok_or(ParseError::MissingField("k.t"))?;
        Ok(Candle {
            exchange: Exchange::Binance,
            contract_type: self.contract_type.clone(),
            symbol,
            open_time: truncate_to_minute(datetime_from_ms(open_ms, "k.t")?),
            open: field_f64(kline, "o")?,
            high: field_f64(kline, "h")?,
            low: field_f64(kline, "l")?,
            close: field_f64(kline, "c")?,
            volume: kline.get("v").map(|v| super::value_f64(v, "k.v")).transpose()?.unwrap_or(0.0),
            trade_num: kline.get("n").map(value_u64).unwrap_or(0),
            is_closed: kline.get("x").and_then(Value::as_bool).unwrap_or(false),
        })
    }

    fn rest_row_to_candle(&self, symbol: &str, row: &Value) -> Option<Candle> {
        let row = row.as_array()?;
        if row.len() < 6 {
            return None;
        }
        let open_ms = row[0].as_i64()?;
        let candle = Candle {
            exchange: Exchange::Binance,
            contract_type: self.contract_type.clone(),
            symbol: symbol.to_string(),
            open_time: truncate_to_minute(datetime_from_ms(open_ms, "openTime").ok()?),
            open: super::value_f64(&row[1], "open").ok()?,
            high: super::value_f64(&row[2], "high").ok()?,
            low: super::value_f64(&row[3], "low").ok()?,
            close: super::value_f64(&row[4], "close").ok()?,
            volume: super::value_f64(&row[5], "volume").ok()?,
            trade_num: row.get(8).map(value_u64).unwrap_or(0),
            is_closed: true,
        };
        Some(candle)
    }
}

#[async_trait]
impl ExchangeAdapter for BinanceAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::Binance
    }

    fn contract_type(&self) -> &str {
        &self.contract_type
    }

    fn ws_url(&self, symbols: &[String]) -> Result<String> {
        let streams = symbols
            .iter()
            .map(|s| format!("{}@kline_1m", s.to_ascii_lowercase()))
            .collect::<Vec<_>>()
            .join("/");
        Ok(format!("{}/stream?streams={streams}", self.stream_base))
    }

    fn subscribe_frames(&self, _symbols: &[String]) -> Result<Vec<String>> {
        // The combined-stream URL already carries the subscription.
        Ok(Vec::new())
    }

    fn supports_incremental_subscribe(&self) -> bool {
        false
    }

    fn handle_frame(&self, text: &str) -> std::result::Result<FrameEvent, ParseError> {
        let payload: Value = serde_json::from_str(text)?;
        if let Some(error) = payload.get("error") {
            let message = error
                .get("msg")
                .and_then(Value::as_str)
                .unwrap_or("subscription error")
                .to_string();
            return Ok(FrameEvent::SubscribeRejected(message));
        }

        let data = payload.get("data").unwrap_or(&payload);
        let Some(kline) = data.get("k") else {
            return Ok(FrameEvent::Ignore);
        };
        let candle = self.kline_to_candle(kline)?;
        Ok(FrameEvent::Candles(vec![candle]))
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
                        .get(self.rest_url)
                        .query(&[
                            ("symbol", symbol.as_str()),
                            ("interval", "1m"),
                            ("limit", "1"),
                        ])
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
                    warn!(symbol, error = %err, "binance REST backfill request failed");
                    continue;
                }
            };
            if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
                return Err(ConnectorError::RateLimited(format!(
                    "binance REST returned 429 for {symbol}"
                )));
            }
            let response = match response.error_for_status() {
                Ok(response) => response,
                Err(err) => {
                    warn!(symbol, error = %err, "binance REST backfill request failed");
                    continue;
                }
            };
            let rows: Value = match response.json().await {
                Ok(rows) => rows,
                Err(err) => {
                    warn!(symbol, error = %err, "binance REST backfill returned bad JSON");
                    continue;
                }
            };
            match rows.as_array().and_then(|rows| rows.first()) {
                Some(row) => {
                    if let Some(candle) = self.rest_row_to_candle(&symbol, row) {
                        candles.push(candle);
                    } else {
                        warn!(symbol, "failed to parse binance REST candle");
                    }
                }
                None => debug!(symbol, "binance REST backfill returned no candles"),
            }
        }
        Ok(candles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    fn adapter() -> BinanceAdapter {
        BinanceAdapter::new("spot").unwrap()
    }

    #[test]
    fn combined_stream_url_lowercases_symbols() {
        let url = adapter()
            .ws_url(&["BTCUSDT".to_string(), "ETHUSDT".to_string()])
            .unwrap();
        assert_eq!(
            url,
            "wss://stream.binance.com:9443/stream?streams=btcusdt@kline_1m/ethusdt@kline_1m"
        );
    }

    #[test]
    fn usdm_uses_futures_hosts() {
        let adapter = BinanceAdapter::new("usdm").unwrap();
        assert!(adapter.ws_url(&["BTCUSDT".to_string()]).unwrap().starts_with("wss://fstream.binance.com/"));
        assert_eq!(adapter.rest_url, "https://fapi.binance.com/fapi/v1/klines");
    }

    #[test]
    fn kline_frame_maps_to_candle() {
        let frame = r#"{
            "stream": "btcusdt@kline_1m",
            "data": {
                "e": "kline", "E": 1700000043123, "s": "BTCUSDT",
                "k": {
                    "t": 1700000040000, "T": 1700000099999, "s": "BTCUSDT", "i": "1m",
                    "o": "44100.0", "c": "44123.45", "h": "44150.0", "l": "44080.0",
                    "v": "123.456", "n": 102, "x": true
                }
            }
        }"#;
        let event = adapter().handle_frame(frame).unwrap();
        let FrameEvent::Candles(candles) = event else {
            panic!("expected candles");
        };
        let candle = &candles[0];
        assert_eq!(candle.symbol, "BTCUSDT");
        assert_eq!(candle.open, 44100.0);
        assert_eq!(candle.close, 44123.45);
        assert_eq!(candle.trade_num, 102);
        assert!(candle.is_closed);
        assert_eq!(candle.open_time.second(), 0);
        assert_eq!(candle.open_time.timestamp_millis(), 1_700_000_040_000);
        assert!(candle.is_well_formed());
    }

    #[test]
    fn ack_frames_are_ignored() {
        let event = adapter().handle_frame(r#"{"result":null,"id":1}"#).unwrap();
        assert!(matches!(event, FrameEvent::Ignore));
    }

    #[test]
    fn missing_price_fields_are_parse_errors() {
        let frame = r#"{"data":{"k":{"t":1700000040000,"s":"BTCUSDT","o":"1.0"}}}"#;
        assert!(adapter().handle_frame(frame).is_err());
    }

    #[test]
    fn error_frame_is_subscribe_rejection() {
        let frame = r#"{"error":{"code":2,"msg":"Invalid request"}}"#;
        let event = adapter().handle_frame(frame).unwrap();
        assert!(matches!(event, FrameEvent::SubscribeRejected(msg) if msg == "Invalid request"));
    }

    #[test]
    fn rest_row_parses_array_payload() {
        let row: Value = serde_json::from_str(
            r#"[1700000040000, "44100.0", "44150.0", "44080.0", "44123.45", "123.456",
                1700000099999, "5443210.0", 102, "60.0", "2650000.0", "0"]"#,
        )
        .unwrap();
        let candle = adapter().rest_row_to_candle("BTCUSDT", &row).unwrap();
        assert!(candle.is_closed);
        assert_eq!(candle.trade_num, 102);
        assert_eq!(candle.open_time.timestamp_millis(), 1_700_000_040_000);
    }
}
