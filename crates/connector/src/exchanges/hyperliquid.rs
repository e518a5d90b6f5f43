//! Hyperliquid candle adapter.
//!
//! One WebSocket for every market type; candles arrive on the `candle`
//! channel keyed by a normalised coin name, so the adapter keeps an
//! alias map back to the symbols subscribers asked for. REST backfill
//! is a POST to `/info` with a `candleSnapshot` request.

use crate::adapter::{ExchangeAdapter, FrameEvent};
use crate::error::{ConnectorError, ParseError, Result};
use crate::exchanges::{datetime_from_ms, field_f64, value_epoch_ms, value_u64};
use async_trait::async_trait;
use chrono::Utc;
use common::candle::truncate_to_minute;
use common::{Candle, Exchange};
use futures::stream::{self, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{debug, warn};

const STREAM_URL: &str = "wss://api.hyperliquid.xyz/ws";
const REST_INFO_URL: &str = "https://api.hyperliquid.xyz/info";
const INTERVAL_MS: i64 = 60_000;
const BACKFILL_LOOKBACK_INTERVALS: i64 = 5;

pub struct HyperliquidAdapter {
    contract_type: String,
    spot_market: bool,
    /// Normalised coin (upper-cased) → symbol as the subscriber wrote it.
    aliases: Mutex<HashMap<String, String>>,
}

impl HyperliquidAdapter {
    pub fn new(contract_type: &str) -> Result<Self> {
        match contract_type {
            "spot" | "usdm" | "coinm" => Ok(Self {
                contract_type: contract_type.to_string(),
                spot_market: contract_type == "spot",
                aliases: Mutex::new(HashMap::new()),
            }),
            other => Err(ConnectorError::UnsupportedContractType(format!(
                "hyperliquid does not support '{other}'"
            ))),
        }
    }

    /// Map a subscriber symbol onto Hyperliquid's coin naming: spot
    /// wants `BASE/QUOTE`; perps want the bare base coin with any
    /// quote/suffix stripped.
    fn normalize_symbol(&self, symbol: &str) -> Result<String> {
        let cleaned = symbol.trim();
        if cleaned.is_empty() {
            return Err(ConnectorError::InvalidSymbol(symbol.to_string()));
        }

        if self.spot_market {
            let upper = cleaned.to_ascii_uppercase();
            for separator in ['/', '_', '-'] {
                if let Some((base, quote)) = upper.split_once(separator) {
                    return Ok(format!("{base}/{quote}"));
                }
            }
            return Err(ConnectorError::InvalidSymbol(format!(
                "hyperliquid spot symbols must include a quote currency, e.g. BTC/USDC: '{symbol}'"
            )));
        }

        let mut coin = cleaned.to_string();
        for separator in ['/', '_', ':', '-'] {
            if let Some((base, _)) = coin.split_once(separator) {
                coin = base.to_string();
                break;
            }
        }
        for suffix in ["USDC", "USDT", "USD", "PERP", "SWAP"] {
            let upper = coin.to_ascii_uppercase();
            if upper.ends_with(suffix) && coin.len() > suffix.len() {
                coin.truncate(coin.len() - suffix.len());
                break;
            }
        }
        Ok(coin)
    }

    fn remember_alias(&self, coin: &str, symbol: &str) {
        self.aliases
            .lock()
            .unwrap()
            .insert(coin.to_ascii_uppercase(), symbol.to_string());
    }

    fn resolve_alias(&self, coin: &str) -> String {
        self.aliases
            .lock()
            .unwrap()
            .get(&coin.to_ascii_uppercase())
            .cloned()
            .unwrap_or_else(|| coin.to_string())
    }

    fn data_to_candle(&self, data: &Value, symbol: String) -> std::result::Result<Candle, ParseError> {
        let open_ms = data
            .get("t")
            .and_then(value_epoch_ms)
            .ok_or(ParseError::MissingField("t"))?;

        // Closed only once the bar's end time has passed; a frame
        // without `T` is treated as a live tick.
        let is_closed = match data.get("T").and_then(value_epoch_ms) {
            Some(close_ms) => Utc::now().timestamp_millis() >= close_ms,
            None => false,
        };

        Ok(Candle {
            exchange: Exchange::Hyperliquid,
            contract_type: self.contract_type.clone(),
            symbol,
            open_time: truncate_to_minute(datetime_from_ms(open_ms, "t")?),
            open: field_f64(data, "o")?,
            high: field_f64(data, "h")?,
            low: field_f64(data, "l")?,
            close: field_f64(data, "c")?,
            volume: data
                .get("v")
                .map(|v| super::value_f64(v, "v"))
                .transpose()?
                .unwrap_or(0.0),
            trade_num: data.get("n").map(value_u64).unwrap_or(0),
            is_closed,
        })
    }
}

#[async_trait]
impl ExchangeAdapter for HyperliquidAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::Hyperliquid
    }

    fn contract_type(&self) -> &str {
        &self.contract_type
    }

    fn validate_symbol(&self, symbol: &str) -> Result<()> {
        self.normalize_symbol(symbol).map(|_| ())
    }

    fn ws_url(&self, _symbols: &[String]) -> Result<String> {
        Ok(STREAM_URL.to_string())
    }

    fn subscribe_frames(&self, symbols: &[String]) -> Result<Vec<String>> {
        let mut frames = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            let coin = self.normalize_symbol(symbol)?;
            self.remember_alias(&coin, symbol);
            frames.push(
                json!({
                    "method": "subscribe",
                    "subscription": {"type": "candle", "coin": coin, "interval": "1m"},
                })
                .to_string(),
            );
        }
        Ok(frames)
    }

    fn unsubscribe_frames(&self, symbols: &[String]) -> Result<Vec<String>> {
        let mut frames = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            let coin = self.normalize_symbol(symbol)?;
            frames.push(
                json!({
                    "method": "unsubscribe",
                    "subscription": {"type": "candle", "coin": coin, "interval": "1m"},
                })
                .to_string(),
            );
        }
        Ok(frames)
    }

    fn handle_frame(&self, text: &str) -> std::result::Result<FrameEvent, ParseError> {
        let message: Value = serde_json::from_str(text)?;

        match message.get("channel").and_then(Value::as_str) {
            Some("candle") => {}
            Some("error") => {
                let msg = message
                    .get("data")
                    .map(|d| d.as_str().map(str::to_string).unwrap_or_else(|| d.to_string()))
                    .unwrap_or_else(|| "subscription rejected".to_string());
                return Ok(FrameEvent::SubscribeRejected(msg));
            }
            _ => return Ok(FrameEvent::Ignore),
        }

        let Some(data) = message.get("data").filter(|d| d.is_object()) else {
            return Ok(FrameEvent::Ignore);
        };
        let coin = data.get("s").and_then(Value::as_str).unwrap_or_default();
        let symbol = self.resolve_alias(coin);
        let candle = self.data_to_candle(data, symbol)?;
        Ok(FrameEvent::Candles(vec![candle]))
    }

    async fn backfill(
        &self,
        client: &reqwest::Client,
        symbols: &[String],
        concurrency: usize,
    ) -> Result<Vec<Candle>> {
        let now_ms = Utc::now().timestamp_millis();
        let start_ms = (now_ms - INTERVAL_MS * BACKFILL_LOOKBACK_INTERVALS).max(0);

        let responses = stream::iter(symbols.iter().cloned())
            .map(|symbol| {
                let client = client.clone();
                let coin = self.normalize_symbol(&symbol);
                async move {
                    let result = match coin {
                        Ok(coin) => {
                            let body = json!({
                                "type": "candleSnapshot",
                                "req": {
                                    "coin": coin,
                                    "interval": "1m",
                                    "startTime": start_ms,
                                    "endTime": now_ms,
                                },
                            });
                            client
                                .post(REST_INFO_URL)
                                .json(&body)
                                .send()
                                .await
                                .map_err(ConnectorError::from)
                        }
                        Err(err) => Err(err),
                    };
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
                    warn!(symbol, error = %err, "hyperliquid REST backfill request failed");
                    continue;
                }
            };
            if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
                return Err(ConnectorError::RateLimited(format!(
                    "hyperliquid REST returned 429 for {symbol}"
                )));
            }
            let response = match response.error_for_status() {
                Ok(response) => response,
                Err(err) => {
                    warn!(symbol, error = %err, "hyperliquid REST backfill request failed");
                    continue;
                }
            };
            let payload: Value = match response.json().await {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(symbol, error = %err, "hyperliquid REST backfill returned bad JSON");
                    continue;
                }
            };
            match payload.as_array().and_then(|rows| rows.last()) {
                Some(entry) => match self.data_to_candle(entry, symbol.clone()) {
                    Ok(candle) => candles.push(candle),
                    Err(err) => warn!(symbol, error = %err, "failed to parse hyperliquid REST candle"),
                },
                None => debug!(symbol, "hyperliquid REST backfill returned no candles"),
            }
        }
        Ok(candles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn perp() -> HyperliquidAdapter {
        HyperliquidAdapter::new("usdm").unwrap()
    }

    #[test]
    fn perp_symbols_strip_quote_suffixes() {
        let adapter = perp();
        assert_eq!(adapter.normalize_symbol("BTCUSDT").unwrap(), "BTC");
        assert_eq!(adapter.normalize_symbol("BTC-PERP").unwrap(), "BTC");
        assert_eq!(adapter.normalize_symbol("ETH/USDC").unwrap(), "ETH");
        assert_eq!(adapter.normalize_symbol("SOL").unwrap(), "SOL");
    }

    #[test]
    fn spot_symbols_require_quote_currency() {
        let spot = HyperliquidAdapter::new("spot").unwrap();
        assert_eq!(spot.normalize_symbol("btc/usdc").unwrap(), "BTC/USDC");
        assert_eq!(spot.normalize_symbol("BTC_USDC").unwrap(), "BTC/USDC");
        assert!(spot.normalize_symbol("BTC").is_err());
        assert!(spot.validate_symbol("BTC").is_err());
    }

    #[test]
    fn candle_frame_resolves_subscriber_alias() {
        let adapter = perp();
        adapter.subscribe_frames(&["BTCUSDT".to_string()]).unwrap();
        let frame = r#"{
            "channel": "candle",
            "data": {
                "t": 1700000040000, "T": 1700000099999, "s": "BTC", "i": "1m",
                "o": "44100.0", "c": "44123.45", "h": "44150.0", "l": "44080.0",
                "v": "123.456", "n": 102
            }
        }"#;
        let FrameEvent::Candles(candles) = adapter.handle_frame(frame).unwrap() else {
            panic!("expected candles");
        };
        let candle = &candles[0];
        assert_eq!(candle.symbol, "BTCUSDT");
        assert_eq!(candle.trade_num, 102);
        assert!(candle.is_closed, "bar end is long past");
    }

    #[test]
    fn missing_close_time_means_open_candle() {
        let adapter = perp();
        let frame = r#"{
            "channel": "candle",
            "data": {"t": 1700000040000, "s": "BTC", "o": "1", "c": "1.5", "h": "2", "l": "0.5"}
        }"#;
        let FrameEvent::Candles(candles) = adapter.handle_frame(frame).unwrap() else {
            panic!("expected candles");
        };
        assert!(!candles[0].is_closed);
    }

    #[test]
    fn missing_open_time_is_dropped_as_parse_error() {
        let adapter = perp();
        let frame = r#"{
            "channel": "candle",
            "data": {"s": "BTC", "o": "1", "c": "1.5", "h": "2", "l": "0.5"}
        }"#;
        assert!(adapter.handle_frame(frame).is_err());
    }

    #[test]
    fn subscription_response_is_ignored() {
        let frame = r#"{"channel":"subscriptionResponse","data":{"method":"subscribe"}}"#;
        assert!(matches!(perp().handle_frame(frame).unwrap(), FrameEvent::Ignore));
    }

    #[test]
    fn subscribe_frame_uses_normalized_coin() {
        let frames = perp().subscribe_frames(&["BTCUSDT".to_string()]).unwrap();
        let frame: Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(frame["subscription"]["type"], "candle");
        assert_eq!(frame["subscription"]["coin"], "BTC");
        assert_eq!(frame["subscription"]["interval"], "1m");
    }
}
