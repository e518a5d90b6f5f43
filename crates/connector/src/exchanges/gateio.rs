//! Gate.io candlestick adapter.
//!
//! Spot rides `spot.candlesticks` on the v4 spot host; both futures
//! flavours use `futures.candlesticks`, with coin-margined contracts on
//! per-settle hosts (`{settle}` substituted from the symbol prefix).
//! The venue pings at the application level (`event: "ping"`).

use crate::adapter::{ExchangeAdapter, FrameEvent};
use crate::error::{ConnectorError, ParseError, Result};
use crate::exchanges::{datetime_from_ms, field_f64, value_epoch_ms, value_u64};
use async_trait::async_trait;
use common::candle::truncate_to_minute;
use common::{Candle, Exchange};
use futures::stream::{self, StreamExt};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

pub struct GateioAdapter {
    contract_type: String,
    stream_base: &'static str,
    channel: &'static str,
    rest_base: &'static str,
    rest_symbol_param: &'static str,
}

impl GateioAdapter {
    pub fn new(contract_type: &str) -> Result<Self> {
        let (stream_base, channel, rest_base, rest_symbol_param) = match contract_type {
            "spot" => (
                "wss://api.gateio.ws/ws/v4/",
                "spot.candlesticks",
                "https://api.gateio.ws/api/v4/spot/candlesticks",
                "currency_pair",
            ),
            "um" => (
                "wss://fx-ws.gateio.ws/v4/ws/usdt",
                "futures.candlesticks",
                "https://api.gateio.ws/api/v4/futures/usdt/candlesticks",
                "contract",
            ),
            "cm" => (
                "wss://fx-ws.gateio.ws/v4/ws/{settle}",
                "futures.candlesticks",
                "https://api.gateio.ws/api/v4/futures/{settle}/candlesticks",
                "contract",
            ),
            other => {
                return Err(ConnectorError::UnsupportedContractType(format!(
                    "gateio does not support '{other}'"
                )))
            }
        };
        Ok(Self {
            contract_type: contract_type.to_string(),
            stream_base,
            channel,
            rest_base,
            rest_symbol_param,
        })
    }

    fn epoch_secs() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    fn settle_currency(symbol: &str) -> Option<&str> {
        symbol.split_once('_').map(|(settle, _)| settle)
    }

    fn resolve_settle(&self, symbols: &[String]) -> Result<String> {
        let settles: BTreeSet<String> = symbols
            .iter()
            .filter_map(|s| Self::settle_currency(s))
            .map(|s| s.to_ascii_lowercase())
            .collect();
        match settles.len() {
            0 => Err(ConnectorError::InvalidSymbol(
                "unable to determine settle currency for gateio delivery stream".to_string(),
            )),
            1 => Ok(settles.into_iter().next().unwrap()),
            _ => Err(ConnectorError::InvalidSymbol(
                "gateio delivery stream requires symbols with the same settle currency".to_string(),
            )),
        }
    }

    /// Symbols in `result.n` arrive prefixed with the interval
    /// ("1m_BTC_USDT").
    fn extract_symbol(raw: &str) -> String {
        if raw.chars().next().is_some_and(|c| c.is_ascii_digit()) {
            if let Some((_, rest)) = raw.split_once('_') {
                return rest.to_string();
            }
        }
        raw.to_string()
    }

    fn entry_to_candle(&self, entry: &Value) -> std::result::Result<Candle, ParseError> {
        let open_ms = entry
            .get("t")
            .and_then(value_epoch_ms)
            .ok_or(ParseError::MissingField("t"))?;
        let symbol_raw = entry
            .get("currency_pair")
            .or_else(|| entry.get("contract"))
            .or_else(|| entry.get("n"))
            .and_then(Value::as_str)
            .ok_or(ParseError::MissingField("n"))?;

        let volume = entry
            .get("a")
            .or_else(|| entry.get("v"))
            .map(|v| super::value_f64(v, "a"))
            .transpose()?
            .unwrap_or(0.0);

        Ok(Candle {
            exchange: Exchange::Gateio,
            contract_type: self.contract_type.clone(),
            symbol: Self::extract_symbol(symbol_raw),
            open_time: truncate_to_minute(datetime_from_ms(open_ms, "t")?),
            open: field_f64(entry, "o")?,
            high: field_f64(entry, "h")?,
            low: field_f64(entry, "l")?,
            close: field_f64(entry, "c")?,
            volume,
            trade_num: entry.get("q").map(value_u64).unwrap_or(0),
            is_closed: entry.get("w").and_then(Value::as_bool).unwrap_or(false),
        })
    }

    fn rest_entry_to_candle(&self, symbol: &str, entry: &Value) -> Option<Candle> {
        match entry {
            // Spot returns arrays:
            // [t, quote_volume, close, high, low, open, base_volume, closed]
            Value::Array(row) => {
                if row.len() < 7 {
                    return None;
                }
                let open_ms = value_epoch_ms(&row[0])?;
                let is_closed = row
                    .get(7)
                    .map(|v| v.as_str() == Some("true") || v.as_bool() == Some(true))
                    .unwrap_or(true);
                Some(Candle {
                    exchange: Exchange::Gateio,
                    contract_type: self.contract_type.clone(),
                    symbol: symbol.to_string(),
                    open_time: truncate_to_minute(datetime_from_ms(open_ms, "t").ok()?),
                    open: super::value_f64(&row[5], "open").ok()?,
                    high: super::value_f64(&row[3], "high").ok()?,
                    low: super::value_f64(&row[4], "low").ok()?,
                    close: super::value_f64(&row[2], "close").ok()?,
                    volume: super::value_f64(&row[6], "volume").ok()?,
                    trade_num: 0,
                    is_closed,
                })
            }
            // Futures return objects {t, v, c, h, l, o}.
            Value::Object(_) => {
                let open_ms = entry.get("t").and_then(value_epoch_ms)?;
                let is_closed = entry
                    .get("finished")
                    .or_else(|| entry.get("completed"))
                    .or_else(|| entry.get("is_closed"))
                    .map(|v| v.as_bool() == Some(true) || v.as_str() == Some("true"))
                    .unwrap_or(true);
                Some(Candle {
                    exchange: Exchange::Gateio,
                    contract_type: self.contract_type.clone(),
                    symbol: symbol.to_string(),
                    open_time: truncate_to_minute(datetime_from_ms(open_ms, "t").ok()?),
                    open: field_f64(entry, "o").ok()?,
                    high: field_f64(entry, "h").ok()?,
                    low: field_f64(entry, "l").ok()?,
                    close: field_f64(entry, "c").ok()?,
                    volume: entry
                        .get("v")
                        .or_else(|| entry.get("volume"))
                        .and_then(|v| super::value_f64(v, "v").ok())
                        .unwrap_or(0.0),
                    trade_num: 0,
                    is_closed,
                })
            }
            _ => None,
        }
    }

    fn rest_url_for(&self, symbol: &str) -> Result<String> {
        if !self.rest_base.contains("{settle}") {
            return Ok(self.rest_base.to_string());
        }
        let settle = Self::settle_currency(symbol)
            .map(|s| s.to_ascii_lowercase())
            .ok_or_else(|| {
                ConnectorError::InvalidSymbol(format!(
                    "unable to determine settle currency for gateio symbol '{symbol}'"
                ))
            })?;
        Ok(self.rest_base.replace("{settle}", &settle))
    }

    fn channel_op(&self, event: &str, symbol: &str) -> String {
        json!({
            "time": Self::epoch_secs(),
            "channel": self.channel,
            "event": event,
            "payload": ["1m", symbol],
        })
        .to_string()
    }
}

#[async_trait]
impl ExchangeAdapter for GateioAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::Gateio
    }

    fn contract_type(&self) -> &str {
        &self.contract_type
    }

    fn ws_url(&self, symbols: &[String]) -> Result<String> {
        if !self.stream_base.contains("{settle}") {
            return Ok(self.stream_base.to_string());
        }
        let settle = self.resolve_settle(symbols)?;
        Ok(self.stream_base.replace("{settle}", &settle))
    }

    fn subscribe_frames(&self, symbols: &[String]) -> Result<Vec<String>> {
        Ok(symbols.iter().map(|s| self.channel_op("subscribe", s)).collect())
    }

    fn unsubscribe_frames(&self, symbols: &[String]) -> Result<Vec<String>> {
        Ok(symbols.iter().map(|s| self.channel_op("unsubscribe", s)).collect())
    }

    fn handle_frame(&self, text: &str) -> std::result::Result<FrameEvent, ParseError> {
        let message: Value = serde_json::from_str(text)?;

        match message.get("event").and_then(Value::as_str) {
            Some("subscribe") | Some("unsubscribe") => {
                if let Some(error) = message.get("error").filter(|e| !e.is_null()) {
                    let msg = error
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("subscription rejected")
                        .to_string();
                    return Ok(FrameEvent::SubscribeRejected(msg));
                }
                return Ok(FrameEvent::Ignore);
            }
            Some("ping") => {
                let channel = message
                    .get("channel")
                    .and_then(Value::as_str)
                    .unwrap_or(self.channel);
                let reply = json!({
                    "time": Self::epoch_secs(),
                    "channel": channel,
                    "event": "pong",
                })
                .to_string();
                return Ok(FrameEvent::Reply(reply));
            }
            Some("update") => {}
            _ => return Ok(FrameEvent::Ignore),
        }

        let entries: Vec<&Value> = match message.get("result") {
            Some(obj @ Value::Object(_)) => vec![obj],
            Some(Value::Array(items)) => items.iter().filter(|i| i.is_object()).collect(),
            _ => return Ok(FrameEvent::Ignore),
        };

        let mut candles = Vec::with_capacity(entries.len());
        for entry in entries {
            candles.push(self.entry_to_candle(entry)?);
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
                let url = self.rest_url_for(&symbol);
                async move {
                    let result = match url {
                        Ok(url) => {
                            client
                                .get(url)
                                .query(&[
                                    (self.rest_symbol_param, symbol.as_str()),
                                    ("interval", "1m"),
                                    ("limit", "1"),
                                ])
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
                    warn!(symbol, error = %err, "gateio REST backfill request failed");
                    continue;
                }
            };
            if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
                return Err(ConnectorError::RateLimited(format!(
                    "gateio REST returned 429 for {symbol}"
                )));
            }
            let response = match response.error_for_status() {
                Ok(response) => response,
                Err(err) => {
                    warn!(symbol, error = %err, "gateio REST backfill request failed");
                    continue;
                }
            };
            let payload: Value = match response.json().await {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(symbol, error = %err, "gateio REST backfill returned bad JSON");
                    continue;
                }
            };
            match payload.as_array().and_then(|rows| rows.first()) {
                Some(entry) => {
                    if let Some(candle) = self.rest_entry_to_candle(&symbol, entry) {
                        candles.push(candle);
                    } else {
                        warn!(symbol, "failed to parse gateio REST candle");
                    }
                }
                None => debug!(symbol, "gateio REST backfill returned no candles"),
            }
        }
        Ok(candles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spot() -> GateioAdapter {
        GateioAdapter::new("spot").unwrap()
    }

    #[test]
    fn settle_host_resolves_from_symbols() {
        let cm = GateioAdapter::new("cm").unwrap();
        let url = cm.ws_url(&["BTC_USD".to_string(), "BTC_USD_20261225".to_string()]).unwrap();
        assert_eq!(url, "wss://fx-ws.gateio.ws/v4/ws/btc");

        let mixed = cm.ws_url(&["BTC_USD".to_string(), "ETH_USD".to_string()]);
        assert!(mixed.is_err());
    }

    #[test]
    fn spot_url_is_static() {
        assert_eq!(spot().ws_url(&["BTC_USDT".to_string()]).unwrap(), "wss://api.gateio.ws/ws/v4/");
    }

    #[test]
    fn subscribe_frame_carries_interval_and_symbol() {
        let frames = spot().subscribe_frames(&["BTC_USDT".to_string()]).unwrap();
        let frame: Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(frame["channel"], "spot.candlesticks");
        assert_eq!(frame["event"], "subscribe");
        assert_eq!(frame["payload"][0], "1m");
        assert_eq!(frame["payload"][1], "BTC_USDT");
    }

    #[test]
    fn update_frame_maps_prefixed_symbol() {
        let frame = r#"{
            "time": 1700000043, "time_ms": 1700000043123,
            "channel": "spot.candlesticks", "event": "update",
            "result": {
                "t": "1700000040", "v": "5443210.0", "c": "44123.45", "h": "44150.0",
                "l": "44080.0", "o": "44100.0", "n": "1m_BTC_USDT", "a": "123.456",
                "w": true
            }
        }"#;
        let FrameEvent::Candles(candles) = spot().handle_frame(frame).unwrap() else {
            panic!("expected candles");
        };
        let candle = &candles[0];
        assert_eq!(candle.symbol, "BTC_USDT");
        assert!(candle.is_closed);
        assert_eq!(candle.volume, 123.456);
        assert_eq!(candle.open_time.timestamp(), 1_700_000_040);
    }

    #[test]
    fn app_ping_gets_pong_reply() {
        let frame = r#"{"time": 1700000000, "channel": "spot.ping", "event": "ping"}"#;
        let FrameEvent::Reply(reply) = spot().handle_frame(frame).unwrap() else {
            panic!("expected reply");
        };
        let reply: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(reply["event"], "pong");
        assert_eq!(reply["channel"], "spot.ping");
    }

    #[test]
    fn subscribe_error_is_rejection() {
        let frame = r#"{
            "time": 1700000000, "channel": "spot.candlesticks", "event": "subscribe",
            "error": {"code": 2, "message": "unknown currency pair"}
        }"#;
        let event = spot().handle_frame(frame).unwrap();
        assert!(matches!(event, FrameEvent::SubscribeRejected(msg) if msg == "unknown currency pair"));
    }

    #[test]
    fn rest_array_entry_parses_spot_layout() {
        let entry: Value = serde_json::from_str(
            r#"["1700000040", "5443210.0", "44123.45", "44150.0", "44080.0", "44100.0", "123.456", "true"]"#,
        )
        .unwrap();
        let candle = spot().rest_entry_to_candle("BTC_USDT", &entry).unwrap();
        assert_eq!(candle.open, 44100.0);
        assert_eq!(candle.close, 44123.45);
        assert!(candle.is_closed);
    }

    #[test]
    fn rest_object_entry_parses_futures_layout() {
        let um = GateioAdapter::new("um").unwrap();
        let entry: Value = serde_json::from_str(
            r#"{"t": 1700000040, "v": 123, "c": "1.5", "h": "2.0", "l": "0.5", "o": "1.0"}"#,
        )
        .unwrap();
        let candle = um.rest_entry_to_candle("BTC_USDT", &entry).unwrap();
        assert_eq!(candle.volume, 123.0);
        assert!(candle.is_closed);
    }
}
