//! Bybit v5 kline adapter.
//!
//! One public host per category; topics are `kline.1.<SYMBOL>` and the
//! payload is a list of objects with a `confirm` flag. The venue sends
//! application-level `op:ping` frames that expect an `op:pong` reply.

use crate::adapter::{ExchangeAdapter, FrameEvent};
use crate::error::{ConnectorError, ParseError, Result};
use crate::exchanges::{datetime_from_ms, field_f64, value_epoch_ms};
use async_trait::async_trait;
use common::candle::truncate_to_minute;
use common::{Candle, Exchange};
use futures::stream::{self, StreamExt};
use serde_json::{json, Value};
use tracing::{debug, warn};

const REST_URL: &str = "https://api.bybit.com/v5/market/kline";

pub struct BybitAdapter {
    contract_type: String,
    stream_url: &'static str,
}

impl BybitAdapter {
    pub fn new(contract_type: &str) -> Result<Self> {
        let stream_url = match contract_type {
            "spot" => "wss://stream.bybit.com/v5/public/spot",
            "linear" => "wss://stream.bybit.com/v5/public/linear",
            "inverse" => "wss://stream.bybit.com/v5/public/inverse",
            other => {
                return Err(ConnectorError::UnsupportedContractType(format!(
                    "bybit does not support '{other}'"
                )))
            }
        };
        Ok(Self {
            contract_type: contract_type.to_string(),
            stream_url,
        })
    }

    fn topics(&self, symbols: &[String]) -> Vec<String> {
        symbols.iter().map(|s| format!("kline.1.{s}")).collect()
    }

    fn entry_to_candle(&self, entry: &Value, symbol: &str) -> std::result::Result<Candle, ParseError> {
        let start_ms = entry
            .get("start")
            .and_then(value_epoch_ms)
            .ok_or(ParseError::MissingField("start"))?;
        Ok(Candle {
            exchange: Exchange::Bybit,
            contract_type: self.contract_type.clone(),
            symbol: symbol.to_string(),
            open_time: truncate_to_minute(datetime_from_ms(start_ms, "start")?),
            open: field_f64(entry, "open")?,
            high: field_f64(entry, "high")?,
            low: field_f64(entry, "low")?,
            close: field_f64(entry, "close")?,
            volume: entry
                .get("volume")
                .map(|v| super::value_f64(v, "volume"))
                .transpose()?
                .unwrap_or(0.0),
            trade_num: 0,
            is_closed: entry.get("confirm").and_then(Value::as_bool).unwrap_or(false),
        })
    }

    fn rest_row_to_candle(&self, symbol: &str, row: &Value) -> Option<Candle> {
        let row = row.as_array()?;
        if row.len() < 6 {
            return None;
        }
        let start_ms = value_epoch_ms(&row[0])?;
        Some(Candle {
            exchange: Exchange::Bybit,
            contract_type: self.contract_type.clone(),
            symbol: symbol.to_string(),
            open_time: truncate_to_minute(datetime_from_ms(start_ms, "start").ok()?),
            open: super::value_f64(&row[1], "open").ok()?,
            high: super::value_f64(&row[2], "high").ok()?,
            low: super::value_f64(&row[3], "low").ok()?,
            close: super::value_f64(&row[4], "close").ok()?,
            volume: super::value_f64(&row[5], "volume").ok()?,
            trade_num: 0,
            is_closed: true,
        })
    }
}

#[async_trait]
impl ExchangeAdapter for BybitAdapter {
    fn exchange(&self) -> Exchange {
        Exchange::Bybit
    }

    fn contract_type(&self) -> &str {
        &self.contract_type
    }

    fn ws_url(&self, _symbols: &[String]) -> Result<String> {
        Ok(self.stream_url.to_string())
    }

    fn subscribe_frames(&self, symbols: &[String]) -> Result<Vec<String>> {
        Ok(vec![
            json!({"op": "subscribe", "args": self.topics(symbols)}).to_string(),
        ])
    }

    fn unsubscribe_frames(&self, symbols: &[String]) -> Result<Vec<String>> {
        Ok(vec![
            json!({"op": "unsubscribe", "args": self.topics(symbols)}).to_string(),
        ])
    }

    fn handle_frame(&self, text: &str) -> std::result::Result<FrameEvent, ParseError> {
        let message: Value = serde_json::from_str(text)?;

        if message.get("op").and_then(Value::as_str) == Some("ping") {
            return Ok(FrameEvent::Reply(json!({"op": "pong"}).to_string()));
        }

        // Subscribe command responses carry a success flag.
        if message.get("op").and_then(Value::as_str) == Some("subscribe")
            && message.get("success").and_then(Value::as_bool) == Some(false)
        {
            let msg = message
                .get("ret_msg")
                .and_then(Value::as_str)
                .unwrap_or("subscription rejected")
                .to_string();
            return Ok(FrameEvent::SubscribeRejected(msg));
        }

        let topic = message.get("topic").and_then(Value::as_str).unwrap_or_default();
        if !topic.starts_with("kline") {
            return Ok(FrameEvent::Ignore);
        }
        let symbol = topic.splitn(3, '.').nth(2).unwrap_or_default();

        let entries: Vec<&Value> = match message.get("data") {
            Some(Value::Array(items)) => items.iter().collect(),
            Some(obj @ Value::Object(_)) => vec![obj],
            _ => return Ok(FrameEvent::Ignore),
        };

        let mut candles = Vec::with_capacity(entries.len());
        for entry in entries {
            candles.push(self.entry_to_candle(entry, symbol)?);
        }
        Ok(FrameEvent::Candles(candles))
    }

    async fn backfill(
        &self,
        client: &reqwest::Client,
        symbols: &[String],
        concurrency: usize,
    ) -> Result<Vec<Candle>> {
        let category = self.contract_type.as_str();
        let responses = stream::iter(symbols.iter().cloned())
            .map(|symbol| {
                let client = client.clone();
                async move {
                    let result = client
                        .get(REST_URL)
                        .query(&[
                            ("category", category),
                            ("symbol", symbol.as_str()),
                            ("interval", "1"),
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
                    warn!(symbol, error = %err, "bybit REST backfill request failed");
                    continue;
                }
            };
            if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
                return Err(ConnectorError::RateLimited(format!(
                    "bybit REST returned 429 for {symbol}"
                )));
            }
            let response = match response.error_for_status() {
                Ok(response) => response,
                Err(err) => {
                    warn!(symbol, error = %err, "bybit REST backfill request failed");
                    continue;
                }
            };
            let payload: Value = match response.json().await {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(symbol, error = %err, "bybit REST backfill returned bad JSON");
                    continue;
                }
            };
            match payload
                .pointer("/result/list")
                .and_then(Value::as_array)
                .and_then(|rows| rows.first())
            {
                Some(row) => {
                    if let Some(candle) = self.rest_row_to_candle(&symbol, row) {
                        candles.push(candle);
                    } else {
                        warn!(symbol, "failed to parse bybit REST candle");
                    }
                }
                None => debug!(symbol, "bybit REST backfill returned no candles"),
            }
        }
        Ok(candles)
    }
}
