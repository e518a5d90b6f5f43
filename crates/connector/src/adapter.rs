//! Venue adapter trait and factory.
//!
//! Each (exchange, contract_type) pair gets one adapter implementing
//! the subscribe payloads, the frame-to-candle mapping, and the REST
//! backfill for that venue.

use crate::error::{ConnectorError, ParseError, Result};
use crate::exchanges;
use async_trait::async_trait;
use common::{Candle, Exchange};

/// Outcome of parsing one raw frame.
#[derive(Debug)]
pub enum FrameEvent {
    /// Zero or more normalised candles.
    Candles(Vec<Candle>),
    /// A protocol-level reply owed to the venue (application ping).
    Reply(String),
    /// The venue rejected our subscription; payload is its message.
    SubscribeRejected(String),
    /// Ack, heartbeat, or other frame with nothing to forward.
    Ignore,
}

/// One exchange connector: subscribe payloads, frame parsing, backfill.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync + 'static {
    fn exchange(&self) -> Exchange;

    /// Canonical contract type carried on every candle from this adapter.
    fn contract_type(&self) -> &str;

    /// WebSocket URL for the given symbol set. Symbol-dependent for
    /// venues that encode the subscription (or the settle currency) in
    /// the URL.
    fn ws_url(&self, symbols: &[String]) -> Result<String>;

    /// Frames to send right after connecting (and, for incremental
    /// venues, when symbols are added mid-stream). Empty when the URL
    /// itself carries the subscription.
    fn subscribe_frames(&self, symbols: &[String]) -> Result<Vec<String>>;

    /// Frames removing symbols from a live stream. Venues without an
    /// unsubscribe op return none and rely on a reconnect.
    fn unsubscribe_frames(&self, _symbols: &[String]) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    /// Whether symbols can be added to a live socket without
    /// reconnecting.
    fn supports_incremental_subscribe(&self) -> bool {
        true
    }

    /// Validate a symbol for this venue before any subscription work.
    fn validate_symbol(&self, symbol: &str) -> Result<()> {
        if symbol.trim().is_empty() {
            return Err(ConnectorError::InvalidSymbol(symbol.to_string()));
        }
        Ok(())
    }

    /// Map one raw text frame onto candles, a reply, or nothing.
    fn handle_frame(&self, text: &str) -> std::result::Result<FrameEvent, ParseError>;

    /// Fetch the latest 1-minute bar for each symbol over REST, with at
    /// most `concurrency` requests in flight. Per-symbol failures are
    /// logged and skipped; the call fails only when nothing could be
    /// retrieved at the transport level.
    async fn backfill(
        &self,
        client: &reqwest::Client,
        symbols: &[String],
        concurrency: usize,
    ) -> Result<Vec<Candle>>;
}

/// Resolve the canonical contract type for an exchange, applying the
/// venue's aliases. `None` selects the venue default where one exists.
pub fn canonical_contract_type(exchange: Exchange, contract_type: Option<&str>) -> Result<String> {
    let normalized = contract_type.map(|c| c.trim().to_ascii_lowercase());
    let normalized = normalized.as_deref().filter(|c| !c.is_empty());
    let resolved = match exchange {
        Exchange::Binance => match normalized {
            Some("spot") => "spot",
            Some("usdm") | Some("um") | Some("usd-m") => "usdm",
            Some("coinm") | Some("cm") | Some("coin-m") => "coinm",
            Some(other) => return Err(unsupported(exchange, other)),
            None => {
                return Err(ConnectorError::UnsupportedContractType(
                    "binance requires a contract type (spot|usdm|coinm)".to_string(),
                ))
            }
        },
        Exchange::Okx => match normalized {
            Some("spot") | None => "spot",
            Some("swap") | Some("perp") => "swap",
            Some("swap_coinm") => "swap_coinm",
            Some(other) => return Err(unsupported(exchange, other)),
        },
        Exchange::Bybit => match normalized {
            Some("spot") | None => "spot",
            Some("linear") | Some("um") | Some("usd-m") | Some("perp") => "linear",
            Some("inverse") | Some("cm") | Some("coin-m") => "inverse",
            Some(other) => return Err(unsupported(exchange, other)),
        },
        Exchange::Gateio => match normalized {
            Some("spot") | None => "spot",
            Some("um") | Some("usd-m") => "um",
            Some("cm") | Some("coin-m") => "cm",
            Some(other) => return Err(unsupported(exchange, other)),
        },
        Exchange::Hyperliquid => match normalized {
            Some("usdm") | Some("usd-m") | Some("perp") | Some("swap") | None => "usdm",
            Some("spot") => "spot",
            Some("coinm") | Some("cm") => "coinm",
            Some(other) => return Err(unsupported(exchange, other)),
        },
    };
    Ok(resolved.to_string())
}

fn unsupported(exchange: Exchange, contract_type: &str) -> ConnectorError {
    ConnectorError::UnsupportedContractType(format!("{exchange} does not support '{contract_type}'"))
}

/// Build the adapter for an (exchange, contract_type) pair.
pub fn build_adapter(
    exchange: Exchange,
    contract_type: Option<&str>,
) -> Result<Box<dyn ExchangeAdapter>> {
    let contract_type = canonical_contract_type(exchange, contract_type)?;
    let adapter: Box<dyn ExchangeAdapter> = match exchange {
        Exchange::Binance => Box::new(exchanges::binance::BinanceAdapter::new(&contract_type)?),
        Exchange::Okx => Box::new(exchanges::okx::OkxAdapter::new(&contract_type)?),
        Exchange::Bybit => Box::new(exchanges::bybit::BybitAdapter::new(&contract_type)?),
        Exchange::Gateio => Box::new(exchanges::gateio::GateioAdapter::new(&contract_type)?),
        Exchange::Hyperliquid => {
            Box::new(exchanges::hyperliquid::HyperliquidAdapter::new(&contract_type)?)
        }
    };
    Ok(adapter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binance_requires_contract_type() {
        assert!(canonical_contract_type(Exchange::Binance, None).is_err());
        assert_eq!(canonical_contract_type(Exchange::Binance, Some("um")).unwrap(), "usdm");
        assert_eq!(canonical_contract_type(Exchange::Binance, Some("CM")).unwrap(), "coinm");
    }

    #[test]
    fn aliases_resolve_per_venue() {
        assert_eq!(canonical_contract_type(Exchange::Bybit, Some("perp")).unwrap(), "linear");
        assert_eq!(canonical_contract_type(Exchange::Bybit, Some("coin-m")).unwrap(), "inverse");
        assert_eq!(canonical_contract_type(Exchange::Gateio, Some("usd-m")).unwrap(), "um");
        assert_eq!(canonical_contract_type(Exchange::Hyperliquid, None).unwrap(), "usdm");
        assert_eq!(canonical_contract_type(Exchange::Okx, Some("perp")).unwrap(), "swap");
    }

    #[test]
    fn unknown_contract_type_is_rejected() {
        let err = canonical_contract_type(Exchange::Okx, Some("options")).unwrap_err();
        assert!(matches!(err, ConnectorError::UnsupportedContractType(_)));
    }

    #[test]
    fn factory_builds_every_supported_pair() {
        let pairs = [
            (Exchange::Binance, Some("spot")),
            (Exchange::Binance, Some("usdm")),
            (Exchange::Binance, Some("coinm")),
            (Exchange::Okx, None),
            (Exchange::Okx, Some("swap")),
            (Exchange::Bybit, Some("linear")),
            (Exchange::Gateio, Some("cm")),
            (Exchange::Hyperliquid, Some("spot")),
        ];
        for (exchange, contract_type) in pairs {
            let adapter = build_adapter(exchange, contract_type).unwrap();
            assert_eq!(adapter.exchange(), exchange);
        }
    }
}
