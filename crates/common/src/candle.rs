//! Canonical candle schema shared by every exchange feed.

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Supported upstream exchanges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Exchange {
    Binance,
    Okx,
    Bybit,
    Gateio,
    Hyperliquid,
}

impl Exchange {
    pub const ALL: [Exchange; 5] = [
        Exchange::Binance,
        Exchange::Okx,
        Exchange::Bybit,
        Exchange::Gateio,
        Exchange::Hyperliquid,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Exchange::Binance => "binance",
            Exchange::Okx => "okx",
            Exchange::Bybit => "bybit",
            Exchange::Gateio => "gateio",
            Exchange::Hyperliquid => "hyperliquid",
        }
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Exchange {
    type Err = UnknownExchange;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "binance" => Ok(Exchange::Binance),
            "okx" => Ok(Exchange::Okx),
            "bybit" => Ok(Exchange::Bybit),
            "gateio" | "gate.io" | "gate" => Ok(Exchange::Gateio),
            "hyperliquid" => Ok(Exchange::Hyperliquid),
            other => Err(UnknownExchange(other.to_string())),
        }
    }
}

/// Returned when an exchange identifier does not match any supported venue.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unsupported exchange: {0}")]
pub struct UnknownExchange(pub String);

/// A normalised 1-minute OHLCV bar. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub exchange: Exchange,
    pub contract_type: String,
    pub symbol: String,
    /// Start of the bar, aligned to a whole minute in UTC.
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// Trade count, 0 when the venue does not provide one.
    pub trade_num: u64,
    /// Whether the bar has finalised for its minute.
    pub is_closed: bool,
}

impl Candle {
    /// Key identifying the feed this candle belongs to.
    pub fn subscription_key(&self) -> SubscriptionKey {
        SubscriptionKey {
            exchange: self.exchange,
            contract_type: self.contract_type.clone(),
            symbol: self.symbol.clone(),
        }
    }

    /// Millisecond epoch of the bar start, used as the dedup key.
    pub fn open_time_ms(&self) -> i64 {
        self.open_time.timestamp_millis()
    }

    /// Check the structural invariants of a bar: finite numbers,
    /// non-negative volume, and OHLC ordering.
    pub fn is_well_formed(&self) -> bool {
        let prices = [self.open, self.high, self.low, self.close];
        if prices.iter().any(|p| !p.is_finite()) || !self.volume.is_finite() {
            return false;
        }
        if self.volume < 0.0 {
            return false;
        }
        self.low <= self.open.min(self.close) && self.high >= self.open.max(self.close)
    }
}

/// Truncate a UTC instant down to its minute boundary.
pub fn truncate_to_minute(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(ts)
}

/// Identity of a unique feed: (exchange, contract_type, symbol).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionKey {
    pub exchange: Exchange,
    pub contract_type: String,
    pub symbol: String,
}

impl SubscriptionKey {
    pub fn new(exchange: Exchange, contract_type: impl Into<String>, symbol: impl Into<String>) -> Self {
        Self {
            exchange,
            contract_type: contract_type.into(),
            symbol: symbol.into(),
        }
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.exchange, self.contract_type, self.symbol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn candle(open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle {
            exchange: Exchange::Binance,
            contract_type: "spot".to_string(),
            symbol: "BTCUSDT".to_string(),
            open_time: Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap(),
            open,
            high,
            low,
            close,
            volume: 10.0,
            trade_num: 42,
            is_closed: true,
        }
    }

    #[test]
    fn exchange_round_trips_through_str() {
        for exchange in Exchange::ALL {
            assert_eq!(exchange.as_str().parse::<Exchange>().unwrap(), exchange);
        }
        assert!("ftx".parse::<Exchange>().is_err());
    }

    #[test]
    fn well_formed_accepts_ordered_ohlc() {
        assert!(candle(100.0, 110.0, 95.0, 105.0).is_well_formed());
    }

    #[test]
    fn well_formed_rejects_low_above_open() {
        assert!(!candle(100.0, 110.0, 101.0, 105.0).is_well_formed());
        assert!(!candle(f64::NAN, 110.0, 95.0, 105.0).is_well_formed());
    }

    #[test]
    fn truncate_drops_seconds() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 59).unwrap();
        let truncated = truncate_to_minute(ts);
        assert_eq!(truncated, Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap());
    }
}
