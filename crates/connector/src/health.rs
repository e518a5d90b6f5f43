//! Per-session health bookkeeping feeding the readiness endpoint.

use crate::breaker::BreakerState;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use common::Exchange;
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Clone, Default)]
struct Entry {
    active_connections: i64,
    last_message_time: Option<DateTime<Utc>>,
    total_quotes: u64,
    total_errors: u64,
    consecutive_failures: u32,
    breaker_state: &'static str,
}

/// Serializable per-(exchange, contract_type) health view.
#[derive(Debug, Clone, Serialize)]
pub struct SessionHealth {
    pub exchange: String,
    pub contract_type: String,
    pub active_connections: i64,
    pub last_message_time: Option<DateTime<Utc>>,
    pub total_quotes: u64,
    pub total_errors: u64,
    pub consecutive_failures: u32,
    pub circuit_state: String,
    pub healthy: bool,
}

/// Registry of upstream health, observed by the HTTP surface. It only
/// mirrors counters; it never mutates session state.
#[derive(Default)]
pub struct HealthRegistry {
    entries: DashMap<(Exchange, String), Entry>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_quote(&self, exchange: Exchange, contract_type: &str) {
        let mut entry = self.entry(exchange, contract_type);
        entry.last_message_time = Some(Utc::now());
        entry.total_quotes += 1;
        entry.consecutive_failures = 0;
    }

    pub fn record_error(&self, exchange: Exchange, contract_type: &str) {
        let mut entry = self.entry(exchange, contract_type);
        entry.total_errors += 1;
        entry.consecutive_failures += 1;
    }

    pub fn record_connection(&self, exchange: Exchange, contract_type: &str, active: bool) {
        let mut entry = self.entry(exchange, contract_type);
        entry.active_connections = (entry.active_connections + if active { 1 } else { -1 }).max(0);
    }

    pub fn record_breaker(&self, exchange: Exchange, contract_type: &str, state: BreakerState) {
        let mut entry = self.entry(exchange, contract_type);
        entry.breaker_state = state.as_str();
    }

    pub fn remove(&self, exchange: Exchange, contract_type: &str) {
        self.entries.remove(&(exchange, contract_type.to_string()));
    }

    fn entry(
        &self,
        exchange: Exchange,
        contract_type: &str,
    ) -> dashmap::mapref::one::RefMut<'_, (Exchange, String), Entry> {
        self.entries
            .entry((exchange, contract_type.to_string()))
            .or_insert_with(|| Entry {
                breaker_state: BreakerState::Closed.as_str(),
                ..Entry::default()
            })
    }

    /// Snapshot all entries. A session is healthy when its breaker is
    /// not open and a message arrived within twice the inactivity
    /// timeout.
    pub fn snapshot(&self, inactivity_timeout: Duration) -> Vec<SessionHealth> {
        let now = Utc::now();
        let stale_after = chrono::Duration::from_std(inactivity_timeout * 2)
            .unwrap_or_else(|_| chrono::Duration::seconds(6));
        self.entries
            .iter()
            .map(|item| {
                let (exchange, contract_type) = item.key();
                let entry = item.value();
                let fresh = entry
                    .last_message_time
                    .map(|t| now - t < stale_after)
                    .unwrap_or(false);
                let breaker_ok = entry.breaker_state != BreakerState::Open.as_str();
                SessionHealth {
                    exchange: exchange.to_string(),
                    contract_type: contract_type.clone(),
                    active_connections: entry.active_connections,
                    last_message_time: entry.last_message_time,
                    total_quotes: entry.total_quotes,
                    total_errors: entry.total_errors,
                    consecutive_failures: entry.consecutive_failures,
                    circuit_state: entry.breaker_state.to_string(),
                    healthy: fresh && breaker_ok,
                }
            })
            .collect()
    }
}
