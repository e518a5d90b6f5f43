//! Session manager: shares upstream sessions across subscribers and
//! fans candles out to them.
//!
//! Placement state sits under one async mutex (lookups dominate and
//! session creation is rare); the hot forwarding path goes through the
//! registry's lock-free reverse index instead.

use crate::client::{QuotaOutcome, SubscriberRegistry, SubscriberState};
use crate::error::GatewayError;
use crate::protocol::{ErrorData, QuoteData, ServerMessage, SubscribeRequest};
use async_trait::async_trait;
use common::config::Settings;
use common::{Candle, ErrorCode, Exchange, SubscriptionKey};
use connector::adapter::{build_adapter, canonical_contract_type};
use connector::{ConnectorError, HealthRegistry, RestPool, SessionCommand, SessionSink, UpstreamSession};
use metrics::histogram;
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

const SESSION_COMMAND_BUFFER: usize = 32;

/// Delivers candles and errors from upstream sessions to subscribers.
pub struct Forwarder {
    registry: Arc<SubscriberRegistry>,
}

impl Forwarder {
    pub fn new(registry: Arc<SubscriberRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl SessionSink for Forwarder {
    async fn deliver(&self, candle: Candle, received_at: Instant) {
        let key = candle.subscription_key();
        let subscribers = self.registry.subscribers_for(&key);
        if subscribers.is_empty() {
            return;
        }

        // Serialize once per fan-out.
        let message = ServerMessage::Quote(QuoteData::from_candle(&candle));
        let json = match serde_json::to_string(&message) {
            Ok(json) => json,
            Err(err) => {
                warn!(error = %err, "failed to serialize quote frame");
                return;
            }
        };

        for client in subscribers {
            match client.take_quota() {
                QuotaOutcome::Deliver => client.send_raw(json.clone()),
                QuotaOutcome::LastDeliver => {
                    client.send_raw(json.clone());
                    info!(subscriber = %client.id, "quote limit reached, closing subscriber");
                    client.push_close();
                }
                QuotaOutcome::Exhausted => {}
            }
        }

        histogram!("quote_latency_seconds").record(received_at.elapsed().as_secs_f64());
    }

    fn report_error(
        &self,
        keys: Vec<SubscriptionKey>,
        code: ErrorCode,
        message: String,
        exchange_message: Option<String>,
    ) {
        let Some(first) = keys.first() else {
            return;
        };
        let symbols: Vec<String> = keys.iter().map(|k| k.symbol.clone()).collect();
        let frame = ServerMessage::Error(
            ErrorData::new(code, message)
                .with_exchange(first.exchange.to_string())
                .with_contract_type(first.contract_type.clone())
                .with_symbols(symbols)
                .with_exchange_message(exchange_message),
        );

        let mut notified = HashSet::new();
        for key in &keys {
            for client in self.registry.subscribers_for(key) {
                if notified.insert(client.id) {
                    client.send(&frame);
                }
            }
        }
    }
}

struct SessionSlot {
    id: String,
    symbols: HashSet<String>,
    command_tx: mpsc::Sender<SessionCommand>,
    join: JoinHandle<()>,
}

#[derive(Default)]
struct Placements {
    sessions: HashMap<(Exchange, String), Vec<SessionSlot>>,
    session_counter: u64,
}

impl Placements {
    fn exchange_session_count(&self, exchange: Exchange) -> usize {
        self.sessions
            .iter()
            .filter(|((e, _), _)| *e == exchange)
            .map(|(_, slots)| slots.len())
            .sum()
    }
}

/// A group of symbols rejected for the same reason.
#[derive(Debug)]
pub struct Rejection {
    pub symbols: Vec<String>,
    pub code: ErrorCode,
    pub message: String,
}

/// Result of a subscribe call.
#[derive(Debug, Default)]
pub struct SubscribeOutcome {
    /// Canonical contract type, present once the pair resolved.
    pub contract_type: Option<String>,
    pub accepted: Vec<String>,
    pub rejected: Vec<Rejection>,
}

/// Owns upstream sessions, the REST pool, and the health registry.
pub struct SessionManager {
    settings: Settings,
    registry: Arc<SubscriberRegistry>,
    forwarder: Arc<Forwarder>,
    rest: RestPool,
    health: Arc<HealthRegistry>,
    placements: Mutex<Placements>,
}

impl SessionManager {
    pub fn new(settings: Settings, registry: Arc<SubscriberRegistry>) -> Result<Self, GatewayError> {
        let rest = RestPool::new(&settings.connector)?;
        Ok(Self {
            forwarder: Arc::new(Forwarder::new(registry.clone())),
            registry,
            rest,
            health: Arc::new(HealthRegistry::new()),
            placements: Mutex::new(Placements::default()),
            settings,
        })
    }

    pub fn health(&self) -> Arc<HealthRegistry> {
        self.health.clone()
    }

    pub fn forwarder(&self) -> Arc<Forwarder> {
        self.forwarder.clone()
    }

    /// Place a subscriber's requested symbols onto upstream sessions.
    pub async fn subscribe(
        &self,
        client: &Arc<SubscriberState>,
        request: &SubscribeRequest,
    ) -> SubscribeOutcome {
        let mut outcome = SubscribeOutcome::default();

        let Ok(exchange) = Exchange::from_str(&request.exchange) else {
            outcome.rejected.push(Rejection {
                symbols: request.symbols.clone(),
                code: ErrorCode::InvalidSymbol,
                message: format!("unsupported exchange: {}", request.exchange),
            });
            return outcome;
        };

        let contract_type = match canonical_contract_type(exchange, request.contract_type.as_deref())
        {
            Ok(contract_type) => contract_type,
            Err(err) => {
                outcome.rejected.push(Rejection {
                    symbols: request.symbols.clone(),
                    code: err.code(),
                    message: err.to_string(),
                });
                return outcome;
            }
        };
        outcome.contract_type = Some(contract_type.clone());

        // Throwaway adapter for venue-specific symbol validation.
        let adapter = match build_adapter(exchange, Some(&contract_type)) {
            Ok(adapter) => adapter,
            Err(err) => {
                outcome.rejected.push(Rejection {
                    symbols: request.symbols.clone(),
                    code: err.code(),
                    message: err.to_string(),
                });
                return outcome;
            }
        };

        let mut valid = Vec::new();
        let mut invalid = Vec::new();
        let mut seen = HashSet::new();
        for symbol in &request.symbols {
            if !seen.insert(symbol.clone()) {
                continue;
            }
            match adapter.validate_symbol(symbol) {
                Ok(()) => valid.push(symbol.clone()),
                Err(err) => invalid.push((symbol.clone(), err.to_string())),
            }
        }
        if !invalid.is_empty() {
            outcome.rejected.push(Rejection {
                symbols: invalid.iter().map(|(s, _)| s.clone()).collect(),
                code: ErrorCode::InvalidSymbol,
                message: invalid[0].1.clone(),
            });
        }

        let mut placements = self.placements.lock().await;
        let mut pool_busy = Vec::new();
        // Batch incremental subscribes per existing slot.
        let mut slot_additions: HashMap<String, Vec<String>> = HashMap::new();
        let mut new_session_symbols = Vec::new();

        for symbol in valid {
            let key = SubscriptionKey::new(exchange, contract_type.clone(), symbol.clone());
            if client.holds(&key) {
                // Idempotent: already subscribed, single stream continues.
                outcome.accepted.push(symbol);
                continue;
            }

            let slots = placements
                .sessions
                .entry((exchange, contract_type.clone()))
                .or_default();

            if slots.iter().any(|slot| slot.symbols.contains(&symbol)) {
                outcome.accepted.push(symbol);
                continue;
            }

            let max_per_ws = self.settings.connector.max_symbol_per_ws;
            if let Some(slot) = slots.iter_mut().find(|slot| slot.symbols.len() < max_per_ws) {
                slot_additions.entry(slot.id.clone()).or_default().push(symbol.clone());
                slot.symbols.insert(symbol.clone());
                outcome.accepted.push(symbol);
                continue;
            }

            let pending_new = new_session_symbols.len().div_ceil(max_per_ws.max(1));
            if placements.exchange_session_count(exchange) + pending_new
                < self.settings.connector.max_conn_per_exchange
                || new_session_symbols.len() % max_per_ws.max(1) != 0
            {
                new_session_symbols.push(symbol.clone());
                outcome.accepted.push(symbol);
            } else {
                pool_busy.push(symbol);
            }
        }

        // Incremental adds to live sessions.
        for (slot_id, symbols) in slot_additions {
            let slots = placements
                .sessions
                .get(&(exchange, contract_type.clone()))
                .into_iter()
                .flatten();
            for slot in slots {
                if slot.id == slot_id {
                    if slot
                        .command_tx
                        .send(SessionCommand::Subscribe(symbols.clone()))
                        .await
                        .is_err()
                    {
                        warn!(session = %slot.id, "session command channel closed");
                    }
                    break;
                }
            }
        }

        // New sessions, chunked to the per-socket symbol cap.
        for chunk in new_session_symbols.chunks(self.settings.connector.max_symbol_per_ws.max(1)) {
            if let Err(err) =
                self.spawn_session(&mut placements, exchange, &contract_type, chunk.to_vec())
            {
                warn!(error = %err, "failed to spawn upstream session");
                outcome.accepted.retain(|s| !chunk.contains(s));
                outcome.rejected.push(Rejection {
                    symbols: chunk.to_vec(),
                    code: err.code(),
                    message: err.to_string(),
                });
            }
        }
        drop(placements);

        if !pool_busy.is_empty() {
            outcome.rejected.push(Rejection {
                symbols: pool_busy,
                code: ErrorCode::ConnectionPoolBusy,
                message: format!("connection pool for {exchange} is at capacity"),
            });
        }

        let keys: Vec<SubscriptionKey> = outcome
            .accepted
            .iter()
            .map(|symbol| SubscriptionKey::new(exchange, contract_type.clone(), symbol.clone()))
            .collect();
        if !keys.is_empty() {
            // Confirm before registering the keys so the confirmation
            // always precedes the first quote on the buffer.
            client.send(&ServerMessage::Subscribed {
                exchange: exchange.to_string(),
                contract_type: contract_type.clone(),
                symbols: outcome.accepted.clone(),
                limit: client.limit(),
            });
            self.registry.subscribe(client, &keys);
        }

        outcome
    }

    fn spawn_session(
        &self,
        placements: &mut Placements,
        exchange: Exchange,
        contract_type: &str,
        symbols: Vec<String>,
    ) -> Result<(), ConnectorError> {
        let adapter: Arc<dyn connector::ExchangeAdapter> =
            Arc::from(build_adapter(exchange, Some(contract_type))?);
        placements.session_counter += 1;
        let id = format!("{exchange}/{contract_type}#{}", placements.session_counter);
        info!(session = %id, symbols = symbols.len(), "spawning upstream session");

        let (command_tx, command_rx) = mpsc::channel(SESSION_COMMAND_BUFFER);
        let session = UpstreamSession::new(
            id.clone(),
            adapter,
            self.settings.connector.clone(),
            symbols.clone(),
            self.rest.client(exchange).clone(),
            self.rest.max_concurrency(),
            self.forwarder.clone(),
            self.health.clone(),
            command_rx,
        );
        let join = tokio::spawn(session.run());

        placements
            .sessions
            .entry((exchange, contract_type.to_string()))
            .or_default()
            .push(SessionSlot {
                id,
                symbols: symbols.into_iter().collect(),
                command_tx,
                join,
            });
        Ok(())
    }

    /// Handle a subscriber disconnect: release keys nobody holds any
    /// more, closing sessions whose symbol set empties out.
    pub async fn release_subscriber(&self, client_id: &uuid::Uuid) {
        let orphaned = self.registry.unregister(client_id);
        if orphaned.is_empty() {
            return;
        }

        let mut placements = self.placements.lock().await;
        for key in orphaned {
            let Some(slots) = placements.sessions.get_mut(&(key.exchange, key.contract_type.clone()))
            else {
                continue;
            };
            for slot in slots.iter_mut() {
                if slot.symbols.remove(&key.symbol) {
                    if slot
                        .command_tx
                        .send(SessionCommand::Unsubscribe(vec![key.symbol.clone()]))
                        .await
                        .is_err()
                    {
                        warn!(session = %slot.id, "session command channel closed");
                    }
                    break;
                }
            }
            slots.retain(|slot| {
                if slot.symbols.is_empty() {
                    info!(session = %slot.id, "session has no symbols left, closing");
                    false
                } else {
                    true
                }
            });
        }
    }

    /// Graceful drain: closing error to every subscriber, shutdown to
    /// every session, bounded by the configured drain timeout.
    pub async fn drain(&self) {
        info!("draining session manager");
        let frame = ServerMessage::Error(ErrorData::new(
            ErrorCode::Unknown,
            "server shutting down",
        ));
        for client in self.registry.all_subscribers() {
            client.send(&frame);
            client.push_close();
        }

        let slots: Vec<SessionSlot> = {
            let mut placements = self.placements.lock().await;
            placements.sessions.drain().flat_map(|(_, slots)| slots).collect()
        };

        for slot in &slots {
            let _ = slot.command_tx.send(SessionCommand::Shutdown).await;
        }
        let joins = futures::future::join_all(slots.into_iter().map(|slot| slot.join));
        if tokio::time::timeout(self.settings.server.drain_timeout, joins).await.is_err() {
            warn!("sessions did not stop within the drain timeout");
        }
        info!("session manager drained");
    }

    #[cfg(test)]
    async fn insert_test_slot(
        &self,
        exchange: Exchange,
        contract_type: &str,
        symbols: Vec<String>,
    ) -> mpsc::Receiver<SessionCommand> {
        let (command_tx, command_rx) = mpsc::channel(SESSION_COMMAND_BUFFER);
        let mut placements = self.placements.lock().await;
        placements.session_counter += 1;
        let id = format!("{exchange}/{contract_type}#{}", placements.session_counter);
        placements
            .sessions
            .entry((exchange, contract_type.to_string()))
            .or_default()
            .push(SessionSlot {
                id,
                symbols: symbols.into_iter().collect(),
                command_tx,
                join: tokio::spawn(async {}),
            });
        command_rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::OverflowPolicy;

    fn settings(max_conn: usize, max_per_ws: usize) -> Settings {
        let mut settings = Settings::default();
        settings.connector.max_conn_per_exchange = max_conn;
        settings.connector.max_symbol_per_ws = max_per_ws;
        settings
    }

    fn manager(max_conn: usize, max_per_ws: usize) -> (SessionManager, Arc<SubscriberRegistry>) {
        let registry = Arc::new(SubscriberRegistry::new());
        let manager = SessionManager::new(settings(max_conn, max_per_ws), registry.clone()).unwrap();
        (manager, registry)
    }

    fn client() -> Arc<SubscriberState> {
        Arc::new(SubscriberState::new(16, OverflowPolicy::DropOldest))
    }

    fn request(exchange: &str, contract_type: Option<&str>, symbols: &[&str]) -> SubscribeRequest {
        SubscribeRequest {
            exchange: exchange.to_string(),
            contract_type: contract_type.map(str::to_string),
            symbols: symbols.iter().map(|s| s.to_string()).collect(),
            limit: 0,
        }
    }

    #[tokio::test]
    async fn unknown_exchange_rejects_all_symbols() {
        let (manager, _) = manager(1, 10);
        let outcome = manager
            .subscribe(&client(), &request("ftx", Some("spot"), &["BTCUSDT"]))
            .await;
        assert!(outcome.accepted.is_empty());
        assert_eq!(outcome.rejected.len(), 1);
        assert_eq!(outcome.rejected[0].code, ErrorCode::InvalidSymbol);
    }

    #[tokio::test]
    async fn unsupported_contract_type_is_rejected() {
        let (manager, _) = manager(1, 10);
        let outcome = manager
            .subscribe(&client(), &request("bybit", Some("options"), &["BTCUSDT"]))
            .await;
        assert!(outcome.accepted.is_empty());
        assert_eq!(outcome.rejected[0].code, ErrorCode::UnsupportedContractType);
    }

    #[tokio::test]
    async fn invalid_symbols_reject_without_killing_valid_ones() {
        let (manager, _) = manager(1, 10);
        let mut command_rx = manager
            .insert_test_slot(Exchange::Hyperliquid, "spot", vec!["BTC/USDC".to_string()])
            .await;
        let outcome = manager
            .subscribe(
                &client(),
                &request("hyperliquid", Some("spot"), &["BTC/USDC", "BTC"]),
            )
            .await;
        // "BTC" has no quote currency for hyperliquid spot.
        assert_eq!(outcome.accepted, vec!["BTC/USDC".to_string()]);
        assert_eq!(outcome.rejected.len(), 1);
        assert_eq!(outcome.rejected[0].code, ErrorCode::InvalidSymbol);
        assert_eq!(outcome.rejected[0].symbols, vec!["BTC".to_string()]);
        assert!(command_rx.try_recv().is_err(), "existing feed, no new subscribe");
    }

    #[tokio::test]
    async fn full_pool_rejects_with_connection_pool_busy() {
        let (manager, _) = manager(1, 10);
        let symbols: Vec<String> = (0..10).map(|i| format!("SYM{i}USDT")).collect();
        let mut command_rx = manager
            .insert_test_slot(Exchange::Binance, "spot", symbols)
            .await;

        let outcome = manager
            .subscribe(&client(), &request("binance", Some("spot"), &["NEWUSDT"]))
            .await;
        assert!(outcome.accepted.is_empty());
        assert_eq!(outcome.rejected.len(), 1);
        assert_eq!(outcome.rejected[0].code, ErrorCode::ConnectionPoolBusy);
        assert!(command_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn capacity_in_existing_session_gets_incremental_subscribe() {
        let (manager, registry) = manager(1, 10);
        let mut command_rx = manager
            .insert_test_slot(Exchange::Okx, "swap", vec!["BTC-USDT-SWAP".to_string()])
            .await;

        let subscriber = client();
        registry.register(subscriber.clone());
        let outcome = manager
            .subscribe(&subscriber, &request("okx", Some("swap"), &["ETH-USDT-SWAP"]))
            .await;
        assert_eq!(outcome.accepted, vec!["ETH-USDT-SWAP".to_string()]);
        match command_rx.try_recv().unwrap() {
            SessionCommand::Subscribe(symbols) => assert_eq!(symbols, vec!["ETH-USDT-SWAP".to_string()]),
            other => panic!("unexpected command: {other:?}"),
        }
        assert_eq!(
            registry
                .subscribers_for(&SubscriptionKey::new(Exchange::Okx, "swap", "ETH-USDT-SWAP"))
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn duplicate_subscribe_is_idempotent() {
        let (manager, registry) = manager(1, 10);
        let _command_rx = manager
            .insert_test_slot(Exchange::Bybit, "linear", vec!["BTCUSDT".to_string()])
            .await;

        let subscriber = client();
        registry.register(subscriber.clone());
        let first = manager
            .subscribe(&subscriber, &request("bybit", Some("linear"), &["BTCUSDT"]))
            .await;
        let second = manager
            .subscribe(&subscriber, &request("bybit", Some("linear"), &["BTCUSDT"]))
            .await;
        assert_eq!(first.accepted, second.accepted);
        let key = SubscriptionKey::new(Exchange::Bybit, "linear", "BTCUSDT");
        assert_eq!(registry.subscribers_for(&key).len(), 1, "one registration, one stream");
    }

    #[tokio::test]
    async fn disconnect_releases_orphaned_symbols() {
        let (manager, registry) = manager(1, 10);
        let mut command_rx = manager
            .insert_test_slot(Exchange::Gateio, "um", vec!["BTC_USDT".to_string()])
            .await;

        let subscriber = client();
        registry.register(subscriber.clone());
        manager
            .subscribe(&subscriber, &request("gateio", Some("um"), &["BTC_USDT"]))
            .await;

        manager.release_subscriber(&subscriber.id).await;
        match command_rx.recv().await.unwrap() {
            SessionCommand::Unsubscribe(symbols) => assert_eq!(symbols, vec!["BTC_USDT".to_string()]),
            other => panic!("unexpected command: {other:?}"),
        }
        let placements = manager.placements.lock().await;
        assert!(
            placements.sessions.get(&(Exchange::Gateio, "um".to_string())).unwrap().is_empty(),
            "empty session removed from placement"
        );
    }
}
