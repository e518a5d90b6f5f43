//! One WebSocket session to one exchange.
//!
//! The session runs a reconnect loop gated by its circuit breaker,
//! processes frames in receive order, applies dedup to closed candles,
//! and offers everything into the dual-pipeline queue. A paired drain
//! task hands queued candles to the downstream sink. Inactivity on the
//! socket triggers a concurrent REST backfill across the session's
//! symbols without dropping the connection.

use crate::adapter::{ExchangeAdapter, FrameEvent};
use crate::breaker::{BreakerState, CircuitBreaker};
use crate::dedup::{DedupVerdict, Deduplicator};
use crate::error::{ConnectorError, Result};
use crate::health::HealthRegistry;
use crate::queue::CandleQueue;
use async_trait::async_trait;
use common::config::ConnectorSettings;
use common::{Candle, ErrorCode, SubscriptionKey};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, timeout};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{client_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;
type WsReader = SplitStream<WsStream>;

const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Runtime commands accepted by a session.
#[derive(Debug, Clone)]
pub enum SessionCommand {
    /// Add symbols to the live subscription.
    Subscribe(Vec<String>),
    /// Remove symbols; the session closes itself once empty.
    Unsubscribe(Vec<String>),
    /// Graceful shutdown.
    Shutdown,
}

/// Downstream half of a session: where candles and errors go.
#[async_trait]
pub trait SessionSink: Send + Sync + 'static {
    /// Deliver one normalised candle. `received_at` is the instant the
    /// raw frame arrived, for latency accounting.
    async fn deliver(&self, candle: Candle, received_at: Instant);

    /// Surface an error to every subscriber holding one of `keys`.
    fn report_error(
        &self,
        keys: Vec<SubscriptionKey>,
        code: ErrorCode,
        message: String,
        exchange_message: Option<String>,
    );
}

enum StreamExit {
    Shutdown,
    /// Symbol set changed on a venue without incremental subscribe;
    /// reconnect with the full set.
    Resubscribe,
}

#[derive(PartialEq)]
enum WaitOutcome {
    Elapsed,
    Shutdown,
}

/// One upstream WebSocket with its breaker, dedup, and queue.
pub struct UpstreamSession {
    id: String,
    adapter: Arc<dyn ExchangeAdapter>,
    settings: ConnectorSettings,
    symbols: Vec<String>,
    breaker: Arc<CircuitBreaker>,
    dedup: Deduplicator,
    queue: Arc<CandleQueue>,
    rest_client: reqwest::Client,
    rest_concurrency: usize,
    sink: Arc<dyn SessionSink>,
    health: Arc<HealthRegistry>,
    command_rx: mpsc::Receiver<SessionCommand>,
}

impl UpstreamSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: impl Into<String>,
        adapter: Arc<dyn ExchangeAdapter>,
        settings: ConnectorSettings,
        symbols: Vec<String>,
        rest_client: reqwest::Client,
        rest_concurrency: usize,
        sink: Arc<dyn SessionSink>,
        health: Arc<HealthRegistry>,
        command_rx: mpsc::Receiver<SessionCommand>,
    ) -> Self {
        let exchange = adapter.exchange();
        let contract_type = adapter.contract_type().to_string();
        let breaker = Arc::new(CircuitBreaker::new(
            settings.breaker_failure_threshold,
            settings.breaker_recovery_timeout,
            settings.breaker_half_open_calls,
            exchange.as_str(),
            contract_type.clone(),
        ));
        let dedup = Deduplicator::new(
            settings.dedup_window,
            settings.dedup_max_entries,
            exchange.as_str(),
            contract_type.clone(),
        );
        let queue = Arc::new(CandleQueue::new(
            settings.closed_queue_maxsize,
            settings.open_queue_maxsize,
            None,
            exchange.as_str(),
            contract_type,
        ));
        Self {
            id: id.into(),
            adapter,
            settings,
            symbols,
            breaker,
            dedup,
            queue,
            rest_client,
            rest_concurrency,
            sink,
            health,
            command_rx,
        }
    }

    /// Run until shutdown or until the symbol set empties out.
    pub async fn run(mut self) {
        let exchange = self.adapter.exchange();
        let contract_type = self.adapter.contract_type().to_string();
        info!(session = %self.id, symbols = self.symbols.len(), "upstream session starting");

        let (stop_tx, stop_rx) = watch::channel(false);
        let drain = tokio::spawn(drain_queue(self.queue.clone(), self.sink.clone(), stop_rx));

        let mut first_attempt = true;
        loop {
            if self.symbols.is_empty() {
                break;
            }
            if !self.breaker.allow() {
                self.health.record_breaker(exchange, &contract_type, self.breaker.state());
                if self.wait_or_command(self.settings.reconnect_delay).await == WaitOutcome::Shutdown {
                    break;
                }
                continue;
            }
            if !first_attempt {
                counter!("reconnections_total", "exchange" => exchange.as_str()).increment(1);
            }
            first_attempt = false;

            match self.connect_and_stream().await {
                Ok(StreamExit::Shutdown) => break,
                Ok(StreamExit::Resubscribe) => continue,
                Err(err) => {
                    let was_open = self.breaker.state() == BreakerState::Open;
                    self.breaker.record_failure();
                    let state = self.breaker.state();
                    self.health.record_error(exchange, &contract_type);
                    self.health.record_breaker(exchange, &contract_type, state);
                    counter!(
                        "connection_errors_total",
                        "exchange" => exchange.as_str(),
                        "kind" => err.code().as_str()
                    )
                    .increment(1);
                    warn!(
                        session = %self.id,
                        error = %err,
                        breaker = state.as_str(),
                        "upstream connection failed, reconnecting"
                    );
                    // Tell the affected subscribers once per failure
                    // streak, on the transition that opens the breaker.
                    if state == BreakerState::Open && !was_open {
                        self.sink.report_error(
                            self.keys(),
                            err.code(),
                            format!("upstream connection to {exchange} is failing"),
                            Some(err.to_string()),
                        );
                    }
                    if self.wait_or_command(self.settings.reconnect_delay).await == WaitOutcome::Shutdown {
                        break;
                    }
                }
            }
        }

        let _ = stop_tx.send(true);
        let _ = drain.await;
        self.health.remove(exchange, &contract_type);
        info!(session = %self.id, "upstream session closed");
    }

    /// Sleep, but keep servicing commands so a shutdown or symbol
    /// change never waits on a backoff.
    async fn wait_or_command(&mut self, wait: Duration) -> WaitOutcome {
        let sleep = tokio::time::sleep(wait);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return WaitOutcome::Elapsed,
                cmd = self.command_rx.recv() => match cmd {
                    Some(SessionCommand::Shutdown) | None => return WaitOutcome::Shutdown,
                    Some(SessionCommand::Subscribe(new)) => {
                        self.add_symbols(new);
                    }
                    Some(SessionCommand::Unsubscribe(gone)) => {
                        self.remove_symbols(&gone);
                        if self.symbols.is_empty() {
                            return WaitOutcome::Shutdown;
                        }
                    }
                },
            }
        }
    }

    async fn connect_and_stream(&mut self) -> Result<StreamExit> {
        let exchange = self.adapter.exchange();
        let contract_type = self.adapter.contract_type().to_string();

        let url = self.adapter.ws_url(&self.symbols)?;
        info!(session = %self.id, url = %url, "connecting to exchange websocket");
        let ws = connect_ws(&url).await?;
        let (mut write, mut read) = ws.split();

        for frame in self.adapter.subscribe_frames(&self.symbols)? {
            debug!(session = %self.id, frame = %frame, "sending subscription");
            write.send(Message::Text(frame)).await?;
        }

        self.breaker.record_success();
        self.health.record_breaker(exchange, &contract_type, self.breaker.state());
        self.health.record_connection(exchange, &contract_type, true);
        gauge!(
            "active_connections",
            "exchange" => exchange.as_str(),
            "contract_type" => contract_type.clone()
        )
        .increment(1.0);
        info!(session = %self.id, "websocket connected");

        let result = self.stream_loop(&mut write, &mut read).await;

        self.health.record_connection(exchange, &contract_type, false);
        gauge!(
            "active_connections",
            "exchange" => exchange.as_str(),
            "contract_type" => contract_type
        )
        .decrement(1.0);
        result
    }

    async fn stream_loop(&mut self, write: &mut WsWriter, read: &mut WsReader) -> Result<StreamExit> {
        let mut ping_timer = interval(self.settings.ws_ping_interval);
        ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ping_timer.reset();
        let mut last_inbound = Instant::now();

        loop {
            tokio::select! {
                frame = timeout(self.settings.inactivity_timeout, read.next()) => {
                    match frame {
                        // Inactivity: backfill over REST, keep the socket.
                        Err(_) => {
                            warn!(
                                session = %self.id,
                                timeout_secs = self.settings.inactivity_timeout.as_secs_f64(),
                                "no updates within inactivity window, performing REST backfill"
                            );
                            self.run_backfill().await;
                        }
                        Ok(Some(Ok(Message::Text(text)))) => {
                            last_inbound = Instant::now();
                            if let Some(reply) = self.process_frame(&text).await {
                                write.send(Message::Text(reply)).await?;
                            }
                        }
                        Ok(Some(Ok(Message::Ping(payload)))) => {
                            last_inbound = Instant::now();
                            write.send(Message::Pong(payload)).await?;
                        }
                        Ok(Some(Ok(Message::Pong(_)))) => {
                            last_inbound = Instant::now();
                        }
                        Ok(Some(Ok(Message::Binary(_)))) | Ok(Some(Ok(Message::Frame(_)))) => {}
                        Ok(Some(Ok(Message::Close(frame)))) => {
                            info!(session = %self.id, ?frame, "exchange closed the connection");
                            return Err(ConnectorError::ConnectionClosed);
                        }
                        Ok(Some(Err(err))) => return Err(err.into()),
                        Ok(None) => return Err(ConnectorError::ConnectionClosed),
                    }
                }

                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(SessionCommand::Shutdown) | None => {
                            let _ = write
                                .send(Message::Close(Some(CloseFrame {
                                    code: CloseCode::Normal,
                                    reason: "shutdown".into(),
                                })))
                                .await;
                            return Ok(StreamExit::Shutdown);
                        }
                        Some(SessionCommand::Subscribe(new)) => {
                            let added = self.add_symbols(new);
                            if !added.is_empty() {
                                if self.adapter.supports_incremental_subscribe() {
                                    for frame in self.adapter.subscribe_frames(&added)? {
                                        write.send(Message::Text(frame)).await?;
                                    }
                                } else {
                                    return Ok(StreamExit::Resubscribe);
                                }
                            }
                        }
                        Some(SessionCommand::Unsubscribe(gone)) => {
                            let removed = self.remove_symbols(&gone);
                            if self.symbols.is_empty() {
                                let _ = write
                                    .send(Message::Close(Some(CloseFrame {
                                        code: CloseCode::Normal,
                                        reason: "no subscribers".into(),
                                    })))
                                    .await;
                                return Ok(StreamExit::Shutdown);
                            }
                            if !removed.is_empty() {
                                let frames = self.adapter.unsubscribe_frames(&removed)?;
                                if frames.is_empty() && !self.adapter.supports_incremental_subscribe() {
                                    return Ok(StreamExit::Resubscribe);
                                }
                                for frame in frames {
                                    write.send(Message::Text(frame)).await?;
                                }
                            }
                        }
                    }
                }

                _ = ping_timer.tick() => {
                    let silence = last_inbound.elapsed();
                    if silence > self.settings.ws_ping_interval + self.settings.ws_ping_timeout {
                        return Err(ConnectorError::StreamTimeout(format!(
                            "no pong for {:.1}s",
                            silence.as_secs_f64()
                        )));
                    }
                    write.send(Message::Ping(Vec::new())).await?;
                }
            }
        }
    }

    /// Map a raw frame into queue entries; returns a reply frame owed
    /// to the venue, if any.
    async fn process_frame(&mut self, text: &str) -> Option<String> {
        let exchange = self.adapter.exchange();
        match self.adapter.handle_frame(text) {
            Ok(FrameEvent::Candles(candles)) => {
                let received_at = Instant::now();
                for candle in candles {
                    self.process_candle(candle, received_at).await;
                }
                None
            }
            Ok(FrameEvent::Reply(reply)) => Some(reply),
            Ok(FrameEvent::Ignore) => None,
            Ok(FrameEvent::SubscribeRejected(message)) => {
                warn!(session = %self.id, message = %message, "exchange rejected subscription");
                counter!(
                    "connection_errors_total",
                    "exchange" => exchange.as_str(),
                    "kind" => ErrorCode::WsSubscribeRejected.as_str()
                )
                .increment(1);
                self.health.record_error(exchange, self.adapter.contract_type());
                self.sink.report_error(
                    self.keys(),
                    ErrorCode::WsSubscribeRejected,
                    "subscription rejected by exchange".to_string(),
                    Some(message),
                );
                // The session may still serve its other symbols.
                None
            }
            Err(err) => {
                debug!(session = %self.id, error = %err, "discarding unparseable frame");
                counter!("parse_errors_total", "exchange" => exchange.as_str()).increment(1);
                None
            }
        }
    }

    async fn process_candle(&mut self, candle: Candle, received_at: Instant) {
        let exchange = self.adapter.exchange();
        let contract_type = self.adapter.contract_type();

        if !candle.is_well_formed() {
            debug!(
                session = %self.id,
                symbol = %candle.symbol,
                "dropping candle violating OHLC invariants"
            );
            counter!("parse_errors_total", "exchange" => exchange.as_str()).increment(1);
            return;
        }

        if candle.is_closed
            && self.dedup.check_and_insert(&candle.symbol, candle.open_time_ms())
                == DedupVerdict::Duplicate
        {
            counter!("duplicates_filtered_total").increment(1);
            return;
        }

        counter!(
            "quotes_processed_total",
            "exchange" => exchange.as_str(),
            "contract_type" => contract_type.to_string(),
            "is_closed" => if candle.is_closed { "true" } else { "false" }
        )
        .increment(1);
        self.health.record_quote(exchange, contract_type);

        self.queue.offer(candle, received_at).await;
    }

    /// The IDLE/BACKFILL leg: fetch the latest bar for every symbol and
    /// feed the results through the normal dedup → queue path. Failures
    /// are reported to the affected subscribers; the socket survives.
    async fn run_backfill(&mut self) {
        let exchange = self.adapter.exchange();
        let symbols = self.symbols.clone();
        let outcome = self
            .adapter
            .backfill(&self.rest_client, &symbols, self.rest_concurrency)
            .await;

        match outcome {
            Ok(candles) if !candles.is_empty() => {
                counter!(
                    "rest_backfills_total",
                    "exchange" => exchange.as_str(),
                    "outcome" => "success"
                )
                .increment(1);
                info!(session = %self.id, count = candles.len(), "REST backfill produced candles");
                let received_at = Instant::now();
                for candle in candles {
                    self.process_candle(candle, received_at).await;
                }
            }
            Ok(_) => {
                counter!(
                    "rest_backfills_total",
                    "exchange" => exchange.as_str(),
                    "outcome" => "failure"
                )
                .increment(1);
                self.health.record_error(exchange, self.adapter.contract_type());
                self.sink.report_error(
                    self.keys(),
                    ErrorCode::RestBackfillFailed,
                    "REST backfill returned no candles".to_string(),
                    None,
                );
            }
            Err(err) => {
                counter!(
                    "rest_backfills_total",
                    "exchange" => exchange.as_str(),
                    "outcome" => "failure"
                )
                .increment(1);
                warn!(session = %self.id, error = %err, "REST backfill failed");
                self.health.record_error(exchange, self.adapter.contract_type());
                let (code, message) = if matches!(err, ConnectorError::RateLimited(_)) {
                    self.breaker.record_failure();
                    self.health.record_breaker(
                        exchange,
                        self.adapter.contract_type(),
                        self.breaker.state(),
                    );
                    (ErrorCode::RateLimited, "exchange rate limit hit during REST backfill")
                } else {
                    (ErrorCode::RestBackfillFailed, "REST backfill failed")
                };
                self.sink.report_error(
                    self.keys(),
                    code,
                    message.to_string(),
                    Some(err.to_string()),
                );
            }
        }
    }

    fn keys(&self) -> Vec<SubscriptionKey> {
        let exchange = self.adapter.exchange();
        let contract_type = self.adapter.contract_type();
        self.symbols
            .iter()
            .map(|symbol| SubscriptionKey::new(exchange, contract_type, symbol.clone()))
            .collect()
    }

    fn add_symbols(&mut self, new: Vec<String>) -> Vec<String> {
        let mut added = Vec::new();
        for symbol in new {
            if !self.symbols.contains(&symbol) {
                self.symbols.push(symbol.clone());
                added.push(symbol);
            }
        }
        added
    }

    fn remove_symbols(&mut self, gone: &[String]) -> Vec<String> {
        let mut removed = Vec::new();
        self.symbols.retain(|symbol| {
            if gone.contains(symbol) {
                removed.push(symbol.clone());
                false
            } else {
                true
            }
        });
        removed
    }
}

/// Hand queued candles to the sink until stopped, then flush whatever
/// is left.
async fn drain_queue(
    queue: Arc<CandleQueue>,
    sink: Arc<dyn SessionSink>,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            biased;

            _ = stop_rx.changed() => {
                while let Some((candle, received_at)) = queue.drain_one() {
                    sink.deliver(candle, received_at).await;
                }
                return;
            }

            item = queue.next() => {
                let (candle, received_at) = item;
                sink.deliver(candle, received_at).await;
            }
        }
    }
}

/// Open a WebSocket to the exchange: resolve DNS preferring IPv4, dial
/// with a bounded timeout, then upgrade over rustls for `wss` URLs.
async fn connect_ws(url_str: &str) -> Result<WsStream> {
    let url = Url::parse(url_str)?;
    let host = url
        .host_str()
        .ok_or_else(|| ConnectorError::ConnectFailed("no host in URL".to_string()))?;
    let default_port = if url.scheme() == "wss" { 443 } else { 80 };
    let port = url.port().unwrap_or(default_port);
    let addr_str = format!("{host}:{port}");

    let addrs: Vec<SocketAddr> = addr_str
        .to_socket_addrs()
        .map_err(|e| ConnectorError::ConnectFailed(format!("DNS resolution failed: {e}")))?
        .collect();

    // IPv4 first; several exchange endpoints publish AAAA records that
    // time out from v4-only networks.
    let mut sorted_addrs: Vec<SocketAddr> = addrs.iter().filter(|a| a.is_ipv4()).copied().collect();
    sorted_addrs.extend(addrs.iter().filter(|a| a.is_ipv6()).copied());

    let mut tcp_stream = None;
    for addr in &sorted_addrs {
        match timeout(TCP_CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                debug!(%addr, "tcp connected");
                tcp_stream = Some(stream);
                break;
            }
            Ok(Err(err)) => debug!(%addr, error = %err, "tcp connect failed"),
            Err(_) => debug!(%addr, "tcp connect timed out"),
        }
    }
    let tcp_stream = tcp_stream
        .ok_or_else(|| ConnectorError::ConnectFailed("all connection attempts failed".to_string()))?;

    let connector = if url.scheme() == "wss" {
        let mut root_store = rustls::RootCertStore::empty();
        let certs = rustls_native_certs::load_native_certs();
        for cert in certs.certs {
            let _ = root_store.add(cert);
        }
        let config = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| ConnectorError::ConnectFailed(format!("TLS config error: {e}")))?
        .with_root_certificates(root_store)
        .with_no_client_auth();
        Connector::Rustls(Arc::new(config))
    } else {
        Connector::Plain
    };

    let (ws_stream, response) =
        client_async_tls_with_config(url_str, tcp_stream, None, Some(connector)).await?;
    debug!(status = ?response.status(), "websocket handshake complete");
    Ok(ws_stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ParseError;
    use chrono::{TimeZone, Utc};
    use common::{Exchange, Settings};
    use std::sync::Mutex;
    use tokio::net::TcpListener;

    /// Adapter pointed at a local mock server. Frames are JSON objects
    /// `{"symbol": …, "minute": …, "closed": …}`.
    struct MockAdapter {
        url: String,
        backfill_candles: Mutex<Vec<Candle>>,
        fail_backfill: bool,
        rate_limit_backfill: bool,
    }

    impl MockAdapter {
        fn new(url: String) -> Self {
            Self {
                url,
                backfill_candles: Mutex::new(Vec::new()),
                fail_backfill: false,
                rate_limit_backfill: false,
            }
        }
    }

    fn test_candle(minute: u32, is_closed: bool) -> Candle {
        Candle {
            exchange: Exchange::Binance,
            contract_type: "spot".to_string(),
            symbol: "BTCUSDT".to_string(),
            open_time: Utc.with_ymd_and_hms(2024, 5, 1, 12, minute, 0).unwrap(),
            open: 100.0,
            high: 101.0,
            low: 99.0,
            close: 100.5,
            volume: 1.0,
            trade_num: 3,
            is_closed,
        }
    }

    #[async_trait]
    impl ExchangeAdapter for MockAdapter {
        fn exchange(&self) -> Exchange {
            Exchange::Binance
        }

        fn contract_type(&self) -> &str {
            "spot"
        }

        fn ws_url(&self, _symbols: &[String]) -> Result<String> {
            Ok(self.url.clone())
        }

        fn subscribe_frames(&self, _symbols: &[String]) -> Result<Vec<String>> {
            Ok(Vec::new())
        }

        fn handle_frame(&self, text: &str) -> std::result::Result<FrameEvent, ParseError> {
            let value: serde_json::Value = serde_json::from_str(text)?;
            if value.get("reject").is_some() {
                return Ok(FrameEvent::SubscribeRejected("mock rejection".to_string()));
            }
            let minute = value
                .get("minute")
                .and_then(serde_json::Value::as_u64)
                .ok_or(ParseError::MissingField("minute"))? as u32;
            let closed = value.get("closed").and_then(serde_json::Value::as_bool).unwrap_or(false);
            Ok(FrameEvent::Candles(vec![test_candle(minute, closed)]))
        }

        async fn backfill(
            &self,
            _client: &reqwest::Client,
            _symbols: &[String],
            _concurrency: usize,
        ) -> Result<Vec<Candle>> {
            if self.rate_limit_backfill {
                return Err(ConnectorError::RateLimited("mock 429".to_string()));
            }
            if self.fail_backfill {
                return Err(ConnectorError::BackfillFailed("mock 500".to_string()));
            }
            Ok(self.backfill_candles.lock().unwrap().drain(..).collect())
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        candles: Mutex<Vec<Candle>>,
        errors: Mutex<Vec<(ErrorCode, Option<String>)>>,
    }

    #[async_trait]
    impl SessionSink for RecordingSink {
        async fn deliver(&self, candle: Candle, _received_at: Instant) {
            self.candles.lock().unwrap().push(candle);
        }

        fn report_error(
            &self,
            _keys: Vec<SubscriptionKey>,
            code: ErrorCode,
            _message: String,
            exchange_message: Option<String>,
        ) {
            self.errors.lock().unwrap().push((code, exchange_message));
        }
    }

    async fn spawn_mock_server(frames: Vec<String>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((stream, _)) = listener.accept().await {
                let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
                for frame in frames {
                    if ws.send(Message::Text(frame)).await.is_err() {
                        return;
                    }
                }
                // Hold the socket open so the session idles rather than
                // seeing an orderly close.
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
        });
        format!("ws://{addr}")
    }

    fn session_settings() -> ConnectorSettings {
        let mut settings = Settings::default().connector;
        settings.inactivity_timeout = Duration::from_millis(200);
        settings.reconnect_delay = Duration::from_millis(50);
        settings
    }

    fn build_session(
        adapter: MockAdapter,
        settings: ConnectorSettings,
    ) -> (UpstreamSession, Arc<RecordingSink>, mpsc::Sender<SessionCommand>) {
        let sink = Arc::new(RecordingSink::default());
        let (command_tx, command_rx) = mpsc::channel(8);
        let session = UpstreamSession::new(
            "binance/spot#1",
            Arc::new(adapter),
            settings,
            vec!["BTCUSDT".to_string()],
            reqwest::Client::new(),
            4,
            sink.clone(),
            Arc::new(HealthRegistry::new()),
            command_rx,
        );
        (session, sink, command_tx)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn streams_and_dedups_replayed_closed_candles() {
        let url = spawn_mock_server(vec![
            r#"{"minute": 1, "closed": true}"#.to_string(),
            r#"{"minute": 1, "closed": true}"#.to_string(),
            r#"{"minute": 2, "closed": true}"#.to_string(),
            r#"{"minute": 2, "closed": false}"#.to_string(),
        ])
        .await;
        let (session, sink, command_tx) = build_session(MockAdapter::new(url), session_settings());
        let handle = tokio::spawn(session.run());

        tokio::time::sleep(Duration::from_millis(300)).await;
        command_tx.send(SessionCommand::Shutdown).await.unwrap();
        handle.await.unwrap();

        let candles = sink.candles.lock().unwrap();
        let closed: Vec<_> = candles.iter().filter(|c| c.is_closed).collect();
        assert_eq!(closed.len(), 2, "replayed closed bar filtered: {candles:?}");
        assert_eq!(candles.iter().filter(|c| !c.is_closed).count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn inactivity_triggers_backfill_delivery() {
        let url = spawn_mock_server(Vec::new()).await;
        let adapter = MockAdapter::new(url);
        *adapter.backfill_candles.lock().unwrap() = vec![test_candle(9, true)];
        let (session, sink, command_tx) = build_session(adapter, session_settings());
        let handle = tokio::spawn(session.run());

        tokio::time::sleep(Duration::from_millis(500)).await;
        command_tx.send(SessionCommand::Shutdown).await.unwrap();
        handle.await.unwrap();

        let candles = sink.candles.lock().unwrap();
        assert!(
            candles.iter().any(|c| c.is_closed && c.open_time.timestamp() % 3600 == 9 * 60),
            "backfill candle delivered: {candles:?}"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_backfill_reports_error_to_subscribers() {
        let url = spawn_mock_server(Vec::new()).await;
        let mut adapter = MockAdapter::new(url);
        adapter.fail_backfill = true;
        let (session, sink, command_tx) = build_session(adapter, session_settings());
        let handle = tokio::spawn(session.run());

        tokio::time::sleep(Duration::from_millis(500)).await;
        command_tx.send(SessionCommand::Shutdown).await.unwrap();
        handle.await.unwrap();

        let errors = sink.errors.lock().unwrap();
        assert!(
            errors.iter().any(|(code, _)| *code == ErrorCode::RestBackfillFailed),
            "expected backfill failure report: {errors:?}"
        );
        assert!(sink.candles.lock().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rate_limited_backfill_reports_rate_limited() {
        let url = spawn_mock_server(Vec::new()).await;
        let mut adapter = MockAdapter::new(url);
        adapter.rate_limit_backfill = true;
        let (session, sink, command_tx) = build_session(adapter, session_settings());
        let handle = tokio::spawn(session.run());

        tokio::time::sleep(Duration::from_millis(500)).await;
        command_tx.send(SessionCommand::Shutdown).await.unwrap();
        handle.await.unwrap();

        let errors = sink.errors.lock().unwrap();
        assert!(
            errors
                .iter()
                .any(|(code, msg)| *code == ErrorCode::RateLimited
                    && msg.as_deref().is_some_and(|m| m.contains("mock 429"))),
            "expected rate-limit report: {errors:?}"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rejection_frame_surfaces_subscribe_rejected() {
        let url = spawn_mock_server(vec![r#"{"reject": true}"#.to_string()]).await;
        let (session, sink, command_tx) = build_session(MockAdapter::new(url), session_settings());
        let handle = tokio::spawn(session.run());

        tokio::time::sleep(Duration::from_millis(300)).await;
        command_tx.send(SessionCommand::Shutdown).await.unwrap();
        handle.await.unwrap();

        let errors = sink.errors.lock().unwrap();
        assert!(errors
            .iter()
            .any(|(code, msg)| *code == ErrorCode::WsSubscribeRejected
                && msg.as_deref() == Some("mock rejection")));
    }
}
