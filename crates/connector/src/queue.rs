//! Dual-pipeline candle queue.
//!
//! Closed candles enter a bounded FIFO that applies backpressure to the
//! producer; open candles enter a LIFO stack that overwrites its oldest
//! entry when capped. The consumer always drains the FIFO first so
//! finished bars arrive in chronological order, then takes the freshest
//! live tick off the stack.

use common::Candle;
use metrics::{counter, gauge};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::time::timeout;
use tracing::warn;

type Item = (Candle, Instant);

struct Inner {
    closed: VecDeque<Item>,
    open: VecDeque<Item>,
    blocking_events: u64,
    open_overflow_events: u64,
}

/// The queue owned by one upstream session.
pub struct CandleQueue {
    closed_cap: usize,
    /// 0 disables the cap on the open stack.
    open_cap: usize,
    /// None blocks the producer indefinitely when the FIFO is full.
    block_timeout: Option<Duration>,
    inner: Mutex<Inner>,
    not_full: Notify,
    not_empty: Notify,
    exchange: String,
    contract_type: String,
}

impl CandleQueue {
    pub fn new(
        closed_cap: usize,
        open_cap: usize,
        block_timeout: Option<Duration>,
        exchange: impl Into<String>,
        contract_type: impl Into<String>,
    ) -> Self {
        Self {
            closed_cap: closed_cap.max(1),
            open_cap,
            block_timeout,
            inner: Mutex::new(Inner {
                closed: VecDeque::new(),
                open: VecDeque::new(),
                blocking_events: 0,
                open_overflow_events: 0,
            }),
            not_full: Notify::new(),
            not_empty: Notify::new(),
            exchange: exchange.into(),
            contract_type: contract_type.into(),
        }
    }

    /// Route a candle into the appropriate pipeline. `received_at` is
    /// the instant the raw frame arrived and travels with the candle
    /// for latency accounting. This is the backpressure point: a
    /// closed candle against a full FIFO suspends the producer until
    /// the consumer frees a slot.
    pub async fn offer(&self, candle: Candle, received_at: Instant) {
        if candle.is_closed {
            self.offer_closed(candle, received_at).await;
        } else {
            self.offer_open(candle, received_at);
        }
    }

    async fn offer_closed(&self, candle: Candle, received_at: Instant) {
        let mut blocked = false;
        let deadline = self.block_timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            let notified = self.not_full.notified();
            {
                let mut inner = self.inner.lock().unwrap();
                if inner.closed.len() < self.closed_cap {
                    inner.closed.push_back((candle, received_at));
                    self.update_depth_gauges(&inner);
                    drop(inner);
                    self.not_empty.notify_one();
                    return;
                }
                if !blocked {
                    blocked = true;
                    inner.blocking_events += 1;
                    counter!("queue_blocking_events_total").increment(1);
                    warn!(
                        exchange = %self.exchange,
                        contract_type = %self.contract_type,
                        depth = inner.closed.len(),
                        "closed queue full, applying backpressure"
                    );
                }
            }
            match deadline {
                None => notified.await,
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                    if remaining.is_zero() || timeout(remaining, notified).await.is_err() {
                        warn!(
                            exchange = %self.exchange,
                            contract_type = %self.contract_type,
                            symbol = %candle.symbol,
                            open_time = %candle.open_time,
                            "producer block timeout expired, dropping closed candle"
                        );
                        return;
                    }
                }
            }
        }
    }

    fn offer_open(&self, candle: Candle, received_at: Instant) {
        let mut inner = self.inner.lock().unwrap();
        if self.open_cap > 0 && inner.open.len() >= self.open_cap {
            let dropped = inner.open.pop_front();
            inner.open_overflow_events += 1;
            counter!("queue_open_overflow_total").increment(1);
            if let Some((dropped, _)) = dropped {
                warn!(
                    exchange = %self.exchange,
                    contract_type = %self.contract_type,
                    symbol = %dropped.symbol,
                    "open stack full, dropped oldest tick"
                );
            }
        }
        inner.open.push_back((candle, received_at));
        self.update_depth_gauges(&inner);
        drop(inner);
        self.not_empty.notify_one();
    }

    /// Non-blocking take: closed FIFO first, then the top of the open
    /// stack. None when both pipelines are empty.
    pub fn drain_one(&self) -> Option<(Candle, Instant)> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(item) = inner.closed.pop_front() {
            self.update_depth_gauges(&inner);
            drop(inner);
            self.not_full.notify_one();
            return Some(item);
        }
        let item = inner.open.pop_back();
        if item.is_some() {
            self.update_depth_gauges(&inner);
        }
        item
    }

    /// Await the next candle, following the same priority rule.
    pub async fn next(&self) -> (Candle, Instant) {
        loop {
            let notified = self.not_empty.notified();
            if let Some(candle) = self.drain_one() {
                return candle;
            }
            notified.await;
        }
    }

    pub fn closed_len(&self) -> usize {
        self.inner.lock().unwrap().closed.len()
    }

    pub fn open_len(&self) -> usize {
        self.inner.lock().unwrap().open.len()
    }

    pub fn is_empty(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.closed.is_empty() && inner.open.is_empty()
    }

    pub fn blocking_events(&self) -> u64 {
        self.inner.lock().unwrap().blocking_events
    }

    pub fn open_overflow_events(&self) -> u64 {
        self.inner.lock().unwrap().open_overflow_events
    }

    fn update_depth_gauges(&self, inner: &Inner) {
        gauge!(
            "queue_depth_closed",
            "exchange" => self.exchange.clone(),
            "contract_type" => self.contract_type.clone()
        )
        .set(inner.closed.len() as f64);
        gauge!(
            "queue_depth_open",
            "exchange" => self.exchange.clone(),
            "contract_type" => self.contract_type.clone()
        )
        .set(inner.open.len() as f64);
    }
}
