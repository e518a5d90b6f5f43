//! Subscriber state and registry.
//!
//! Each downstream connection owns a bounded outbound buffer drained by
//! its writer task; a slow subscriber triggers the configured overflow
//! policy instead of stalling the fan-out loop. The registry keeps a
//! lock-free reverse index from subscription key to subscriber ids for
//! the hot forwarding path.

use crate::protocol::{ErrorData, ServerMessage};
use chrono::{DateTime, Utc};
use common::{ErrorCode, OverflowPolicy, SubscriptionKey};
use dashmap::{DashMap, DashSet};
use metrics::gauge;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Unique subscriber identifier.
pub type SubscriberId = Uuid;

/// Items the writer task takes off a subscriber's buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// A pre-serialized JSON text frame.
    Frame(String),
    /// Keep-alive ping.
    Ping,
    /// Close the connection after flushing.
    Close,
}

/// Per-quote delivery decision under the subscription `limit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaOutcome {
    Deliver,
    /// Deliver this quote, then close: the limit is reached.
    LastDeliver,
    Exhausted,
}

/// State for one connected subscriber.
pub struct SubscriberState {
    pub id: SubscriberId,
    pub connected_at: DateTime<Utc>,
    capacity: usize,
    overflow_policy: OverflowPolicy,
    buffer: Mutex<VecDeque<Outbound>>,
    notify: Notify,
    closing: AtomicBool,
    backpressure_flagged: AtomicBool,
    /// Total quote frames allowed on this connection; 0 = unbounded.
    limit: AtomicU64,
    quotes_sent: AtomicU64,
    keys: DashSet<SubscriptionKey>,
}

impl SubscriberState {
    pub fn new(capacity: usize, overflow_policy: OverflowPolicy) -> Self {
        Self {
            id: Uuid::new_v4(),
            connected_at: Utc::now(),
            capacity: capacity.max(1),
            overflow_policy,
            buffer: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closing: AtomicBool::new(false),
            backpressure_flagged: AtomicBool::new(false),
            limit: AtomicU64::new(0),
            quotes_sent: AtomicU64::new(0),
            keys: DashSet::new(),
        }
    }

    pub fn set_limit(&self, limit: u64) {
        self.limit.store(limit, Ordering::Relaxed);
    }

    pub fn limit(&self) -> u64 {
        self.limit.load(Ordering::Relaxed)
    }

    /// Serialize and enqueue a frame for this subscriber.
    pub fn send(&self, message: &ServerMessage) {
        match serde_json::to_string(message) {
            Ok(json) => self.push(Outbound::Frame(json)),
            Err(err) => warn!(subscriber = %self.id, error = %err, "failed to serialize frame"),
        }
    }

    /// Enqueue a pre-serialized frame (shared across a fan-out).
    pub fn send_raw(&self, json: String) {
        self.push(Outbound::Frame(json));
    }

    pub fn push_ping(&self) {
        self.push(Outbound::Ping);
    }

    /// Request the connection be closed once the buffer flushes.
    pub fn push_close(&self) {
        {
            let mut buffer = self.buffer.lock().unwrap();
            buffer.push_back(Outbound::Close);
        }
        self.closing.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    fn push(&self, item: Outbound) {
        if self.closing.load(Ordering::SeqCst) {
            return;
        }
        {
            let mut buffer = self.buffer.lock().unwrap();
            if buffer.len() >= self.capacity {
                match self.overflow_policy {
                    OverflowPolicy::DropOldest => {
                        buffer.pop_front();
                        // One backpressure notice per burst, cleared when
                        // the writer catches up.
                        if !self.backpressure_flagged.swap(true, Ordering::SeqCst) {
                            warn!(subscriber = %self.id, "outbound buffer full, dropping oldest frames");
                            if let Ok(json) = serde_json::to_string(&ServerMessage::Error(
                                ErrorData::new(
                                    ErrorCode::InternalQueueBackpressure,
                                    "subscriber buffer overflowed; oldest frames dropped",
                                ),
                            )) {
                                buffer.push_back(Outbound::Frame(json));
                            }
                        }
                        buffer.push_back(item);
                    }
                    OverflowPolicy::Close => {
                        warn!(subscriber = %self.id, "outbound buffer full, closing connection");
                        if let Ok(json) = serde_json::to_string(&ServerMessage::Error(
                            ErrorData::new(
                                ErrorCode::InternalQueueBackpressure,
                                "subscriber buffer overflowed; closing connection",
                            ),
                        )) {
                            buffer.push_back(Outbound::Frame(json));
                        }
                        buffer.push_back(Outbound::Close);
                        self.closing.store(true, Ordering::SeqCst);
                    }
                }
            } else {
                buffer.push_back(item);
            }
        }
        self.notify.notify_one();
    }

    /// Await the next outbound item. Used only by the writer task.
    pub async fn next_outbound(&self) -> Outbound {
        loop {
            let notified = self.notify.notified();
            {
                let mut buffer = self.buffer.lock().unwrap();
                if let Some(item) = buffer.pop_front() {
                    if buffer.is_empty() {
                        self.backpressure_flagged.store(false, Ordering::SeqCst);
                    }
                    return item;
                }
            }
            notified.await;
        }
    }

    /// Account one quote against the connection limit.
    pub fn take_quota(&self) -> QuotaOutcome {
        let limit = self.limit.load(Ordering::Relaxed);
        if limit == 0 {
            return QuotaOutcome::Deliver;
        }
        let sent = self.quotes_sent.fetch_add(1, Ordering::Relaxed) + 1;
        match sent.cmp(&limit) {
            std::cmp::Ordering::Less => QuotaOutcome::Deliver,
            std::cmp::Ordering::Equal => QuotaOutcome::LastDeliver,
            std::cmp::Ordering::Greater => QuotaOutcome::Exhausted,
        }
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    pub fn buffered(&self) -> usize {
        self.buffer.lock().unwrap().len()
    }

    pub fn keys(&self) -> Vec<SubscriptionKey> {
        self.keys.iter().map(|k| k.clone()).collect()
    }

    pub fn holds(&self, key: &SubscriptionKey) -> bool {
        self.keys.contains(key)
    }
}

/// Registry of connected subscribers plus the key reverse index.
#[derive(Default)]
pub struct SubscriberRegistry {
    clients: DashMap<SubscriberId, Arc<SubscriberState>>,
    index: DashMap<SubscriptionKey, DashSet<SubscriberId>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, client: Arc<SubscriberState>) -> SubscriberId {
        let id = client.id;
        self.clients.insert(id, client);
        gauge!("active_subscribers").set(self.clients.len() as f64);
        info!(subscriber = %id, "subscriber registered");
        id
    }

    /// Remove a subscriber; returns the keys that now have no
    /// subscribers at all, so upstream symbols can be released.
    pub fn unregister(&self, id: &SubscriberId) -> Vec<SubscriptionKey> {
        let mut orphaned = Vec::new();
        if let Some((_, client)) = self.clients.remove(id) {
            for key in client.keys.iter() {
                let mut empty = false;
                if let Some(set) = self.index.get(&key) {
                    set.remove(id);
                    empty = set.is_empty();
                }
                if empty {
                    self.index.remove(&key);
                    orphaned.push(key.clone());
                }
            }
            info!(subscriber = %id, "subscriber unregistered");
        }
        gauge!("active_subscribers").set(self.clients.len() as f64);
        orphaned
    }

    /// Record that a subscriber holds `keys`. Idempotent per key.
    pub fn subscribe(&self, client: &Arc<SubscriberState>, keys: &[SubscriptionKey]) {
        for key in keys {
            client.keys.insert(key.clone());
            self.index.entry(key.clone()).or_default().insert(client.id);
        }
        debug!(subscriber = %client.id, count = keys.len(), "subscription keys recorded");
    }

    pub fn subscribers_for(&self, key: &SubscriptionKey) -> Vec<Arc<SubscriberState>> {
        match self.index.get(key) {
            Some(ids) => ids
                .iter()
                .filter_map(|id| self.clients.get(&*id).map(|c| c.clone()))
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn all_subscribers(&self) -> Vec<Arc<SubscriberState>> {
        self.clients.iter().map(|c| c.clone()).collect()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.index.len()
    }
}
