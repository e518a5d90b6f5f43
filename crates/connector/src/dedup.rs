//! Sliding-window deduplication of closed candles.
//!
//! Reconnects and REST backfill frequently replay the last few bars;
//! filtering on (symbol, open-time) at the normalised layer guarantees
//! at-most-once delivery per bar downstream. Open candles are live
//! ticks and legitimately repeat, so they are never checked here.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

type Key = (String, i64);

/// Outcome of a dedup check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupVerdict {
    Fresh,
    Duplicate,
}

struct Inner {
    seen: HashMap<Key, Instant>,
    /// Insertion order, oldest first. Drives window cleanup and
    /// overflow eviction.
    order: VecDeque<Key>,
}

/// Deduplicator over a sliding time window with a hard entry cap.
pub struct Deduplicator {
    window: Duration,
    max_entries: usize,
    inner: Mutex<Inner>,
    exchange: String,
    contract_type: String,
}

impl Deduplicator {
    pub fn new(
        window: Duration,
        max_entries: usize,
        exchange: impl Into<String>,
        contract_type: impl Into<String>,
    ) -> Self {
        Self {
            window,
            max_entries,
            inner: Mutex::new(Inner {
                seen: HashMap::new(),
                order: VecDeque::new(),
            }),
            exchange: exchange.into(),
            contract_type: contract_type.into(),
        }
    }

    /// Atomically check a (symbol, open-time-ms) key and record it.
    ///
    /// Duplicate iff the key was inserted within the window; an entry
    /// older than the window is readmitted as fresh.
    pub fn check_and_insert(&self, symbol: &str, open_time_ms: i64) -> DedupVerdict {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();

        let key: Key = (symbol.to_string(), open_time_ms);
        if let Some(inserted_at) = inner.seen.get(&key) {
            if now.duration_since(*inserted_at) <= self.window {
                debug!(
                    exchange = %self.exchange,
                    contract_type = %self.contract_type,
                    symbol,
                    open_time_ms,
                    "duplicate candle filtered"
                );
                return DedupVerdict::Duplicate;
            }
        }

        inner.seen.insert(key.clone(), now);
        inner.order.push_back(key);

        self.evict_expired(&mut inner, now);
        self.enforce_cap(&mut inner);

        DedupVerdict::Fresh
    }

    /// Drop entries older than the window from the front of the
    /// insertion order. Amortised: runs on every insert but stops at
    /// the first recent entry.
    fn evict_expired(&self, inner: &mut Inner, now: Instant) {
        while let Some(front) = inner.order.front() {
            match inner.seen.get(front) {
                Some(inserted_at) if now.duration_since(*inserted_at) > self.window => {
                    let key = inner.order.pop_front().unwrap();
                    inner.seen.remove(&key);
                }
                // Key was readmitted later; its stale order slot is dead.
                None => {
                    inner.order.pop_front();
                }
                _ => break,
            }
        }
    }

    fn enforce_cap(&self, inner: &mut Inner) {
        if inner.seen.len() <= self.max_entries {
            return;
        }
        let mut removed = 0usize;
        while inner.seen.len() > self.max_entries {
            match inner.order.pop_front() {
                Some(key) => {
                    if inner.seen.remove(&key).is_some() {
                        removed += 1;
                    }
                }
                None => break,
            }
        }
        if removed > 0 {
            warn!(
                exchange = %self.exchange,
                contract_type = %self.contract_type,
                removed,
                max_entries = self.max_entries,
                "dedup entry cap reached, evicted oldest entries"
            );
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn repeat_within_window_is_duplicate() {
        let dedup = Deduplicator::new(Duration::from_secs(120), 100, "binance", "spot");
        assert_eq!(dedup.check_and_insert("BTCUSDT", 1_700_000_000_000), DedupVerdict::Fresh);
        assert_eq!(
            dedup.check_and_insert("BTCUSDT", 1_700_000_000_000),
            DedupVerdict::Duplicate
        );
        // Different bar or different symbol is fresh.
        assert_eq!(dedup.check_and_insert("BTCUSDT", 1_700_000_060_000), DedupVerdict::Fresh);
        assert_eq!(dedup.check_and_insert("ETHUSDT", 1_700_000_000_000), DedupVerdict::Fresh);
    }

    #[test]
    fn expired_entry_is_readmitted() {
        let dedup = Deduplicator::new(Duration::from_millis(20), 100, "binance", "spot");
        assert_eq!(dedup.check_and_insert("BTCUSDT", 1), DedupVerdict::Fresh);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(dedup.check_and_insert("BTCUSDT", 1), DedupVerdict::Fresh);
    }

    #[test]
    fn cap_evicts_oldest_first() {
        let dedup = Deduplicator::new(Duration::from_secs(120), 3, "binance", "spot");
        for ms in 0..4 {
            assert_eq!(dedup.check_and_insert("BTCUSDT", ms), DedupVerdict::Fresh);
        }
        assert_eq!(dedup.len(), 3);
        // Key 0 was evicted, so it reads as fresh again; key 3 is still held.
        assert_eq!(dedup.check_and_insert("BTCUSDT", 0), DedupVerdict::Fresh);
        assert_eq!(dedup.check_and_insert("BTCUSDT", 3), DedupVerdict::Duplicate);
    }

    #[test]
    fn concurrent_inserts_yield_exactly_one_fresh() {
        let dedup = Arc::new(Deduplicator::new(Duration::from_secs(120), 100, "okx", "swap"));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let dedup = dedup.clone();
                std::thread::spawn(move || dedup.check_and_insert("BTC-USDT", 42))
            })
            .collect();
        let fresh = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|v| *v == DedupVerdict::Fresh)
            .count();
        assert_eq!(fresh, 1);
    }
}
