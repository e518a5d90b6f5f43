//! Per-exchange streaming engine for the candle gateway.
//!
//! One [`session::UpstreamSession`] owns a single WebSocket to one
//! exchange, a circuit breaker, a deduplicator, and a dual-pipeline
//! queue. Raw frames are normalised by the venue adapter, filtered, and
//! offered to the queue; a consumer task drains the queue into the
//! downstream fan-out.
//!
//! ```text
//! exchange WS ──► session ──► adapter.parse ──► dedup ──► queue ──► forward
//!        │            │
//!        │            └─ inactivity ──► adapter.backfill (REST pool)
//!        └─ failures ──► circuit breaker ──► backoff
//! ```

pub mod adapter;
pub mod breaker;
pub mod dedup;
pub mod error;
pub mod exchanges;
pub mod health;
pub mod queue;
pub mod rest;
pub mod session;

pub use adapter::{build_adapter, ExchangeAdapter, FrameEvent};
pub use breaker::{BreakerSnapshot, BreakerState, CircuitBreaker};
pub use dedup::{DedupVerdict, Deduplicator};
pub use error::{ConnectorError, ParseError};
pub use health::{HealthRegistry, SessionHealth};
pub use queue::CandleQueue;
pub use rest::RestPool;
pub use session::{SessionCommand, SessionSink, UpstreamSession};
