//! Downstream gateway: WebSocket subscriber multiplexer, session
//! manager, and the HTTP health/metrics surface.
//!
//! ```text
//! upstream sessions ──► Forwarder ──► SubscriberRegistry ──► WebSocket clients
//!        ▲                                   ▲
//!        └── SessionManager (placement) ─────┘
//! ```
//!
//! Subscribers connect on the WS port, send one subscribe frame, and
//! receive `subscribed` / `quote` / `error` frames until they
//! disconnect or their quote limit is reached.

pub mod client;
pub mod error;
pub mod health;
pub mod manager;
pub mod protocol;
pub mod ws_server;

pub use client::{SubscriberRegistry, SubscriberState};
pub use error::{GatewayError, Result};
pub use manager::{Forwarder, SessionManager};
pub use protocol::{ErrorData, QuoteData, ServerMessage, SubscribeRequest};
pub use ws_server::{create_router, AppState};
