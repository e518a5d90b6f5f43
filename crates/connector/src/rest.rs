//! Pooled REST clients for backfill calls.
//!
//! One keep-alive `reqwest` client per exchange, owned by the session
//! manager and injected into sessions. HTTP/2 is negotiated via ALPN.

use crate::error::Result;
use common::config::ConnectorSettings;
use common::Exchange;
use std::collections::HashMap;
use std::time::Duration;

/// Process-wide REST client pool, one client per exchange.
pub struct RestPool {
    clients: HashMap<Exchange, reqwest::Client>,
    max_concurrency: usize,
}

impl RestPool {
    pub fn new(settings: &ConnectorSettings) -> Result<Self> {
        let mut clients = HashMap::new();
        for exchange in Exchange::ALL {
            clients.insert(
                exchange,
                build_client(
                    settings.rest_timeout,
                    settings.rest_pool_connections,
                )?,
            );
        }
        Ok(Self {
            clients,
            max_concurrency: settings.rest_pool_maxsize.max(1),
        })
    }

    pub fn client(&self, exchange: Exchange) -> &reqwest::Client {
        // Every variant is populated in `new`.
        &self.clients[&exchange]
    }

    /// Upper bound on concurrent backfill requests per session.
    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }
}

fn build_client(timeout: Duration, keepalive_connections: usize) -> Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .timeout(timeout)
        .pool_max_idle_per_host(keepalive_connections)
        .pool_idle_timeout(Duration::from_secs(90))
        .build()?;
    Ok(client)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::Settings;

    #[test]
    fn pool_covers_every_exchange() {
        let pool = RestPool::new(&Settings::default().connector).unwrap();
        for exchange in Exchange::ALL {
            let _ = pool.client(exchange);
        }
        assert_eq!(pool.max_concurrency(), 20);
    }
}
