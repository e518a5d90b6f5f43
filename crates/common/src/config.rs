//! Environment-driven configuration.
//!
//! All knobs are read from `CONNECTOR_*` variables with documented
//! defaults; a malformed value is a fatal configuration error.

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Raised when an environment variable cannot be parsed.
#[derive(Debug, thiserror::Error)]
#[error("environment variable {name} must be a valid {expected}: {value:?}")]
pub struct ConfigError {
    pub name: String,
    pub expected: &'static str,
    pub value: String,
}

fn get_raw(name: &str) -> Option<String> {
    env::var(name).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn get_parsed<T: FromStr>(name: &str, default: T, expected: &'static str) -> Result<T, ConfigError> {
    match get_raw(name) {
        None => Ok(default),
        Some(raw) => raw.parse::<T>().map_err(|_| ConfigError {
            name: name.to_string(),
            expected,
            value: raw,
        }),
    }
}

fn get_duration(name: &str, default_secs: f64) -> Result<Duration, ConfigError> {
    let secs = get_parsed::<f64>(name, default_secs, "float")?;
    if !secs.is_finite() || secs < 0.0 {
        return Err(ConfigError {
            name: name.to_string(),
            expected: "non-negative float",
            value: secs.to_string(),
        });
    }
    Ok(Duration::from_secs_f64(secs))
}

fn get_usize(name: &str, default: usize) -> Result<usize, ConfigError> {
    get_parsed(name, default, "integer")
}

fn get_u16(name: &str, default: u16) -> Result<u16, ConfigError> {
    get_parsed(name, default, "port number")
}

fn get_u32(name: &str, default: u32) -> Result<u32, ConfigError> {
    get_parsed(name, default, "integer")
}

fn get_bool(name: &str, default: bool) -> Result<bool, ConfigError> {
    match get_raw(name) {
        None => Ok(default),
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(ConfigError {
                name: name.to_string(),
                expected: "boolean",
                value: raw,
            }),
        },
    }
}

fn get_string(name: &str, default: &str) -> String {
    get_raw(name).unwrap_or_else(|| default.to_string())
}

/// What to do when a subscriber's outbound buffer fills up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Evict the oldest buffered frame and keep streaming.
    DropOldest,
    /// Close the subscriber connection.
    Close,
}

impl FromStr for OverflowPolicy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "drop_oldest" => Ok(OverflowPolicy::DropOldest),
            "close" => Ok(OverflowPolicy::Close),
            _ => Err(()),
        }
    }
}

/// Upstream connector settings.
#[derive(Debug, Clone)]
pub struct ConnectorSettings {
    pub inactivity_timeout: Duration,
    pub reconnect_delay: Duration,
    pub rest_timeout: Duration,
    pub ws_ping_interval: Duration,
    pub ws_ping_timeout: Duration,
    pub max_symbol_per_ws: usize,
    pub max_conn_per_exchange: usize,
    pub breaker_failure_threshold: u32,
    pub breaker_recovery_timeout: Duration,
    pub breaker_half_open_calls: u32,
    pub closed_queue_maxsize: usize,
    /// 0 disables the cap: the open stack grows and never drops.
    pub open_queue_maxsize: usize,
    pub dedup_window: Duration,
    pub dedup_max_entries: usize,
    pub rest_pool_connections: usize,
    pub rest_pool_maxsize: usize,
}

/// Downstream server settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub health_check_port: u16,
    pub health_check_enabled: bool,
    pub subscribe_timeout: Duration,
    pub subscriber_buffer_max: usize,
    pub overflow_policy: OverflowPolicy,
    pub drain_timeout: Duration,
    pub log_level: String,
}

/// Full gateway configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    pub connector: ConnectorSettings,
    pub server: ServerSettings,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let connector = ConnectorSettings {
            inactivity_timeout: get_duration("CONNECTOR_INACTIVITY_TIMEOUT", 3.0)?,
            reconnect_delay: get_duration("CONNECTOR_RECONNECT_DELAY", 1.0)?,
            rest_timeout: get_duration("CONNECTOR_REST_TIMEOUT", 5.0)?,
            ws_ping_interval: get_duration("CONNECTOR_WS_PING_INTERVAL", 20.0)?,
            ws_ping_timeout: get_duration("CONNECTOR_WS_PING_TIMEOUT", 20.0)?,
            max_symbol_per_ws: get_usize("CONNECTOR_MAX_SYMBOL_PER_WS", 50)?,
            max_conn_per_exchange: get_usize("CONNECTOR_MAX_CONN_PER_EXCHANGE", 5)?,
            breaker_failure_threshold: get_u32("CONNECTOR_CIRCUIT_BREAKER_FAILURE_THRESHOLD", 5)?,
            breaker_recovery_timeout: get_duration("CONNECTOR_CIRCUIT_BREAKER_RECOVERY_TIMEOUT", 30.0)?,
            breaker_half_open_calls: get_u32("CONNECTOR_CIRCUIT_BREAKER_HALF_OPEN_CALLS", 1)?,
            closed_queue_maxsize: get_usize("CONNECTOR_CLOSED_QUEUE_MAXSIZE", 1000)?,
            open_queue_maxsize: get_usize("CONNECTOR_OPEN_QUEUE_MAXSIZE", 0)?,
            dedup_window: get_duration("CONNECTOR_DEDUPLICATION_WINDOW_SECONDS", 120.0)?,
            dedup_max_entries: get_usize("CONNECTOR_DEDUPLICATION_MAX_ENTRIES", 10_000)?,
            rest_pool_connections: get_usize("CONNECTOR_REST_POOL_CONNECTIONS", 10)?,
            rest_pool_maxsize: get_usize("CONNECTOR_REST_POOL_MAXSIZE", 20)?,
        };

        let overflow_raw = get_string("CONNECTOR_SUBSCRIBER_OVERFLOW_POLICY", "drop_oldest");
        let overflow_policy = overflow_raw.parse::<OverflowPolicy>().map_err(|_| ConfigError {
            name: "CONNECTOR_SUBSCRIBER_OVERFLOW_POLICY".to_string(),
            expected: "one of drop_oldest, close",
            value: overflow_raw,
        })?;

        let server = ServerSettings {
            host: get_string("CONNECTOR_WS_HOST", "0.0.0.0"),
            port: get_u16("CONNECTOR_WS_PORT", 8765)?,
            health_check_port: get_u16("CONNECTOR_WSS_HEALTH_CHECK_PORT", 8766)?,
            health_check_enabled: get_bool("CONNECTOR_WSS_HEALTH_CHECK_ENABLED", true)?,
            subscribe_timeout: get_duration("CONNECTOR_WSS_SUBSCRIBE_TIMEOUT", 10.0)?,
            subscriber_buffer_max: get_usize("CONNECTOR_SUBSCRIBER_BUFFER_MAX", 1000)?,
            overflow_policy,
            drain_timeout: get_duration("CONNECTOR_DRAIN_TIMEOUT", 10.0)?,
            log_level: get_string("CONNECTOR_LOG_LEVEL", "INFO"),
        };

        Ok(Settings { connector, server })
    }
}

impl Default for Settings {
    /// Defaults as if no environment variables were set. Used by tests.
    fn default() -> Self {
        Settings {
            connector: ConnectorSettings {
                inactivity_timeout: Duration::from_secs(3),
                reconnect_delay: Duration::from_secs(1),
                rest_timeout: Duration::from_secs(5),
                ws_ping_interval: Duration::from_secs(20),
                ws_ping_timeout: Duration::from_secs(20),
                max_symbol_per_ws: 50,
                max_conn_per_exchange: 5,
                breaker_failure_threshold: 5,
                breaker_recovery_timeout: Duration::from_secs(30),
                breaker_half_open_calls: 1,
                closed_queue_maxsize: 1000,
                open_queue_maxsize: 0,
                dedup_window: Duration::from_secs(120),
                dedup_max_entries: 10_000,
                rest_pool_connections: 10,
                rest_pool_maxsize: 20,
            },
            server: ServerSettings {
                host: "0.0.0.0".to_string(),
                port: 8765,
                health_check_port: 8766,
                health_check_enabled: true,
                subscribe_timeout: Duration::from_secs(10),
                subscriber_buffer_max: 1000,
                overflow_policy: OverflowPolicy::DropOldest,
                drain_timeout: Duration::from_secs(10),
                log_level: "INFO".to_string(),
            },
        }
    }
}
