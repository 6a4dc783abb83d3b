use crate::channel::ReconnectPolicy;
use log::warn;
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub api_url: String,
    pub ws_url: String,
    pub http_timeout: Duration,
    pub connect_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    pub heartbeat_period: Duration,
    pub fast_poll: Duration,
    pub slow_poll: Duration,
    pub ended_poll: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8000".to_string(),
            ws_url: "ws://localhost:8000/ws/poll".to_string(),
            http_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            reconnect: ReconnectPolicy::default(),
            heartbeat_period: Duration::from_secs(30),
            fast_poll: Duration::from_secs(5),
            slow_poll: Duration::from_secs(300),
            ended_poll: Duration::from_secs(30),
        }
    }
}

impl SyncConfig {
    // Reads the environment (after dotenvy has loaded any .env file), falling back to defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let reconnect = ReconnectPolicy::new(
            Duration::from_millis(read_number("RECONNECT_BASE_MS", 1000)),
            Duration::from_millis(read_number("RECONNECT_MAX_MS", 30_000)),
            read_number("RECONNECT_MAX_ATTEMPTS", 5),
        );

        Self {
            api_url: env::var("POLL_API_URL").unwrap_or(defaults.api_url),
            ws_url: env::var("POLL_WS_URL").unwrap_or(defaults.ws_url),
            http_timeout: Duration::from_secs(read_number("HTTP_TIMEOUT_SECS", 10)),
            connect_timeout: Duration::from_secs(read_number("WS_CONNECT_TIMEOUT_SECS", 10)),
            reconnect,
            heartbeat_period: Duration::from_secs(read_number("HEARTBEAT_SECS", 30)),
            fast_poll: Duration::from_secs(read_number("FAST_POLL_SECS", 5)),
            slow_poll: Duration::from_secs(read_number("SLOW_POLL_SECS", 300)),
            ended_poll: Duration::from_secs(read_number("ENDED_POLL_SECS", 30)),
        }
    }
}

fn read_number<T>(name: &str, default: T) -> T
where
    T: FromStr + Copy + PartialOrd + Default + std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => parse_number(name, &raw, default),
        Err(_) => default,
    }
}

// Zero would make interval timers panic, so it is rejected like any other bad value
fn parse_number<T>(name: &str, raw: &str, default: T) -> T
where
    T: FromStr + Copy + PartialOrd + Default + std::fmt::Display,
{
    match raw.trim().parse::<T>() {
        Ok(value) if value > T::default() => value,
        _ => {
            warn!("Ignoring invalid {}={:?}, using {}", name, raw, default);
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_numbers() {
        assert_eq!(parse_number("X", " 42 ", 7u64), 42);
        assert_eq!(parse_number("X", "3", 5u32), 3);
    }

    #[test]
    fn falls_back_on_garbage_or_zero() {
        assert_eq!(parse_number("X", "soon", 7u64), 7);
        assert_eq!(parse_number("X", "0", 7u64), 7);
        assert_eq!(parse_number("X", "-1", 7u64), 7);
    }

    #[test]
    fn defaults_match_documented_cadence() {
        let config = SyncConfig::default();
        assert_eq!(config.fast_poll, Duration::from_secs(5));
        assert_eq!(config.slow_poll, Duration::from_secs(300));
        assert_eq!(config.ended_poll, Duration::from_secs(30));
        assert_eq!(config.heartbeat_period, Duration::from_secs(30));
        assert_eq!(config.reconnect.max_attempts(), 5);
    }
}
