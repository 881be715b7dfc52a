//! Runtime configuration and environment overrides.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

/// Resolved gateway configuration after CLI parsing and environment
/// overrides.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Local APRS identity; also the addressee we accept messages for.
    pub callsign: String,
    /// APRS-IS server-side filter expression.
    pub filter: String,
    pub server: String,
    pub port: u16,
    /// Number of parallel APRS-IS sessions.
    pub channels: usize,
    /// Whether to transmit reply messages.
    pub respond: bool,
    /// Credentials file for the document store.
    pub credentials: PathBuf,
    pub debug: bool,
    /// Prometheus scrape port, when metrics export is enabled.
    pub metrics_port: Option<u16>,
}

/// Environment override for a string option.
pub fn env_or(var: &str, default: String) -> String {
    env::var(var).unwrap_or(default)
}

/// Environment override for an integer option. The parsed value is used
/// when the variable is set and valid; the default covers both an unset
/// variable and one that fails to parse.
pub fn env_int<T: FromStr>(var: &str, default: T) -> T {
    match env::var(var) {
        Ok(value) => value.parse().unwrap_or(default),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_int_unset_uses_default() {
        env::remove_var("APRS_GATEWAY_TEST_UNSET");
        assert_eq!(env_int("APRS_GATEWAY_TEST_UNSET", 3usize), 3);
    }

    #[test]
    fn env_int_valid_value_parses() {
        env::set_var("APRS_GATEWAY_TEST_VALID", "7");
        assert_eq!(env_int("APRS_GATEWAY_TEST_VALID", 3usize), 7);
    }

    #[test]
    fn env_int_garbage_falls_back_to_default() {
        env::set_var("APRS_GATEWAY_TEST_GARBAGE", "not-a-number");
        assert_eq!(env_int("APRS_GATEWAY_TEST_GARBAGE", 3usize), 3);
    }

    #[test]
    fn env_or_prefers_environment() {
        env::set_var("APRS_GATEWAY_TEST_ADDR", "other.aprs2.net");
        assert_eq!(
            env_or("APRS_GATEWAY_TEST_ADDR", "noam.aprs2.net".to_owned()),
            "other.aprs2.net"
        );
        env::remove_var("APRS_GATEWAY_TEST_ADDR");
        assert_eq!(
            env_or("APRS_GATEWAY_TEST_ADDR", "noam.aprs2.net".to_owned()),
            "noam.aprs2.net"
        );
    }
}
