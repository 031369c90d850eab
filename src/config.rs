use log::{debug, warn};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Default TCP port for file transfers
pub const DEFAULT_TRANSFER_PORT: u16 = 52120;
/// Default UDP port for discovery queries and replies
pub const DEFAULT_DISCOVERY_PORT: u16 = 52121;
/// Plaintext chunk size used for filename buffers and content streaming
pub const DEFAULT_BUFFER_SIZE: usize = 1024;
/// Marker that identifies a discovery query datagram
pub const DISCOVERY_MARKER: &str = "DISCOVER_FILE_TRANSFER";
/// Number of leading bytes compared when matching the marker
pub const MARKER_MATCH_LEN: usize = 23;
/// Interface used for info and neighbor discovery when none is given
pub const DEFAULT_INTERFACE: &str = "wlan0";

const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);
const DEFAULT_SPINNER_INTERVAL: Duration = Duration::from_millis(100);

/// Runtime configuration shared by every transfer and discovery component
#[derive(Debug, Clone)]
pub struct Config {
    /// TCP port the transfer server listens on and the client connects to
    pub transfer_port: u16,
    /// UDP port the discovery responder binds and the requester targets
    pub discovery_port: u16,
    /// Plaintext chunk size; ciphertext frames may be one block larger
    pub buffer_size: usize,
    /// Discovery query marker
    pub discovery_marker: String,
    /// Idle period after which the requester stops collecting replies
    pub discovery_timeout: Duration,
    /// How often the responder re-checks its cancellation flag
    pub poll_interval: Duration,
    /// Redraw interval of the progress spinner
    pub spinner_interval: Duration,
    /// Network interface used when the caller does not name one
    pub default_interface: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            transfer_port: DEFAULT_TRANSFER_PORT,
            discovery_port: DEFAULT_DISCOVERY_PORT,
            buffer_size: DEFAULT_BUFFER_SIZE,
            discovery_marker: DISCOVERY_MARKER.to_string(),
            discovery_timeout: DEFAULT_DISCOVERY_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            spinner_interval: DEFAULT_SPINNER_INTERVAL,
            default_interface: DEFAULT_INTERFACE.to_string(),
        }
    }
}

impl Config {
    /// Build a configuration from `BYTEVALVE_*` environment variables,
    /// falling back to the defaults for anything unset or unparsable
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let config = Self {
            transfer_port: env_or("BYTEVALVE_TRANSFER_PORT", defaults.transfer_port),
            discovery_port: env_or("BYTEVALVE_DISCOVERY_PORT", defaults.discovery_port),
            buffer_size: env_or("BYTEVALVE_BUFFER_SIZE", defaults.buffer_size).max(1),
            discovery_marker: defaults.discovery_marker,
            discovery_timeout: env::var("BYTEVALVE_DISCOVERY_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.discovery_timeout),
            poll_interval: defaults.poll_interval,
            spinner_interval: defaults.spinner_interval,
            default_interface: env::var("BYTEVALVE_INTERFACE")
                .ok()
                .filter(|name| !name.is_empty())
                .unwrap_or(defaults.default_interface),
        };

        debug!("Loaded configuration: {:?}", config);
        config
    }
}

fn env_or<T: FromStr + Copy>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(value) => match value.parse() {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!("Ignoring invalid value for {}: {}", key, value);
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ports_are_distinct() {
        let config = Config::default();
        assert_eq!(config.transfer_port, 52120);
        assert_eq!(config.discovery_port, 52121);
        assert_ne!(config.transfer_port, config.discovery_port);
    }

    #[test]
    fn test_env_or_falls_back_on_garbage() {
        env::set_var("BYTEVALVE_TEST_GARBAGE_PORT", "not-a-port");
        assert_eq!(env_or("BYTEVALVE_TEST_GARBAGE_PORT", 7u16), 7);

        env::set_var("BYTEVALVE_TEST_GOOD_PORT", "9000");
        assert_eq!(env_or("BYTEVALVE_TEST_GOOD_PORT", 7u16), 9000);

        assert_eq!(env_or("BYTEVALVE_TEST_UNSET_PORT", 11u16), 11);
    }
}
