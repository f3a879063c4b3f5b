//! Bridge configuration.

use std::time::Duration;

use tracing::Level;

/// Default client name announced through `nvim_set_client_info`.
pub const DEFAULT_CLIENT_NAME: &str = env!("CARGO_PKG_NAME");

/// Default minimum level mirrored into the host's message area.
pub const DEFAULT_BRIDGE_LEVEL: Level = Level::WARN;

/// Default upper bound for `wait` before it gives up with exit code 1.
///
/// Roughly a hundred years, i.e. forever for a plugin host.
pub const DEFAULT_WAIT_LIMIT: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Default name of the host execution thread.
pub const DEFAULT_HOST_THREAD_NAME: &str = "nvimwire-host";

/// Default name of the listener thread.
pub const DEFAULT_LISTENER_THREAD_NAME: &str = "nvimwire-listener";

/// Configuration shared by the host connection and the run loop.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Name announced to the host.
    pub client_name: String,
    /// `(major, minor, patch)` announced to the host.
    pub version: (u64, u64, u64),
    /// Minimum level forwarded to the host by the log bridge.
    pub bridge_level: Level,
    /// How long `wait` sleeps before resolving on its own.
    pub wait_limit: Duration,
    /// Name of the host execution thread.
    pub host_thread_name: String,
    /// Name of the listener thread.
    pub listener_thread_name: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            client_name: DEFAULT_CLIENT_NAME.to_string(),
            version: crate_version(),
            bridge_level: DEFAULT_BRIDGE_LEVEL,
            wait_limit: DEFAULT_WAIT_LIMIT,
            host_thread_name: DEFAULT_HOST_THREAD_NAME.to_string(),
            listener_thread_name: DEFAULT_LISTENER_THREAD_NAME.to_string(),
        }
    }
}

fn crate_version() -> (u64, u64, u64) {
    let part = |s: &str| s.parse().unwrap_or(0);
    (
        part(env!("CARGO_PKG_VERSION_MAJOR")),
        part(env!("CARGO_PKG_VERSION_MINOR")),
        part(env!("CARGO_PKG_VERSION_PATCH")),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = BridgeConfig::default();
        assert_eq!(config.client_name, "nvimwire");
        assert_eq!(config.bridge_level, Level::WARN);
        assert_eq!(config.wait_limit, DEFAULT_WAIT_LIMIT);
        assert_eq!(config.host_thread_name, DEFAULT_HOST_THREAD_NAME);
        assert_eq!(config.version, (0, 1, 0));
    }
}
