use std::env;
use std::time::Duration;

use url::Url;

/// ICE server used when a caller does not supply one.
pub const DEFAULT_ICE_SERVER: &str = "stun:stun.skapi.com:3468";

const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;
const DEFAULT_RECONNECT_BASE_MS: u64 = 1_000;
const DEFAULT_RECONNECT_CAP_MS: u64 = 30_000;

/// Client configuration.
///
/// `reconnect_base_ms`/`reconnect_cap_ms` parameterize the reconnect delay
/// `min(base * 2^attempt, cap)`; the defaults give the production schedule.
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// WebSocket endpoint of the signaling relay (`ws://` or `wss://`).
    pub relay_url: String,
    /// Single ICE server URL handed to new peer connections.
    pub ice_server_url: String,
    pub max_reconnect_attempts: u32,
    pub reconnect_base_ms: u64,
    pub reconnect_cap_ms: u64,
    /// Substitute a silent placeholder video track when a call requests no
    /// media, keeping SDP negotiation symmetric between the two sides.
    pub use_dummy_track_if_no_media: bool,
    /// Interval between WebSocket-level keepalive pings.
    pub heartbeat_interval: Duration,
}

impl RealtimeConfig {
    pub fn new(relay_url: impl Into<String>) -> Self {
        Self {
            relay_url: relay_url.into(),
            ice_server_url: DEFAULT_ICE_SERVER.to_string(),
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            reconnect_base_ms: DEFAULT_RECONNECT_BASE_MS,
            reconnect_cap_ms: DEFAULT_RECONNECT_CAP_MS,
            use_dummy_track_if_no_media: true,
            heartbeat_interval: Duration::from_secs(30),
        }
    }

    /// Load configuration from `LAGOON_RELAY_URL`, falling back to a local
    /// relay endpoint.
    pub fn from_env() -> Self {
        let relay = env::var("LAGOON_RELAY_URL")
            .unwrap_or_else(|_| "ws://127.0.0.1:8080/realtime".to_string());
        Self::new(relay)
    }

    pub fn with_ice_server(mut self, url: impl Into<String>) -> Self {
        self.ice_server_url = url.into();
        self
    }

    pub fn with_reconnect(mut self, max_attempts: u32, base_ms: u64, cap_ms: u64) -> Self {
        self.max_reconnect_attempts = max_attempts;
        self.reconnect_base_ms = base_ms;
        self.reconnect_cap_ms = cap_ms;
        self
    }

    pub fn with_dummy_track(mut self, enabled: bool) -> Self {
        self.use_dummy_track_if_no_media = enabled;
        self
    }

    /// Whether media attachment is permitted: the relay connection must be
    /// TLS-protected or terminate on a loopback host.
    pub fn is_secure_context(&self) -> bool {
        let Ok(url) = Url::parse(&self.relay_url) else {
            return false;
        };
        if url.scheme() == "wss" {
            return true;
        }
        matches!(
            url.host_str(),
            Some("localhost") | Some("127.0.0.1") | Some("[::1]") | Some("::1")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_production_schedule() {
        let config = RealtimeConfig::new("wss://relay.example.com/realtime");
        assert_eq!(config.max_reconnect_attempts, 10);
        assert_eq!(config.reconnect_base_ms, 1_000);
        assert_eq!(config.reconnect_cap_ms, 30_000);
        assert_eq!(config.ice_server_url, DEFAULT_ICE_SERVER);
        assert!(config.use_dummy_track_if_no_media);
    }

    #[test]
    fn secure_context_requires_tls_or_loopback() {
        assert!(RealtimeConfig::new("wss://relay.example.com/rt").is_secure_context());
        assert!(RealtimeConfig::new("ws://127.0.0.1:9000/rt").is_secure_context());
        assert!(RealtimeConfig::new("ws://localhost:9000/rt").is_secure_context());
        assert!(!RealtimeConfig::new("ws://relay.example.com/rt").is_secure_context());
        assert!(!RealtimeConfig::new("not a url").is_secure_context());
    }
}
