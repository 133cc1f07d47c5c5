//! Relay control channel.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::protocol::RtcContent;

pub mod signaling;

pub use signaling::SignalingTransport;

/// Lifecycle of the control channel. One per client instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Connecting,
    Open,
    Reconnecting,
    Closed,
}

/// Delay before reconnect attempt `attempt` (1-based): `base * 2^attempt`,
/// capped.
pub fn backoff_delay(attempt: u32, base_ms: u64, cap_ms: u64) -> Duration {
    let exponential = base_ms.saturating_mul(2u64.saturating_pow(attempt));
    Duration::from_millis(exponential.min(cap_ms))
}

/// Outbound seam peer sessions use to reach the relay, kept narrow so the
/// session layer can be exercised without a live socket.
#[async_trait]
pub trait SignalSender: Send + Sync {
    async fn send_rtc(&self, uid: &str, content: RtcContent) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_the_cap() {
        assert_eq!(backoff_delay(1, 1_000, 30_000), Duration::from_millis(2_000));
        assert_eq!(backoff_delay(2, 1_000, 30_000), Duration::from_millis(4_000));
        assert_eq!(backoff_delay(3, 1_000, 30_000), Duration::from_millis(8_000));
        assert_eq!(
            backoff_delay(4, 1_000, 30_000),
            Duration::from_millis(16_000)
        );
        for attempt in 5..=10 {
            assert_eq!(
                backoff_delay(attempt, 1_000, 30_000),
                Duration::from_millis(30_000)
            );
        }
    }

    #[test]
    fn backoff_survives_pathological_attempt_counts() {
        assert_eq!(
            backoff_delay(u32::MAX, 1_000, 30_000),
            Duration::from_millis(30_000)
        );
    }
}
