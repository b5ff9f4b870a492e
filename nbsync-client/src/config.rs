//! Client configuration.

use std::time::Duration;

/// What to do with an optimistically applied update the remote party refused.
///
/// The local snapshot already contains the refused edit when the refusal
/// arrives; leaving it in place would show a document the remote party does
/// not have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RejectionPolicy {
    /// Apply the inverse of the refused patch to the current snapshot.
    /// Falls back to a resync if the inverse no longer applies.
    Rollback,
    /// Discard local state and fetch the canonical document.
    #[default]
    Resync,
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// How long a socket may stay unusable before it counts as failed
    pub grace_period: Duration,
    /// Delay before the second reopen attempt after a failure
    pub reconnect_delay: Duration,
    /// Upper bound for the doubling reopen delay
    pub max_reconnect_delay: Duration,
    /// Bound on the connect handshake after every (re)open
    pub handshake_timeout: Duration,
    /// Keepalive interval while connected (None = no keepalive)
    pub ping_interval: Option<Duration>,
    pub rejection_policy: RejectionPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_millis(500),
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            ping_interval: Some(Duration::from_secs(28)),
            rejection_policy: RejectionPolicy::Resync,
        }
    }
}

impl ClientConfig {
    /// Delay before reopen attempt `attempt` (0 = first, immediate).
    pub fn reconnect_backoff(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        self.reconnect_delay
            .saturating_mul(factor)
            .min(self.max_reconnect_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = ClientConfig::default();
        assert_eq!(config.grace_period, Duration::from_millis(500));
        assert_eq!(config.handshake_timeout, Duration::from_secs(10));
        assert_eq!(config.ping_interval, Some(Duration::from_secs(28)));
        assert_eq!(config.rejection_policy, RejectionPolicy::Resync);
    }

    #[test]
    fn test_reconnect_backoff_doubles_and_caps() {
        let config = ClientConfig {
            reconnect_delay: Duration::from_millis(100),
            max_reconnect_delay: Duration::from_millis(500),
            ..ClientConfig::default()
        };
        assert_eq!(config.reconnect_backoff(0), Duration::ZERO);
        assert_eq!(config.reconnect_backoff(1), Duration::from_millis(100));
        assert_eq!(config.reconnect_backoff(2), Duration::from_millis(200));
        assert_eq!(config.reconnect_backoff(3), Duration::from_millis(400));
        assert_eq!(config.reconnect_backoff(4), Duration::from_millis(500));
        assert_eq!(config.reconnect_backoff(60), Duration::from_millis(500));
    }
}
