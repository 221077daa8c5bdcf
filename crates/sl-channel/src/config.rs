use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timing and size limits shared by all boundary channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Bound on each accept/connect attempt; a stop request is observed
    /// within one such interval.
    pub reconnect_wait_ms: u64,
    /// Sleep between polls of an empty buffer.
    pub poll_interval_ms: u64,
    /// A frame write taking longer than this counts as a link failure.
    /// The send window keeps a receiver that is merely full from getting
    /// here: the sender stops writing instead of filling the socket.
    pub write_timeout_ms: u64,
    pub max_frame_bytes: usize,
    /// Items a sender keeps unacknowledged, and so written but not yet in
    /// the receiver's buffer.
    pub send_window: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            reconnect_wait_ms: 1000,
            poll_interval_ms: 1,
            write_timeout_ms: 5000,
            max_frame_bytes: 16 * 1024 * 1024,
            send_window: 64,
        }
    }
}

impl ChannelConfig {
    pub fn with_reconnect_wait(mut self, wait: Duration) -> Self {
        self.reconnect_wait_ms = wait.as_millis() as u64;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_max_frame_bytes(mut self, bytes: usize) -> Self {
        self.max_frame_bytes = bytes;
        self
    }

    pub fn with_send_window(mut self, items: usize) -> Self {
        self.send_window = items;
        self
    }

    pub fn send_window(&self) -> usize {
        self.send_window.max(1)
    }

    pub fn reconnect_wait(&self) -> Duration {
        Duration::from_millis(self.reconnect_wait_ms.max(1))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_and_partial_documents() {
        let config: ChannelConfig = serde_json::from_str(r#"{"reconnect_wait_ms": 50}"#).unwrap();
        assert_eq!(config.reconnect_wait(), Duration::from_millis(50));
        assert_eq!(config.poll_interval(), Duration::from_millis(1));
        assert_eq!(config.max_frame_bytes, ChannelConfig::default().max_frame_bytes);
        assert_eq!(config.send_window(), 64);
    }

    #[test]
    fn builders_set_fields() {
        let config = ChannelConfig::default()
            .with_reconnect_wait(Duration::from_millis(20))
            .with_write_timeout(Duration::from_secs(1));
        assert_eq!(config.reconnect_wait_ms, 20);
        assert_eq!(config.write_timeout(), Duration::from_secs(1));
    }
}
